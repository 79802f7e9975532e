// phantom-dspm-core/src/orchestrator.rs
// Owns the job lifecycle end to end: accepts a trigger, creates the job
// row, wires the enumerator, pipeline and collector together, and performs
// the terminal status transition plus the account's last-scan stamp.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ClassifierConfig, PipelineConfig};
use crate::collector::ResultCollector;
use crate::enumerator::StorageEnumerator;
use crate::error::{DspmError, DspmResult};
use crate::model::{JobProgress, JobStatus, ScanJob, ScanScope, ScanType};
use crate::pattern_library::PatternLibrary;
use crate::pipeline::{CancellationToken, ScanPipeline};
use crate::store::Store;

/// `{account_id, scan_type?, scope?}` as received from an external RPC.
/// Defaults to a full, unrestricted scan.
#[derive(Debug, Clone, Default)]
pub struct ScanTriggerRequest {
    pub account_id: Uuid,
    pub scan_type: Option<ScanType>,
    pub scope: Option<ScanScope>,
    pub trigger_source: Option<String>,
}

/// Constructs a `StorageEnumerator` for one account. The orchestrator never
/// knows about cloud SDKs; this indirection is supplied by the binary that
/// owns account credentials.
pub trait EnumeratorFactory: Send + Sync {
    fn build(&self, account_id: Uuid) -> DspmResult<Arc<dyn StorageEnumerator>>;
}

struct RunningJob {
    cancel: CancellationToken,
    progress: Arc<Mutex<JobProgress>>,
}

/// Coordinates scan jobs across accounts. One instance per process; each
/// triggered scan gets its own pipeline, worker pools and cancellation
/// token, sharing only the store and the pattern library.
pub struct ScanOrchestrator {
    store: Arc<dyn Store>,
    enumerators: Arc<dyn EnumeratorFactory>,
    patterns: Arc<PatternLibrary>,
    pipeline_config: PipelineConfig,
    classifier_config: ClassifierConfig,
    running: DashMap<Uuid, RunningJob>,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        enumerators: Arc<dyn EnumeratorFactory>,
        patterns: Arc<PatternLibrary>,
        pipeline_config: PipelineConfig,
        classifier_config: ClassifierConfig,
    ) -> Self {
        Self {
            store,
            enumerators,
            patterns,
            pipeline_config,
            classifier_config,
            running: DashMap::new(),
        }
    }

    /// Creates the job row, spawns the scan in the background and returns
    /// the created job immediately; the scan continues after this returns.
    #[instrument(skip(self), fields(account_id = %request.account_id))]
    pub async fn trigger_scan(self: &Arc<Self>, request: ScanTriggerRequest) -> DspmResult<ScanJob> {
        let scan_type = request.scan_type.unwrap_or(ScanType::Full);
        let scope = request.scope.unwrap_or_default();
        let trigger_source = request.trigger_source.unwrap_or_else(|| "api".to_string());

        let mut job = ScanJob::new(request.account_id, scan_type, Some(scope.clone()), trigger_source);
        self.store.update_job_status(job.id, job.status, "system").await?;

        let cancel = CancellationToken::new();
        let progress = Arc::new(Mutex::new(JobProgress::from(&job)));
        self.running.insert(job.id, RunningJob { cancel: cancel.clone(), progress: progress.clone() });

        job.transition(JobStatus::Running)?;
        self.store.update_job_status(job.id, job.status, "system").await?;
        *progress.lock().await = JobProgress::from(&job);

        let this = self.clone();
        let job_id = job.id;
        let account_id = job.account_id;
        tokio::spawn(async move {
            this.run_scan(job_id, account_id, scope, cancel, progress).await;
        });

        Ok(job)
    }

    /// Requests cancellation of a running job. A no-op if the job is
    /// already finished or unknown; the pipeline checks the token
    /// cooperatively, so cancellation is never instantaneous.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(entry) = self.running.get(&job_id) {
            entry.cancel.cancel();
        }
    }

    /// Best-effort read model for an active job. Returns `None` once the
    /// job has finished and been evicted from the registry.
    pub async fn progress(&self, job_id: Uuid) -> Option<JobProgress> {
        let progress = self.running.get(&job_id)?.progress.clone();
        Some(progress.lock().await.clone())
    }

    #[instrument(skip(self, scope, cancel, progress), fields(job_id = %job_id))]
    async fn run_scan(
        self: Arc<Self>,
        job_id: Uuid,
        account_id: Uuid,
        scope: ScanScope,
        cancel: CancellationToken,
        progress: Arc<Mutex<JobProgress>>,
    ) {
        let outcome = self.drive_scan(job_id, account_id, scope, cancel.clone(), progress.clone()).await;

        let final_status = match outcome {
            Ok(assets_upserted) if cancel.is_cancelled() => {
                info!(assets_upserted, "scan cancelled");
                JobStatus::Cancelled
            }
            Ok(assets_upserted) if assets_upserted == 0 => {
                warn!("scan completed with no assets successfully scanned");
                JobStatus::Failed
            }
            Ok(assets_upserted) => {
                info!(assets_upserted, "scan completed");
                JobStatus::Completed
            }
            Err(err) => {
                error!(error = %err, "scan failed before any asset was scanned");
                JobStatus::Failed
            }
        };

        if let Err(err) = self.store.update_job_status(job_id, final_status, "system").await {
            error!(job_id = %job_id, error = %err, "failed to persist terminal job status");
        }
        if let Err(err) = self.store.update_account_last_scan(account_id, final_status).await {
            error!(account_id = %account_id, error = %err, "failed to stamp account last-scan status");
        }

        {
            let mut p = progress.lock().await;
            p.status = final_status;
            p.ended_at = Some(chrono::Utc::now());
        }

        self.running.remove(&job_id);
    }

    /// Builds the enumerator, spawns the pipeline and collector, polls
    /// counters into the progress read model until the collector finishes,
    /// and returns the number of assets the collector actually upserted.
    async fn drive_scan(
        &self,
        job_id: Uuid,
        account_id: Uuid,
        scope: ScanScope,
        cancel: CancellationToken,
        progress: Arc<Mutex<JobProgress>>,
    ) -> DspmResult<u64> {
        let enumerator = self.enumerators.build(account_id)?;
        enumerator.validate().await.map_err(|err| match err {
            DspmError::Authentication(_) | DspmError::Authorization(_) => err,
            other => DspmError::Authentication(other.to_string()),
        })?;

        let handles = ScanPipeline::spawn(
            account_id,
            enumerator.clone(),
            scope,
            self.pipeline_config.clone(),
            self.classifier_config,
            self.patterns.clone(),
            cancel.clone(),
        );
        let counters = handles.counters.clone();

        let collector = ResultCollector::new(self.store.clone(), self.pipeline_config.classification_batch_size);
        let collector_task = tokio::spawn(collector.run(handles));

        let poller = tokio::spawn({
            let progress = progress.clone();
            let counters = counters.clone();
            async move {
                loop {
                    {
                        let mut p = progress.lock().await;
                        p.scanned_assets = counters.scanned_assets.load(std::sync::atomic::Ordering::Relaxed);
                        p.scanned_objects = counters.scanned_objects.load(std::sync::atomic::Ordering::Relaxed);
                        p.classifications_found = counters.classifications_found.load(std::sync::atomic::Ordering::Relaxed);
                        p.findings_found = counters.findings_found.load(std::sync::atomic::Ordering::Relaxed);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        });

        let outcome = collector_task.await.map_err(|err| DspmError::Store(format!("collector task panicked: {err}")))?;
        poller.abort();

        let _ = enumerator.close().await;

        {
            let mut p = progress.lock().await;
            p.scanned_assets = counters.scanned_assets.load(std::sync::atomic::Ordering::Relaxed);
            p.scanned_objects = counters.scanned_objects.load(std::sync::atomic::Ordering::Relaxed);
            p.classifications_found = counters.classifications_found.load(std::sync::atomic::Ordering::Relaxed);
            p.findings_found = counters.findings_found.load(std::sync::atomic::Ordering::Relaxed);
        }

        if !outcome.errors.is_empty() {
            warn!(errors_seen = outcome.errors_seen, "scan finished with per-object/per-asset errors");
        }

        let final_counts = progress.lock().await.clone();
        if let Err(err) = self
            .store
            .update_job_progress(
                job_id,
                final_counts.scanned_assets,
                final_counts.scanned_objects,
                final_counts.classifications_found,
                final_counts.findings_found,
            )
            .await
        {
            warn!(job_id = %job_id, error = %err, "failed to persist final job progress");
        }

        Ok(outcome.assets_upserted)
    }
}
