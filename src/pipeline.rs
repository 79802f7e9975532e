// phantom-dspm-core/src/pipeline.rs
// The concurrent producer/consumer scan engine: enumerate -> fetch ->
// classify -> emit, over bounded channels with cooperative cancellation.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::classifier::{Classifier, ClassifyInput};
use crate::config::{ClassifierConfig, PipelineConfig};
use crate::enumerator::{AssetDescriptor, ObjectDescriptor, StorageEnumerator};
use crate::error::DspmError;
use crate::model::{Classification, DataAsset, DataCategory, EncryptionStatus, Finding, FindingSeverity, ScanScope, SensitivityLevel};
use crate::pattern_library::PatternLibrary;

/// Cooperative cancellation flag shared by every worker of one job. Workers
/// check it between operations and on every queue send/receive.
#[derive(Clone)]
pub struct CancellationToken(Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// An error surfaced on `error_ch`, scoped to the asset/object that caused
/// it. Per-object and per-asset errors are partial, not fatal.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub asset_id: Option<Uuid>,
    pub object_path: Option<String>,
    pub message: String,
}

/// Running totals for one job, updated by the workers and read by the
/// orchestrator's progress model.
#[derive(Default)]
pub struct JobCounters {
    pub scanned_assets: AtomicU64,
    pub scanned_objects: AtomicU64,
    pub classifications_found: AtomicU64,
    pub findings_found: AtomicU64,
}

/// The four output streams plus the counters and a handle that resolves
/// once every worker has exited and all four channels have closed.
pub struct PipelineHandles {
    pub asset_rx: mpsc::Receiver<DataAsset>,
    pub classification_rx: mpsc::Receiver<Classification>,
    pub finding_rx: mpsc::Receiver<Finding>,
    pub error_rx: mpsc::Receiver<PipelineError>,
    pub counters: Arc<JobCounters>,
    pub supervisor: JoinHandle<()>,
}

pub struct ScanPipeline;

impl ScanPipeline {
    /// Spawns the asset, object and classify stages for one scan and
    /// returns the output channels immediately; the stages run in the
    /// background until the enumerator is exhausted or `cancel` fires.
    pub fn spawn(
        account_id: Uuid,
        enumerator: Arc<dyn StorageEnumerator>,
        scope: ScanScope,
        pipeline_config: PipelineConfig,
        classifier_config: ClassifierConfig,
        patterns: Arc<PatternLibrary>,
        cancel: CancellationToken,
    ) -> PipelineHandles {
        let (asset_tx, asset_rx) = mpsc::channel(pipeline_config.output_channel_capacity);
        let (classification_tx, classification_rx) = mpsc::channel(pipeline_config.output_channel_capacity);
        let (finding_tx, finding_rx) = mpsc::channel(pipeline_config.output_channel_capacity);
        let (error_tx, error_rx) = mpsc::channel(pipeline_config.output_channel_capacity);

        let (asset_queue_tx, asset_queue_rx) = mpsc::channel::<AssetDescriptor>(pipeline_config.asset_queue_capacity);
        let (object_queue_tx, object_queue_rx) = mpsc::channel::<(AssetDescriptor, ObjectDescriptor)>(pipeline_config.object_queue_capacity);
        let asset_queue_rx = Arc::new(Mutex::new(asset_queue_rx));
        let object_queue_rx = Arc::new(Mutex::new(object_queue_rx));

        let counters = Arc::new(JobCounters::default());

        let producer = tokio::spawn(asset_producer_stage(
            enumerator.clone(),
            scope,
            asset_queue_tx,
            error_tx.clone(),
            cancel.clone(),
        ));

        let mut asset_workers = Vec::with_capacity(pipeline_config.asset_workers);
        for _ in 0..pipeline_config.asset_workers {
            asset_workers.push(tokio::spawn(asset_stage_worker(
                enumerator.clone(),
                asset_queue_rx.clone(),
                object_queue_tx.clone(),
                asset_tx.clone(),
                error_tx.clone(),
                counters.clone(),
                cancel.clone(),
            )));
        }
        drop(asset_tx);
        drop(object_queue_tx);

        let mut classify_workers = Vec::with_capacity(pipeline_config.classify_workers);
        for _ in 0..pipeline_config.classify_workers {
            classify_workers.push(tokio::spawn(classify_stage_worker(
                enumerator.clone(),
                object_queue_rx.clone(),
                classification_tx.clone(),
                finding_tx.clone(),
                error_tx.clone(),
                counters.clone(),
                patterns.clone(),
                classifier_config,
                pipeline_config.clone(),
                cancel.clone(),
            )));
        }
        drop(classification_tx);
        drop(finding_tx);
        drop(error_tx);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let ceiling = pipeline_config.scan_wall_clock_ceiling;
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ceiling) => watchdog_cancel.cancel(),
                _ = done_rx => {}
            }
        });

        let supervisor = tokio::spawn(async move {
            let _ = producer.await;
            for handle in asset_workers {
                let _ = handle.await;
            }
            for handle in classify_workers {
                let _ = handle.await;
            }
            let _ = done_tx.send(());
        });

        PipelineHandles {
            asset_rx,
            classification_rx,
            finding_rx,
            error_rx,
            counters,
            supervisor,
        }
    }
}

async fn asset_producer_stage(
    enumerator: Arc<dyn StorageEnumerator>,
    scope: ScanScope,
    asset_queue_tx: mpsc::Sender<AssetDescriptor>,
    error_tx: mpsc::Sender<PipelineError>,
    cancel: CancellationToken,
) {
    let mut stream = match enumerator.list_assets(&scope).await {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "asset enumeration failed to start");
            let _ = error_tx
                .send(PipelineError {
                    asset_id: None,
                    object_path: None,
                    message: err.to_string(),
                })
                .await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        if cancel.is_cancelled() {
            debug!("asset producer observed cancellation, stopping enumeration");
            return;
        }
        match item {
            Ok(descriptor) => {
                if asset_queue_tx.send(descriptor).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "asset enumeration error, continuing with next asset");
                let _ = error_tx
                    .send(PipelineError {
                        asset_id: None,
                        object_path: None,
                        message: err.to_string(),
                    })
                    .await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn asset_stage_worker(
    enumerator: Arc<dyn StorageEnumerator>,
    asset_queue_rx: Arc<Mutex<mpsc::Receiver<AssetDescriptor>>>,
    object_queue_tx: mpsc::Sender<(AssetDescriptor, ObjectDescriptor)>,
    asset_tx: mpsc::Sender<DataAsset>,
    error_tx: mpsc::Sender<PipelineError>,
    counters: Arc<JobCounters>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let descriptor = {
            let mut rx = asset_queue_rx.lock().await;
            rx.recv().await
        };
        let Some(descriptor) = descriptor else { return };

        let asset_record = descriptor_to_asset(&descriptor);
        if asset_tx.send(asset_record).await.is_err() {
            return;
        }
        counters.scanned_assets.fetch_add(1, Ordering::Relaxed);

        let mut objects = match enumerator.list_objects(&descriptor).await {
            Ok(s) => s,
            Err(err) => {
                let _ = error_tx
                    .send(PipelineError {
                        asset_id: Some(descriptor.provisional_id),
                        object_path: None,
                        message: err.to_string(),
                    })
                    .await;
                continue;
            }
        };

        while let Some(item) = objects.next().await {
            if cancel.is_cancelled() {
                return;
            }
            match item {
                Ok(object) => {
                    if object_queue_tx.send((descriptor.clone(), object)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = error_tx
                        .send(PipelineError {
                            asset_id: Some(descriptor.provisional_id),
                            object_path: None,
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        }
    }
}

fn descriptor_to_asset(descriptor: &AssetDescriptor) -> DataAsset {
    let mut asset = DataAsset::new(descriptor.account_id, descriptor.resource_type.clone(), descriptor.resource_arn.clone(), descriptor.region.clone());
    asset.id = descriptor.provisional_id;
    asset.display_name = descriptor.display_name.clone();
    asset.public_access = descriptor.public_access;
    asset.encryption_status = descriptor.encryption_status;
    asset
}

#[allow(clippy::too_many_arguments)]
async fn classify_stage_worker(
    enumerator: Arc<dyn StorageEnumerator>,
    object_queue_rx: Arc<Mutex<mpsc::Receiver<(AssetDescriptor, ObjectDescriptor)>>>,
    classification_tx: mpsc::Sender<Classification>,
    finding_tx: mpsc::Sender<Finding>,
    error_tx: mpsc::Sender<PipelineError>,
    counters: Arc<JobCounters>,
    patterns: Arc<PatternLibrary>,
    classifier_config: ClassifierConfig,
    pipeline_config: PipelineConfig,
    cancel: CancellationToken,
) {
    let classifier = Classifier::new(classifier_config);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let item = {
            let mut rx = object_queue_rx.lock().await;
            rx.recv().await
        };
        let Some((asset, object)) = item else { return };

        counters.scanned_objects.fetch_add(1, Ordering::Relaxed);

        let object_path = object.path.clone();
        let object_size = object.size;
        let snapshot = patterns.snapshot();

        let matches = if object_size > pipeline_config.streaming_threshold_bytes {
            match classify_streamed(enumerator.as_ref(), &asset, &object, &pipeline_config, &classifier, &snapshot, &cancel).await {
                Ok(matches) => matches,
                Err(err) => {
                    let _ = error_tx
                        .send(PipelineError {
                            asset_id: Some(asset.provisional_id),
                            object_path: Some(object_path.clone()),
                            message: err.to_string(),
                        })
                        .await;
                    continue;
                }
            }
        } else {
            let content = match read_with_retry(enumerator.as_ref(), &asset, &object, &pipeline_config, 0).await {
                Ok(content) => content,
                Err(err) => {
                    let _ = error_tx
                        .send(PipelineError {
                            asset_id: Some(asset.provisional_id),
                            object_path: Some(object_path.clone()),
                            message: err.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            let ceiling = pipeline_config.max_object_bytes;
            let classify_result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                classifier.classify(&snapshot, ClassifyInput::whole(&object_path, &content.bytes, content.content_type_hint, object_size), ceiling)
            }));
            match classify_result {
                Ok(matches) => matches,
                Err(_) => {
                    let _ = error_tx
                        .send(PipelineError {
                            asset_id: Some(asset.provisional_id),
                            object_path: Some(object_path.clone()),
                            message: "classifier panicked".into(),
                        })
                        .await;
                    continue;
                }
            }
        };

        if matches.is_empty() {
            continue;
        }

        for posture_finding in posture_findings(&asset, &matches) {
            counters.findings_found.fetch_add(1, Ordering::Relaxed);
            if finding_tx.send(posture_finding).await.is_err() {
                return;
            }
        }

        for m in matches {
            let classification = Classification {
                id: Uuid::new_v4(),
                asset_id: asset.provisional_id,
                object_path: object_path.clone(),
                object_size,
                rule_name: m.rule_name,
                category: m.category,
                sensitivity: m.sensitivity,
                match_count: m.count,
                confidence: m.confidence,
                sample_matches: m.sample_matches,
                match_locations: m.match_locations,
                created_at: chrono::Utc::now(),
            };
            counters.classifications_found.fetch_add(1, Ordering::Relaxed);
            if classification_tx.send(classification).await.is_err() {
                return;
            }
        }
    }
}

async fn read_with_retry(
    enumerator: &dyn StorageEnumerator,
    asset: &AssetDescriptor,
    object: &ObjectDescriptor,
    config: &PipelineConfig,
    offset: u64,
) -> Result<crate::enumerator::ObjectContent, DspmError> {
    let mut attempt = 0;
    loop {
        let read = tokio::time::timeout(config.object_read_timeout, enumerator.open_object(asset, &object.path, offset, config.max_object_bytes)).await;
        match read {
            Ok(Ok(content)) => return Ok(content),
            Ok(Err(err)) if attempt < config.retry_attempts => {
                warn!(path = %object.path, attempt, error = %err, "transient read error, retrying");
                tokio::time::sleep(config.retry_backoff[attempt as usize]).await;
                attempt += 1;
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(DspmError::TransientIo {
                    path: object.path.clone(),
                    source: "read timed out".into(),
                })
            }
        }
    }
}

/// Reads an object larger than the streaming threshold in successive
/// overlapping windows rather than pulling it whole into memory, so no
/// rule match that straddles a window boundary is ever split and missed.
async fn classify_streamed(
    enumerator: &dyn StorageEnumerator,
    asset: &AssetDescriptor,
    object: &ObjectDescriptor,
    config: &PipelineConfig,
    classifier: &Classifier,
    snapshot: &crate::pattern_library::RuleSet,
    cancel: &CancellationToken,
) -> Result<Vec<crate::classifier::Match>, DspmError> {
    let overlap = config.stream_overlap_bytes;
    let mut offset: u64 = 0;
    let mut base_line: u32 = 1;
    let mut skip_before_byte: usize = 0;
    let mut matches: Vec<crate::classifier::Match> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(DspmError::Cancelled);
        }
        let content = read_with_retry(enumerator, asset, object, config, offset).await?;
        if content.bytes.is_empty() {
            break;
        }

        let window = ClassifyInput {
            object_path: &object.path,
            content: &content.bytes,
            content_type_hint: content.content_type_hint,
            object_size: object.size,
            base_line,
            skip_before_byte,
        };
        let window_matches = std::panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(snapshot, window, config.max_object_bytes)))
            .map_err(|_| DspmError::Classifier { path: object.path.clone(), reason: "classifier panicked on a streamed window".into() })?;
        matches.extend(window_matches);

        if !content.truncated {
            break;
        }

        let stride = (content.bytes.len() as u64).saturating_sub(overlap).max(1);
        base_line += content.bytes[..stride as usize].iter().filter(|&&b| b == b'\n').count() as u32;
        offset += stride;
        skip_before_byte = (content.bytes.len() as u64 - stride) as usize;
    }

    Ok(merge_rule_matches(matches))
}

/// Windowed reads produce one `Match` per rule per window; a large object
/// with hits in more than one window needs those merged into one `Match`
/// per rule, the same shape a single-pass classification would have
/// produced.
fn merge_rule_matches(matches: Vec<crate::classifier::Match>) -> Vec<crate::classifier::Match> {
    let mut by_rule: std::collections::HashMap<String, crate::classifier::Match> = std::collections::HashMap::new();
    for m in matches {
        by_rule
            .entry(m.rule_name.clone())
            .and_modify(|existing| {
                existing.count += m.count;
                existing.confidence = existing.confidence.max(m.confidence);
                existing.sample_matches.extend(m.sample_matches.clone());
                existing.match_locations.extend(m.match_locations.clone());
            })
            .or_insert(m);
    }
    by_rule.into_values().collect()
}

/// Asset-level posture findings triggered by what the classifier found on
/// one object: a public bucket holding PCI data, unencrypted PHI, or an
/// exposed credential.
fn posture_findings(asset: &AssetDescriptor, matches: &[crate::classifier::Match]) -> Vec<Finding> {
    let mut findings = Vec::new();

    if asset.public_access && matches.iter().any(|m| m.category == DataCategory::Pci) {
        findings.push(Finding::new(
            asset.account_id,
            Some(asset.provisional_id),
            "public_bucket_contains_pci",
            "Publicly accessible bucket contains payment card data",
            format!("Asset {} is publicly accessible and contains PCI-classified data.", asset.resource_arn),
            FindingSeverity::Critical,
            serde_json::json!({ "resource_arn": asset.resource_arn }),
        ));
    }

    if asset.encryption_status == EncryptionStatus::None && matches.iter().any(|m| m.category == DataCategory::Phi) {
        findings.push(Finding::new(
            asset.account_id,
            Some(asset.provisional_id),
            "unencrypted_phi_exposure",
            "Unencrypted asset contains protected health information",
            format!("Asset {} stores PHI-classified data without at-rest encryption.", asset.resource_arn),
            FindingSeverity::High,
            serde_json::json!({ "resource_arn": asset.resource_arn }),
        ));
    }

    if matches.iter().any(|m| m.category == DataCategory::Secrets && m.sensitivity >= SensitivityLevel::High) {
        findings.push(Finding::new(
            asset.account_id,
            Some(asset.provisional_id),
            "exposed_credential",
            "Exposed credential detected in object content",
            format!("Asset {} contains what appears to be a live credential or secret.", asset.resource_arn),
            FindingSeverity::Critical,
            serde_json::json!({ "resource_arn": asset.resource_arn }),
        ));
    }

    findings
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::collector::ResultCollector;
    use crate::model::EncryptionStatus;
    use crate::pattern_library::{ContentTypeHint, PatternLibrary};
    use crate::testing::{FixtureObject, InMemoryEnumerator, InMemoryStore};

    use super::*;

    fn fixture_object(n: usize) -> FixtureObject {
        FixtureObject::new(
            ObjectDescriptor { path: format!("object-{n}.txt"), size: 4, last_modified: chrono::Utc::now() },
            b"hi!!".to_vec(),
            ContentTypeHint::Text,
        )
        .with_read_delay(std::time::Duration::from_millis(5))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // However many objects a scan has queued and whenever `cancel()`
        // fires relative to that work, the pipeline must still drain to a
        // close within a bounded wait (no stage can hang on a stale
        // cancellation check) and must never report scanning more objects
        // than the enumerator actually had.
        #[test]
        fn cancelling_mid_scan_always_drains_and_never_overcounts(
            object_count in 1usize..12,
            cancel_after_ms in 0u64..40,
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let account_id = Uuid::new_v4();
                let arn = "arn:aws:s3:::bucket/cancellation-target";
                let asset = AssetDescriptor {
                    provisional_id: crate::enumerator::provisional_asset_id(account_id, arn),
                    account_id,
                    resource_type: "s3_bucket".into(),
                    resource_arn: arn.into(),
                    display_name: arn.into(),
                    region: "us-east-1".into(),
                    public_access: false,
                    encryption_status: EncryptionStatus::Cmk,
                };
                let objects: Vec<FixtureObject> = (0..object_count).map(fixture_object).collect();
                let enumerator: Arc<dyn StorageEnumerator> =
                    Arc::new(InMemoryEnumerator::new().with_asset(asset, objects));

                let cancel = CancellationToken::new();
                let mut pipeline_config = PipelineConfig::default();
                pipeline_config.asset_workers = 1;
                pipeline_config.classify_workers = 1;

                let handles = ScanPipeline::spawn(
                    account_id,
                    enumerator,
                    ScanScope::default(),
                    pipeline_config,
                    ClassifierConfig::default(),
                    Arc::new(PatternLibrary::with_builtins()),
                    cancel.clone(),
                );
                let counters = handles.counters.clone();

                tokio::time::sleep(std::time::Duration::from_millis(cancel_after_ms)).await;
                cancel.cancel();

                let store = Arc::new(InMemoryStore::new());
                let collector = ResultCollector::new(store, 1000);
                let drained = tokio::time::timeout(std::time::Duration::from_secs(5), collector.run(handles)).await;

                prop_assert!(drained.is_ok(), "collector did not drain within the timeout after cancellation");
                prop_assert!(counters.scanned_objects.load(Ordering::Relaxed) <= object_count as u64);
                Ok(())
            })?;
        }
    }
}
