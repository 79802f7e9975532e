// phantom-dspm-core/src/collector.rs
// Fan-in from the pipeline's four output channels: batched classification
// persistence, per-asset summary aggregation, ID remapping and deferred
// finding writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::model::{AssetSummary, Classification, DataAsset, Finding};
use crate::pipeline::{PipelineError, PipelineHandles};
use crate::store::Store;

#[derive(Debug, Default)]
pub struct CollectorOutcome {
    pub assets_upserted: u64,
    pub classifications_persisted: u64,
    pub findings_persisted: u64,
    pub errors_seen: u64,
    pub errors: Vec<PipelineError>,
}

/// Single task per scan, reading all four pipeline channels concurrently.
/// Owns the one and only provisional-to-persisted ID map for the scan.
pub struct ResultCollector {
    store: Arc<dyn Store>,
    id_map: RwLock<HashMap<Uuid, Uuid>>,
    batch_size: usize,
}

impl ResultCollector {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            id_map: RwLock::new(HashMap::new()),
            batch_size,
        }
    }

    /// Drains `handles` to completion: upserts assets as they arrive,
    /// batches and flushes classifications, tracks per-asset summaries,
    /// and defers findings until every channel has closed.
    pub async fn run(self, mut handles: PipelineHandles) -> CollectorOutcome {
        let mut outcome = CollectorOutcome::default();
        let mut batch: Vec<Classification> = Vec::new();
        let mut summaries: HashMap<Uuid, AssetSummary> = HashMap::new();
        let mut pending_classifications: HashMap<Uuid, Vec<Classification>> = HashMap::new();
        let mut deferred_findings: Vec<Finding> = Vec::new();

        let mut assets_open = true;
        let mut classifications_open = true;
        let mut findings_open = true;
        let mut errors_open = true;

        while assets_open || classifications_open || findings_open || errors_open {
            tokio::select! {
                biased;

                asset = handles.asset_rx.recv(), if assets_open => {
                    match asset {
                        Some(asset) => {
                            self.handle_asset(asset, &mut outcome).await;
                            self.replay_pending(&mut pending_classifications, &mut batch, &mut summaries).await;
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch, &mut summaries, &mut outcome).await;
                            }
                        }
                        None => assets_open = false,
                    }
                }

                classification = handles.classification_rx.recv(), if classifications_open => {
                    match classification {
                        Some(mut classification) => {
                            match self.resolve(classification.asset_id).await {
                                Some(db_id) => {
                                    classification.asset_id = db_id;
                                    batch.push(classification);
                                    if batch.len() >= self.batch_size {
                                        self.flush(&mut batch, &mut summaries, &mut outcome).await;
                                    }
                                }
                                None => {
                                    pending_classifications.entry(classification.asset_id).or_default().push(classification);
                                }
                            }
                        }
                        None => classifications_open = false,
                    }
                }

                finding = handles.finding_rx.recv(), if findings_open => {
                    match finding {
                        Some(finding) => deferred_findings.push(finding),
                        None => findings_open = false,
                    }
                }

                error = handles.error_rx.recv(), if errors_open => {
                    match error {
                        Some(error) => {
                            outcome.errors_seen += 1;
                            warn!(asset_id = ?error.asset_id, object_path = ?error.object_path, message = %error.message, "pipeline error");
                            outcome.errors.push(error);
                        }
                        None => errors_open = false,
                    }
                }
            }
        }

        // Channels closed; flush whatever remains, then drain deferred
        // findings with ID remapping applied, as the last step.
        if !batch.is_empty() {
            self.flush(&mut batch, &mut summaries, &mut outcome).await;
        }
        for (provisional_id, leftovers) in pending_classifications.drain() {
            warn!(provisional_id = %provisional_id, count = leftovers.len(), "classifications never resolved to a persisted asset");
        }
        self.drain_deferred_findings(deferred_findings, &mut outcome).await;

        let _ = handles.supervisor.await;
        outcome
    }

    async fn handle_asset(&self, asset: DataAsset, outcome: &mut CollectorOutcome) {
        let provisional_id = asset.id;
        match self.store.upsert_asset(&asset).await {
            Ok(db_id) => {
                self.id_map.write().await.insert(provisional_id, db_id);
                outcome.assets_upserted += 1;

                if let Err(err) = self.store.delete_classifications_for_asset(db_id).await {
                    warn!(asset_id = %db_id, error = %err, "failed to clear prior classifications before rescan");
                }
                if let Err(err) = self.store.delete_findings_for_asset(db_id).await {
                    warn!(asset_id = %db_id, error = %err, "failed to clear prior findings before rescan");
                }
            }
            Err(err) => {
                warn!(provisional_id = %provisional_id, error = %err, "asset upsert failed, dropping its downstream rows");
            }
        }
    }

    async fn resolve(&self, provisional_id: Uuid) -> Option<Uuid> {
        self.id_map.read().await.get(&provisional_id).copied()
    }

    async fn replay_pending(
        &self,
        pending: &mut HashMap<Uuid, Vec<Classification>>,
        batch: &mut Vec<Classification>,
        summaries: &mut HashMap<Uuid, AssetSummary>,
    ) {
        let map = self.id_map.read().await;
        let resolved: Vec<Uuid> = pending.keys().filter(|k| map.contains_key(k)).copied().collect();
        drop(map);
        for provisional_id in resolved {
            if let Some(mut rows) = pending.remove(&provisional_id) {
                let db_id = self.resolve(provisional_id).await.expect("just checked membership");
                for row in &mut rows {
                    row.asset_id = db_id;
                }
                batch.extend(rows);
            }
        }
        let _ = summaries;
    }

    async fn flush(&self, batch: &mut Vec<Classification>, summaries: &mut HashMap<Uuid, AssetSummary>, outcome: &mut CollectorOutcome) {
        if batch.is_empty() {
            return;
        }
        let flushed = match self.store.bulk_insert_classifications(batch).await {
            Ok(()) => batch.len(),
            Err(err) => {
                warn!(error = %err, batch_size = batch.len(), "bulk insert failed, falling back to per-row inserts");
                let mut succeeded = 0;
                for row in batch.iter() {
                    match self.store.bulk_insert_classifications(std::slice::from_ref(row)).await {
                        Ok(()) => succeeded += 1,
                        Err(row_err) => warn!(classification_id = %row.id, error = %row_err, "dropping classification row that failed to persist"),
                    }
                }
                succeeded
            }
        };
        outcome.classifications_persisted += flushed as u64;

        for classification in batch.iter() {
            summaries.entry(classification.asset_id).or_default().record(classification);
        }

        for (asset_id, summary) in summaries.iter() {
            let categories: BTreeSet<_> = summary.categories.iter().copied().collect();
            if let Err(err) = self
                .store
                .update_asset_classification(*asset_id, summary.max_sensitivity.unwrap_or(crate::model::SensitivityLevel::Unknown), &categories, summary.count)
                .await
            {
                warn!(asset_id = %asset_id, error = %err, "failed to write asset classification summary");
            }
        }

        batch.clear();
    }

    async fn drain_deferred_findings(&self, findings: Vec<Finding>, outcome: &mut CollectorOutcome) {
        for mut finding in findings {
            if let Some(provisional_id) = finding.asset_id {
                match self.resolve(provisional_id).await {
                    Some(db_id) => finding.asset_id = Some(db_id),
                    None => {
                        warn!(provisional_id = %provisional_id, "dropping finding for an asset that was never persisted");
                        continue;
                    }
                }
            }
            match self.store.create_finding(&finding).await {
                Ok(_) => outcome.findings_persisted += 1,
                Err(err) => warn!(finding_id = %finding.id, error = %err, "failed to persist deferred finding"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    use crate::model::{DataAsset, DataCategory, Finding, FindingSeverity, SensitivityLevel};
    use crate::pipeline::JobCounters;
    use crate::testing::InMemoryStore;

    fn handles_with_channels() -> (
        mpsc::Sender<DataAsset>,
        mpsc::Sender<Classification>,
        mpsc::Sender<Finding>,
        mpsc::Sender<PipelineError>,
        PipelineHandles,
    ) {
        let (asset_tx, asset_rx) = mpsc::channel(8);
        let (classification_tx, classification_rx) = mpsc::channel(8);
        let (finding_tx, finding_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(8);
        let supervisor = tokio::spawn(async {});
        let handles = PipelineHandles {
            asset_rx,
            classification_rx,
            finding_rx,
            error_rx,
            counters: Arc::new(JobCounters::default()),
            supervisor,
        };
        (asset_tx, classification_tx, finding_tx, error_tx, handles)
    }

    #[tokio::test]
    async fn classification_arriving_before_its_asset_is_replayed_after_upsert() {
        let store = Arc::new(InMemoryStore::new());
        let account_id = Uuid::new_v4();
        let provisional_id = Uuid::new_v4();

        let (asset_tx, classification_tx, finding_tx, error_tx, handles) = handles_with_channels();

        let classification = Classification {
            id: Uuid::new_v4(),
            asset_id: provisional_id,
            object_path: "a.txt".into(),
            object_size: 10,
            rule_name: "SSN Detector".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::Critical,
            match_count: 1,
            confidence: 0.9,
            sample_matches: vec![],
            match_locations: vec![],
            created_at: chrono::Utc::now(),
        };
        classification_tx.send(classification).await.unwrap();

        // The collector starts draining with only the classification queued;
        // it must buffer it rather than drop it, since the asset has not
        // been upserted yet.
        let collector = ResultCollector::new(store.clone(), 1000);
        let run_handle = tokio::spawn(collector.run(handles));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut asset = DataAsset::new(account_id, "s3_bucket", "arn:aws:s3:::bucket/a", "us-east-1");
        asset.id = provisional_id;
        asset_tx.send(asset).await.unwrap();

        drop(asset_tx);
        drop(classification_tx);
        drop(finding_tx);
        drop(error_tx);

        let outcome = run_handle.await.unwrap();

        assert_eq!(outcome.assets_upserted, 1);
        assert_eq!(outcome.classifications_persisted, 1);
        assert_eq!(store.classifications_for(provisional_id).await.len(), 1);
    }

    #[tokio::test]
    async fn finding_for_a_brand_new_asset_is_deferred_until_the_asset_is_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let account_id = Uuid::new_v4();
        let provisional_id = Uuid::new_v4();

        let (asset_tx, classification_tx, finding_tx, error_tx, handles) = handles_with_channels();

        let finding = Finding::new(
            account_id,
            Some(provisional_id),
            "exposed_credential",
            "Exposed credential detected",
            "test",
            FindingSeverity::Critical,
            serde_json::json!({}),
        );
        finding_tx.send(finding).await.unwrap();

        let collector = ResultCollector::new(store.clone(), 1000);
        let run_handle = tokio::spawn(collector.run(handles));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut asset = DataAsset::new(account_id, "s3_bucket", "arn:aws:s3:::bucket/b", "us-east-1");
        asset.id = provisional_id;
        asset_tx.send(asset).await.unwrap();

        drop(asset_tx);
        drop(classification_tx);
        drop(finding_tx);
        drop(error_tx);

        let outcome = run_handle.await.unwrap();

        assert_eq!(outcome.findings_persisted, 1);
        let persisted = store.findings_for(provisional_id).await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].asset_id, Some(provisional_id));
    }

    #[tokio::test]
    async fn a_failed_batch_flush_falls_back_to_per_row_inserts() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_bulk_insert();
        let account_id = Uuid::new_v4();
        let provisional_id = Uuid::new_v4();

        let (asset_tx, classification_tx, finding_tx, error_tx, handles) = handles_with_channels();

        let mut asset = DataAsset::new(account_id, "s3_bucket", "arn:aws:s3:::bucket/c", "us-east-1");
        asset.id = provisional_id;
        asset_tx.send(asset).await.unwrap();

        for i in 0..3 {
            let classification = Classification {
                id: Uuid::new_v4(),
                asset_id: provisional_id,
                object_path: format!("object-{i}.txt"),
                object_size: 10,
                rule_name: "SSN Detector".into(),
                category: DataCategory::Pii,
                sensitivity: SensitivityLevel::Critical,
                match_count: 1,
                confidence: 0.9,
                sample_matches: vec![],
                match_locations: vec![],
                created_at: chrono::Utc::now(),
            };
            classification_tx.send(classification).await.unwrap();
        }

        drop(asset_tx);
        drop(classification_tx);
        drop(finding_tx);
        drop(error_tx);

        let collector = ResultCollector::new(store.clone(), 1000);
        let outcome = collector.run(handles).await;

        assert_eq!(outcome.classifications_persisted, 3);
        assert_eq!(store.classifications_for(provisional_id).await.len(), 3);
    }

    async fn run_one_scan(store: Arc<InMemoryStore>, account_id: Uuid, resource_arn: &str, hit_count: usize) {
        let provisional_id = crate::enumerator::provisional_asset_id(account_id, resource_arn);
        let (asset_tx, classification_tx, finding_tx, error_tx, handles) = handles_with_channels();

        let mut asset = DataAsset::new(account_id, "s3_bucket", resource_arn, "us-east-1");
        asset.id = provisional_id;
        asset_tx.send(asset).await.unwrap();

        for i in 0..hit_count {
            let classification = Classification {
                id: Uuid::new_v4(),
                asset_id: provisional_id,
                object_path: format!("object-{i}.txt"),
                object_size: 10,
                rule_name: "SSN Detector".into(),
                category: DataCategory::Pii,
                sensitivity: SensitivityLevel::Critical,
                match_count: 1,
                confidence: 0.9,
                sample_matches: vec![],
                match_locations: vec![],
                created_at: chrono::Utc::now(),
            };
            classification_tx.send(classification).await.unwrap();
        }

        drop(asset_tx);
        drop(classification_tx);
        drop(finding_tx);
        drop(error_tx);

        let collector = ResultCollector::new(store, 1000);
        collector.run(handles).await;
    }

    proptest! {
        // Rescanning the same resource ARN any number of times must leave the
        // store holding exactly the latest scan's classifications -- never a
        // union of the old and new rows, regardless of how many hits either
        // scan produced.
        #[test]
        fn rescanning_the_same_asset_replaces_rather_than_accumulates_classifications(
            first_hits in 0usize..6,
            second_hits in 0usize..6,
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                let account_id = Uuid::new_v4();
                let resource_arn = "arn:aws:s3:::bucket/rescan-target";

                run_one_scan(store.clone(), account_id, resource_arn, first_hits).await;
                run_one_scan(store.clone(), account_id, resource_arn, second_hits).await;

                let provisional_id = crate::enumerator::provisional_asset_id(account_id, resource_arn);
                let persisted = store.classifications_for(provisional_id).await;
                prop_assert_eq!(persisted.len(), second_hits);
                prop_assert_eq!(store.asset_count().await, 1);
                Ok(())
            })?;
        }
    }
}

