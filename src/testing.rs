// phantom-dspm-core/src/testing.rs
// In-memory doubles for `Store` and `StorageEnumerator`. Not a production
// backend: no SQL, no migrations, no durability across process restarts.
// Exists so the pipeline/collector/orchestrator are exercisable end to end
// without an external store or cloud SDK.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::enumerator::{AssetDescriptor, ObjectContent, ObjectDescriptor, StorageEnumerator};
use crate::error::DspmError;
use crate::model::{Classification, DataAsset, DataCategory, Finding, JobStatus, ScanScope, SensitivityLevel};
use crate::orchestrator::EnumeratorFactory;
use crate::pattern_library::ContentTypeHint;
use crate::store::Store;

#[derive(Debug, Clone)]
struct JobRecord {
    status: JobStatus,
    scanned_assets: u64,
    scanned_objects: u64,
    classifications_found: u64,
    findings_found: u64,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            status: JobStatus::Pending,
            scanned_assets: 0,
            scanned_objects: 0,
            classifications_found: 0,
            findings_found: 0,
        }
    }
}

#[derive(Default)]
struct StoreState {
    assets_by_id: HashMap<Uuid, DataAsset>,
    asset_id_by_key: HashMap<(Uuid, String), Uuid>,
    classifications_by_asset: HashMap<Uuid, Vec<Classification>>,
    findings_by_id: HashMap<Uuid, Finding>,
    jobs: HashMap<Uuid, JobRecord>,
    account_last_scan: HashMap<Uuid, JobStatus>,
}

/// An `RwLock`-guarded set of hash maps satisfying `Store`. All-or-nothing
/// per `bulk_insert_classifications` call via a single write-lock critical
/// section, as the design requires. `fail_next_bulk_insert` lets a test
/// inject exactly one batch-level failure to exercise the per-row fallback.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    fail_next_bulk_insert: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call to `bulk_insert_classifications` fails once, then
    /// behaves normally again.
    pub fn fail_next_bulk_insert(&self) {
        self.fail_next_bulk_insert.store(true, Ordering::SeqCst);
    }

    pub async fn asset(&self, asset_id: Uuid) -> Option<DataAsset> {
        self.state.read().await.assets_by_id.get(&asset_id).cloned()
    }

    pub async fn classifications_for(&self, asset_id: Uuid) -> Vec<Classification> {
        self.state.read().await.classifications_by_asset.get(&asset_id).cloned().unwrap_or_default()
    }

    pub async fn findings_for(&self, asset_id: Uuid) -> Vec<Finding> {
        self.state
            .read()
            .await
            .findings_by_id
            .values()
            .filter(|f| f.asset_id == Some(asset_id))
            .cloned()
            .collect()
    }

    pub async fn all_findings(&self) -> Vec<Finding> {
        self.state.read().await.findings_by_id.values().cloned().collect()
    }

    pub async fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.state.read().await.jobs.get(&job_id).map(|j| j.status)
    }

    pub async fn account_last_scan(&self, account_id: Uuid) -> Option<JobStatus> {
        self.state.read().await.account_last_scan.get(&account_id).copied()
    }

    pub async fn asset_count(&self) -> usize {
        self.state.read().await.assets_by_id.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_asset(&self, asset: &DataAsset) -> Result<Uuid, DspmError> {
        let key = (asset.account_id, asset.resource_arn.clone());
        let mut state = self.state.write().await;
        let id = state.asset_id_by_key.get(&key).copied().unwrap_or(asset.id);

        let mut row = asset.clone();
        row.id = id;
        row.last_scanned_at = Some(Utc::now());
        state.asset_id_by_key.insert(key, id);
        state.assets_by_id.insert(id, row);
        Ok(id)
    }

    async fn bulk_insert_classifications(&self, batch: &[Classification]) -> Result<(), DspmError> {
        if self.fail_next_bulk_insert.swap(false, Ordering::SeqCst) {
            return Err(DspmError::Store("simulated batch-level insert failure".into()));
        }
        let mut state = self.state.write().await;
        for row in batch {
            state.classifications_by_asset.entry(row.asset_id).or_default().push(row.clone());
        }
        Ok(())
    }

    async fn create_finding(&self, finding: &Finding) -> Result<Uuid, DspmError> {
        let mut state = self.state.write().await;
        if let Some(asset_id) = finding.asset_id {
            if !state.assets_by_id.contains_key(&asset_id) {
                return Err(DspmError::NotFound(format!("asset {asset_id} referenced by finding does not exist")));
            }
        }
        state.findings_by_id.insert(finding.id, finding.clone());
        Ok(finding.id)
    }

    async fn delete_classifications_for_asset(&self, asset_id: Uuid) -> Result<(), DspmError> {
        self.state.write().await.classifications_by_asset.remove(&asset_id);
        Ok(())
    }

    async fn delete_findings_for_asset(&self, asset_id: Uuid) -> Result<(), DspmError> {
        self.state.write().await.findings_by_id.retain(|_, f| f.asset_id != Some(asset_id));
        Ok(())
    }

    async fn update_asset_classification(
        &self,
        asset_id: Uuid,
        max_sensitivity: SensitivityLevel,
        categories: &BTreeSet<DataCategory>,
        count: u64,
    ) -> Result<(), DspmError> {
        let mut state = self.state.write().await;
        match state.assets_by_id.get_mut(&asset_id) {
            Some(asset) => {
                asset.sensitivity = max_sensitivity;
                asset.data_categories = categories.clone();
                asset.classification_count = count;
                asset.updated_at = Utc::now();
                Ok(())
            }
            None => Err(DspmError::NotFound(format!("asset {asset_id} not found for classification summary update"))),
        }
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, _actor: &str) -> Result<(), DspmError> {
        self.state.write().await.jobs.entry(job_id).or_default().status = status;
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        scanned_assets: u64,
        scanned_objects: u64,
        classifications_found: u64,
        findings_found: u64,
    ) -> Result<(), DspmError> {
        let mut state = self.state.write().await;
        let job = state.jobs.entry(job_id).or_default();
        job.scanned_assets = scanned_assets;
        job.scanned_objects = scanned_objects;
        job.classifications_found = classifications_found;
        job.findings_found = findings_found;
        Ok(())
    }

    async fn update_account_last_scan(&self, account_id: Uuid, status: JobStatus) -> Result<(), DspmError> {
        self.state.write().await.account_last_scan.insert(account_id, status);
        Ok(())
    }
}

/// One fixture object: its descriptor, its bytes, and the content-type hint
/// the enumerator would have derived from its extension/MIME type.
#[derive(Debug, Clone)]
pub struct FixtureObject {
    pub descriptor: ObjectDescriptor,
    pub bytes: Vec<u8>,
    pub content_type_hint: ContentTypeHint,
    /// Artificial delay before `open_object` returns, for tests that need a
    /// scan slow enough to cancel mid-flight.
    pub read_delay: Option<std::time::Duration>,
}

impl FixtureObject {
    pub fn new(descriptor: ObjectDescriptor, bytes: Vec<u8>, content_type_hint: ContentTypeHint) -> Self {
        Self { descriptor, bytes, content_type_hint, read_delay: None }
    }

    pub fn with_read_delay(mut self, delay: std::time::Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }
}

/// A pre-seeded `StorageEnumerator`: a fixed list of assets, each with a
/// fixed list of objects and their content, configured by a test before the
/// pipeline runs against it.
#[derive(Default)]
pub struct InMemoryEnumerator {
    assets: Vec<AssetDescriptor>,
    objects_by_arn: HashMap<String, Vec<FixtureObject>>,
    fail_validate: bool,
}

impl InMemoryEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_validation(mut self) -> Self {
        self.fail_validate = true;
        self
    }

    pub fn with_asset(mut self, asset: AssetDescriptor, objects: Vec<FixtureObject>) -> Self {
        self.objects_by_arn.insert(asset.resource_arn.clone(), objects);
        self.assets.push(asset);
        self
    }
}

#[async_trait]
impl StorageEnumerator for InMemoryEnumerator {
    async fn validate(&self) -> Result<(), DspmError> {
        if self.fail_validate {
            return Err(DspmError::Authentication("simulated credential failure".into()));
        }
        Ok(())
    }

    async fn list_assets(&self, scope: &ScanScope) -> Result<BoxStream<'static, Result<AssetDescriptor, DspmError>>, DspmError> {
        let buckets = scope.buckets.clone();
        let items: Vec<Result<AssetDescriptor, DspmError>> = self
            .assets
            .iter()
            .filter(|a| buckets.as_ref().map(|b| b.iter().any(|name| a.resource_arn.contains(name))).unwrap_or(true))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn list_objects(&self, asset: &AssetDescriptor) -> Result<BoxStream<'static, Result<ObjectDescriptor, DspmError>>, DspmError> {
        let items: Vec<Result<ObjectDescriptor, DspmError>> = self
            .objects_by_arn
            .get(&asset.resource_arn)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|fixture| Ok(fixture.descriptor))
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn open_object(&self, asset: &AssetDescriptor, path: &str, offset: u64, max_bytes: u64) -> Result<ObjectContent, DspmError> {
        let fixture = self
            .objects_by_arn
            .get(&asset.resource_arn)
            .and_then(|objects| objects.iter().find(|o| o.descriptor.path == path))
            .ok_or_else(|| DspmError::TransientIo { path: path.to_string(), source: "no such fixture object".into() })?;

        if let Some(delay) = fixture.read_delay {
            tokio::time::sleep(delay).await;
        }

        let offset = (offset as usize).min(fixture.bytes.len());
        let remaining = &fixture.bytes[offset..];
        let ceiling = max_bytes as usize;
        let truncated = remaining.len() > ceiling;
        let bytes = if truncated { remaining[..ceiling].to_vec() } else { remaining.to_vec() };
        Ok(ObjectContent { bytes, content_type_hint: fixture.content_type_hint, truncated })
    }
}

/// Hands every account the same pre-built enumerator. Sufficient for tests
/// that only ever scan one account at a time.
pub struct SingleAccountEnumeratorFactory {
    enumerator: Arc<dyn StorageEnumerator>,
}

impl SingleAccountEnumeratorFactory {
    pub fn new(enumerator: Arc<dyn StorageEnumerator>) -> Self {
        Self { enumerator }
    }
}

impl EnumeratorFactory for SingleAccountEnumeratorFactory {
    fn build(&self, _account_id: Uuid) -> Result<Arc<dyn StorageEnumerator>, DspmError> {
        Ok(self.enumerator.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncryptionStatus;

    fn sample_asset(account_id: Uuid, arn: &str) -> AssetDescriptor {
        AssetDescriptor {
            provisional_id: crate::enumerator::provisional_asset_id(account_id, arn),
            account_id,
            resource_type: "s3_bucket".into(),
            resource_arn: arn.into(),
            display_name: arn.into(),
            region: "us-east-1".into(),
            public_access: false,
            encryption_status: EncryptionStatus::Cmk,
        }
    }

    #[tokio::test]
    async fn store_upsert_is_keyed_by_account_and_arn_not_incoming_id() {
        let store = InMemoryStore::new();
        let account_id = Uuid::new_v4();
        let mut asset = DataAsset::new(account_id, "s3_bucket", "arn:aws:s3:::bucket/a", "us-east-1");
        let first_id = store.upsert_asset(&asset).await.unwrap();

        asset.id = Uuid::new_v4();
        let second_id = store.upsert_asset(&asset).await.unwrap();
        assert_eq!(first_id, second_id);
        assert_eq!(store.asset_count().await, 1);
    }

    #[tokio::test]
    async fn create_finding_rejects_unknown_asset_reference() {
        let store = InMemoryStore::new();
        let finding = Finding::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            "test_finding",
            "title",
            "description",
            crate::model::FindingSeverity::Low,
            serde_json::json!({}),
        );
        assert!(store.create_finding(&finding).await.is_err());
    }

    #[tokio::test]
    async fn bulk_insert_fails_exactly_once_after_fail_next_is_armed() {
        let store = InMemoryStore::new();
        store.fail_next_bulk_insert();
        let batch = vec![];
        assert!(store.bulk_insert_classifications(&batch).await.is_err());
        assert!(store.bulk_insert_classifications(&batch).await.is_ok());
    }

    #[tokio::test]
    async fn enumerator_lists_seeded_assets_and_objects() {
        let account_id = Uuid::new_v4();
        let asset = sample_asset(account_id, "arn:aws:s3:::bucket/a");
        let object = FixtureObject::new(
            ObjectDescriptor { path: "readme.txt".into(), size: 4, last_modified: Utc::now() },
            b"hi!!".to_vec(),
            ContentTypeHint::Text,
        );
        let enumerator = InMemoryEnumerator::new().with_asset(asset.clone(), vec![object]);

        let mut stream = enumerator.list_assets(&ScanScope::default()).await.unwrap();
        let first = futures::StreamExt::next(&mut stream).await.unwrap().unwrap();
        assert_eq!(first.resource_arn, asset.resource_arn);

        let content = enumerator.open_object(&asset, "readme.txt", 0, 1024).await.unwrap();
        assert_eq!(content.bytes, b"hi!!");
        assert!(!content.truncated);
    }
}
