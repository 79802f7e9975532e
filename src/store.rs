// phantom-dspm-core/src/store.rs
// The SQL persistence layer is an external collaborator; this module only
// defines the contract the orchestrator and collector depend on.

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DspmError;
use crate::model::{Classification, DataAsset, DataCategory, Finding, JobStatus, SensitivityLevel};

/// Persistence operations consumed by the orchestrator and collector.
/// Every method is either a single statement or a short transaction; no
/// method may hold a transaction open across an `.await` on anything but
/// the store itself.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates by `(account_id, resource_arn)`; returns the
    /// row's stable ID.
    async fn upsert_asset(&self, asset: &DataAsset) -> Result<Uuid, DspmError>;

    /// All-or-nothing insert of the batch. Callers retry per-row on
    /// failure; this method itself never partially applies a batch.
    async fn bulk_insert_classifications(&self, batch: &[Classification]) -> Result<(), DspmError>;

    /// Single insert with foreign-key validation against `asset_id`, when
    /// present.
    async fn create_finding(&self, finding: &Finding) -> Result<Uuid, DspmError>;

    async fn delete_classifications_for_asset(&self, asset_id: Uuid) -> Result<(), DspmError>;

    async fn delete_findings_for_asset(&self, asset_id: Uuid) -> Result<(), DspmError>;

    /// Idempotent summary writer.
    async fn update_asset_classification(
        &self,
        asset_id: Uuid,
        max_sensitivity: SensitivityLevel,
        categories: &BTreeSet<DataCategory>,
        count: u64,
    ) -> Result<(), DspmError>;

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, actor: &str) -> Result<(), DspmError>;

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        scanned_assets: u64,
        scanned_objects: u64,
        classifications_found: u64,
        findings_found: u64,
    ) -> Result<(), DspmError>;

    async fn update_account_last_scan(&self, account_id: Uuid, status: JobStatus) -> Result<(), DspmError>;
}
