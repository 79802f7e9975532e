// phantom-dspm-core/src/enumerator.rs
// Provider-agnostic adapter the pipeline consumes. Real cloud-SDK backed
// implementations live outside this crate; this module only defines the
// contract plus the stable provisional-ID hash the pipeline relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::DspmError;
use crate::model::{EncryptionStatus, ScanScope};
use crate::pattern_library::ContentTypeHint;

/// Stable hash of `(account_id, resource_arn)`, usable as a cross-stage
/// reference before the store assigns a durable ID. Deterministic so the
/// same asset always yields the same provisional ID within a process.
pub fn provisional_asset_id(account_id: Uuid, resource_arn: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{account_id}:{resource_arn}").as_bytes())
}

/// An asset as seen by the enumerator, before persistence.
#[derive(Debug, Clone)]
pub struct AssetDescriptor {
    pub provisional_id: Uuid,
    pub account_id: Uuid,
    pub resource_type: String,
    pub resource_arn: String,
    pub display_name: String,
    pub region: String,
    pub public_access: bool,
    pub encryption_status: EncryptionStatus,
}

/// An object within an asset, before it is opened.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// A streamed read of one object's content.
pub struct ObjectContent {
    pub bytes: Vec<u8>,
    pub content_type_hint: ContentTypeHint,
    pub truncated: bool,
}

/// Adapter interface over a cloud provider's storage surface. Never
/// mutates the cloud side; every operation is read-only.
#[async_trait]
pub trait StorageEnumerator: Send + Sync {
    /// Probes credentials. Returns an `Authentication`/`Authorization`
    /// error on failure; either is fatal to the job that calls it.
    async fn validate(&self) -> Result<(), DspmError>;

    /// A finite, non-restartable sequence of assets within `scope`.
    async fn list_assets(&self, scope: &ScanScope) -> Result<BoxStream<'static, Result<AssetDescriptor, DspmError>>, DspmError>;

    /// A finite, non-restartable sequence of objects within `asset`,
    /// paginating internally as needed.
    async fn list_objects(&self, asset: &AssetDescriptor) -> Result<BoxStream<'static, Result<ObjectDescriptor, DspmError>>, DspmError>;

    /// Reads at most `max_bytes` of `path` within `asset`, starting at
    /// `offset`. `ObjectContent::truncated` tells the caller whether bytes
    /// remain past `offset + bytes.len()`, so a large object can be pulled
    /// in successive overlapping windows rather than read whole. Guarantees
    /// release of the underlying I/O handle on every exit path, including
    /// errors and cancellation.
    async fn open_object(&self, asset: &AssetDescriptor, path: &str, offset: u64, max_bytes: u64) -> Result<ObjectContent, DspmError>;

    /// Releases any resources held by this enumerator instance.
    async fn close(&self) -> Result<(), DspmError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_id_is_stable_for_the_same_inputs() {
        let account_id = Uuid::new_v4();
        let a = provisional_asset_id(account_id, "arn:aws:s3:::bucket/key");
        let b = provisional_asset_id(account_id, "arn:aws:s3:::bucket/key");
        assert_eq!(a, b);
    }

    #[test]
    fn provisional_id_differs_for_different_arns() {
        let account_id = Uuid::new_v4();
        let a = provisional_asset_id(account_id, "arn:aws:s3:::bucket/one");
        let b = provisional_asset_id(account_id, "arn:aws:s3:::bucket/two");
        assert_ne!(a, b);
    }
}
