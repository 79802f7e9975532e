// phantom-dspm-core/src/model.rs
// Domain entities shared by the pipeline, collector and orchestrator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DspmError;

/// Cloud provider a `CloudAccount` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

/// Tenant-owned credential bundle. The connector configuration is treated
/// as opaque by this crate; it is only ever handed to a `StorageEnumerator`
/// implementation the pipeline does not construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudAccount {
    pub id: Uuid,
    pub provider: Provider,
    pub external_account_id: String,
    pub display_name: String,
    pub connector_config: std::collections::HashMap<String, String>,
    pub status: AccountStatus,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Full,
    Incremental,
    Lineage,
    AiServices,
    Encryption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether `self -> next` is an allowed edge in the job state machine
    /// DAG: `pending -> running -> {completed|failed|cancelled}`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Pending, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Allowlist restricting which buckets/regions a scan enumerates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanScope {
    pub buckets: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
}

/// One scan attempt against one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub scan_type: ScanType,
    pub status: JobStatus,
    pub scope: Option<ScanScope>,
    pub scanned_assets: u64,
    pub scanned_objects: u64,
    pub classifications_found: u64,
    pub findings_found: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trigger_source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(account_id: Uuid, scan_type: ScanType, scope: Option<ScanScope>, trigger_source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            scan_type,
            status: JobStatus::Pending,
            scope,
            scanned_assets: 0,
            scanned_objects: 0,
            classifications_found: 0,
            findings_found: 0,
            started_at: None,
            ended_at: None,
            trigger_source: trigger_source.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status transition, rejecting any edge outside the DAG.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), DspmError> {
        if !self.status.can_transition_to(next) {
            return Err(DspmError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.ended_at = Some(Utc::now())
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Progress counters never decrease until the job reaches a terminal
    /// status; this merges a delta rather than overwriting.
    pub fn add_progress(&mut self, assets: u64, objects: u64, classifications: u64, findings: u64) {
        self.scanned_assets += assets;
        self.scanned_objects += objects;
        self.classifications_found += classifications;
        self.findings_found += findings;
        self.updated_at = Utc::now();
    }
}

/// Read model for an in-flight or completed job, safe to poll concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub scanned_assets: u64,
    pub scanned_objects: u64,
    pub classifications_found: u64,
    pub findings_found: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&ScanJob> for JobProgress {
    fn from(job: &ScanJob) -> Self {
        Self {
            status: job.status,
            scanned_assets: job.scanned_assets,
            scanned_objects: job.scanned_objects,
            classifications_found: job.classifications_found,
            findings_found: job.findings_found,
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStatus {
    None,
    Sse,
    SseKms,
    Cmk,
}

/// Ordering reflects the severity ladder used for max-sensitivity rollups:
/// `critical > high > medium > low > unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Pii,
    Phi,
    Pci,
    Secrets,
    Custom,
}

/// A discovered cloud resource that may contain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAsset {
    pub id: Uuid,
    pub account_id: Uuid,
    pub resource_type: String,
    pub resource_arn: String,
    pub display_name: String,
    pub region: String,
    pub encryption_status: EncryptionStatus,
    pub encryption_key_arn: Option<String>,
    pub public_access: bool,
    pub sensitivity: SensitivityLevel,
    pub data_categories: BTreeSet<DataCategory>,
    pub classification_count: u64,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataAsset {
    pub fn new(account_id: Uuid, resource_type: impl Into<String>, resource_arn: impl Into<String>, region: impl Into<String>) -> Self {
        let now = Utc::now();
        let resource_arn = resource_arn.into();
        Self {
            id: Uuid::new_v4(),
            account_id,
            resource_type: resource_type.into(),
            display_name: resource_arn.clone(),
            resource_arn,
            region: region.into(),
            encryption_status: EncryptionStatus::None,
            encryption_key_arn: None,
            public_access: false,
            sensitivity: SensitivityLevel::Unknown,
            data_categories: BTreeSet::new(),
            classification_count: 0,
            last_scanned_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One position a rule matched at, prior to masking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLocation {
    pub line: u32,
    pub column: Option<u32>,
    pub column_name: Option<String>,
}

/// A masked sample of one match, safe to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMatch {
    pub line: u32,
    pub column: Option<u32>,
    pub column_name: Option<String>,
    pub value: String,
    pub context: Option<String>,
}

/// One rule hit on one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub object_path: String,
    pub object_size: u64,
    pub rule_name: String,
    pub category: DataCategory,
    pub sensitivity: SensitivityLevel,
    pub match_count: u32,
    pub confidence: f64,
    pub sample_matches: Vec<SampleMatch>,
    pub match_locations: Vec<MatchLocation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    InProgress,
    Resolved,
    Suppressed,
}

impl FindingStatus {
    pub fn can_transition_to(self, next: FindingStatus) -> bool {
        use FindingStatus::*;
        matches!(
            (self, next),
            (Open, InProgress) | (Open, Resolved) | (Open, Suppressed) | (InProgress, Resolved) | (InProgress, Suppressed)
        )
    }
}

/// A security issue tied to an account and, usually, an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub account_id: Uuid,
    pub asset_id: Option<Uuid>,
    pub finding_type: String,
    pub title: String,
    pub description: String,
    pub severity: FindingSeverity,
    pub status: FindingStatus,
    pub evidence: serde_json::Value,
    pub remediation: Option<String>,
    pub compliance_references: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Finding {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: Uuid,
        asset_id: Option<Uuid>,
        finding_type: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        severity: FindingSeverity,
        evidence: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            asset_id,
            finding_type: finding_type.into(),
            title: title.into(),
            description: description.into(),
            severity,
            status: FindingStatus::Open,
            evidence,
            remediation: None,
            compliance_references: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Rolling per-asset aggregate the collector maintains while batching
/// classifications, flushed as a single summary write.
#[derive(Debug, Clone, Default)]
pub struct AssetSummary {
    pub max_sensitivity: Option<SensitivityLevel>,
    pub categories: BTreeSet<DataCategory>,
    pub count: u64,
}

impl AssetSummary {
    pub fn record(&mut self, classification: &Classification) {
        self.max_sensitivity = Some(match self.max_sensitivity {
            Some(current) if current >= classification.sensitivity => current,
            _ => classification.sensitivity,
        });
        self.categories.insert(classification.category);
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn job_transitions_follow_the_dag() {
        let mut job = ScanJob::new(Uuid::new_v4(), ScanType::Full, None, "manual");
        assert_eq!(job.status, JobStatus::Pending);
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.ended_at.is_some());
        assert!(job.transition(JobStatus::Running).is_err());
    }

    #[test]
    fn sensitivity_ordering_matches_the_ladder() {
        assert!(SensitivityLevel::Critical > SensitivityLevel::High);
        assert!(SensitivityLevel::High > SensitivityLevel::Medium);
        assert!(SensitivityLevel::Medium > SensitivityLevel::Low);
        assert!(SensitivityLevel::Low > SensitivityLevel::Unknown);
    }

    #[test]
    fn asset_summary_tracks_max_sensitivity_categories_and_count() {
        let asset_id = Uuid::new_v4();
        let mut summary = AssetSummary::default();
        let low = Classification {
            id: Uuid::new_v4(),
            asset_id,
            object_path: "a.txt".into(),
            object_size: 10,
            rule_name: "Email Detector".into(),
            category: DataCategory::Pii,
            sensitivity: SensitivityLevel::Low,
            match_count: 1,
            confidence: 0.8,
            sample_matches: vec![],
            match_locations: vec![],
            created_at: Utc::now(),
        };
        let mut critical = low.clone();
        critical.category = DataCategory::Pci;
        critical.sensitivity = SensitivityLevel::Critical;

        summary.record(&low);
        summary.record(&critical);

        assert_eq!(summary.max_sensitivity, Some(SensitivityLevel::Critical));
        assert_eq!(summary.categories.len(), 2);
        assert_eq!(summary.count, 2);
    }

    fn arb_sensitivity() -> impl proptest::strategy::Strategy<Value = SensitivityLevel> {
        prop_oneof![
            Just(SensitivityLevel::Unknown),
            Just(SensitivityLevel::Low),
            Just(SensitivityLevel::Medium),
            Just(SensitivityLevel::High),
            Just(SensitivityLevel::Critical),
        ]
    }

    fn arb_category() -> impl proptest::strategy::Strategy<Value = DataCategory> {
        prop_oneof![
            Just(DataCategory::Pii),
            Just(DataCategory::Phi),
            Just(DataCategory::Pci),
            Just(DataCategory::Secrets),
            Just(DataCategory::Custom),
        ]
    }

    fn classification_with(asset_id: Uuid, sensitivity: SensitivityLevel, category: DataCategory) -> Classification {
        Classification {
            id: Uuid::new_v4(),
            asset_id,
            object_path: "fixture".into(),
            object_size: 0,
            rule_name: "fixture rule".into(),
            category,
            sensitivity,
            match_count: 1,
            confidence: 0.5,
            sample_matches: vec![],
            match_locations: vec![],
            created_at: Utc::now(),
        }
    }

    proptest! {
        // `AssetSummary::record`, folded over any batch of classifications in
        // any order, must land on the batch's true max sensitivity, the exact
        // set of categories seen and a count equal to the batch length --
        // independent of the order the collector happens to deliver them in.
        #[test]
        fn asset_summary_is_order_independent_and_matches_its_batch(
            hits in proptest::collection::vec((arb_sensitivity(), arb_category()), 0..32)
        ) {
            let asset_id = Uuid::new_v4();
            let classifications: Vec<Classification> = hits
                .iter()
                .map(|(s, c)| classification_with(asset_id, *s, *c))
                .collect();

            let mut forward = AssetSummary::default();
            for c in &classifications {
                forward.record(c);
            }

            let mut reversed = AssetSummary::default();
            for c in classifications.iter().rev() {
                reversed.record(c);
            }

            let expected_max = hits.iter().map(|(s, _)| *s).max();
            let expected_categories: BTreeSet<DataCategory> = hits.iter().map(|(_, c)| *c).collect();

            prop_assert_eq!(forward.max_sensitivity, expected_max);
            prop_assert_eq!(forward.categories.clone(), expected_categories.clone());
            prop_assert_eq!(forward.count, hits.len() as u64);

            // Order must not change the outcome: summaries are a fold over a
            // commutative, associative accumulator.
            prop_assert_eq!(reversed.max_sensitivity, forward.max_sensitivity);
            prop_assert_eq!(reversed.categories, forward.categories);
            prop_assert_eq!(reversed.count, forward.count);
        }
    }
}
