//! Core scan engine for cloud data security posture management: pattern
//! matching, classification, encryption compliance scoring, and the
//! concurrent enumerate -> classify -> persist pipeline that drives them.
//!
//! This crate is a library, not a service. The SQL store, cloud SDKs, HTTP
//! surface, scheduler and notification delivery are external collaborators
//! represented here only as `async_trait` interfaces (`Store`,
//! `StorageEnumerator`, `EnumeratorFactory`); a consuming binary supplies
//! real implementations. The [`testing`] module ships in-memory doubles of
//! both so the pipeline is exercisable without either.

pub mod classifier;
pub mod collector;
pub mod compliance;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pattern_library;
pub mod pipeline;
pub mod store;
pub mod telemetry;

pub mod testing;

pub use classifier::{Classifier, ClassifyInput, Match};
pub use collector::{CollectorOutcome, ResultCollector};
pub use compliance::{score as score_compliance, ComplianceReport, EncryptionProfile, Grade, ScoringWeights};
pub use config::{ClassifierConfig, PipelineConfig};
pub use enumerator::{provisional_asset_id, AssetDescriptor, ObjectContent, ObjectDescriptor, StorageEnumerator};
pub use error::{DspmError, DspmResult};
pub use model::{
    AccountStatus, AssetSummary, Classification, CloudAccount, DataAsset, DataCategory, Finding, FindingSeverity,
    FindingStatus, JobProgress, JobStatus, MatchLocation, Provider, SampleMatch, ScanJob, ScanScope, ScanType,
    SensitivityLevel,
};
pub use orchestrator::{EnumeratorFactory, ScanOrchestrator, ScanTriggerRequest};
pub use pattern_library::{ContentTypeHint, PatternLibrary, PatternRule, RuleSet, RuleSpec};
pub use pipeline::{CancellationToken, PipelineError, ScanPipeline};
pub use store::Store;
