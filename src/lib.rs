// MMP Ingest - Core Library
// Monitoring-plan upload pipeline used by the CLI, the API server and tests

pub mod config;
pub mod data_quality;
pub mod db;
pub mod deduplication;
pub mod entities;
pub mod error;
pub mod memory;
pub mod notifications;
pub mod parser;
pub mod persistence;
pub mod pipeline;
pub mod progress;
pub mod reconciliation;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use config::IngestConfig;
pub use data_quality::{Issue, IssueCategory, IssueKind, ValidationGate, ValidationReport};
pub use db::{setup_database, Event, SqliteRecordStore};
pub use deduplication::{normalize_code, normalize_text, IdentityKey, OccurrenceIndex};
pub use entities::{
    CanonicalField, MatchTier, MonitoringPlanRecord, PersistedSiteEntry, PlanMetadata, PlanStatus,
    PlanWithEntries, RegistryLinkage, RegistrySite, SiteEntry, UploaderContext, UploaderProfile,
};
pub use error::{IngestError, Stage, StoreError, StoreResult};
pub use memory::{MemoryObjectStore, MemoryRecordStore, StaticProfileDirectory};
pub use notifications::{LogNotificationSink, MemoryNotificationSink, Notification, NotificationSink};
pub use parser::{
    coerce_bool, detect_format, get_parser, looks_like_date, DelimitedPlanParser, FileValidator,
    ParseOutcome, PlanFileParser, SourceRow, SYNONYMS,
};
pub use persistence::{
    sweep_stale_pending, BatchPersistenceCoordinator, PersistJob, PersistOutcome, SweepReport,
};
pub use pipeline::{PlanIngestor, RegistrySummary, UploadRequest, UploadResult};
pub use progress::{NoopProgress, ProgressReporter, ProgressTracker, TracingProgress};
pub use reconciliation::{
    generate_site_code, MatchResult, ReconciliationPlan, SiteRegistryReconciler,
};
pub use storage::LocalObjectStore;
pub use store::{resolve_uploader, ObjectStore, ProfileDirectory, RecordStore, StoredObject};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
