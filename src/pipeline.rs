// 🚚 Upload pipeline - file → parse → validate → reconcile → persist → notify
//
// PlanIngestor never panics on bad input and never returns a bare error:
// every outcome is an UploadResult the caller can show as-is.

use crate::config::IngestConfig;
use crate::data_quality::{ValidationGate, ValidationReport};
use crate::entities::{PlanMetadata, PlanWithEntries, RegistrySite, UploaderContext};
use crate::error::{IngestError, Stage};
use crate::notifications::{notify_best_effort, LogNotificationSink, Notification, NotificationSink};
use crate::parser::{detect_format, get_parser, ParseOutcome};
use crate::persistence::{BatchPersistenceCoordinator, PersistJob, PersistOutcome};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::reconciliation::{IdentityMatch, SiteRegistryReconciler};
use crate::store::{ObjectStore, RecordStore};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Review-required matches listed individually in the warnings
const REVIEW_WARNING_LIMIT: usize = 10;

/// Validation warnings copied into the result warnings
const VALIDATION_WARNING_LIMIT: usize = 20;

// ============================================================================
// REQUEST / RESULT
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub metadata: PlanMetadata,
}

impl UploadRequest {
    pub fn new(file_name: &str, bytes: Vec<u8>) -> Self {
        UploadRequest {
            file_name: file_name.to_string(),
            bytes,
            metadata: PlanMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: PlanMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub created: usize,
    pub linked: usize,
    pub review_required: usize,

    /// One per distinct site identity in the file
    pub matches: Vec<IdentityMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub plan: Option<PlanWithEntries>,
    pub registry: Option<RegistrySummary>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,

    /// `type,row,column,category,message` report of every validation issue
    pub issues_report: Option<String>,
    pub validation: Option<ValidationReport>,
}

impl UploadResult {
    fn failed(error: &IngestError, validation: Option<ValidationReport>) -> Self {
        let issues_report = validation.as_ref().and_then(|report| match report.to_csv() {
            Ok(csv) => Some(csv),
            Err(e) => {
                tracing::warn!(error = %e, "could not render issues report");
                None
            }
        });
        let warnings = validation
            .as_ref()
            .map(|report| report.warning_messages(VALIDATION_WARNING_LIMIT))
            .unwrap_or_default();

        UploadResult {
            success: false,
            plan: None,
            registry: None,
            warnings,
            error: Some(error.to_string()),
            error_code: Some(error.code().to_string()),
            issues_report,
            validation,
        }
    }
}

/// Failure plus the validation report, when validation got that far
struct Rejection {
    error: IngestError,
    validation: Option<ValidationReport>,
}

impl From<IngestError> for Rejection {
    fn from(error: IngestError) -> Self {
        Rejection {
            error,
            validation: None,
        }
    }
}

// ============================================================================
// INGESTOR
// ============================================================================

pub struct PlanIngestor {
    config: IngestConfig,
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    notifier: Arc<dyn NotificationSink>,
    coordinator: BatchPersistenceCoordinator,
}

impl PlanIngestor {
    pub fn new(
        config: IngestConfig,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let coordinator =
            BatchPersistenceCoordinator::new(Arc::clone(&records), Arc::clone(&objects), &config);
        PlanIngestor {
            config,
            records,
            objects,
            notifier: Arc::new(LogNotificationSink),
            coordinator,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub async fn ingest(
        &self,
        request: UploadRequest,
        uploader: &UploaderContext,
        progress: Option<&dyn ProgressReporter>,
        cancel: &CancellationToken,
    ) -> UploadResult {
        let span = tracing::info_span!(
            "ingest",
            upload_id = %Uuid::new_v4(),
            file = %request.file_name,
            uploader = %uploader.id
        );
        let tracker = ProgressTracker::new(progress);

        match self.run(request, uploader, &tracker, cancel).instrument(span).await {
            Ok((outcome, validation)) => self.succeeded(outcome, validation).await,
            Err(rejection) => {
                tracing::warn!(code = rejection.error.code(), error = %rejection.error, "upload rejected");
                UploadResult::failed(&rejection.error, rejection.validation)
            }
        }
    }

    async fn run(
        &self,
        request: UploadRequest,
        uploader: &UploaderContext,
        progress: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<(PersistOutcome, ValidationReport), Rejection> {
        let UploadRequest {
            file_name,
            bytes,
            metadata,
        } = request;

        // size + type
        if bytes.len() > self.config.max_file_bytes {
            return Err(IngestError::FileTooLarge {
                size: bytes.len(),
                limit: self.config.max_file_bytes,
            }
            .into());
        }
        let parser = get_parser(detect_format(&file_name)?);
        tracing::debug!(parser = parser.name(), version = parser.version(), "parser selected");
        progress.report(5, "Checking file");

        // parse and registry fetch are independent
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled { stage: Stage::Parse }.into());
        }
        let bytes: Arc<[u8]> = Arc::from(bytes);
        let parse_task = {
            let bytes = Arc::clone(&bytes);
            let file_name = file_name.clone();
            tokio::task::spawn_blocking(move || parser.parse(&bytes, &file_name))
        };
        let (parsed, registry) = tokio::join!(parse_task, self.fetch_registry());
        let parsed: ParseOutcome = parsed.map_err(|e| {
            IngestError::persistence(
                Stage::Parse,
                crate::error::StoreError::Join(e.to_string()),
            )
        })?;
        progress.report(15, "Parsing file");
        tracing::info!(
            entries = parsed.entries.len(),
            delimiter = %parsed.delimiter,
            "file parsed"
        );

        // validation gate: stop before any write
        let validation = ValidationGate::new()
            .with_expected_hub(metadata.hub.as_deref())
            .validate(&parsed);
        progress.report(25, "Validating file");
        if validation.has_blocking() {
            return Err(Rejection {
                error: IngestError::Validation {
                    blocking: validation.blocking_count(),
                },
                validation: Some(validation),
            });
        }
        tracing::info!(
            warnings = validation.warning_count(),
            "{}",
            validation.headline()
        );

        let registry = match registry {
            Ok(sites) => sites,
            Err(error) => {
                return Err(Rejection {
                    error,
                    validation: Some(validation),
                })
            }
        };

        let reconciliation = SiteRegistryReconciler::new()
            .with_activity_type(&self.config.default_activity_type)
            .with_default_hub(metadata.hub.as_deref())
            .plan(&registry, &parsed.entries);
        progress.report(30, "Matching sites against registry");

        let job = PersistJob {
            file_name: &file_name,
            bytes: &bytes,
            entries: &parsed.entries,
            reconciliation,
            metadata: &metadata,
            uploader,
        };
        match self.coordinator.persist(job, progress, cancel).await {
            Ok(outcome) => Ok((outcome, validation)),
            Err(error) => Err(Rejection {
                error,
                validation: Some(validation),
            }),
        }
    }

    async fn fetch_registry(&self) -> Result<Vec<RegistrySite>, IngestError> {
        match tokio::time::timeout(self.config.step_timeout, self.records.list_sites()).await {
            Ok(Ok(sites)) => Ok(sites),
            Ok(Err(e)) => Err(IngestError::persistence(Stage::RegistryFetch, e)),
            Err(_) => Err(IngestError::Timeout {
                stage: Stage::RegistryFetch,
                timeout: self.config.step_timeout,
            }),
        }
    }

    async fn succeeded(&self, outcome: PersistOutcome, validation: ValidationReport) -> UploadResult {
        let PersistOutcome {
            plan,
            reconciliation,
            warnings: persist_warnings,
            ..
        } = outcome;

        let mut warnings = vec![reconciliation.summary_message()];
        warnings.extend(persist_warnings);

        let review: Vec<&IdentityMatch> = reconciliation.review_required().collect();
        for m in review.iter().take(REVIEW_WARNING_LIMIT) {
            warnings.push(format!(
                "Row {}: matched registry site {} by {} ({:.0}% confidence), please review",
                m.first_row,
                m.result.site_code,
                m.result.tier.as_str(),
                m.result.confidence * 100.0
            ));
        }
        if review.len() > REVIEW_WARNING_LIMIT {
            warnings.push(format!(
                "... and {} more site matches need review",
                review.len() - REVIEW_WARNING_LIMIT
            ));
        }
        warnings.extend(validation.warning_messages(VALIDATION_WARNING_LIMIT));

        let registry = RegistrySummary {
            created: reconciliation.created_count(),
            linked: reconciliation.linked_count(),
            review_required: review.len(),
            matches: reconciliation.matches.clone(),
        };

        notify_best_effort(
            self.notifier.as_ref(),
            &Notification::plan_uploaded(&plan.plan),
            self.config.step_timeout,
        )
        .await;

        UploadResult {
            success: true,
            plan: Some(plan),
            registry: Some(registry),
            warnings,
            error: None,
            error_code: None,
            issues_report: None,
            validation: Some(validation),
        }
    }
}
