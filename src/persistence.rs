// 💾 Batch persistence - upload, duplicate check, registry writes, batched
// entry inserts, commit, and the compensation chain when any of it fails
//
// Plans are written as `pending` and only flip to `active` in the final
// atomic commit, together with the registry count increments. Anything that
// goes wrong before that point is undone in reverse order. Registry rows are
// shared with concurrent uploads, so a rollback never deletes them: rows that
// end up unused are collected by `sweep_stale_pending` once older than the
// pending TTL, together with plans left pending by a crashed process.

use crate::config::IngestConfig;
use crate::entities::{
    generate_mmp_id, plan_name_from_filename, MonitoringPlanRecord, PersistedSiteEntry,
    PlanFilter, PlanMetadata, PlanStatus, PlanWithEntries, SiteEntry, UploaderContext,
};
use crate::error::{IngestError, Stage, StoreError, StoreResult};
use crate::progress::ProgressTracker;
use crate::reconciliation::ReconciliationPlan;
use crate::storage::object_path;
use crate::store::{ObjectStore, RecordStore, StoredObject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress milestones owned by this stage (the pipeline reports 0..40)
const PROGRESS_UPLOAD: u8 = 40;
const PROGRESS_DUPLICATES: u8 = 45;
const PROGRESS_SITES: u8 = 50;
const PROGRESS_PLAN: u8 = 55;
const PROGRESS_BATCHES_END: u8 = 95;
const PROGRESS_HYDRATE: u8 = 97;
const PROGRESS_DONE: u8 = 100;

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ============================================================================
// JOB + OUTCOME
// ============================================================================

/// Everything needed to persist one validated, reconciled upload
pub struct PersistJob<'a> {
    pub file_name: &'a str,
    pub bytes: &'a [u8],
    pub entries: &'a [SiteEntry],
    pub reconciliation: ReconciliationPlan,
    pub metadata: &'a PlanMetadata,
    pub uploader: &'a UploaderContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistOutcome {
    pub plan: PlanWithEntries,

    /// Reconciliation after store results were folded back in
    pub reconciliation: ReconciliationPlan,

    pub object: StoredObject,

    /// Non-fatal findings (e.g. another plan for the same project + month)
    pub warnings: Vec<String>,
}

/// What has been written so far and must be undone on failure
#[derive(Debug, Default)]
struct Compensation {
    object_path: Option<String>,
    /// Left in place for the sweep; only logged
    created_sites: Vec<Uuid>,
    plan_id: Option<Uuid>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct BatchPersistenceCoordinator {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    batch_size: usize,
    step_timeout: Duration,
    duplicate_window: Duration,
    pending_ttl: Duration,
    storage_prefix: String,
}

impl BatchPersistenceCoordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        config: &IngestConfig,
    ) -> Self {
        BatchPersistenceCoordinator {
            records,
            objects,
            batch_size: config.batch_size.max(1),
            step_timeout: config.step_timeout,
            duplicate_window: config.duplicate_window,
            pending_ttl: config.pending_ttl,
            storage_prefix: config.storage_prefix.clone(),
        }
    }

    /// Run a store call under the step timeout
    async fn guarded<T, F>(
        &self,
        stage: Stage,
        call: F,
        wrap: fn(Stage, StoreError) -> IngestError,
    ) -> Result<T, IngestError>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.step_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(wrap(stage, e)),
            Err(_) => Err(IngestError::Timeout {
                stage,
                timeout: self.step_timeout,
            }),
        }
    }

    fn ensure_live(cancel: &CancellationToken, stage: Stage) -> Result<(), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled { stage });
        }
        Ok(())
    }

    pub async fn persist(
        &self,
        job: PersistJob<'_>,
        progress: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<PersistOutcome, IngestError> {
        let now = Utc::now();

        // (a) upload; nothing to undo if this fails
        Self::ensure_live(cancel, Stage::UploadFile)?;
        let path = object_path(&self.storage_prefix, job.file_name, now);
        let object = self
            .guarded(
                Stage::UploadFile,
                self.objects.put(&path, job.bytes),
                IngestError::storage,
            )
            .await?;
        progress.report(PROGRESS_UPLOAD, "Uploading file");
        tracing::info!(path = %object.path, bytes = object.byte_size, "plan file stored");

        let mut undo = Compensation {
            object_path: Some(object.path.clone()),
            ..Default::default()
        };

        match self.write_records(job, object, now, progress, cancel, &mut undo).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(error = %e, stage = ?e.stage(), "upload failed; rolling back");
                self.compensate(&undo).await;
                Err(e)
            }
        }
    }

    async fn write_records(
        &self,
        job: PersistJob<'_>,
        object: StoredObject,
        now: DateTime<Utc>,
        progress: &ProgressTracker<'_>,
        cancel: &CancellationToken,
        undo: &mut Compensation,
    ) -> Result<PersistOutcome, IngestError> {
        let PersistJob {
            file_name,
            entries,
            mut reconciliation,
            metadata,
            uploader,
            ..
        } = job;

        // (b) duplicate check, before any registry write
        Self::ensure_live(cancel, Stage::DuplicateCheck)?;
        let warnings = self.check_duplicates(file_name, metadata, now, None).await?;
        progress.report(PROGRESS_DUPLICATES, "Checking for duplicate uploads");

        // new registry rows, create-if-absent
        let mut creations = Vec::with_capacity(reconciliation.new_sites.len());
        for chunk in reconciliation.new_sites.chunks(self.batch_size) {
            Self::ensure_live(cancel, Stage::RegistryCreate)?;
            let created = self
                .guarded(
                    Stage::RegistryCreate,
                    self.records.create_sites(chunk),
                    IngestError::persistence,
                )
                .await?;
            undo.created_sites
                .extend(created.iter().filter(|c| c.created).map(|c| c.site.id));
            creations.extend(created);
        }
        reconciliation.apply_creations(&creations);
        progress.report(PROGRESS_SITES, "Registering new sites");

        // (c) plan record, pending until commit
        Self::ensure_live(cancel, Stage::PlanInsert)?;
        let plan_id = Uuid::new_v4();
        let record = MonitoringPlanRecord {
            id: plan_id,
            mmp_id: generate_mmp_id(&plan_id),
            name: metadata
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| plan_name_from_filename(file_name)),
            status: PlanStatus::Pending,
            entries: entries.len(),
            processed_entries: 0,
            file_path: object.path.clone(),
            file_url: object.url.clone(),
            original_filename: file_name.to_string(),
            content_hash: object.content_hash.clone(),
            project_id: metadata.owner_project_id.clone(),
            month: metadata.month.clone(),
            hub: metadata.hub.clone(),
            uploaded_by: uploader.id.clone(),
            uploaded_by_name: uploader.display_name.clone(),
            uploaded_at: now,
        };
        self.guarded(
            Stage::PlanInsert,
            self.records.insert_plan(&record),
            IngestError::persistence,
        )
        .await?;
        undo.plan_id = Some(plan_id);

        // a concurrent upload of the same file may have passed the first check
        Self::ensure_live(cancel, Stage::DuplicateCheck)?;
        self.check_duplicates(file_name, metadata, now, Some(plan_id))
            .await?;
        progress.report(PROGRESS_PLAN, "Creating plan record");

        // (d) entries, sequential batches
        let total_batches = entries.len().div_ceil(self.batch_size);
        for (i, chunk) in entries.chunks(self.batch_size).enumerate() {
            let stage = Stage::EntryBatch {
                index: i + 1,
                total: total_batches,
            };
            Self::ensure_live(cancel, stage)?;

            let offset = i * self.batch_size;
            let rows = chunk
                .iter()
                .enumerate()
                .map(|(j, entry)| {
                    let matched = reconciliation.match_for_entry(offset + j).ok_or_else(|| {
                        IngestError::persistence(
                            stage,
                            StoreError::Corrupt(format!(
                                "row {} has no resolved registry site",
                                entry.source_row
                            )),
                        )
                    })?;
                    Ok(PersistedSiteEntry {
                        id: Uuid::new_v4(),
                        plan_id,
                        registry_site_id: matched.registry_site_id,
                        registry_linkage: matched.linkage(&uploader.id, now),
                        created_at: now,
                        entry: entry.clone(),
                    })
                })
                .collect::<Result<Vec<_>, IngestError>>()?;

            self.guarded(stage, self.records.insert_entries(&rows), IngestError::persistence)
                .await?;
            progress.report_batch(
                PROGRESS_PLAN,
                PROGRESS_BATCHES_END,
                i + 1,
                total_batches,
                &format!("Saving entries (batch {} of {})", i + 1, total_batches),
            );
            tracing::debug!(plan_id = %plan_id, batch = i + 1, total_batches, rows = rows.len(), "entry batch saved");
        }

        // (f) hydrate while still pending, so a failed read can be undone
        Self::ensure_live(cancel, Stage::Hydrate)?;
        let stored = self
            .guarded(Stage::Hydrate, self.records.get_plan(plan_id), IngestError::persistence)
            .await?
            .ok_or_else(|| {
                IngestError::persistence(
                    Stage::Hydrate,
                    StoreError::NotFound(format!("plan {}", plan_id)),
                )
            })?;
        let saved_entries = self
            .guarded(
                Stage::Hydrate,
                self.records.list_entries(plan_id),
                IngestError::persistence,
            )
            .await?;
        if saved_entries.len() != entries.len() {
            return Err(IngestError::persistence(
                Stage::Hydrate,
                StoreError::Corrupt(format!(
                    "expected {} saved entries, found {}",
                    entries.len(),
                    saved_entries.len()
                )),
            ));
        }
        progress.report(PROGRESS_HYDRATE, "Loading saved plan");

        // (e) commit: processed count + registry counts + active, atomically
        Self::ensure_live(cancel, Stage::Finalize)?;
        let deltas = reconciliation.count_deltas();
        self.guarded(
            Stage::Finalize,
            self.records.finalize_plan(plan_id, entries.len(), &deltas),
            IngestError::persistence,
        )
        .await?;
        progress.report(PROGRESS_DONE, "Upload complete");

        let mut plan = stored;
        plan.status = PlanStatus::Active;
        plan.processed_entries = entries.len();

        tracing::info!(
            plan_id = %plan_id,
            mmp_id = %plan.mmp_id,
            entries = entries.len(),
            created_sites = reconciliation.created_count(),
            linked_sites = reconciliation.linked_count(),
            "plan committed"
        );

        Ok(PersistOutcome {
            plan: PlanWithEntries {
                plan,
                entries: saved_entries,
            },
            reconciliation,
            object,
            warnings,
        })
    }

    /// Active plans, and pending plans still inside the TTL (an upload in flight)
    fn is_live(&self, plan: &MonitoringPlanRecord, now: DateTime<Utc>) -> bool {
        match plan.status {
            PlanStatus::Active => true,
            PlanStatus::Pending => plan.uploaded_at >= now - chrono_span(self.pending_ttl),
            PlanStatus::Archived => false,
        }
    }

    /// Duplicate rules, over live plans other than `own`:
    /// - project + month known: same filename → reject, other filename → warn
    /// - otherwise: same filename inside the recency window → reject
    async fn check_duplicates(
        &self,
        file_name: &str,
        metadata: &PlanMetadata,
        now: DateTime<Utc>,
        own: Option<Uuid>,
    ) -> Result<Vec<String>, IngestError> {
        let mut warnings = Vec::new();

        let filter = match metadata.project_month() {
            Some((project, month)) => PlanFilter::default().with_project_month(project, month),
            None => PlanFilter::default()
                .with_filename(file_name)
                .uploaded_after(now - chrono_span(self.duplicate_window)),
        };
        let live: Vec<MonitoringPlanRecord> = self
            .guarded(
                Stage::DuplicateCheck,
                self.records.find_plans(&filter),
                IngestError::persistence,
            )
            .await?
            .into_iter()
            .filter(|p| Some(p.id) != own && self.is_live(p, now))
            .collect();

        match metadata.project_month() {
            Some((project, month)) => {
                if let Some(same) = live.iter().find(|p| p.original_filename == file_name) {
                    return Err(IngestError::DuplicateUpload(format!(
                        "'{}' is already {} for project {} / {} as {}",
                        file_name,
                        uploaded_or_in_progress(same),
                        project,
                        month,
                        same.mmp_id
                    )));
                }
                for other in &live {
                    warnings.push(format!(
                        "Another plan for project {} / {} already exists: {} ({})",
                        project, month, other.name, other.original_filename
                    ));
                }
            }
            None => {
                if let Some(same) = live.first() {
                    return Err(IngestError::DuplicateUpload(format!(
                        "'{}' was {} {} minute(s) ago as {}",
                        file_name,
                        uploaded_or_in_progress(same),
                        (now - same.uploaded_at).num_minutes().max(0),
                        same.mmp_id
                    )));
                }
            }
        }

        Ok(warnings)
    }

    /// Best-effort undo in reverse order: plan (entries cascade), then the
    /// stored object. Failures are logged, never raised.
    async fn compensate(&self, undo: &Compensation) {
        if let Some(plan_id) = undo.plan_id {
            match tokio::time::timeout(self.step_timeout, self.records.delete_plan(plan_id)).await {
                Ok(Ok(_)) => tracing::info!(plan_id = %plan_id, "rolled back plan record"),
                Ok(Err(e)) => tracing::error!(plan_id = %plan_id, error = %e, "failed to delete plan during rollback"),
                Err(_) => tracing::error!(plan_id = %plan_id, "timed out deleting plan during rollback"),
            }
        }

        // other uploads may already be linked to these rows
        if !undo.created_sites.is_empty() {
            tracing::info!(
                sites = undo.created_sites.len(),
                "registry sites created by failed upload left for the stale sweep"
            );
        }

        if let Some(path) = &undo.object_path {
            match tokio::time::timeout(self.step_timeout, self.objects.remove(path)).await {
                Ok(Ok(())) => tracing::info!(path = %path, "removed uploaded file"),
                Ok(Err(e)) => tracing::error!(path = %path, error = %e, "failed to remove uploaded file during rollback"),
                Err(_) => tracing::error!(path = %path, "timed out removing uploaded file during rollback"),
            }
        }
    }
}

fn uploaded_or_in_progress(plan: &MonitoringPlanRecord) -> &'static str {
    if plan.status == PlanStatus::Pending {
        "being uploaded"
    } else {
        "uploaded"
    }
}

// ============================================================================
// STALE PENDING SWEEP
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub removed_plans: Vec<Uuid>,
    pub removed_objects: usize,
    pub released_sites: usize,
    pub failures: usize,
}

/// Remove plans stuck in `pending` for longer than `ttl` (a process died
/// between insert and commit) with their entries and objects, then registry
/// rows older than `ttl` that nothing references.
pub async fn sweep_stale_pending(
    records: &dyn RecordStore,
    objects: &dyn ObjectStore,
    ttl: Duration,
) -> Result<SweepReport, IngestError> {
    let cutoff = Utc::now() - chrono_span(ttl);
    let filter = PlanFilter::status(PlanStatus::Pending).uploaded_before(cutoff);
    let stale = records
        .find_plans(&filter)
        .await
        .map_err(|e| IngestError::persistence(Stage::Sweep, e))?;

    let mut report = SweepReport {
        examined: stale.len(),
        ..Default::default()
    };

    for plan in stale {
        match records.delete_plan(plan.id).await {
            Ok(_) => report.removed_plans.push(plan.id),
            Err(e) => {
                tracing::error!(plan_id = %plan.id, error = %e, "failed to delete stale plan");
                report.failures += 1;
                continue;
            }
        }

        match objects.remove(&plan.file_path).await {
            Ok(()) => report.removed_objects += 1,
            Err(e) => {
                tracing::error!(path = %plan.file_path, error = %e, "failed to remove stale plan file");
                report.failures += 1;
            }
        }
    }

    match records.release_orphan_sites(cutoff).await {
        Ok(n) => report.released_sites = n,
        Err(e) => {
            tracing::error!(error = %e, "failed to release orphaned registry sites");
            report.failures += 1;
        }
    }

    if report.examined > 0 || report.released_sites > 0 {
        tracing::info!(
            examined = report.examined,
            removed = report.removed_plans.len(),
            released_sites = report.released_sites,
            failures = report.failures,
            "stale pending sweep finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::CanonicalField;
    use crate::memory::{MemoryObjectStore, MemoryRecordStore};
    use crate::reconciliation::SiteRegistryReconciler;

    fn entries(n: usize) -> Vec<SiteEntry> {
        (0..n)
            .map(|i| {
                SiteEntry::new(i + 2)
                    .with(CanonicalField::SiteCode, &format!("KH-{:03}", i))
                    .with(CanonicalField::SiteName, &format!("Site {}", i))
                    .with(CanonicalField::State, "Khartoum")
            })
            .collect()
    }

    struct Harness {
        records: Arc<MemoryRecordStore>,
        objects: Arc<MemoryObjectStore>,
        coordinator: BatchPersistenceCoordinator,
    }

    fn harness(config: IngestConfig) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let coordinator = BatchPersistenceCoordinator::new(records.clone(), objects.clone(), &config);
        Harness {
            records,
            objects,
            coordinator,
        }
    }

    async fn persist(
        h: &Harness,
        file_name: &str,
        rows: &[SiteEntry],
        metadata: &PlanMetadata,
        cancel: &CancellationToken,
    ) -> Result<PersistOutcome, IngestError> {
        let registry = h.records.list_sites().await.unwrap();
        let reconciliation = SiteRegistryReconciler::new().plan(&registry, rows);
        let uploader = UploaderContext::new("u-1", "Amina");
        let job = PersistJob {
            file_name,
            bytes: b"Site Code\n",
            entries: rows,
            reconciliation,
            metadata,
            uploader: &uploader,
        };
        h.coordinator.persist(job, &ProgressTracker::new(None), cancel).await
    }

    #[tokio::test]
    async fn test_persist_commits_active_plan() {
        let h = harness(IngestConfig::default().with_batch_size(2));
        let rows = entries(5);
        let outcome = persist(&h, "march.csv", &rows, &PlanMetadata::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.plan.plan.status, PlanStatus::Active);
        assert_eq!(outcome.plan.plan.processed_entries, 5);
        assert_eq!(outcome.plan.plan.name, "march");
        assert_eq!(outcome.plan.entries.len(), 5);
        assert_eq!(h.records.entry_total(), 5);
        assert_eq!(h.objects.len(), 1);

        let sites = h.records.list_sites().await.unwrap();
        assert_eq!(sites.len(), 5);
        assert!(sites.iter().all(|s| s.mmp_count == 1));
    }

    #[tokio::test]
    async fn test_duplicate_project_month_rejected_without_side_effects() {
        let h = harness(IngestConfig::default());
        let meta = PlanMetadata::default().with_project_month("proj-1", "2025-03");
        persist(&h, "march.csv", &entries(2), &meta, &CancellationToken::new())
            .await
            .unwrap();

        let before_sites = h.records.list_sites().await.unwrap();
        let err = persist(&h, "march.csv", &entries(3), &meta, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::DuplicateUpload(_)));
        assert_eq!(h.records.plan_total(), 1);
        assert_eq!(h.objects.len(), 1);
        assert_eq!(h.records.list_sites().await.unwrap(), before_sites);
    }

    #[tokio::test]
    async fn test_same_project_month_different_file_warns() {
        let h = harness(IngestConfig::default());
        let meta = PlanMetadata::default().with_project_month("proj-1", "2025-03");
        persist(&h, "march.csv", &entries(2), &meta, &CancellationToken::new())
            .await
            .unwrap();

        let outcome = persist(&h, "march_v2.csv", &entries(2), &meta, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("march.csv"));
        assert_eq!(h.records.plan_total(), 2);
    }

    #[tokio::test]
    async fn test_recency_window_without_project_month() {
        let h = harness(IngestConfig::default());
        let meta = PlanMetadata::default();
        persist(&h, "plan.csv", &entries(1), &meta, &CancellationToken::new())
            .await
            .unwrap();
        let err = persist(&h, "plan.csv", &entries(1), &meta, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_upload");

        // zero window: the earlier upload is outside it
        let h = harness(IngestConfig::default().with_duplicate_window(Duration::ZERO));
        persist(&h, "plan.csv", &entries(1), &meta, &CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(persist(&h, "plan.csv", &entries(1), &meta, &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let h = harness(IngestConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = persist(&h, "plan.csv", &entries(3), &PlanMetadata::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::UploadFile));
        assert!(h.objects.is_empty());
        assert_eq!(h.records.plan_total(), 0);
    }

    fn pending_plan(file_name: &str, uploaded_at: DateTime<Utc>) -> MonitoringPlanRecord {
        let id = Uuid::new_v4();
        MonitoringPlanRecord {
            id,
            mmp_id: generate_mmp_id(&id),
            name: "march".to_string(),
            status: PlanStatus::Pending,
            entries: 1,
            processed_entries: 0,
            file_path: format!("mmp-files/{}", file_name),
            file_url: format!("memory://mmp-files/{}", file_name),
            original_filename: file_name.to_string(),
            content_hash: String::new(),
            project_id: Some("proj-1".to_string()),
            month: Some("2025-03".to_string()),
            hub: None,
            uploaded_by: "u-2".to_string(),
            uploaded_by_name: "Omer".to_string(),
            uploaded_at,
        }
    }

    #[tokio::test]
    async fn test_upload_in_flight_counts_as_duplicate() {
        let h = harness(IngestConfig::default());
        let meta = PlanMetadata::default().with_project_month("proj-1", "2025-03");
        h.records
            .insert_plan(&pending_plan("march.csv", Utc::now()))
            .await
            .unwrap();

        let err = persist(&h, "march.csv", &entries(2), &meta, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateUpload(ref m) if m.contains("being uploaded")));
        assert_eq!(h.records.plan_total(), 1);
        assert!(h.objects.is_empty());
        assert!(h.records.list_sites().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_pending_does_not_block_upload() {
        let h = harness(IngestConfig::default().with_pending_ttl(Duration::from_secs(60)));
        let meta = PlanMetadata::default().with_project_month("proj-1", "2025-03");
        let abandoned = pending_plan("march.csv", Utc::now() - chrono::Duration::hours(1));
        h.records.insert_plan(&abandoned).await.unwrap();

        let outcome = persist(&h, "march.csv", &entries(2), &meta, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.plan.plan.status, PlanStatus::Active);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_entries_carry_match_record() {
        let h = harness(IngestConfig::default());
        let outcome = persist(&h, "march.csv", &entries(2), &PlanMetadata::default(), &CancellationToken::new())
            .await
            .unwrap();

        for saved in &outcome.plan.entries {
            let link = &saved.registry_linkage;
            assert_eq!(link.match_tier, crate::entities::MatchTier::Created);
            assert_eq!(link.confidence, 1.0);
            assert!(link.auto_accepted());
            assert_eq!(link.matched_by, "u-1");
            assert_eq!(link.matched_at, outcome.plan.plan.uploaded_at);
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_pending_only() {
        let records = MemoryRecordStore::new();
        let objects = MemoryObjectStore::new();

        let mut stale = MonitoringPlanRecord {
            id: Uuid::new_v4(),
            mmp_id: "MMP-STALE".to_string(),
            name: "stale".to_string(),
            status: PlanStatus::Pending,
            entries: 0,
            processed_entries: 0,
            file_path: "mmp-files/stale.csv".to_string(),
            file_url: "memory://mmp-files/stale.csv".to_string(),
            original_filename: "stale.csv".to_string(),
            content_hash: String::new(),
            project_id: None,
            month: None,
            hub: None,
            uploaded_by: "u-1".to_string(),
            uploaded_by_name: "Amina".to_string(),
            uploaded_at: Utc::now() - chrono::Duration::hours(2),
        };
        objects.put(&stale.file_path, b"x").await.unwrap();
        records.insert_plan(&stale).await.unwrap();

        // fresh pending and old active plans stay
        let mut fresh = stale.clone();
        fresh.id = Uuid::new_v4();
        fresh.uploaded_at = Utc::now();
        records.insert_plan(&fresh).await.unwrap();

        stale.id = Uuid::new_v4();
        stale.status = PlanStatus::Active;
        records.insert_plan(&stale).await.unwrap();

        let report = sweep_stale_pending(&records, &objects, Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.removed_plans.len(), 1);
        assert_eq!(report.removed_objects, 1);
        assert_eq!(report.released_sites, 0);
        assert_eq!(report.failures, 0);
        assert_eq!(records.plan_total(), 2);
        assert!(objects.is_empty());
    }
}
