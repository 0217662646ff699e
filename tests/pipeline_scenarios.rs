// 🧪 End-to-end upload scenarios against in-memory and sqlite backends,
// with a record store that can be told to fail or stall a given entry batch,
// or to hold an upload at a given step until another one gets there

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mmp_ingest::entities::{
    MonitoringPlanRecord, NewRegistrySite, PersistedSiteEntry, PlanFilter, RegistrySite,
    SiteCreation, SiteStatus,
};
use mmp_ingest::{
    sweep_stale_pending, IngestConfig, LocalObjectStore, MatchTier, MemoryObjectStore,
    MemoryRecordStore, ObjectStore, PlanIngestor, PlanMetadata, PlanStatus, RecordStore,
    SqliteRecordStore, StoreError, StoreResult, UploadRequest, UploadResult, UploaderContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// FAILURE INJECTION
// ============================================================================

#[derive(Default)]
struct FlakyRecordStore {
    inner: Arc<MemoryRecordStore>,
    /// 1-based entry batch that fails
    fail_batch: Option<usize>,
    /// delay applied to every entry batch
    batch_delay: Option<Duration>,
    batches_seen: AtomicUsize,

    /// awaited before the registry snapshot is read
    snapshot_gate: Option<Arc<Notify>>,
    /// notified after new registry rows are written
    created_signal: Option<Arc<Notify>>,
    /// notified after the plan row is written
    plan_signal: Option<Arc<Notify>>,
    /// awaited before every entry batch
    batch_gate: Option<Arc<Notify>>,
    /// a second pending plan for the same file lands just before ours
    rival_plan: bool,
}

impl FlakyRecordStore {
    fn sharing(inner: &Arc<MemoryRecordStore>) -> Self {
        FlakyRecordStore {
            inner: Arc::clone(inner),
            ..Default::default()
        }
    }

    fn failing_at(batch: usize) -> Self {
        FlakyRecordStore {
            fail_batch: Some(batch),
            ..Default::default()
        }
    }

    fn stalling(delay: Duration) -> Self {
        FlakyRecordStore {
            batch_delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RecordStore for FlakyRecordStore {
    async fn list_sites(&self) -> StoreResult<Vec<RegistrySite>> {
        if let Some(gate) = &self.snapshot_gate {
            gate.notified().await;
        }
        self.inner.list_sites().await
    }

    async fn create_sites(&self, sites: &[NewRegistrySite]) -> StoreResult<Vec<SiteCreation>> {
        let created = self.inner.create_sites(sites).await?;
        if let Some(signal) = &self.created_signal {
            signal.notify_one();
        }
        Ok(created)
    }

    async fn release_orphan_sites(&self, created_before: DateTime<Utc>) -> StoreResult<usize> {
        self.inner.release_orphan_sites(created_before).await
    }

    async fn find_plans(&self, filter: &PlanFilter) -> StoreResult<Vec<MonitoringPlanRecord>> {
        self.inner.find_plans(filter).await
    }

    async fn insert_plan(&self, plan: &MonitoringPlanRecord) -> StoreResult<()> {
        if self.rival_plan {
            let mut rival = plan.clone();
            rival.id = Uuid::new_v4();
            rival.uploaded_by = "u-2".to_string();
            self.inner.insert_plan(&rival).await?;
        }
        self.inner.insert_plan(plan).await?;
        if let Some(signal) = &self.plan_signal {
            signal.notify_one();
        }
        Ok(())
    }

    async fn insert_entries(&self, entries: &[PersistedSiteEntry]) -> StoreResult<usize> {
        let batch = self.batches_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.batch_gate {
            gate.notified().await;
        }
        if let Some(delay) = self.batch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_batch == Some(batch) {
            return Err(StoreError::Backend(format!("injected failure on batch {}", batch)));
        }
        self.inner.insert_entries(entries).await
    }

    async fn finalize_plan(
        &self,
        plan_id: Uuid,
        processed_entries: usize,
        site_deltas: &[(Uuid, u32)],
    ) -> StoreResult<()> {
        self.inner
            .finalize_plan(plan_id, processed_entries, site_deltas)
            .await
    }

    async fn delete_plan(&self, plan_id: Uuid) -> StoreResult<bool> {
        self.inner.delete_plan(plan_id).await
    }

    async fn get_plan(&self, plan_id: Uuid) -> StoreResult<Option<MonitoringPlanRecord>> {
        self.inner.get_plan(plan_id).await
    }

    async fn list_entries(&self, plan_id: Uuid) -> StoreResult<Vec<PersistedSiteEntry>> {
        self.inner.list_entries(plan_id).await
    }
}

// ============================================================================
// HELPERS
// ============================================================================

const HEADER: &str = "Site Code,Site Name,State,Locality,Hub Office,Visit Date";

fn csv_with_rows(rows: &[&str]) -> Vec<u8> {
    let mut text = String::from(HEADER);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    text.push('\n');
    text.into_bytes()
}

/// `n` rows with distinct codes
fn distinct_rows(n: usize) -> Vec<u8> {
    let rows: Vec<String> = (0..n)
        .map(|i| format!("KH-OMD-S{:03},Site {},Khartoum,Omdurman,Khartoum,01-03-2025", i, i))
        .collect();
    let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
    csv_with_rows(&refs)
}

fn uploader() -> UploaderContext {
    UploaderContext::new("u-1", "Amina Yousif")
}

async fn upload(
    ingestor: &PlanIngestor,
    file_name: &str,
    bytes: Vec<u8>,
    metadata: PlanMetadata,
) -> UploadResult {
    ingestor
        .ingest(
            UploadRequest::new(file_name, bytes).with_metadata(metadata),
            &uploader(),
            None,
            &CancellationToken::new(),
        )
        .await
}

fn registry_site(code: &str, name: &str, state: &str, locality: &str, count: u32) -> RegistrySite {
    RegistrySite {
        id: Uuid::new_v4(),
        site_code: code.to_string(),
        site_name: name.to_string(),
        state: Some(state.to_string()),
        locality: Some(locality.to_string()),
        hub: Some("El Geneina".to_string()),
        activity_type: "TPM".to_string(),
        status: SiteStatus::Active,
        mmp_count: count,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_repeated_code_creates_one_site_counted_twice() {
    let records = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let ingestor = PlanIngestor::new(IngestConfig::default(), records.clone(), objects.clone());

    let bytes = csv_with_rows(&[
        "WD-KUL-ADAR-0001,Adar Market,West Darfur,Kulbus,El Geneina,15-03-2025",
        "WD-KUL-ADAR-0001,Adar Market,West Darfur,Kulbus,El Geneina,22-03-2025",
    ]);
    let result = upload(&ingestor, "march.csv", bytes, PlanMetadata::default()).await;
    assert!(result.success, "{:?}", result.error);

    let sites = records.list_sites().await.unwrap();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].site_code, "WD-KUL-ADAR-0001");
    assert_eq!(sites[0].mmp_count, 2);

    let plan = result.plan.unwrap();
    assert_eq!(plan.plan.status, PlanStatus::Active);
    assert_eq!(plan.entries.len(), 2);
    assert!(plan.entries.iter().all(|e| e.registry_site_id == sites[0].id));

    let registry = result.registry.unwrap();
    assert_eq!(registry.created, 1);
    assert_eq!(registry.linked, 0);
    assert_eq!(result.warnings[0], "1 new sites registered, 0 existing sites linked");
    assert_eq!(objects.len(), 1);
}

#[tokio::test]
async fn test_existing_site_count_grows_by_occurrences() {
    let existing = registry_site("WD-KUL-ADAR-0001", "Adar Market", "West Darfur", "Kulbus", 3);
    let records = Arc::new(MemoryRecordStore::with_sites(vec![existing.clone()]));
    let ingestor = PlanIngestor::new(
        IngestConfig::default(),
        records.clone(),
        Arc::new(MemoryObjectStore::new()),
    );

    let bytes = csv_with_rows(&[
        "wd kul adar 0001,Adar Market,West Darfur,Kulbus,El Geneina,15-03-2025",
        "WD-KUL-ADAR-0001,Adar Market,West Darfur,Kulbus,El Geneina,22-03-2025",
        ",ADAR  market,west darfur,Sirba,El Geneina,23-03-2025",
    ]);
    let result = upload(&ingestor, "march.csv", bytes, PlanMetadata::default()).await;
    assert!(result.success, "{:?}", result.error);

    let sites = records.list_sites().await.unwrap();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].mmp_count, 6);

    // third row matched on name + state only: flagged for review
    let registry = result.registry.unwrap();
    assert_eq!(registry.linked, 1);
    assert_eq!(registry.review_required, 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("Row 4:") && w.contains("please review")));

    // the match record survives a reload
    let plan_id = result.plan.unwrap().plan.id;
    let saved = records.list_entries(plan_id).await.unwrap();
    let flagged: Vec<usize> = saved
        .iter()
        .filter(|e| e.needs_review())
        .map(|e| e.entry.source_row)
        .collect();
    assert_eq!(flagged, vec![4]);
    assert_eq!(saved[2].registry_linkage.match_tier, MatchTier::NameState);
    assert_eq!(saved[2].registry_linkage.confidence_level(), "medium");
    assert_eq!(saved[0].registry_linkage.match_tier, MatchTier::ExactCode);
}

#[tokio::test]
async fn test_distinct_identities_in_empty_registry() {
    let records = Arc::new(MemoryRecordStore::new());
    let ingestor = PlanIngestor::new(
        IngestConfig::default(),
        records.clone(),
        Arc::new(MemoryObjectStore::new()),
    );

    let result = upload(&ingestor, "plan.csv", distinct_rows(7), PlanMetadata::default()).await;
    assert!(result.success);

    let sites = records.list_sites().await.unwrap();
    assert_eq!(sites.len(), 7);
    assert!(sites.iter().all(|s| s.mmp_count == 1));
}

#[tokio::test]
async fn test_duplicate_upload_leaves_registry_and_storage_unchanged() {
    let records = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let ingestor = PlanIngestor::new(IngestConfig::default(), records.clone(), objects.clone());
    let meta = PlanMetadata::default().with_project_month("proj-7", "2025-03");

    let first = upload(&ingestor, "march.csv", distinct_rows(3), meta.clone()).await;
    assert!(first.success);

    let sites_before = records.list_sites().await.unwrap();
    let objects_before = objects.paths();

    let second = upload(&ingestor, "march.csv", distinct_rows(3), meta).await;
    assert!(!second.success);
    assert_eq!(second.error_code.as_deref(), Some("duplicate_upload"));
    assert!(second.plan.is_none());

    assert_eq!(records.list_sites().await.unwrap(), sites_before);
    assert_eq!(objects.paths(), objects_before);
    assert_eq!(records.plan_total(), 1);
}

#[tokio::test]
async fn test_failure_at_batch_k_removes_plan_and_file() {
    let records = Arc::new(FlakyRecordStore::failing_at(2));
    let objects = Arc::new(MemoryObjectStore::new());
    let config = IngestConfig::default().with_batch_size(4);
    let ingestor = PlanIngestor::new(config, records.clone(), objects.clone());

    // 10 rows → batches of 4, 4, 2
    let result = upload(&ingestor, "plan.csv", distinct_rows(10), PlanMetadata::default()).await;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("persistence_error"));
    assert!(result.error.unwrap().contains("batch 2 of 3"));

    assert_eq!(records.inner.plan_total(), 0);
    assert_eq!(records.inner.entry_total(), 0);
    assert!(objects.is_empty());
    assert_eq!(records.batches_seen.load(Ordering::SeqCst), 2);

    // new registry rows stay at zero until the sweep collects them
    let sites = records.inner.list_sites().await.unwrap();
    assert_eq!(sites.len(), 10);
    assert!(sites.iter().all(|s| s.mmp_count == 0));

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = sweep_stale_pending(records.as_ref(), objects.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(report.released_sites, 10);
    assert!(records.inner.list_sites().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stalled_batch_times_out_and_rolls_back() {
    let records = Arc::new(FlakyRecordStore::stalling(Duration::from_millis(300)));
    let objects = Arc::new(MemoryObjectStore::new());
    let config = IngestConfig::default().with_step_timeout(Duration::from_millis(50));
    let ingestor = PlanIngestor::new(config, records.clone(), objects.clone());

    let result = upload(&ingestor, "plan.csv", distinct_rows(3), PlanMetadata::default()).await;
    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("timeout"));
    assert_eq!(records.inner.plan_total(), 0);
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_cancel_between_batches() {
    let records = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let config = IngestConfig::default().with_batch_size(2);
    let ingestor = PlanIngestor::new(config, records.clone(), objects.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let reporter = move |_current: u8, _total: u8, stage: &str| {
        if stage.contains("batch 1 of") {
            trigger.cancel();
        }
    };

    let result = ingestor
        .ingest(
            UploadRequest::new("plan.csv", distinct_rows(6)),
            &uploader(),
            Some(&reporter),
            &cancel,
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("cancelled"));
    assert!(result.error.unwrap().contains("batch 2 of 3"));
    assert_eq!(records.plan_total(), 0);
    assert_eq!(records.entry_total(), 0);
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_blocking_validation_returns_report_and_writes_nothing() {
    let records = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let ingestor = PlanIngestor::new(IngestConfig::default(), records.clone(), objects.clone());

    let bytes = csv_with_rows(&[
        "KH-1,Site One,Khartoum,Omdurman,Khartoum,31-13-2025",
        "KH-2,Site Two,Khartoum,Omdurman,Khartoum,",
    ]);
    let result = upload(&ingestor, "plan.csv", bytes, PlanMetadata::default()).await;

    assert!(!result.success);
    assert_eq!(result.error_code.as_deref(), Some("validation_error"));
    let report = result.issues_report.unwrap();
    let mut lines = report.lines();
    assert_eq!(lines.next(), Some("type,row,column,category,message"));
    assert!(report.contains("error,2,Visit Date,invalid_date_format"));
    assert!(report.contains("warning,3,Visit Date,missing_date"));

    assert_eq!(records.plan_total(), 0);
    assert!(records.list_sites().await.unwrap().is_empty());
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_hub_mismatch_blocks_upload() {
    let ingestor = PlanIngestor::new(
        IngestConfig::default(),
        Arc::new(MemoryRecordStore::new()),
        Arc::new(MemoryObjectStore::new()),
    );
    let bytes = csv_with_rows(&["KS-1,Site,Kassala,Kassala,Kassala,01-03-2025"]);
    let result = upload(
        &ingestor,
        "plan.csv",
        bytes,
        PlanMetadata::default().with_hub("Khartoum"),
    )
    .await;
    assert_eq!(result.error_code.as_deref(), Some("validation_error"));
}

#[tokio::test]
async fn test_concurrent_uploads_share_new_site() {
    let records = Arc::new(MemoryRecordStore::new());
    let ingestor = PlanIngestor::new(
        IngestConfig::default(),
        records.clone(),
        Arc::new(MemoryObjectStore::new()),
    );

    let row = "KH-NEW-0001,New Site,Khartoum,Bahri,Khartoum,01-03-2025";
    let (a, b) = tokio::join!(
        upload(&ingestor, "a.csv", csv_with_rows(&[row]), PlanMetadata::default()),
        upload(&ingestor, "b.csv", csv_with_rows(&[row]), PlanMetadata::default()),
    );
    assert!(a.success && b.success);

    let sites = records.list_sites().await.unwrap();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].mmp_count, 2);
}

#[tokio::test]
async fn test_failed_upload_keeps_site_another_upload_is_using() {
    let shared = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let site_created = Arc::new(Notify::new());
    let b_planned = Arc::new(Notify::new());
    let a_rolled_back = Arc::new(Notify::new());

    // A creates the site, then fails its first batch once B is past its plan insert
    let a_store = FlakyRecordStore {
        fail_batch: Some(1),
        created_signal: Some(site_created.clone()),
        batch_gate: Some(b_planned.clone()),
        ..FlakyRecordStore::sharing(&shared)
    };
    // B reads the registry after A created the site, and writes entries after A's rollback
    let b_store = FlakyRecordStore {
        snapshot_gate: Some(site_created.clone()),
        plan_signal: Some(b_planned.clone()),
        batch_gate: Some(a_rolled_back.clone()),
        ..FlakyRecordStore::sharing(&shared)
    };
    let a = PlanIngestor::new(IngestConfig::default(), Arc::new(a_store), objects.clone());
    let b = PlanIngestor::new(IngestConfig::default(), Arc::new(b_store), objects.clone());

    let row = "KH-NEW-0001,New Site,Khartoum,Bahri,Khartoum,01-03-2025";
    let (a_result, b_result) = tokio::join!(
        async {
            let result = upload(&a, "a.csv", csv_with_rows(&[row]), PlanMetadata::default()).await;
            a_rolled_back.notify_one();
            result
        },
        upload(&b, "b.csv", csv_with_rows(&[row]), PlanMetadata::default()),
    );

    assert!(!a_result.success);
    assert!(b_result.success, "{:?}", b_result.error);
    assert_eq!(b_result.registry.unwrap().linked, 1);

    let sites = shared.list_sites().await.unwrap();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].site_code, "KH-NEW-0001");
    assert_eq!(sites[0].mmp_count, 1);
    assert_eq!(shared.plan_total(), 1);

    // referenced and counted: the sweep keeps it
    let report = sweep_stale_pending(shared.as_ref(), objects.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(report.released_sites, 0);
    assert_eq!(shared.list_sites().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_same_file_rejected_after_plan_insert() {
    let records = Arc::new(FlakyRecordStore {
        rival_plan: true,
        ..Default::default()
    });
    let objects = Arc::new(MemoryObjectStore::new());
    let ingestor = PlanIngestor::new(IngestConfig::default(), records.clone(), objects.clone());

    let result = upload(
        &ingestor,
        "march.csv",
        distinct_rows(2),
        PlanMetadata::default().with_project_month("proj-1", "2025-03"),
    )
    .await;
    assert_eq!(result.error_code.as_deref(), Some("duplicate_upload"));
    assert!(result.error.unwrap().contains("being uploaded"));

    // only the other upload's pending row is left, and no stored file
    let plans = records.inner.find_plans(&PlanFilter::default()).await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].uploaded_by, "u-2");
    assert_eq!(records.inner.entry_total(), 0);
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_sqlite_and_filesystem_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig::default()
        .with_database_path(dir.path().join("mmp.db"))
        .with_storage_root(dir.path().join("files"));
    let records = Arc::new(SqliteRecordStore::open(&config.database_path).unwrap());
    let objects = Arc::new(LocalObjectStore::new(config.storage_root.clone()));
    let ingestor = PlanIngestor::new(config, records.clone(), objects.clone());

    let bytes = b"Site Code,Site Name,State,Locality,Visit Date,Donor Ref,Market Diversion Monitoring\n\
WD-KUL-ADAR-0001,Adar Market,West Darfur,Kulbus,15-03-2025,D-77,yes\n"
        .to_vec();
    let result = upload(
        &ingestor,
        "March Plan.csv",
        bytes,
        PlanMetadata::default().with_project_month("proj-1", "2025-03"),
    )
    .await;
    assert!(result.success, "{:?}", result.error);

    let saved = result.plan.unwrap();
    assert_eq!(saved.plan.name, "March Plan");
    assert!(saved.plan.mmp_id.starts_with("MMP-"));

    let stored = records.get_plan(saved.plan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PlanStatus::Active);
    assert_eq!(stored.processed_entries, 1);

    let entries = records.list_entries(saved.plan.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0].entry;
    assert_eq!(entry.site_name.as_deref(), Some("Adar Market"));
    assert_eq!(entry.visit_date.as_deref(), Some("15-03-2025"));
    assert!(entry.use_market_diversion);
    assert_eq!(entry.additional_data.get("Donor Ref").map(String::as_str), Some("D-77"));
    assert_eq!(entries, saved.entries);

    let link = &entries[0].registry_linkage;
    assert_eq!(link.match_tier, MatchTier::Created);
    assert_eq!(link.confidence, 1.0);
    assert!(!link.requires_review);
    assert_eq!(link.matched_by, "u-1");
    assert_eq!(link.source_workflow, "mmp_upload");
    assert_eq!(link.matched_at, stored.uploaded_at);

    let file = stored.file_path.clone();
    assert!(dir.path().join("files").join(&file).exists());

    // second identical upload: rejected, nothing new on disk
    let again = upload(
        &ingestor,
        "March Plan.csv",
        b"Site Code,Site Name\nWD-KUL-ADAR-0001,Adar Market\n".to_vec(),
        PlanMetadata::default().with_project_month("proj-1", "2025-03"),
    )
    .await;
    assert_eq!(again.error_code.as_deref(), Some("duplicate_upload"));
    let files: Vec<_> = std::fs::read_dir(dir.path().join("files/mmp-files"))
        .unwrap()
        .collect();
    assert_eq!(files.len(), 1);

    objects.remove(&file).await.unwrap();
}
