// 🗄️ SQLite record store - plans, entries, site registry, audit events
//
// rusqlite is blocking: every call runs on tokio's blocking pool behind one
// shared connection. Multi-row writes (entry batches, finalize) are single
// transactions so a failed batch leaves nothing behind.

use crate::entities::{
    MatchTier, MonitoringPlanRecord, NewRegistrySite, PersistedSiteEntry, PlanFilter, PlanStatus,
    RegistryLinkage, RegistrySite, SiteCreation, SiteEntry, SiteStatus, UploaderProfile,
};
use crate::error::{StoreError, StoreResult};
use crate::store::{ProfileDirectory, RecordStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Audit trail entry ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> StoreResult<()> {
    let data_json = serde_json::to_string(&event.data)?;
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;
    Ok(())
}

pub fn get_events_for_entity(conn: &Connection, entity_id: &str) -> StoreResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events WHERE entity_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![entity_id], |row| {
            let data: String = row.get(5)?;
            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_time(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for crash recovery; FKs so entries cascade with their plan
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sites_registry (
            id TEXT PRIMARY KEY,
            site_code TEXT NOT NULL,
            normalized_code TEXT NOT NULL UNIQUE,
            site_name TEXT NOT NULL,
            state_name TEXT,
            locality_name TEXT,
            hub_name TEXT,
            activity_type TEXT NOT NULL,
            status TEXT NOT NULL,
            mmp_count INTEGER NOT NULL DEFAULT 0 CHECK (mmp_count >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mmp_files (
            id TEXT PRIMARY KEY,
            mmp_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            entries INTEGER NOT NULL,
            processed_entries INTEGER NOT NULL DEFAULT 0,
            file_path TEXT NOT NULL,
            file_url TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            project_id TEXT,
            month TEXT,
            hub TEXT,
            uploaded_by TEXT NOT NULL,
            uploaded_by_name TEXT NOT NULL,
            uploaded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mmp_site_entries (
            id TEXT PRIMARY KEY,
            mmp_file_id TEXT NOT NULL REFERENCES mmp_files(id) ON DELETE CASCADE,
            registry_site_id TEXT NOT NULL REFERENCES sites_registry(id),
            source_row INTEGER NOT NULL,
            site_code TEXT,
            site_name TEXT,
            state TEXT,
            locality TEXT,
            hub_office TEXT,
            cp_name TEXT,
            visit_type TEXT,
            visit_date TEXT,
            main_activity TEXT,
            site_activity TEXT,
            monitoring_by TEXT,
            survey_tool TEXT,
            use_market_diversion INTEGER NOT NULL DEFAULT 0,
            use_warehouse_monitoring INTEGER NOT NULL DEFAULT 0,
            comments TEXT,
            additional_data TEXT NOT NULL DEFAULT '{}',
            match_tier TEXT NOT NULL,
            match_confidence REAL NOT NULL,
            requires_review INTEGER NOT NULL DEFAULT 0,
            matched_at TEXT NOT NULL,
            matched_by TEXT NOT NULL,
            source_workflow TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_entries_plan ON mmp_site_entries(mmp_file_id);
        CREATE INDEX IF NOT EXISTS idx_entries_site ON mmp_site_entries(registry_site_id);
        CREATE INDEX IF NOT EXISTS idx_entries_review ON mmp_site_entries(requires_review);
        CREATE INDEX IF NOT EXISTS idx_plans_project_month ON mmp_files(project_id, month);
        CREATE INDEX IF NOT EXISTS idx_plans_filename ON mmp_files(original_filename);
        CREATE INDEX IF NOT EXISTS idx_plans_status ON mmp_files(status, uploaded_at);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);",
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn bad_value(idx: usize, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected value '{}'", value),
        ),
    )
}

const SITE_COLUMNS: &str = "id, site_code, site_name, state_name, locality_name, hub_name,
     activity_type, status, mmp_count, created_at, updated_at";

fn site_from_row(row: &Row) -> rusqlite::Result<RegistrySite> {
    let status: String = row.get(7)?;
    let count: i64 = row.get(8)?;
    Ok(RegistrySite {
        id: parse_uuid(row, 0)?,
        site_code: row.get(1)?,
        site_name: row.get(2)?,
        state: row.get(3)?,
        locality: row.get(4)?,
        hub: row.get(5)?,
        activity_type: row.get(6)?,
        status: SiteStatus::parse(&status).ok_or_else(|| bad_value(7, &status))?,
        mmp_count: u32::try_from(count).map_err(|e| conversion_error(8, e))?,
        created_at: parse_time(row, 9)?,
        updated_at: parse_time(row, 10)?,
    })
}

const PLAN_COLUMNS: &str = "id, mmp_id, name, status, entries, processed_entries, file_path,
     file_url, original_filename, content_hash, project_id, month, hub, uploaded_by,
     uploaded_by_name, uploaded_at";

fn plan_from_row(row: &Row) -> rusqlite::Result<MonitoringPlanRecord> {
    let status: String = row.get(3)?;
    let entries: i64 = row.get(4)?;
    let processed: i64 = row.get(5)?;
    Ok(MonitoringPlanRecord {
        id: parse_uuid(row, 0)?,
        mmp_id: row.get(1)?,
        name: row.get(2)?,
        status: PlanStatus::parse(&status).ok_or_else(|| bad_value(3, &status))?,
        entries: usize::try_from(entries).map_err(|e| conversion_error(4, e))?,
        processed_entries: usize::try_from(processed).map_err(|e| conversion_error(5, e))?,
        file_path: row.get(6)?,
        file_url: row.get(7)?,
        original_filename: row.get(8)?,
        content_hash: row.get(9)?,
        project_id: row.get(10)?,
        month: row.get(11)?,
        hub: row.get(12)?,
        uploaded_by: row.get(13)?,
        uploaded_by_name: row.get(14)?,
        uploaded_at: parse_time(row, 15)?,
    })
}

const ENTRY_COLUMNS: &str = "id, mmp_file_id, registry_site_id, created_at, source_row,
     site_code, site_name, state, locality, hub_office, cp_name, visit_type, visit_date,
     main_activity, site_activity, monitoring_by, survey_tool, use_market_diversion,
     use_warehouse_monitoring, comments, additional_data, match_tier, match_confidence,
     requires_review, matched_at, matched_by, source_workflow";

fn entry_from_row(row: &Row) -> rusqlite::Result<PersistedSiteEntry> {
    let source_row: i64 = row.get(4)?;
    let additional: String = row.get(20)?;
    let additional_data: BTreeMap<String, String> =
        serde_json::from_str(&additional).map_err(|e| conversion_error(20, e))?;
    let tier: String = row.get(21)?;

    Ok(PersistedSiteEntry {
        id: parse_uuid(row, 0)?,
        plan_id: parse_uuid(row, 1)?,
        registry_site_id: parse_uuid(row, 2)?,
        registry_linkage: RegistryLinkage {
            match_tier: MatchTier::parse(&tier).ok_or_else(|| bad_value(21, &tier))?,
            confidence: row.get(22)?,
            requires_review: row.get(23)?,
            matched_at: parse_time(row, 24)?,
            matched_by: row.get(25)?,
            source_workflow: row.get(26)?,
        },
        created_at: parse_time(row, 3)?,
        entry: SiteEntry {
            source_row: usize::try_from(source_row).map_err(|e| conversion_error(4, e))?,
            site_code: row.get(5)?,
            site_name: row.get(6)?,
            state: row.get(7)?,
            locality: row.get(8)?,
            hub_office: row.get(9)?,
            cp_name: row.get(10)?,
            visit_type: row.get(11)?,
            visit_date: row.get(12)?,
            main_activity: row.get(13)?,
            site_activity: row.get(14)?,
            monitoring_by: row.get(15)?,
            survey_tool: row.get(16)?,
            use_market_diversion: row.get(17)?,
            use_warehouse_monitoring: row.get(18)?,
            comments: row.get(19)?,
            additional_data,
        },
    })
}

// ============================================================================
// SYNCHRONOUS OPERATIONS (one connection, caller holds the lock)
// ============================================================================

fn select_site_by_code(conn: &Connection, normalized_code: &str) -> StoreResult<RegistrySite> {
    let sql = format!(
        "SELECT {} FROM sites_registry WHERE normalized_code = ?1",
        SITE_COLUMNS
    );
    conn.query_row(&sql, params![normalized_code], site_from_row)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("site code {}", normalized_code)))
}

fn create_sites_tx(conn: &mut Connection, sites: &[NewRegistrySite]) -> StoreResult<Vec<SiteCreation>> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();
    let mut results = Vec::with_capacity(sites.len());

    for site in sites {
        let normalized = site.normalized_code();
        let inserted = tx.execute(
            "INSERT INTO sites_registry (
                id, site_code, normalized_code, site_name, state_name, locality_name, hub_name,
                activity_type, status, mmp_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)
            ON CONFLICT(normalized_code) DO NOTHING",
            params![
                site.id.to_string(),
                site.site_code,
                normalized,
                site.site_name,
                site.state,
                site.locality,
                site.hub,
                site.activity_type,
                SiteStatus::Active.as_str(),
                now,
            ],
        )?;

        let stored = select_site_by_code(&tx, &normalized)?;
        if inserted == 1 {
            insert_event(
                &tx,
                &Event::new(
                    "site_registered",
                    "site",
                    &stored.id.to_string(),
                    serde_json::json!({ "site_code": stored.site_code, "site_name": stored.site_name }),
                    "reconciler",
                ),
            )?;
        }
        results.push(SiteCreation {
            requested_id: site.id,
            site: stored,
            created: inserted == 1,
        });
    }

    tx.commit()?;
    Ok(results)
}

fn insert_entries_tx(conn: &mut Connection, entries: &[PersistedSiteEntry]) -> StoreResult<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO mmp_site_entries (
                id, mmp_file_id, registry_site_id, created_at, source_row,
                site_code, site_name, state, locality, hub_office, cp_name, visit_type,
                visit_date, main_activity, site_activity, monitoring_by, survey_tool,
                use_market_diversion, use_warehouse_monitoring, comments, additional_data,
                match_tier, match_confidence, requires_review, matched_at, matched_by,
                source_workflow
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
        )?;

        for persisted in entries {
            let e = &persisted.entry;
            let link = &persisted.registry_linkage;
            let additional = serde_json::to_string(&e.additional_data)?;
            stmt.execute(params![
                persisted.id.to_string(),
                persisted.plan_id.to_string(),
                persisted.registry_site_id.to_string(),
                persisted.created_at.to_rfc3339(),
                e.source_row as i64,
                e.site_code,
                e.site_name,
                e.state,
                e.locality,
                e.hub_office,
                e.cp_name,
                e.visit_type,
                e.visit_date,
                e.main_activity,
                e.site_activity,
                e.monitoring_by,
                e.survey_tool,
                e.use_market_diversion,
                e.use_warehouse_monitoring,
                e.comments,
                additional,
                link.match_tier.as_str(),
                link.confidence,
                link.requires_review,
                link.matched_at.to_rfc3339(),
                link.matched_by,
                link.source_workflow,
            ])?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

fn finalize_tx(
    conn: &mut Connection,
    plan_id: Uuid,
    processed_entries: usize,
    site_deltas: &[(Uuid, u32)],
) -> StoreResult<()> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();

    for (site_id, delta) in site_deltas {
        let changed = tx.execute(
            "UPDATE sites_registry SET mmp_count = mmp_count + ?1, updated_at = ?2 WHERE id = ?3",
            params![*delta as i64, now, site_id.to_string()],
        )?;
        if changed != 1 {
            // dropping tx rolls back every increment above
            return Err(StoreError::NotFound(format!("registry site {}", site_id)));
        }
    }

    let changed = tx.execute(
        "UPDATE mmp_files SET processed_entries = ?1, status = ?2 WHERE id = ?3",
        params![
            processed_entries as i64,
            PlanStatus::Active.as_str(),
            plan_id.to_string()
        ],
    )?;
    if changed != 1 {
        return Err(StoreError::NotFound(format!("plan {}", plan_id)));
    }

    insert_event(
        &tx,
        &Event::new(
            "plan_activated",
            "plan",
            &plan_id.to_string(),
            serde_json::json!({ "processed_entries": processed_entries, "sites": site_deltas.len() }),
            "persistence",
        ),
    )?;

    tx.commit()?;
    Ok(())
}

fn release_orphans_tx(conn: &mut Connection, created_before: DateTime<Utc>) -> StoreResult<usize> {
    let tx = conn.transaction()?;
    let candidates: Vec<RegistrySite> = {
        let sql = format!(
            "SELECT {} FROM sites_registry s
             WHERE s.mmp_count = 0
               AND NOT EXISTS (SELECT 1 FROM mmp_site_entries e WHERE e.registry_site_id = s.id)",
            SITE_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map([], site_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    // age compares parsed timestamps, not strings
    let mut removed = 0;
    for site in candidates.iter().filter(|s| s.created_at < created_before) {
        removed += tx.execute("DELETE FROM sites_registry WHERE id = ?1", params![site.id.to_string()])?;
        insert_event(
            &tx,
            &Event::new(
                "site_released",
                "site",
                &site.id.to_string(),
                serde_json::json!({ "site_code": site.site_code }),
                "sweeper",
            ),
        )?;
    }

    tx.commit()?;
    Ok(removed)
}

fn find_plans_sync(conn: &Connection, filter: &PlanFilter) -> StoreResult<Vec<MonitoringPlanRecord>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(project) = &filter.project_id {
        clauses.push("project_id = ?");
        values.push(Value::Text(project.clone()));
    }
    if let Some(month) = &filter.month {
        clauses.push("month = ?");
        values.push(Value::Text(month.clone()));
    }
    if let Some(filename) = &filter.original_filename {
        clauses.push("original_filename = ?");
        values.push(Value::Text(filename.clone()));
    }

    let sql = if clauses.is_empty() {
        format!("SELECT {} FROM mmp_files ORDER BY uploaded_at", PLAN_COLUMNS)
    } else {
        format!(
            "SELECT {} FROM mmp_files WHERE {} ORDER BY uploaded_at",
            PLAN_COLUMNS,
            clauses.join(" AND ")
        )
    };

    let mut stmt = conn.prepare(&sql)?;
    let plans = stmt
        .query_map(params_from_iter(values), plan_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    // time bounds compare parsed timestamps, not strings
    Ok(plans.into_iter().filter(|p| filter.matches(p)).collect())
}

// ============================================================================
// SQLITE RECORD STORE
// ============================================================================

#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        setup_database(&conn).context("Failed to initialize database schema")?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        setup_database(&conn).context("Failed to initialize database schema")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        SqliteRecordStore {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn upsert_profile(&self, profile: &UploaderProfile) -> StoreResult<()> {
        let profile = profile.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, role = excluded.role",
                params![profile.id, profile.display_name, profile.role],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn events_for(&self, entity_id: &str) -> StoreResult<Vec<Event>> {
        let entity_id = entity_id.to_string();
        self.with_conn(move |conn| get_events_for_entity(conn, &entity_id))
            .await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn list_sites(&self) -> StoreResult<Vec<RegistrySite>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM sites_registry ORDER BY rowid", SITE_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let sites = stmt
                .query_map([], site_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sites)
        })
        .await
    }

    async fn create_sites(&self, sites: &[NewRegistrySite]) -> StoreResult<Vec<SiteCreation>> {
        let sites = sites.to_vec();
        self.with_conn(move |conn| create_sites_tx(conn, &sites)).await
    }

    async fn release_orphan_sites(&self, created_before: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(move |conn| release_orphans_tx(conn, created_before))
            .await
    }

    async fn find_plans(&self, filter: &PlanFilter) -> StoreResult<Vec<MonitoringPlanRecord>> {
        let filter = filter.clone();
        self.with_conn(move |conn| find_plans_sync(conn, &filter)).await
    }

    async fn insert_plan(&self, plan: &MonitoringPlanRecord) -> StoreResult<()> {
        let plan = plan.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mmp_files (
                    id, mmp_id, name, status, entries, processed_entries, file_path, file_url,
                    original_filename, content_hash, project_id, month, hub, uploaded_by,
                    uploaded_by_name, uploaded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    plan.id.to_string(),
                    plan.mmp_id,
                    plan.name,
                    plan.status.as_str(),
                    plan.entries as i64,
                    plan.processed_entries as i64,
                    plan.file_path,
                    plan.file_url,
                    plan.original_filename,
                    plan.content_hash,
                    plan.project_id,
                    plan.month,
                    plan.hub,
                    plan.uploaded_by,
                    plan.uploaded_by_name,
                    plan.uploaded_at.to_rfc3339(),
                ],
            )?;
            insert_event(
                conn,
                &Event::new(
                    "plan_created",
                    "plan",
                    &plan.id.to_string(),
                    serde_json::json!({
                        "mmp_id": plan.mmp_id,
                        "original_filename": plan.original_filename,
                        "entries": plan.entries,
                    }),
                    &plan.uploaded_by,
                ),
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_entries(&self, entries: &[PersistedSiteEntry]) -> StoreResult<usize> {
        let entries = entries.to_vec();
        self.with_conn(move |conn| insert_entries_tx(conn, &entries)).await
    }

    async fn finalize_plan(
        &self,
        plan_id: Uuid,
        processed_entries: usize,
        site_deltas: &[(Uuid, u32)],
    ) -> StoreResult<()> {
        let site_deltas = site_deltas.to_vec();
        self.with_conn(move |conn| finalize_tx(conn, plan_id, processed_entries, &site_deltas))
            .await
    }

    async fn delete_plan(&self, plan_id: Uuid) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let id = plan_id.to_string();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM mmp_site_entries WHERE mmp_file_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM mmp_files WHERE id = ?1", params![id])?;
            if deleted > 0 {
                insert_event(
                    &tx,
                    &Event::new("plan_deleted", "plan", &id, serde_json::json!({}), "persistence"),
                )?;
            }
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn get_plan(&self, plan_id: Uuid) -> StoreResult<Option<MonitoringPlanRecord>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM mmp_files WHERE id = ?1", PLAN_COLUMNS);
            Ok(conn
                .query_row(&sql, params![plan_id.to_string()], plan_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_entries(&self, plan_id: Uuid) -> StoreResult<Vec<PersistedSiteEntry>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM mmp_site_entries WHERE mmp_file_id = ?1 ORDER BY source_row, rowid",
                ENTRY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params![plan_id.to_string()], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

#[async_trait]
impl ProfileDirectory for SqliteRecordStore {
    async fn lookup(&self, user_id: &str) -> StoreResult<Option<UploaderProfile>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, display_name, role FROM profiles WHERE id = ?1",
                    params![user_id],
                    |row| {
                        Ok(UploaderProfile {
                            id: row.get(0)?,
                            display_name: row.get(1)?,
                            role: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }
}
