// 🔌 Collaborator seams - relational store, object store, profile lookup
//
// The pipeline only talks to these traits. Backends: db.rs (sqlite),
// storage.rs (filesystem), memory.rs (in-process).

use crate::entities::{
    MonitoringPlanRecord, NewRegistrySite, PersistedSiteEntry, PlanFilter, RegistrySite,
    SiteCreation, UploaderContext, UploaderProfile,
};
use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// RELATIONAL STORE
// ============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Full registry snapshot, oldest row first
    async fn list_sites(&self) -> StoreResult<Vec<RegistrySite>>;

    /// Create-if-absent keyed on the normalized site code. When the code is
    /// already owned, the existing row comes back with `created = false`.
    async fn create_sites(&self, sites: &[NewRegistrySite]) -> StoreResult<Vec<SiteCreation>>;

    /// Delete registry rows created before `created_before` that are still at
    /// mmp_count 0 with no entries pointing at them. Returns how many went.
    async fn release_orphan_sites(&self, created_before: DateTime<Utc>) -> StoreResult<usize>;

    async fn find_plans(&self, filter: &PlanFilter) -> StoreResult<Vec<MonitoringPlanRecord>>;

    async fn insert_plan(&self, plan: &MonitoringPlanRecord) -> StoreResult<()>;

    /// Insert one batch; all-or-nothing
    async fn insert_entries(&self, entries: &[PersistedSiteEntry]) -> StoreResult<usize>;

    /// Commit point: processed count, registry increments and status → active,
    /// applied together or not at all
    async fn finalize_plan(
        &self,
        plan_id: Uuid,
        processed_entries: usize,
        site_deltas: &[(Uuid, u32)],
    ) -> StoreResult<()>;

    /// Removes the plan and (cascading) its entries. Ok(false) if it was absent.
    async fn delete_plan(&self, plan_id: Uuid) -> StoreResult<bool>;

    async fn get_plan(&self, plan_id: Uuid) -> StoreResult<Option<MonitoringPlanRecord>>;

    /// Entries of a plan in source-row order
    async fn list_entries(&self, plan_id: Uuid) -> StoreResult<Vec<PersistedSiteEntry>>;
}

// ============================================================================
// OBJECT STORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub path: String,
    pub url: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<StoredObject>;

    /// Removing a missing object is not an error
    async fn remove(&self, path: &str) -> StoreResult<()>;
}

// ============================================================================
// PROFILE LOOKUP
// ============================================================================

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> StoreResult<Option<UploaderProfile>>;
}

/// Uploader context for `user_id`; falls back to the id as display name when
/// the profile is missing or the lookup fails
pub async fn resolve_uploader(directory: &dyn ProfileDirectory, user_id: &str) -> UploaderContext {
    match directory.lookup(user_id).await {
        Ok(Some(profile)) => profile.into(),
        Ok(None) => UploaderContext::new(user_id, user_id),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "profile lookup failed; using id as name");
            UploaderContext::new(user_id, user_id)
        }
    }
}
