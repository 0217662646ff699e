// 🧠 In-process backends
// Same contracts as the sqlite/filesystem stores, held behind RwLocks.
// Used for headless runs and tests.

use crate::entities::{
    MonitoringPlanRecord, NewRegistrySite, PersistedSiteEntry, PlanFilter, PlanStatus,
    RegistrySite, SiteCreation, UploaderProfile,
};
use crate::error::{StoreError, StoreResult};
use crate::storage::sha256_hex;
use crate::store::{ObjectStore, ProfileDirectory, RecordStore, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

// ============================================================================
// RECORD STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    sites: Vec<RegistrySite>,
    plans: Vec<MonitoringPlanRecord>,
    entries: Vec<PersistedSiteEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: RwLock<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated registry
    pub fn with_sites(sites: Vec<RegistrySite>) -> Self {
        MemoryRecordStore {
            state: RwLock::new(MemoryState {
                sites,
                ..Default::default()
            }),
        }
    }

    pub fn entry_total(&self) -> usize {
        self.state.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn plan_total(&self) -> usize {
        self.state.read().map(|s| s.plans.len()).unwrap_or(0)
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_sites(&self) -> StoreResult<Vec<RegistrySite>> {
        Ok(self.read()?.sites.clone())
    }

    async fn create_sites(&self, sites: &[NewRegistrySite]) -> StoreResult<Vec<SiteCreation>> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut results = Vec::with_capacity(sites.len());

        for new_site in sites {
            let code = new_site.normalized_code();
            let existing = state.sites.iter().find(|s| s.normalized_code() == code).cloned();
            match existing {
                Some(site) => results.push(SiteCreation {
                    requested_id: new_site.id,
                    site,
                    created: false,
                }),
                None => {
                    let site = new_site.clone().into_site(now);
                    state.sites.push(site.clone());
                    results.push(SiteCreation {
                        requested_id: new_site.id,
                        site,
                        created: true,
                    });
                }
            }
        }

        Ok(results)
    }

    async fn release_orphan_sites(&self, created_before: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.write()?;
        let referenced: HashSet<Uuid> = state.entries.iter().map(|e| e.registry_site_id).collect();
        let before = state.sites.len();
        state.sites.retain(|s| {
            !(s.mmp_count == 0 && s.created_at < created_before && !referenced.contains(&s.id))
        });
        Ok(before - state.sites.len())
    }

    async fn find_plans(&self, filter: &PlanFilter) -> StoreResult<Vec<MonitoringPlanRecord>> {
        Ok(self
            .read()?
            .plans
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn insert_plan(&self, plan: &MonitoringPlanRecord) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.plans.iter().any(|p| p.id == plan.id) {
            return Err(StoreError::Backend(format!("plan {} already exists", plan.id)));
        }
        state.plans.push(plan.clone());
        Ok(())
    }

    async fn insert_entries(&self, entries: &[PersistedSiteEntry]) -> StoreResult<usize> {
        let mut state = self.write()?;

        // validate the whole batch first so nothing lands on failure
        for entry in entries {
            if !state.plans.iter().any(|p| p.id == entry.plan_id) {
                return Err(StoreError::NotFound(format!("plan {}", entry.plan_id)));
            }
            if !state.sites.iter().any(|s| s.id == entry.registry_site_id) {
                return Err(StoreError::NotFound(format!(
                    "registry site {}",
                    entry.registry_site_id
                )));
            }
        }

        state.entries.extend(entries.iter().cloned());
        Ok(entries.len())
    }

    async fn finalize_plan(
        &self,
        plan_id: Uuid,
        processed_entries: usize,
        site_deltas: &[(Uuid, u32)],
    ) -> StoreResult<()> {
        let mut state = self.write()?;

        if !state.plans.iter().any(|p| p.id == plan_id) {
            return Err(StoreError::NotFound(format!("plan {}", plan_id)));
        }
        for (id, _) in site_deltas {
            if !state.sites.iter().any(|s| s.id == *id) {
                return Err(StoreError::NotFound(format!("registry site {}", id)));
            }
        }

        let now = Utc::now();
        for (id, delta) in site_deltas {
            if let Some(site) = state.sites.iter_mut().find(|s| s.id == *id) {
                site.mmp_count += delta;
                site.updated_at = now;
            }
        }
        if let Some(plan) = state.plans.iter_mut().find(|p| p.id == plan_id) {
            plan.processed_entries = processed_entries;
            plan.status = PlanStatus::Active;
        }
        Ok(())
    }

    async fn delete_plan(&self, plan_id: Uuid) -> StoreResult<bool> {
        let mut state = self.write()?;
        let before = state.plans.len();
        state.plans.retain(|p| p.id != plan_id);
        state.entries.retain(|e| e.plan_id != plan_id);
        Ok(state.plans.len() < before)
    }

    async fn get_plan(&self, plan_id: Uuid) -> StoreResult<Option<MonitoringPlanRecord>> {
        Ok(self.read()?.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn list_entries(&self, plan_id: Uuid) -> StoreResult<Vec<PersistedSiteEntry>> {
        let mut entries: Vec<PersistedSiteEntry> = self
            .read()?
            .entries
            .iter()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.entry.source_row);
        Ok(entries)
    }
}

// ============================================================================
// OBJECT STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().ok().and_then(|o| o.get(path).cloned())
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> StoreResult<StoredObject> {
        let content_hash = sha256_hex(bytes);

        self.objects
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(path.to_string(), bytes.to_vec());

        Ok(StoredObject {
            path: path.to_string(),
            url: format!("memory://{}", path),
            content_hash,
            byte_size: bytes.len(),
        })
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.objects
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(path);
        Ok(())
    }
}

// ============================================================================
// PROFILE DIRECTORY
// ============================================================================

#[derive(Debug, Default)]
pub struct StaticProfileDirectory {
    profiles: HashMap<String, UploaderProfile>,
}

impl StaticProfileDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, id: &str, display_name: &str, role: Option<&str>) -> Self {
        self.profiles.insert(
            id.to_string(),
            UploaderProfile {
                id: id.to_string(),
                display_name: display_name.to_string(),
                role: role.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn lookup(&self, user_id: &str) -> StoreResult<Option<UploaderProfile>> {
        Ok(self.profiles.get(user_id).cloned())
    }
}
