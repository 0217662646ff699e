// 📋 Monitoring Plan - one uploaded batch of site visits
//
// Lifecycle: pending (write-ahead) → active (all entries + counts committed)
// A plan never becomes active unless every entry batch landed.

use super::site_entry::PersistedSiteEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Entries are still being written
    Pending,
    Active,
    Archived,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Active => "active",
            PlanStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PlanStatus::Pending),
            "active" => Some(PlanStatus::Active),
            "archived" => Some(PlanStatus::Archived),
            _ => None,
        }
    }
}

// ============================================================================
// UPLOAD CONTEXT
// ============================================================================

/// Who is uploading. Passed explicitly, never read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderContext {
    pub id: String,
    pub display_name: String,
}

impl UploaderContext {
    pub fn new(id: &str, display_name: &str) -> Self {
        UploaderContext {
            id: id.to_string(),
            display_name: display_name.to_string(),
        }
    }
}

/// Profile as returned by a ProfileDirectory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderProfile {
    pub id: String,
    pub display_name: String,
    pub role: Option<String>,
}

impl From<UploaderProfile> for UploaderContext {
    fn from(profile: UploaderProfile) -> Self {
        UploaderContext {
            id: profile.id,
            display_name: profile.display_name,
        }
    }
}

/// Caller-supplied metadata for an upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Plan name; defaults to the file name without extension
    pub display_name: Option<String>,
    pub hub: Option<String>,
    pub month: Option<String>,
    pub owner_project_id: Option<String>,
}

impl PlanMetadata {
    pub fn with_project_month(mut self, project_id: &str, month: &str) -> Self {
        self.owner_project_id = Some(project_id.to_string());
        self.month = Some(month.to_string());
        self
    }

    pub fn with_hub(mut self, hub: &str) -> Self {
        self.hub = Some(hub.to_string());
        self
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    /// Project and month, only when both are present and non-blank
    pub fn project_month(&self) -> Option<(&str, &str)> {
        let project = self.owner_project_id.as_deref().map(str::trim)?;
        let month = self.month.as_deref().map(str::trim)?;
        if project.is_empty() || month.is_empty() {
            return None;
        }
        Some((project, month))
    }
}

// ============================================================================
// PLAN RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPlanRecord {
    pub id: Uuid,

    /// Human-facing id, e.g. MMP-4F2A91C0
    pub mmp_id: String,
    pub name: String,
    pub status: PlanStatus,

    /// Entries the file declared (non-empty rows)
    pub entries: usize,
    pub processed_entries: usize,

    pub file_path: String,
    pub file_url: String,
    pub original_filename: String,
    pub content_hash: String,

    pub project_id: Option<String>,
    pub month: Option<String>,
    pub hub: Option<String>,

    pub uploaded_by: String,
    pub uploaded_by_name: String,
    pub uploaded_at: DateTime<Utc>,
}

impl MonitoringPlanRecord {
    pub fn is_active(&self) -> bool {
        self.status == PlanStatus::Active
    }
}

pub fn generate_mmp_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("MMP-{}", simple[..8].to_uppercase())
}

/// Default plan name: file name without its extension
pub fn plan_name_from_filename(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[..idx].to_string(),
        _ => base.to_string(),
    }
}

/// Plan with every entry, as returned to the uploader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWithEntries {
    pub plan: MonitoringPlanRecord,
    pub entries: Vec<PersistedSiteEntry>,
}

// ============================================================================
// FILTERED QUERIES
// ============================================================================

/// Collection-style filter; every set field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanFilter {
    pub status: Option<PlanStatus>,
    pub project_id: Option<String>,
    pub month: Option<String>,
    pub original_filename: Option<String>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
}

impl PlanFilter {
    pub fn status(status: PlanStatus) -> Self {
        PlanFilter {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_project_month(mut self, project_id: &str, month: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self.month = Some(month.to_string());
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.original_filename = Some(filename.to_string());
        self
    }

    pub fn uploaded_after(mut self, at: DateTime<Utc>) -> Self {
        self.uploaded_after = Some(at);
        self
    }

    pub fn uploaded_before(mut self, at: DateTime<Utc>) -> Self {
        self.uploaded_before = Some(at);
        self
    }

    pub fn matches(&self, plan: &MonitoringPlanRecord) -> bool {
        if let Some(status) = self.status {
            if plan.status != status {
                return false;
            }
        }
        if let Some(project) = &self.project_id {
            if plan.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if let Some(month) = &self.month {
            if plan.month.as_deref() != Some(month.as_str()) {
                return false;
            }
        }
        if let Some(filename) = &self.original_filename {
            if &plan.original_filename != filename {
                return false;
            }
        }
        if let Some(after) = self.uploaded_after {
            if plan.uploaded_at < after {
                return false;
            }
        }
        if let Some(before) = self.uploaded_before {
            if plan.uploaded_at >= before {
                return false;
            }
        }
        true
    }
}
