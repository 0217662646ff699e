// 🗺️ Registry Site - canonical, deduplicated site catalog
//
// Identity: UUID (never changes)
// Dedup key: normalized site code (unique in every backend)
// mmp_count only ever grows: it is the number of plan rows ever linked here

use crate::deduplication::normalize_code;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Active,
    Inactive,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Active => "active",
            SiteStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SiteStatus::Active),
            "inactive" => Some(SiteStatus::Inactive),
            _ => None,
        }
    }
}

// ============================================================================
// REGISTRY SITE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySite {
    pub id: Uuid,
    pub site_code: String,
    pub site_name: String,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub hub: Option<String>,
    pub activity_type: String,
    pub status: SiteStatus,

    /// Number of plan entries ever reconciled to this site
    pub mmp_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistrySite {
    pub fn normalized_code(&self) -> String {
        normalize_code(&self.site_code)
    }
}

// ============================================================================
// NEW SITE (queued for creation)
// ============================================================================

/// A site the reconciler wants created. The id is assigned up front so
/// entries can be linked before the insert happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRegistrySite {
    pub id: Uuid,
    pub site_code: String,
    pub site_name: String,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub hub: Option<String>,
    pub activity_type: String,
}

impl NewRegistrySite {
    pub fn normalized_code(&self) -> String {
        normalize_code(&self.site_code)
    }

    /// The row as it looks right after a successful insert
    pub fn into_site(self, now: DateTime<Utc>) -> RegistrySite {
        RegistrySite {
            id: self.id,
            site_code: self.site_code,
            site_name: self.site_name,
            state: self.state,
            locality: self.locality,
            hub: self.hub,
            activity_type: self.activity_type,
            status: SiteStatus::Active,
            mmp_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a create-if-absent insert
#[derive(Debug, Clone, PartialEq)]
pub struct SiteCreation {
    /// The id the caller asked for
    pub requested_id: Uuid,

    /// The row now holding that normalized code
    pub site: RegistrySite,

    /// False when another writer already owned the code
    pub created: bool,
}
