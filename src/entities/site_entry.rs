// 📍 Site Entry - one row of a monitoring plan
//
// Canonical optional fields + one open bag for everything the header table
// does not know about. Immutable once the parser hands it over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// CANONICAL FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    SiteCode,
    SiteName,
    State,
    Locality,
    HubOffice,
    CpName,
    VisitType,
    VisitDate,
    MainActivity,
    SiteActivity,
    MonitoringBy,
    SurveyTool,
    UseMarketDiversion,
    UseWarehouseMonitoring,
    Comments,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 15] = [
        CanonicalField::SiteCode,
        CanonicalField::SiteName,
        CanonicalField::State,
        CanonicalField::Locality,
        CanonicalField::HubOffice,
        CanonicalField::CpName,
        CanonicalField::VisitType,
        CanonicalField::VisitDate,
        CanonicalField::MainActivity,
        CanonicalField::SiteActivity,
        CanonicalField::MonitoringBy,
        CanonicalField::SurveyTool,
        CanonicalField::UseMarketDiversion,
        CanonicalField::UseWarehouseMonitoring,
        CanonicalField::Comments,
    ];

    /// Column label used in issue reports
    pub fn label(&self) -> &'static str {
        match self {
            CanonicalField::SiteCode => "Site Code",
            CanonicalField::SiteName => "Site Name",
            CanonicalField::State => "State",
            CanonicalField::Locality => "Locality",
            CanonicalField::HubOffice => "Hub Office",
            CanonicalField::CpName => "CP Name",
            CanonicalField::VisitType => "Visit Type",
            CanonicalField::VisitDate => "Visit Date",
            CanonicalField::MainActivity => "Main Activity",
            CanonicalField::SiteActivity => "Activity at Site",
            CanonicalField::MonitoringBy => "Monitoring By",
            CanonicalField::SurveyTool => "Survey Tool",
            CanonicalField::UseMarketDiversion => "Use Market Diversion Monitoring",
            CanonicalField::UseWarehouseMonitoring => "Use Warehouse Monitoring",
            CanonicalField::Comments => "Comments",
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(
            self,
            CanonicalField::UseMarketDiversion | CanonicalField::UseWarehouseMonitoring
        )
    }
}

// ============================================================================
// SITE ENTRY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteEntry {
    /// 1-based line in the source file (header is line 1)
    pub source_row: usize,

    pub site_code: Option<String>,
    pub site_name: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub hub_office: Option<String>,
    pub cp_name: Option<String>,
    pub visit_type: Option<String>,
    pub visit_date: Option<String>,
    pub main_activity: Option<String>,
    pub site_activity: Option<String>,
    pub monitoring_by: Option<String>,
    pub survey_tool: Option<String>,

    #[serde(default)]
    pub use_market_diversion: bool,
    #[serde(default)]
    pub use_warehouse_monitoring: bool,

    pub comments: Option<String>,

    /// Unmapped columns, keyed by the header exactly as it appeared
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_data: BTreeMap<String, String>,
}

impl SiteEntry {
    pub fn new(source_row: usize) -> Self {
        SiteEntry {
            source_row,
            ..Default::default()
        }
    }

    /// Builder pattern: set a text field
    pub fn with(mut self, field: CanonicalField, value: &str) -> Self {
        if let Some(slot) = self.text_slot_mut(field) {
            *slot = Some(value.to_string());
        }
        self
    }

    /// Builder pattern: add an unmapped column
    pub fn with_extra(mut self, header: &str, value: &str) -> Self {
        self.additional_data
            .insert(header.to_string(), value.to_string());
        self
    }

    /// Text value of a canonical field (None for boolean fields)
    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        let slot = match field {
            CanonicalField::SiteCode => &self.site_code,
            CanonicalField::SiteName => &self.site_name,
            CanonicalField::State => &self.state,
            CanonicalField::Locality => &self.locality,
            CanonicalField::HubOffice => &self.hub_office,
            CanonicalField::CpName => &self.cp_name,
            CanonicalField::VisitType => &self.visit_type,
            CanonicalField::VisitDate => &self.visit_date,
            CanonicalField::MainActivity => &self.main_activity,
            CanonicalField::SiteActivity => &self.site_activity,
            CanonicalField::MonitoringBy => &self.monitoring_by,
            CanonicalField::SurveyTool => &self.survey_tool,
            CanonicalField::Comments => &self.comments,
            CanonicalField::UseMarketDiversion | CanonicalField::UseWarehouseMonitoring => {
                return None
            }
        };
        slot.as_deref()
    }

    pub fn flag(&self, field: CanonicalField) -> Option<bool> {
        match field {
            CanonicalField::UseMarketDiversion => Some(self.use_market_diversion),
            CanonicalField::UseWarehouseMonitoring => Some(self.use_warehouse_monitoring),
            _ => None,
        }
    }

    pub fn set_flag(&mut self, field: CanonicalField, value: bool) {
        match field {
            CanonicalField::UseMarketDiversion => self.use_market_diversion = value,
            CanonicalField::UseWarehouseMonitoring => self.use_warehouse_monitoring = value,
            _ => {}
        }
    }

    pub fn is_set(&self, field: CanonicalField) -> bool {
        self.get(field).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Fill a text field only when it is still empty. Returns true if written.
    pub fn fill_if_empty(&mut self, field: CanonicalField, value: &str) -> bool {
        if self.is_set(field) {
            return false;
        }
        match self.text_slot_mut(field) {
            Some(slot) => {
                *slot = Some(value.to_string());
                true
            }
            None => false,
        }
    }

    pub(crate) fn text_slot_mut(&mut self, field: CanonicalField) -> Option<&mut Option<String>> {
        match field {
            CanonicalField::SiteCode => Some(&mut self.site_code),
            CanonicalField::SiteName => Some(&mut self.site_name),
            CanonicalField::State => Some(&mut self.state),
            CanonicalField::Locality => Some(&mut self.locality),
            CanonicalField::HubOffice => Some(&mut self.hub_office),
            CanonicalField::CpName => Some(&mut self.cp_name),
            CanonicalField::VisitType => Some(&mut self.visit_type),
            CanonicalField::VisitDate => Some(&mut self.visit_date),
            CanonicalField::MainActivity => Some(&mut self.main_activity),
            CanonicalField::SiteActivity => Some(&mut self.site_activity),
            CanonicalField::MonitoringBy => Some(&mut self.monitoring_by),
            CanonicalField::SurveyTool => Some(&mut self.survey_tool),
            CanonicalField::Comments => Some(&mut self.comments),
            CanonicalField::UseMarketDiversion | CanonicalField::UseWarehouseMonitoring => None,
        }
    }

    /// Short label for messages: name, else code, else row number
    pub fn display_name(&self) -> String {
        self.site_name
            .clone()
            .or_else(|| self.site_code.clone())
            .unwrap_or_else(|| format!("row {}", self.source_row))
    }
}

// ============================================================================
// REGISTRY LINKAGE
// ============================================================================

/// How an entry was matched to its registry site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExactCode,
    NameStateLocality,
    NameState,
    /// No match; a registry row is created for this identity
    Created,
}

impl MatchTier {
    pub fn confidence(&self) -> f64 {
        match self {
            MatchTier::ExactCode => 1.0,
            MatchTier::NameStateLocality => 0.85,
            MatchTier::NameState => 0.70,
            MatchTier::Created => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::ExactCode => "exact_code",
            MatchTier::NameStateLocality => "name_state_locality",
            MatchTier::NameState => "name_state",
            MatchTier::Created => "created",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact_code" => Some(MatchTier::ExactCode),
            "name_state_locality" => Some(MatchTier::NameStateLocality),
            "name_state" => Some(MatchTier::NameState),
            "created" => Some(MatchTier::Created),
            _ => None,
        }
    }
}

/// high ≥ 0.85, medium ≥ 0.70, low otherwise
pub fn confidence_level(confidence: f64) -> &'static str {
    if confidence >= 0.85 {
        "high"
    } else if confidence >= 0.70 {
        "medium"
    } else {
        "low"
    }
}

/// Match record kept with each persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryLinkage {
    pub match_tier: MatchTier,
    pub confidence: f64,
    pub requires_review: bool,
    pub matched_at: DateTime<Utc>,

    /// Uploader id
    pub matched_by: String,
    pub source_workflow: String,
}

impl RegistryLinkage {
    pub const UPLOAD_WORKFLOW: &'static str = "mmp_upload";

    pub fn confidence_level(&self) -> &'static str {
        confidence_level(self.confidence)
    }

    pub fn auto_accepted(&self) -> bool {
        !self.requires_review
    }
}

// ============================================================================
// PERSISTED ENTRY
// ============================================================================

/// A site entry after it has been linked and written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSiteEntry {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub registry_site_id: Uuid,
    pub registry_linkage: RegistryLinkage,
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub entry: SiteEntry,
}

impl PersistedSiteEntry {
    pub fn needs_review(&self) -> bool {
        self.registry_linkage.requires_review
    }
}
