// Entity Models
// Registry sites keep a stable UUID identity; plan entries point at it.

pub mod plan;
pub mod site;
pub mod site_entry;

pub use plan::{
    generate_mmp_id, plan_name_from_filename, MonitoringPlanRecord, PlanFilter, PlanMetadata,
    PlanStatus, PlanWithEntries, UploaderContext, UploaderProfile,
};
pub use site::{NewRegistrySite, RegistrySite, SiteCreation, SiteStatus};
pub use site_entry::{
    confidence_level, CanonicalField, MatchTier, PersistedSiteEntry, RegistryLinkage, SiteEntry,
};
