// ⚖️ Site Registry Reconciler - link every plan row to one canonical site
//
// Matching tiers (first satisfied wins):
//   1. normalized site code
//   2. normalized name + state + locality
//   3. normalized name + state
// Anything unmatched is queued for creation. Counting rule, no exceptions:
//   existing site → prior + occurrences, new site → occurrences
//
// Planning is pure. Creation results from the store are folded back in with
// apply_creations(), which also handles "someone else created it first".

use crate::deduplication::{normalize_code, normalize_text, IdentityKey, OccurrenceIndex};
use crate::entities::{
    MatchTier, NewRegistrySite, RegistryLinkage, RegistrySite, SiteCreation, SiteEntry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub registry_site_id: Uuid,
    pub site_code: String,
    pub newly_created: bool,
    pub tier: MatchTier,
    pub confidence: f64,
    pub requires_review: bool,

    /// Rows with this identity in the batch
    pub occurrences: u32,

    /// mmp_count of the registry row before this batch (0 for new rows)
    pub prior_count: u32,

    /// mmp_count once this batch is committed
    pub final_count: u32,
}

impl MatchResult {
    /// Match record stored with every entry linked through this result
    pub fn linkage(&self, matched_by: &str, matched_at: DateTime<Utc>) -> RegistryLinkage {
        RegistryLinkage {
            match_tier: self.tier,
            confidence: self.confidence,
            requires_review: self.requires_review,
            matched_at,
            matched_by: matched_by.to_string(),
            source_workflow: RegistryLinkage::UPLOAD_WORKFLOW.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub key: IdentityKey,

    /// Source row of the first entry with this identity
    pub first_row: usize,
    pub result: MatchResult,
}

// ============================================================================
// RECONCILIATION PLAN
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// One per distinct identity, in first-appearance order
    pub matches: Vec<IdentityMatch>,

    /// Rows to insert into the registry
    pub new_sites: Vec<NewRegistrySite>,

    /// Index into `matches` for each entry, by batch index
    entry_groups: Vec<usize>,
}

impl ReconciliationPlan {
    pub fn match_for_entry(&self, entry_index: usize) -> Option<&MatchResult> {
        self.entry_groups
            .get(entry_index)
            .and_then(|&g| self.matches.get(g))
            .map(|m| &m.result)
    }

    pub fn registry_id_for_entry(&self, entry_index: usize) -> Option<Uuid> {
        self.match_for_entry(entry_index).map(|m| m.registry_site_id)
    }

    pub fn entry_site_ids(&self) -> Vec<Uuid> {
        (0..self.entry_groups.len())
            .filter_map(|i| self.registry_id_for_entry(i))
            .collect()
    }

    /// (registry id, occurrences) per registry row, first-appearance order
    pub fn count_deltas(&self) -> Vec<(Uuid, u32)> {
        let mut order: Vec<Uuid> = Vec::new();
        let mut totals: HashMap<Uuid, u32> = HashMap::new();
        for m in &self.matches {
            let id = m.result.registry_site_id;
            let total = totals.entry(id).or_insert_with(|| {
                order.push(id);
                0
            });
            *total += m.result.occurrences;
        }
        order
            .into_iter()
            .map(|id| (id, totals.get(&id).copied().unwrap_or(0)))
            .collect()
    }

    fn distinct_ids(&self, newly_created: bool) -> usize {
        self.matches
            .iter()
            .filter(|m| m.result.newly_created == newly_created)
            .map(|m| m.result.registry_site_id)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn created_count(&self) -> usize {
        self.distinct_ids(true)
    }

    pub fn linked_count(&self) -> usize {
        self.distinct_ids(false)
    }

    pub fn review_required(&self) -> impl Iterator<Item = &IdentityMatch> {
        self.matches.iter().filter(|m| m.result.requires_review)
    }

    pub fn summary_message(&self) -> String {
        format!(
            "{} new sites registered, {} existing sites linked",
            self.created_count(),
            self.linked_count()
        )
    }

    /// Fold store results back in. A creation that lost a race to another
    /// writer is relinked to the row that owns the code.
    pub fn apply_creations(&mut self, creations: &[SiteCreation]) {
        let mut remap: HashMap<Uuid, &RegistrySite> = HashMap::new();
        for creation in creations {
            if !creation.created && creation.site.id != creation.requested_id {
                remap.insert(creation.requested_id, &creation.site);
            }
        }
        if remap.is_empty() {
            return;
        }

        for m in &mut self.matches {
            if let Some(existing) = remap.get(&m.result.registry_site_id) {
                m.result.registry_site_id = existing.id;
                m.result.site_code = existing.site_code.clone();
                m.result.newly_created = false;
                m.result.prior_count = existing.mmp_count;
            }
        }
        self.new_sites.retain(|s| !remap.contains_key(&s.id));
        self.recompute_final_counts();
    }

    fn recompute_final_counts(&mut self) {
        let deltas: HashMap<Uuid, u32> = self.count_deltas().into_iter().collect();
        for m in &mut self.matches {
            let total = deltas
                .get(&m.result.registry_site_id)
                .copied()
                .unwrap_or(0);
            m.result.final_count = m.result.prior_count + total;
        }
    }
}

// ============================================================================
// REGISTRY INDEX
// ============================================================================

#[derive(Debug, Clone)]
struct Candidate {
    id: Uuid,
    site_code: String,
    prior_count: u32,
    queued: bool,
}

/// Lookup tables over registry rows + rows queued in this batch.
/// When several rows share a key, the first one (registry order) wins.
#[derive(Default)]
struct RegistryIndex {
    candidates: Vec<Candidate>,
    by_code: HashMap<String, usize>,
    by_name_state_locality: HashMap<(String, String, String), usize>,
    by_name_state: HashMap<(String, String), usize>,
}

impl RegistryIndex {
    fn build(registry: &[RegistrySite]) -> Self {
        let mut index = RegistryIndex::default();
        for site in registry {
            index.insert(
                Candidate {
                    id: site.id,
                    site_code: site.site_code.clone(),
                    prior_count: site.mmp_count,
                    queued: false,
                },
                &site.site_name,
                site.state.as_deref(),
                site.locality.as_deref(),
            );
        }
        index
    }

    fn insert(&mut self, candidate: Candidate, name: &str, state: Option<&str>, locality: Option<&str>) {
        let idx = self.candidates.len();
        let code = normalize_code(&candidate.site_code);
        let name = normalize_text(name);
        let state = state.map(normalize_text).unwrap_or_default();
        let locality = locality.map(normalize_text).unwrap_or_default();
        self.candidates.push(candidate);

        if !code.is_empty() {
            self.by_code.entry(code).or_insert(idx);
        }
        if !name.is_empty() && !state.is_empty() {
            if !locality.is_empty() {
                self.by_name_state_locality
                    .entry((name.clone(), state.clone(), locality))
                    .or_insert(idx);
            }
            self.by_name_state.entry((name, state)).or_insert(idx);
        }
    }

    fn lookup(&self, key: &IdentityKey) -> Option<(&Candidate, MatchTier)> {
        if key.has_code() {
            if let Some(&idx) = self.by_code.get(&key.code) {
                return Some((&self.candidates[idx], MatchTier::ExactCode));
            }
        }
        if key.name.is_empty() || key.state.is_empty() {
            return None;
        }
        if !key.locality.is_empty() {
            let tuple = (key.name.clone(), key.state.clone(), key.locality.clone());
            if let Some(&idx) = self.by_name_state_locality.get(&tuple) {
                return Some((&self.candidates[idx], MatchTier::NameStateLocality));
            }
        }
        self.by_name_state
            .get(&(key.name.clone(), key.state.clone()))
            .map(|&idx| (&self.candidates[idx], MatchTier::NameState))
    }

    fn code_taken(&self, normalized_code: &str) -> bool {
        self.by_code.contains_key(normalized_code)
    }
}

// ============================================================================
// SITE CODE GENERATION
// ============================================================================

/// Uppercase prefix of `len` characters. With `initials`, multi-word values
/// use the first letter of each word ("West Darfur" → "WD").
fn code_part(value: Option<&str>, len: usize, initials: bool) -> String {
    let words: Vec<String> = value
        .map(normalize_text)
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let part: String = if initials && words.len() >= 2 {
        words
            .iter()
            .filter_map(|w| w.chars().next())
            .take(len)
            .collect()
    } else {
        words.concat().chars().take(len).collect()
    };

    if part.is_empty() {
        "X".repeat(len)
    } else {
        part.to_uppercase()
    }
}

/// SS-LLL-NNNN-0001: state, locality, name prefixes + first free suffix
pub fn generate_site_code(
    state: Option<&str>,
    locality: Option<&str>,
    name: Option<&str>,
    is_taken: impl Fn(&str) -> bool,
) -> String {
    let prefix = format!(
        "{}-{}-{}",
        code_part(state, 2, true),
        code_part(locality, 3, false),
        code_part(name, 4, false)
    );
    let mut n: u32 = 1;
    loop {
        let code = format!("{}-{:04}", prefix, n);
        if !is_taken(&normalize_code(&code)) {
            return code;
        }
        n += 1;
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct SiteRegistryReconciler {
    /// Matches below this confidence are flagged for review (default: 0.90)
    pub auto_accept_threshold: f64,

    /// Activity type for created sites
    pub activity_type: String,

    /// Hub for created sites when the row names none
    pub default_hub: Option<String>,
}

impl Default for SiteRegistryReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteRegistryReconciler {
    pub fn new() -> Self {
        SiteRegistryReconciler {
            auto_accept_threshold: 0.90,
            activity_type: "TPM".to_string(),
            default_hub: None,
        }
    }

    pub fn with_activity_type(mut self, activity_type: &str) -> Self {
        self.activity_type = activity_type.to_string();
        self
    }

    pub fn with_default_hub(mut self, hub: Option<&str>) -> Self {
        self.default_hub = hub.map(str::to_string);
        self
    }

    /// Resolve every entry against the registry snapshot
    pub fn plan(&self, registry: &[RegistrySite], entries: &[SiteEntry]) -> ReconciliationPlan {
        let occurrences = OccurrenceIndex::build(entries);
        let mut index = RegistryIndex::build(registry);
        let mut plan = ReconciliationPlan {
            matches: Vec::with_capacity(occurrences.distinct()),
            ..Default::default()
        };

        for group in occurrences.groups() {
            let entry = &entries[group.first_index];

            let found = index
                .lookup(&group.key)
                .map(|(candidate, tier)| (candidate.clone(), tier));
            let (candidate, tier) = match found {
                Some(hit) => hit,
                None => {
                    let new_site = self.new_site_for(entry, &group.key, &index);
                    let candidate = Candidate {
                        id: new_site.id,
                        site_code: new_site.site_code.clone(),
                        prior_count: 0,
                        queued: true,
                    };
                    index.insert(
                        candidate.clone(),
                        &new_site.site_name,
                        new_site.state.as_deref(),
                        new_site.locality.as_deref(),
                    );
                    plan.new_sites.push(new_site);
                    (candidate, MatchTier::Created)
                }
            };

            let confidence = tier.confidence();
            plan.matches.push(IdentityMatch {
                key: group.key.clone(),
                first_row: entry.source_row,
                result: MatchResult {
                    registry_site_id: candidate.id,
                    site_code: candidate.site_code.clone(),
                    newly_created: candidate.queued,
                    tier,
                    confidence,
                    requires_review: confidence < self.auto_accept_threshold,
                    occurrences: group.occurrences(),
                    prior_count: candidate.prior_count,
                    final_count: 0,
                },
            });
        }

        // entry → group (one match per group)
        let group_of: HashMap<&IdentityKey, usize> = occurrences
            .groups()
            .iter()
            .enumerate()
            .map(|(g, group)| (&group.key, g))
            .collect();
        plan.entry_groups = (0..entries.len())
            .filter_map(|i| occurrences.key_for_entry(i))
            .filter_map(|key| group_of.get(key).copied())
            .collect();

        plan.recompute_final_counts();

        tracing::debug!(
            entries = entries.len(),
            identities = plan.matches.len(),
            new_sites = plan.new_sites.len(),
            "reconciliation planned"
        );
        plan
    }

    fn new_site_for(&self, entry: &SiteEntry, key: &IdentityKey, index: &RegistryIndex) -> NewRegistrySite {
        let supplied = entry
            .site_code
            .as_deref()
            .map(str::trim)
            .filter(|_| key.has_code());
        let site_code = match supplied {
            Some(code) => code.to_string(),
            None => generate_site_code(
                entry.state.as_deref(),
                entry.locality.as_deref(),
                entry.site_name.as_deref(),
                |code| index.code_taken(code),
            ),
        };

        NewRegistrySite {
            id: Uuid::new_v4(),
            site_name: entry
                .site_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| site_code.clone()),
            site_code,
            state: entry.state.clone(),
            locality: entry.locality.clone(),
            hub: entry.hub_office.clone().or_else(|| self.default_hub.clone()),
            activity_type: self.activity_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{confidence_level, CanonicalField, SiteStatus};

    fn entry(row: usize, code: &str, name: &str, state: &str, locality: &str) -> SiteEntry {
        let mut e = SiteEntry::new(row);
        for (field, value) in [
            (CanonicalField::SiteCode, code),
            (CanonicalField::SiteName, name),
            (CanonicalField::State, state),
            (CanonicalField::Locality, locality),
        ] {
            if !value.is_empty() {
                e = e.with(field, value);
            }
        }
        e
    }

    fn site(code: &str, name: &str, state: &str, locality: &str, count: u32) -> RegistrySite {
        let now = Utc::now();
        RegistrySite {
            id: Uuid::new_v4(),
            site_code: code.to_string(),
            site_name: name.to_string(),
            state: Some(state.to_string()).filter(|s| !s.is_empty()),
            locality: Some(locality.to_string()).filter(|s| !s.is_empty()),
            hub: None,
            activity_type: "TPM".to_string(),
            status: SiteStatus::Active,
            mmp_count: count,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_repeated_code_against_empty_registry_creates_one_site() {
        let entries = vec![
            entry(2, "WD-KUL-ADAR-0001", "Adar", "West Darfur", "Kulbus"),
            entry(3, "WD-KUL-ADAR-0001", "Adar", "West Darfur", "Kulbus"),
        ];
        let plan = SiteRegistryReconciler::new().plan(&[], &entries);

        assert_eq!(plan.new_sites.len(), 1);
        assert_eq!(plan.new_sites[0].site_code, "WD-KUL-ADAR-0001");
        assert_eq!(plan.matches.len(), 1);
        assert_eq!(plan.matches[0].result.final_count, 2);
        assert!(plan.matches[0].result.newly_created);
        assert_eq!(plan.registry_id_for_entry(0), plan.registry_id_for_entry(1));
        assert_eq!(plan.count_deltas(), vec![(plan.new_sites[0].id, 2)]);
    }

    #[test]
    fn test_existing_site_count_is_prior_plus_occurrences() {
        let existing = site("KH-BAH-ALFA-0001", "Alfa Clinic", "Khartoum", "Bahri", 5);
        let entries = vec![
            entry(2, "kh bah alfa 0001", "", "", ""),
            entry(3, "KH-BAH-ALFA-0001", "", "", ""),
            entry(4, "KH-BAH-ALFA-0001", "", "", ""),
        ];
        let plan = SiteRegistryReconciler::new().plan(std::slice::from_ref(&existing), &entries);

        assert!(plan.new_sites.is_empty());
        // "kh bah alfa 0001" normalizes to the same code, so a single identity
        assert_eq!(plan.matches.len(), 1);
        let result = &plan.matches[0].result;
        assert_eq!(result.registry_site_id, existing.id);
        assert_eq!(result.tier, MatchTier::ExactCode);
        assert_eq!(result.occurrences, 3);
        assert_eq!(result.final_count, 8);
        assert!(!result.requires_review);
        assert_eq!(plan.summary_message(), "0 new sites registered, 1 existing sites linked");
    }

    #[test]
    fn test_distinct_identities_in_empty_registry() {
        let entries = vec![
            entry(2, "", "Adar", "West Darfur", "Kulbus"),
            entry(3, "", "Bir", "West Darfur", "Kulbus"),
            entry(4, "", "Cira", "Kassala", "Aroma"),
            entry(5, "Q-77", "Delta", "Kassala", "Aroma"),
        ];
        let plan = SiteRegistryReconciler::new().plan(&[], &entries);

        assert_eq!(plan.new_sites.len(), 4);
        assert!(plan.matches.iter().all(|m| m.result.final_count == 1));
        assert_eq!(plan.created_count(), 4);
        assert_eq!(plan.linked_count(), 0);

        let ids: HashSet<Uuid> = plan.entry_site_ids().iter().copied().collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_tier_order() {
        let by_code = site("S-1", "Other Name", "Kassala", "Aroma", 0);
        let by_locality = site("S-2", "Adar", "West Darfur", "Kulbus", 1);
        let by_state = site("S-3", "Bir", "West Darfur", "Somewhere", 2);
        let registry = vec![by_code.clone(), by_locality.clone(), by_state.clone()];

        let entries = vec![
            entry(2, "s1", "Adar", "West Darfur", "Kulbus"),
            entry(3, "", "ADAR", "west darfur", "KULBUS"),
            entry(4, "", "Bir", "West Darfur", "Elsewhere"),
        ];
        let plan = SiteRegistryReconciler::new().plan(&registry, &entries);

        let tiers: Vec<(Uuid, MatchTier)> = plan
            .matches
            .iter()
            .map(|m| (m.result.registry_site_id, m.result.tier))
            .collect();
        assert_eq!(
            tiers,
            vec![
                (by_code.id, MatchTier::ExactCode),
                (by_locality.id, MatchTier::NameStateLocality),
                (by_state.id, MatchTier::NameState),
            ]
        );

        assert_eq!(plan.review_required().count(), 2);
        assert_eq!(plan.matches[2].result.final_count, 3);
    }

    #[test]
    fn test_unknown_code_does_not_fall_through_to_name_when_name_absent() {
        let registry = vec![site("S-1", "Adar", "West Darfur", "Kulbus", 0)];
        let entries = vec![entry(2, "NEW-1", "", "", "")];
        let plan = SiteRegistryReconciler::new().plan(&registry, &entries);
        assert_eq!(plan.new_sites.len(), 1);
        assert_eq!(plan.new_sites[0].site_code, "NEW-1");
        assert_eq!(plan.new_sites[0].site_name, "NEW-1");
    }

    #[test]
    fn test_queued_site_matches_later_identity() {
        let entries = vec![
            entry(2, "", "Adar", "West Darfur", "Kulbus"),
            // same site, different spelling of an absent locality → tier 3 against the queued row
            entry(3, "", "Adar", "West Darfur", ""),
        ];
        let plan = SiteRegistryReconciler::new().plan(&[], &entries);

        assert_eq!(plan.new_sites.len(), 1);
        assert_eq!(plan.matches.len(), 2);
        assert_eq!(plan.matches[1].result.tier, MatchTier::NameState);
        assert!(plan.matches[1].result.newly_created);
        assert!(plan.matches.iter().all(|m| m.result.final_count == 2));
        assert_eq!(plan.created_count(), 1);
    }

    #[test]
    fn test_generated_codes() {
        let entries = vec![
            entry(2, "", "Adar Market", "West Darfur", "Kulbus"),
            entry(3, "", "Adar Mosque", "West Darfur", "Kulbus"),
        ];
        let registry = vec![site("WD-KUL-ADAR-0001", "Adar Clinic", "West Darfur", "Kulbus", 4)];
        let plan = SiteRegistryReconciler::new().plan(&registry, &entries);

        let codes: Vec<&str> = plan.new_sites.iter().map(|s| s.site_code.as_str()).collect();
        assert_eq!(codes, vec!["WD-KUL-ADAR-0002", "WD-KUL-ADAR-0003"]);
    }

    #[test]
    fn test_generate_site_code_fallbacks() {
        assert_eq!(
            generate_site_code(None, None, None, |_| false),
            "XX-XXX-XXXX-0001"
        );
        assert_eq!(
            generate_site_code(Some("Khartoum"), Some("Um"), Some("Al Amal"), |_| false),
            "KH-UM-ALAM-0001"
        );
    }

    #[test]
    fn test_apply_creations_relinks_lost_race() {
        let entries = vec![
            entry(2, "WD-KUL-ADAR-0001", "Adar", "West Darfur", "Kulbus"),
            entry(3, "WD-KUL-ADAR-0001", "Adar", "West Darfur", "Kulbus"),
        ];
        let mut plan = SiteRegistryReconciler::new().plan(&[], &entries);
        let requested = plan.new_sites[0].id;

        // another upload created the same code with one occurrence meanwhile
        let winner = site("WD-KUL-ADAR-0001", "Adar", "West Darfur", "Kulbus", 1);
        plan.apply_creations(&[SiteCreation {
            requested_id: requested,
            site: winner.clone(),
            created: false,
        }]);

        assert!(plan.new_sites.is_empty());
        assert_eq!(plan.registry_id_for_entry(0), Some(winner.id));
        assert_eq!(plan.registry_id_for_entry(1), Some(winner.id));
        let result = &plan.matches[0].result;
        assert!(!result.newly_created);
        assert_eq!(result.final_count, 3);
        assert_eq!(plan.summary_message(), "0 new sites registered, 1 existing sites linked");
    }

    #[test]
    fn test_confidence_levels() {
        assert_eq!(confidence_level(MatchTier::ExactCode.confidence()), "high");
        assert_eq!(confidence_level(MatchTier::NameStateLocality.confidence()), "high");
        assert_eq!(confidence_level(MatchTier::NameState.confidence()), "medium");
        assert_eq!(confidence_level(0.4), "low");
    }
}
