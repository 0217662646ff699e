// 🔍 Deduplication - identity keys + occurrence grouping
//
// Rows that describe the same site (same normalized code|name|state|locality)
// collapse into one identity; the number of rows is its occurrence count.

use crate::entities::SiteEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Site codes compare case-insensitively with punctuation stripped:
/// "WD-KUL-ADAR-0001" == "wd kul adar 0001"
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Names/places: lowercase, punctuation removed, whitespace collapsed
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .flat_map(|c| c.to_lowercase())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalized(value: Option<&str>, f: fn(&str) -> String) -> String {
    value.map(f).unwrap_or_default()
}

// ============================================================================
// IDENTITY KEY
// ============================================================================

/// Normalized (code, name, state, locality) of one entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub code: String,
    pub name: String,
    pub state: String,
    pub locality: String,
}

impl IdentityKey {
    pub fn from_entry(entry: &SiteEntry) -> Self {
        IdentityKey {
            code: normalized(entry.site_code.as_deref(), normalize_code),
            name: normalized(entry.site_name.as_deref(), normalize_text),
            state: normalized(entry.state.as_deref(), normalize_text),
            locality: normalized(entry.locality.as_deref(), normalize_text),
        }
    }

    pub fn has_code(&self) -> bool {
        !self.code.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}|{}", self.code, self.name, self.state, self.locality)
    }
}

// ============================================================================
// OCCURRENCE INDEX
// ============================================================================

/// One distinct identity in a batch
#[derive(Debug, Clone)]
pub struct OccurrenceGroup {
    pub key: IdentityKey,

    /// Index (into the batch) of the first row with this identity
    pub first_index: usize,

    /// Every row index with this identity, in file order
    pub entry_indices: Vec<usize>,
}

impl OccurrenceGroup {
    pub fn occurrences(&self) -> u32 {
        self.entry_indices.len() as u32
    }
}

/// Groups a batch by identity, keeping first-appearance order
#[derive(Debug, Clone, Default)]
pub struct OccurrenceIndex {
    groups: Vec<OccurrenceGroup>,
    by_key: HashMap<IdentityKey, usize>,
    entry_group: Vec<usize>,
}

impl OccurrenceIndex {
    pub fn build(entries: &[SiteEntry]) -> Self {
        let mut index = OccurrenceIndex::default();

        for (i, entry) in entries.iter().enumerate() {
            let key = IdentityKey::from_entry(entry);
            let group_idx = match index.by_key.get(&key) {
                Some(&g) => g,
                None => {
                    let g = index.groups.len();
                    index.groups.push(OccurrenceGroup {
                        key: key.clone(),
                        first_index: i,
                        entry_indices: Vec::new(),
                    });
                    index.by_key.insert(key, g);
                    g
                }
            };
            index.groups[group_idx].entry_indices.push(i);
            index.entry_group.push(group_idx);
        }

        index
    }

    pub fn groups(&self) -> &[OccurrenceGroup] {
        &self.groups
    }

    pub fn distinct(&self) -> usize {
        self.groups.len()
    }

    pub fn occurrences(&self, key: &IdentityKey) -> u32 {
        self.by_key
            .get(key)
            .map(|&g| self.groups[g].occurrences())
            .unwrap_or(0)
    }

    /// Identity of the entry at `entry_index`
    pub fn key_for_entry(&self, entry_index: usize) -> Option<&IdentityKey> {
        self.entry_group
            .get(entry_index)
            .map(|&g| &self.groups[g].key)
    }
}

/// Site codes that appear on more than one row: normalized code → rows
pub fn repeated_site_codes(entries: &[SiteEntry]) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<String> = Vec::new();
    let mut rows: HashMap<String, Vec<usize>> = HashMap::new();

    for entry in entries {
        let code = normalized(entry.site_code.as_deref(), normalize_code);
        if code.is_empty() {
            continue;
        }
        rows.entry(code.clone())
            .or_insert_with(|| {
                order.push(code.clone());
                Vec::new()
            })
            .push(entry.source_row);
    }

    order
        .into_iter()
        .filter_map(|code| {
            let lines = rows.remove(&code)?;
            (lines.len() > 1).then_some((code, lines))
        })
        .collect()
}
