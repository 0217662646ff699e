// ✅ Validation Gate - blocking vs advisory issues + downloadable report
//
// Blocking issues stop the upload before anything is persisted.
// Advisory issues travel with the result as warnings.
// The report (type,row,column,category,message) is returned either way.

use crate::deduplication::{normalize_text, repeated_site_codes};
use crate::entities::{CanonicalField, SiteEntry};
use crate::parser::{parse_visit_date, ParseOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// ISSUE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Error,
    Warning,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Error => "error",
            IssueKind::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    // blocking
    ParseError,
    FileStructure,
    MissingHeaders,
    MissingIdentity,
    InvalidDateFormat,
    HubMismatch,

    // advisory
    MissingRecommendedHeaders,
    MissingDate,
    MissingField,
    IncompleteActivity,
    DuplicateSiteCode,
    UnrecognizedBoolean,
    HeuristicBackfill,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::ParseError => "parse_error",
            IssueCategory::FileStructure => "file_structure",
            IssueCategory::MissingHeaders => "missing_headers",
            IssueCategory::MissingIdentity => "missing_identity",
            IssueCategory::InvalidDateFormat => "invalid_date_format",
            IssueCategory::HubMismatch => "hub_mismatch",
            IssueCategory::MissingRecommendedHeaders => "missing_recommended_headers",
            IssueCategory::MissingDate => "missing_date",
            IssueCategory::MissingField => "missing_field",
            IssueCategory::IncompleteActivity => "incomplete_activity",
            IssueCategory::DuplicateSiteCode => "duplicate_site_code",
            IssueCategory::UnrecognizedBoolean => "unrecognized_boolean",
            IssueCategory::HeuristicBackfill => "heuristic_backfill",
        }
    }

    /// Human-readable name for summaries
    pub fn display_name(&self) -> &'static str {
        match self {
            IssueCategory::ParseError => "File could not be read",
            IssueCategory::FileStructure => "File structure problems",
            IssueCategory::MissingHeaders => "Missing required headers",
            IssueCategory::MissingIdentity => "Rows without site name or code",
            IssueCategory::InvalidDateFormat => "Invalid date formats",
            IssueCategory::HubMismatch => "Hub office mismatches",
            IssueCategory::MissingRecommendedHeaders => "Missing recommended headers",
            IssueCategory::MissingDate => "Missing visit dates",
            IssueCategory::MissingField => "Missing field values",
            IssueCategory::IncompleteActivity => "Incomplete activity information",
            IssueCategory::DuplicateSiteCode => "Repeated site codes",
            IssueCategory::UnrecognizedBoolean => "Unrecognized yes/no values",
            IssueCategory::HeuristicBackfill => "Values inferred from other columns",
        }
    }

    /// The gate's classification: does this category abort the upload?
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            IssueCategory::ParseError
                | IssueCategory::FileStructure
                | IssueCategory::MissingHeaders
                | IssueCategory::MissingIdentity
                | IssueCategory::InvalidDateFormat
                | IssueCategory::HubMismatch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,

    /// 1-based file line (header = 1); None for file-level issues
    pub row: Option<usize>,
    pub column: Option<String>,
    pub category: IssueCategory,
    pub message: String,
}

impl Issue {
    /// Kind follows the category's classification
    pub fn new(category: IssueCategory, message: impl Into<String>) -> Self {
        Issue {
            kind: if category.is_blocking() {
                IssueKind::Error
            } else {
                IssueKind::Warning
            },
            row: None,
            column: None,
            category,
            message: message.into(),
        }
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn in_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == IssueKind::Error
    }

    /// "Row 4: message" / "message"
    pub fn describe(&self) -> String {
        match self.row {
            Some(row) => format!("Row {}: {}", row, self.message),
            None => self.message.clone(),
        }
    }
}

// ============================================================================
// VALIDATION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
    pub entry_count: usize,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| !i.is_blocking())
    }

    pub fn blocking_count(&self) -> usize {
        self.errors().count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn has_blocking(&self) -> bool {
        self.issues.iter().any(Issue::is_blocking)
    }

    pub fn error_summary(&self) -> BTreeMap<&'static str, usize> {
        summarize(self.errors())
    }

    pub fn warning_summary(&self) -> BTreeMap<&'static str, usize> {
        summarize(self.warnings())
    }

    pub fn headline(&self) -> String {
        let errors = self.blocking_count();
        let warnings = self.warning_count();
        if errors > 0 {
            format!("CSV Validation: {} errors found", errors)
        } else if warnings > 0 {
            format!("CSV Validation: Successful with {} warnings", warnings)
        } else {
            "CSV Validation: Successful".to_string()
        }
    }

    /// Warning lines for display, capped at `limit` with a trailing "... and N more"
    pub fn warning_messages(&self, limit: usize) -> Vec<String> {
        let warnings: Vec<&Issue> = self.warnings().collect();
        let mut lines: Vec<String> = warnings.iter().take(limit).map(|w| w.describe()).collect();
        if warnings.len() > limit {
            lines.push(format!("... and {} more warnings", warnings.len() - limit));
        }
        lines
    }

    /// Delimited issues report: type,row,column,category,message
    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["type", "row", "column", "category", "message"])?;

        for issue in &self.issues {
            let row = issue.row.map(|r| r.to_string()).unwrap_or_default();
            writer.write_record([
                issue.kind.as_str(),
                row.as_str(),
                issue.column.as_deref().unwrap_or(""),
                issue.category.as_str(),
                issue.message.as_str(),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))?;
        String::from_utf8(bytes).map_err(|e| {
            csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

fn summarize<'a>(issues: impl Iterator<Item = &'a Issue>) -> BTreeMap<&'static str, usize> {
    let mut summary = BTreeMap::new();
    for issue in issues {
        *summary.entry(issue.category.display_name()).or_insert(0) += 1;
    }
    summary
}

// ============================================================================
// VALIDATION GATE
// ============================================================================

/// Columns we expect in a well-formed plan; absence is advisory
const RECOMMENDED_FIELDS: [CanonicalField; 8] = [
    CanonicalField::HubOffice,
    CanonicalField::State,
    CanonicalField::Locality,
    CanonicalField::SiteName,
    CanonicalField::CpName,
    CanonicalField::MainActivity,
    CanonicalField::SiteActivity,
    CanonicalField::VisitDate,
];

pub struct ValidationGate {
    /// Hub selected for the upload; rows naming another hub office are rejected
    pub expected_hub: Option<String>,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationGate {
    pub fn new() -> Self {
        ValidationGate { expected_hub: None }
    }

    pub fn with_expected_hub(mut self, hub: Option<&str>) -> Self {
        self.expected_hub = hub
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        self
    }

    /// Run every check over a parse outcome
    pub fn validate(&self, outcome: &ParseOutcome) -> ValidationReport {
        let mut report = ValidationReport {
            issues: outcome.issues.clone(),
            entry_count: outcome.entries.len(),
        };

        // Nothing else is meaningful once the file itself is unreadable
        if report.issues.iter().any(|i| {
            matches!(
                i.category,
                IssueCategory::ParseError | IssueCategory::FileStructure
            )
        }) {
            return report;
        }

        if !self.check_headers(outcome, &mut report.issues) {
            return report;
        }

        for entry in &outcome.entries {
            self.check_entry(outcome, entry, &mut report.issues);
        }

        self.check_hub(&outcome.entries, &mut report.issues);
        check_repeated_codes(&outcome.entries, &mut report.issues);

        report
    }

    /// Returns false when the header row makes row checks pointless
    fn check_headers(&self, outcome: &ParseOutcome, issues: &mut Vec<Issue>) -> bool {
        if !outcome.is_mapped(CanonicalField::SiteName) && !outcome.is_mapped(CanonicalField::SiteCode)
        {
            issues.push(
                Issue::new(
                    IssueCategory::MissingHeaders,
                    "Missing required headers: a Site Name or Site Code column is needed",
                )
                .in_column("Site Name"),
            );
            return false;
        }

        let missing: Vec<&str> = RECOMMENDED_FIELDS
            .iter()
            .filter(|f| !outcome.is_mapped(**f))
            .map(|f| f.label())
            .collect();
        if !missing.is_empty() {
            issues.push(Issue::new(
                IssueCategory::MissingRecommendedHeaders,
                format!("Missing recommended headers: {}", missing.join(", ")),
            ));
        }

        true
    }

    fn check_entry(&self, outcome: &ParseOutcome, entry: &SiteEntry, issues: &mut Vec<Issue>) {
        let row = entry.source_row;

        if !entry.is_set(CanonicalField::SiteName) && !entry.is_set(CanonicalField::SiteCode) {
            issues.push(
                Issue::new(
                    IssueCategory::MissingIdentity,
                    "Row has neither a Site Name nor a Site Code",
                )
                .at_row(row)
                .in_column(CanonicalField::SiteName.label()),
            );
        }

        match entry.visit_date.as_deref().filter(|d| !d.is_empty()) {
            Some(date) if parse_visit_date(date).is_none() => issues.push(
                Issue::new(
                    IssueCategory::InvalidDateFormat,
                    format!(
                        "Invalid date format '{}'. Use DD-MM-YYYY or YYYY-MM-DD",
                        date
                    ),
                )
                .at_row(row)
                .in_column(CanonicalField::VisitDate.label()),
            ),
            Some(_) => {}
            None => issues.push(
                Issue::new(IssueCategory::MissingDate, "Missing Visit Date")
                    .at_row(row)
                    .in_column(CanonicalField::VisitDate.label()),
            ),
        }

        for field in [
            CanonicalField::HubOffice,
            CanonicalField::State,
            CanonicalField::SiteName,
        ] {
            if outcome.is_mapped(field) && !entry.is_set(field) {
                // a row with no name and no code already has a blocking issue
                if field == CanonicalField::SiteName && !entry.is_set(CanonicalField::SiteCode) {
                    continue;
                }
                issues.push(
                    Issue::new(
                        IssueCategory::MissingField,
                        format!("Missing {}", field.label()),
                    )
                    .at_row(row)
                    .in_column(field.label()),
                );
            }
        }

        let activity_mapped = outcome.is_mapped(CanonicalField::MainActivity)
            || outcome.is_mapped(CanonicalField::SiteActivity);
        if activity_mapped
            && (!entry.is_set(CanonicalField::MainActivity)
                || !entry.is_set(CanonicalField::SiteActivity))
        {
            issues.push(
                Issue::new(
                    IssueCategory::IncompleteActivity,
                    "Main Activity and Activity at Site should both be filled in",
                )
                .at_row(row)
                .in_column(CanonicalField::MainActivity.label()),
            );
        }
    }

    /// One blocking issue per distinct hub office that does not belong to the expected hub
    fn check_hub(&self, entries: &[SiteEntry], issues: &mut Vec<Issue>) {
        let Some(expected) = &self.expected_hub else {
            return;
        };

        let mut order: Vec<String> = Vec::new();
        let mut mismatches: HashMap<String, (usize, String, usize)> = HashMap::new();

        for entry in entries {
            let Some(office) = entry.hub_office.as_deref().filter(|o| !o.is_empty()) else {
                continue;
            };
            if hub_matches(expected, office) {
                continue;
            }
            let key = normalize_text(office);
            mismatches
                .entry(key.clone())
                .and_modify(|(_, _, count)| *count += 1)
                .or_insert_with(|| {
                    order.push(key);
                    (entry.source_row, office.to_string(), 1)
                });
        }

        for key in order {
            if let Some((row, office, count)) = mismatches.remove(&key) {
                issues.push(
                    Issue::new(
                        IssueCategory::HubMismatch,
                        format!(
                            "Hub office '{}' ({} row(s)) does not belong to the selected hub '{}'",
                            office, count, expected
                        ),
                    )
                    .at_row(row)
                    .in_column(CanonicalField::HubOffice.label()),
                );
            }
        }
    }
}

/// "El Fasher" matches "El Fasher Hub" and "el-fasher"
pub fn hub_matches(expected: &str, office: &str) -> bool {
    let expected = normalize_text(expected);
    let office = normalize_text(office);
    if expected.is_empty() || office.is_empty() {
        return true;
    }
    let strip = |s: &str| s.trim_end_matches(" hub").trim_end_matches(" office").to_string();
    let (expected, office) = (strip(&expected), strip(&office));
    expected == office || office.contains(&expected) || expected.contains(&office)
}

fn check_repeated_codes(entries: &[SiteEntry], issues: &mut Vec<Issue>) {
    for (code, rows) in repeated_site_codes(entries) {
        let first = rows[0];
        let listed = rows
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let shown = entries
            .iter()
            .find(|e| e.source_row == first)
            .and_then(|e| e.site_code.clone())
            .unwrap_or(code);
        issues.push(
            Issue::new(
                IssueCategory::DuplicateSiteCode,
                format!(
                    "Site code {} appears on rows {}; they will be recorded as repeat visits to one site",
                    shown, listed
                ),
            )
            .at_row(first)
            .in_column(CanonicalField::SiteCode.label()),
        );
    }
}
