// 🏗️ Plan File Parser - schema-tolerant delimited file reader
//
// Field teams export plans from different spreadsheet templates: "Site Name",
// "Facility Name", "site" all mean the same thing. Headers are normalized and
// resolved through a synonym table; unknown columns are kept verbatim.

use crate::data_quality::{Issue, IssueCategory};
use crate::deduplication::normalize_text;
use crate::entities::{CanonicalField, SiteEntry};
use crate::error::IngestError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// SYNONYM TABLE
// ============================================================================

/// Normalized header spellings per canonical field. The first spelling is the
/// primary (exact) name and always wins over other fields' synonyms.
pub const SYNONYMS: &[(CanonicalField, &[&str])] = &[
    (CanonicalField::HubOffice, &["huboffice", "hub", "office"]),
    (CanonicalField::State, &["state", "statename"]),
    (CanonicalField::Locality, &["locality", "localityname"]),
    (CanonicalField::SiteName, &["sitename", "site", "facilityname"]),
    (CanonicalField::SiteCode, &["sitecode", "siteid"]),
    (
        CanonicalField::CpName,
        &["cpname", "partner", "implementingpartner", "cp"],
    ),
    (CanonicalField::MainActivity, &["mainactivity"]),
    (
        CanonicalField::SiteActivity,
        &["activityatsite", "siteactivity", "activitysite", "activityatthesite"],
    ),
    (CanonicalField::VisitType, &["visittype", "type"]),
    (CanonicalField::VisitDate, &["visitdate", "date"]),
    (
        CanonicalField::Comments,
        &["comments", "comment", "remarks", "notes"],
    ),
    (CanonicalField::MonitoringBy, &["monitoringby"]),
    (
        CanonicalField::SurveyTool,
        &["surveyundermastertool", "surveytool"],
    ),
    (
        CanonicalField::UseMarketDiversion,
        &["usemarketdiversionmonitoring", "marketdiversionmonitoring"],
    ),
    (
        CanonicalField::UseWarehouseMonitoring,
        &["usewarehousemonitoring", "warehousemonitoring"],
    ),
];

/// Header normalization: lowercase, strip everything that is not a letter or digit
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

// ============================================================================
// HEADER MAP
// ============================================================================

/// Which column feeds which canonical field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
    /// Headers as they appeared (trimmed); blank headers become "Column N"
    pub headers: Vec<String>,

    /// Per column: the field it feeds, if any
    pub assignments: Vec<Option<CanonicalField>>,
}

impl HeaderMap {
    pub fn resolve(raw_headers: &[String]) -> Self {
        let headers: Vec<String> = raw_headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = h.trim();
                if h.is_empty() {
                    format!("Column {}", i + 1)
                } else {
                    h.to_string()
                }
            })
            .collect();
        let normalized: Vec<String> = raw_headers.iter().map(|h| normalize_header(h)).collect();
        let mut assignments: Vec<Option<CanonicalField>> = vec![None; headers.len()];

        let find_free = |assignments: &[Option<CanonicalField>], spelling: &str| {
            normalized
                .iter()
                .enumerate()
                .find(|(i, n)| n.as_str() == spelling && assignments[*i].is_none())
                .map(|(i, _)| i)
        };

        // Pass 1: exact primary names
        let mut resolved: Vec<CanonicalField> = Vec::new();
        for (field, spellings) in SYNONYMS {
            if let Some(col) = find_free(&assignments, spellings[0]) {
                assignments[col] = Some(*field);
                resolved.push(*field);
            }
        }

        // Pass 2: remaining fields, first synonym present wins
        for (field, spellings) in SYNONYMS {
            if resolved.contains(field) {
                continue;
            }
            for spelling in spellings.iter().skip(1) {
                if let Some(col) = find_free(&assignments, spelling) {
                    assignments[col] = Some(*field);
                    resolved.push(*field);
                    break;
                }
            }
        }

        HeaderMap {
            headers,
            assignments,
        }
    }

    pub fn field_for(&self, column: usize) -> Option<CanonicalField> {
        self.assignments.get(column).copied().flatten()
    }

    pub fn column_for(&self, field: CanonicalField) -> Option<usize> {
        self.assignments.iter().position(|a| *a == Some(field))
    }

    pub fn is_mapped(&self, field: CanonicalField) -> bool {
        self.column_for(field).is_some()
    }
}

// ============================================================================
// SOURCE ROW + PARSE OUTCOME
// ============================================================================

/// One file row: header → trimmed cell. Ephemeral.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub line: usize,
    pub cells: Vec<(String, String)>,
}

impl SourceRow {
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.is_empty())
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub entries: Vec<SiteEntry>,
    pub issues: Vec<Issue>,
    pub header_map: HeaderMap,
    pub delimiter: char,
}

impl ParseOutcome {
    fn failed(issue: Issue) -> Self {
        ParseOutcome {
            entries: Vec::new(),
            issues: vec![issue],
            header_map: HeaderMap::default(),
            delimiter: ',',
        }
    }

    pub fn is_mapped(&self, field: CanonicalField) -> bool {
        self.header_map.is_mapped(field)
    }
}

// ============================================================================
// COMPOSABLE TRAITS
// ============================================================================

/// PlanFileParser - turns uploaded bytes into site entries + issues
///
/// Never fails: an unreadable file is reported as a blocking issue so the
/// caller still gets a report to hand back.
pub trait PlanFileParser: Send + Sync {
    fn parse(&self, bytes: &[u8], file_name: &str) -> ParseOutcome;

    fn name(&self) -> &str;

    /// Parser version (recorded in logs)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

/// FileValidator - optional capability: can this parser take the file?
pub trait FileValidator {
    fn can_parse(&self, file_name: &str) -> bool;
}

// ============================================================================
// FACTORY FUNCTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    Csv,
    Tsv,
    Text,
}

pub fn file_extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    base.rfind('.')
        .filter(|idx| *idx + 1 < base.len())
        .map(|idx| base[idx + 1..].to_lowercase())
}

/// Detect the file format from the extension
pub fn detect_format(file_name: &str) -> Result<FileFormat, IngestError> {
    match file_extension(file_name).as_deref() {
        Some("csv") => Ok(FileFormat::Csv),
        Some("tsv") => Ok(FileFormat::Tsv),
        Some("txt") => Ok(FileFormat::Text),
        Some(other) => Err(IngestError::UnsupportedFile(format!(
            "'.{}' files are not supported; upload a CSV export",
            other
        ))),
        None => Err(IngestError::UnsupportedFile(format!(
            "'{}' has no file extension",
            file_name
        ))),
    }
}

pub fn get_parser(format: FileFormat) -> Arc<dyn PlanFileParser> {
    match format {
        FileFormat::Tsv => Arc::new(DelimitedPlanParser::new().with_delimiter(b'\t')),
        FileFormat::Csv | FileFormat::Text => Arc::new(DelimitedPlanParser::new()),
    }
}

// ============================================================================
// DELIMITED PARSER
// ============================================================================

const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];

pub struct DelimitedPlanParser {
    /// Forced delimiter; sniffed from the header line when None
    delimiter: Option<u8>,
}

impl Default for DelimitedPlanParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DelimitedPlanParser {
    pub fn new() -> Self {
        DelimitedPlanParser { delimiter: None }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    fn map_row(&self, header_map: &HeaderMap, row: &SourceRow, issues: &mut Vec<Issue>) -> SiteEntry {
        let mut entry = SiteEntry::new(row.line);
        let mut leftovers: Vec<(&str, &str)> = Vec::new();

        for (col, (header, value)) in row.cells.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            match header_map.field_for(col) {
                Some(field) if field.is_boolean() => {
                    let flag = coerce_bool(value).unwrap_or_else(|| {
                        issues.push(
                            Issue::new(
                                IssueCategory::UnrecognizedBoolean,
                                format!("'{}' is not a yes/no value; treated as no", value),
                            )
                            .at_row(row.line)
                            .in_column(header.as_str()),
                        );
                        false
                    });
                    entry.set_flag(field, flag);
                }
                Some(field) => {
                    entry.fill_if_empty(field, value);
                }
                None => {
                    entry
                        .additional_data
                        .insert(header.clone(), value.clone());
                    leftovers.push((header.as_str(), value.as_str()));
                }
            }
        }

        backfill(&mut entry, &leftovers, issues);
        entry
    }
}

impl FileValidator for DelimitedPlanParser {
    fn can_parse(&self, file_name: &str) -> bool {
        detect_format(file_name).is_ok()
    }
}

impl PlanFileParser for DelimitedPlanParser {
    fn parse(&self, bytes: &[u8], file_name: &str) -> ParseOutcome {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                return ParseOutcome::failed(Issue::new(
                    IssueCategory::ParseError,
                    format!(
                        "{} is not readable text (invalid UTF-8 at byte {})",
                        file_name,
                        e.valid_up_to()
                    ),
                ))
            }
        };

        if text.trim().is_empty() {
            return ParseOutcome::failed(Issue::new(
                IssueCategory::ParseError,
                format!("{} is empty", file_name),
            ));
        }

        let delimiter = self.delimiter.unwrap_or_else(|| sniff_delimiter(text));
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut records = Vec::new();
        for result in reader.records() {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    let line = e.position().map(|p| p.line() as usize);
                    let mut issue = Issue::new(
                        IssueCategory::ParseError,
                        format!("Failed to read {}: {}", file_name, e),
                    );
                    if let Some(line) = line {
                        issue = issue.at_row(line);
                    }
                    return ParseOutcome::failed(issue);
                }
            }
        }

        let mut records = records.into_iter();
        let raw_headers: Vec<String> = match records.next() {
            Some(header) if header.iter().any(|h| !h.trim().is_empty()) => {
                header.iter().map(str::to_string).collect()
            }
            _ => {
                return ParseOutcome::failed(Issue::new(
                    IssueCategory::ParseError,
                    "No header row found",
                ))
            }
        };
        let header_map = HeaderMap::resolve(&raw_headers);

        let mut entries = Vec::new();
        let mut issues = Vec::new();
        let mut data_rows = 0usize;

        for (i, record) in records.enumerate() {
            data_rows += 1;
            let row = SourceRow {
                line: i + 2,
                cells: record
                    .iter()
                    .enumerate()
                    .map(|(col, cell)| {
                        let header = header_map
                            .headers
                            .get(col)
                            .cloned()
                            .unwrap_or_else(|| format!("Column {}", col + 1));
                        (header, cell.trim().to_string())
                    })
                    .collect(),
            };
            if row.is_blank() {
                continue;
            }
            entries.push(self.map_row(&header_map, &row, &mut issues));
        }

        if entries.is_empty() {
            issues.push(Issue::new(
                IssueCategory::FileStructure,
                if data_rows == 0 {
                    "File must contain a header row and at least one data row"
                } else {
                    "File contains no non-empty data rows"
                },
            ));
        }

        tracing::debug!(
            file = file_name,
            entries = entries.len(),
            delimiter = %(delimiter as char).escape_default(),
            "parsed plan file"
        );

        ParseOutcome {
            entries,
            issues,
            header_map,
            delimiter: delimiter as char,
        }
    }

    fn name(&self) -> &str {
        "delimited"
    }
}

/// Pick the candidate that occurs most often in the header line (default ',')
pub fn sniff_delimiter(text: &str) -> u8 {
    let header_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in DELIMITER_CANDIDATES {
        let count = header_line.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// yes/true/1/y/t → true; no/false/0/n/f/"" → false; anything else → None
pub fn coerce_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "y" | "t" => Some(true),
        "no" | "false" | "0" | "n" | "f" | "" => Some(false),
        _ => None,
    }
}

const DATE_FORMATS: [&str; 5] = ["%d-%m-%Y", "%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d.%m.%Y"];

/// Visit dates: DD-MM-YYYY, YYYY-MM-DD and their / and . variants.
/// A trailing time component ("2025-03-01 00:00:00") is ignored.
pub fn parse_visit_date(value: &str) -> Option<NaiveDate> {
    let value = value.split_whitespace().next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

fn is_month_name(value: &str) -> bool {
    let v = normalize_text(value);
    MONTHS
        .iter()
        .any(|m| v == *m || (v.len() >= 3 && m.starts_with(v.as_str())))
}

/// Full dates and bare month names
pub fn looks_like_date(value: &str) -> bool {
    parse_visit_date(value).is_some() || is_month_name(value)
}

fn header_is_date_shaped(header: &str) -> bool {
    let normalized = normalize_header(header);
    looks_like_date(header) || normalized.contains("month") || normalized.contains("date")
}

/// States of Sudan, normalized, with common alternate spellings
const KNOWN_STATES: [&str; 27] = [
    "khartoum",
    "gezira",
    "al jazirah",
    "aj jazirah",
    "el gezira",
    "kassala",
    "gedaref",
    "al qadarif",
    "red sea",
    "river nile",
    "northern",
    "sennar",
    "blue nile",
    "white nile",
    "north kordofan",
    "south kordofan",
    "west kordofan",
    "north darfur",
    "south darfur",
    "west darfur",
    "east darfur",
    "central darfur",
    "abyei",
    "nahr an nil",
    "shamal darfur",
    "janub darfur",
    "gharb darfur",
];

pub fn is_known_state(value: &str) -> bool {
    let v = normalize_text(value);
    KNOWN_STATES.contains(&v.as_str())
}

fn looks_like_site_code(value: &str) -> bool {
    let len = value.chars().count();
    (3..=32).contains(&len)
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(|c| c.is_alphabetic())
        && value
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '/'))
}

// ============================================================================
// HEURISTIC BACKFILL
// ============================================================================

/// Looks at unmapped columns for values that belong in an empty canonical
/// field. Only empty fields are written; the bag keeps the original value.
fn backfill(entry: &mut SiteEntry, leftovers: &[(&str, &str)], issues: &mut Vec<Issue>) {
    for (header, value) in leftovers {
        let target = if is_known_state(value) {
            Some(CanonicalField::State)
        } else if header_is_date_shaped(header) && !looks_like_date(value) {
            Some(CanonicalField::Locality)
        } else if parse_visit_date(value).is_some() {
            Some(CanonicalField::VisitDate)
        } else if normalize_header(header).contains("code") && looks_like_site_code(value) {
            Some(CanonicalField::SiteCode)
        } else {
            None
        };

        let Some(field) = target else { continue };
        if entry.fill_if_empty(field, value) {
            issues.push(
                Issue::new(
                    IssueCategory::HeuristicBackfill,
                    format!(
                        "{} taken from column '{}' ('{}')",
                        field.label(),
                        header,
                        value
                    ),
                )
                .at_row(entry.source_row)
                .in_column(*header),
            );
        }
    }
}
