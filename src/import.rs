//! Client import from delimited text with loosely named columns
//!
//! Headers are matched case-insensitively by substring against ordered term
//! lists; the first header (in column order) containing any term wins. Rows
//! are inserted one at a time and each outcome is recorded, so one bad row
//! never stops the rest.

use crate::error::{Error, Result};
use crate::models::{Client, NewClient};
use crate::store::{insert_record, RecordStore};
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

pub const NAME_TERMS: &[&str] = &["client", "name", "project", "job"];
pub const ADDRESS_TERMS: &[&str] = &["address", "location", "street"];
pub const CONTACT_TERMS: &[&str] = &["contact", "customer", "owner"];

pub const NO_DATA: &str = "No data found in CSV";
pub const NO_NAME_COLUMN: &str =
    "Could not find a name column. Expected: Client Name, Project, Job, or Name";

/// Index of the first header containing any of `terms`, ignoring case.
pub fn find_header_index<S: AsRef<str>>(headers: &[S], terms: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let lower = header.as_ref().trim().to_lowercase();
        terms.iter().any(|term| lower.contains(term))
    })
}

/// Which column feeds which client field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: usize,
    pub address: Option<usize>,
    pub contact: Option<usize>,
}

impl ColumnMapping {
    /// Resolves the mapping; a missing name column is a validation error.
    pub fn resolve<S: AsRef<str>>(headers: &[S]) -> Result<Self> {
        let name = find_header_index(headers, NAME_TERMS)
            .ok_or_else(|| Error::validation(NO_NAME_COLUMN))?;
        Ok(Self {
            name,
            address: find_header_index(headers, ADDRESS_TERMS),
            contact: find_header_index(headers, CONTACT_TERMS),
        })
    }
}

/// A client read from an import file, not yet stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedClient {
    pub name: String,
    pub address: String,
    pub contact_name: String,
}

impl ParsedClient {
    fn to_new_client(&self) -> NewClient {
        NewClient {
            name: self.name.clone(),
            address: self.address.clone(),
            contact_name: self.contact_name.clone(),
        }
    }
}

fn cell<S: AsRef<str>>(row: &[S], index: Option<usize>) -> String {
    index
        .and_then(|i| row.get(i))
        .map(|value| value.as_ref().trim().to_string())
        .unwrap_or_default()
}

/// Maps a header row and data rows to clients.
///
/// Rows whose trimmed name is empty are skipped. Short rows read missing cells
/// as empty.
pub fn parse_table<H, R>(headers: &[H], rows: &[Vec<R>]) -> Result<Vec<ParsedClient>>
where
    H: AsRef<str>,
    R: AsRef<str>,
{
    if rows.is_empty() || headers.is_empty() {
        return Err(Error::validation(NO_DATA));
    }
    let mapping = ColumnMapping::resolve(headers)?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let name = cell(row, Some(mapping.name));
            if name.is_empty() {
                return None;
            }
            Some(ParsedClient {
                name,
                address: cell(row, mapping.address),
                contact_name: cell(row, mapping.contact),
            })
        })
        .collect())
}

/// Reads delimited text with a header row and maps it to clients.
pub fn parse_csv<R: Read>(reader: R) -> Result<Vec<ParsedClient>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            // Spreadsheet exports often start with a byte-order mark.
            if i == 0 {
                h.trim_start_matches('\u{feff}').to_string()
            } else {
                h.to_string()
            }
        })
        .collect();

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        if record.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    parse_table(&headers, &rows)
}

pub fn parse_csv_file(path: &Path) -> Result<Vec<ParsedClient>> {
    let file = std::fs::File::open(path)?;
    parse_csv(file)
}

/// Result of inserting one parsed client
#[derive(Debug)]
pub enum ImportOutcome {
    Imported(Client),
    Failed { name: String, error: Error },
}

/// Accounting for a bulk import, in input order
#[derive(Debug, Default)]
pub struct ImportReport {
    pub success: usize,
    pub failed: usize,
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Inserts clients one at a time; failures are counted, never raised.
pub async fn import_clients(store: &dyn RecordStore, clients: &[ParsedClient]) -> ImportReport {
    let mut report = ImportReport::default();

    for parsed in clients {
        match insert_record::<Client, _>(store, &parsed.to_new_client()).await {
            Ok(client) => {
                report.success += 1;
                report.outcomes.push(ImportOutcome::Imported(client));
            }
            Err(error) => {
                warn!(name = %parsed.name, error = %error, "import row failed");
                report.failed += 1;
                report.outcomes.push(ImportOutcome::Failed {
                    name: parsed.name.clone(),
                    error,
                });
            }
        }
    }

    info!(success = report.success, failed = report.failed, "import finished");
    report
}
