//! Flattened client × log × item export

use crate::error::{Error, Result};
use crate::models::{Client, MaterialItem, MaterialLog};
use crate::store::{fetch, Order, Query, RecordStore};
use chrono::{Local, NaiveDate, TimeZone};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EXPORT_COLUMNS: [&str; 8] = [
    "Client Name",
    "Contact",
    "Address",
    "Date",
    "Material",
    "Quantity",
    "Unit",
    "Notes",
];

const DATE_FORMAT: &str = "%-m/%-d/%Y";

/// One output line; missing values are empty strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub client_name: String,
    pub contact: String,
    pub address: String,
    pub date: String,
    pub material: String,
    pub quantity: String,
    pub unit: String,
    pub notes: String,
}

impl ExportRow {
    fn fields(&self) -> [&str; 8] {
        [
            &self.client_name,
            &self.contact,
            &self.address,
            &self.date,
            &self.material,
            &self.quantity,
            &self.unit,
            &self.notes,
        ]
    }

    fn for_client(client: &Client) -> Self {
        Self {
            client_name: client.name.clone(),
            contact: client.contact_name.clone().unwrap_or_default(),
            address: client.address.clone(),
            ..Self::default()
        }
    }
}

/// Composes rows with dates in the local calendar.
pub fn compose(clients: &[Client], logs: &[MaterialLog], items: &[MaterialItem]) -> Vec<ExportRow> {
    compose_in(clients, logs, items, &Local)
}

/// Composes rows with dates rendered in `tz`.
///
/// Clients keep their given order, then their logs, then each log's items. A
/// client without logs and a log without items each still produce one row.
pub fn compose_in<Tz>(
    clients: &[Client],
    logs: &[MaterialLog],
    items: &[MaterialItem],
    tz: &Tz,
) -> Vec<ExportRow>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut logs_by_client: HashMap<&str, Vec<&MaterialLog>> = HashMap::new();
    for log in logs {
        logs_by_client.entry(log.client_id.as_str()).or_default().push(log);
    }
    let mut items_by_log: HashMap<&str, Vec<&MaterialItem>> = HashMap::new();
    for item in items {
        items_by_log.entry(item.log_id.as_str()).or_default().push(item);
    }

    let mut rows = Vec::new();
    for client in clients {
        let base = ExportRow::for_client(client);
        let client_logs = logs_by_client
            .get(client.id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();

        if client_logs.is_empty() {
            rows.push(base.clone());
        }

        for log in client_logs {
            let dated = ExportRow {
                date: log.date.with_timezone(tz).format(DATE_FORMAT).to_string(),
                notes: log.notes.clone().unwrap_or_default(),
                ..base.clone()
            };
            let log_items = items_by_log
                .get(log.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();

            if log_items.is_empty() {
                rows.push(dated.clone());
            }
            for item in log_items {
                rows.push(ExportRow {
                    material: item.name.clone(),
                    quantity: item.quantity.to_string(),
                    unit: item.unit.clone(),
                    ..dated.clone()
                });
            }
        }
    }
    rows
}

/// Writes the header row and every export row.
pub fn write_csv<W: Write>(writer: W, rows: &[ExportRow]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(EXPORT_COLUMNS)?;
    for row in rows {
        csv_writer.write_record(row.fields())?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn to_csv_string(rows: &[ExportRow]) -> Result<String> {
    let mut buffer = Vec::new();
    write_csv(&mut buffer, rows)?;
    String::from_utf8(buffer).map_err(Error::validation)
}

/// `<product>_export_<YYYYMMDD>.csv`
pub fn export_filename(product: &str, date: NaiveDate) -> String {
    format!("{}_export_{}.csv", product, date.format("%Y%m%d"))
}

/// Counts shown before exporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub clients: usize,
    pub logs: usize,
    pub items: usize,
}

/// Everything an export needs, fetched concurrently
#[derive(Debug, Clone, Default)]
pub struct ExportData {
    pub clients: Vec<Client>,
    pub logs: Vec<MaterialLog>,
    pub items: Vec<MaterialItem>,
}

impl ExportData {
    /// Fetches clients (newest first), logs and items in parallel.
    pub async fn load(store: &dyn RecordStore) -> Result<Self> {
        let client_query = Query::new().order(Order::desc("created_at"));
        let all = Query::new();
        let (clients, logs, items) = tokio::try_join!(
            fetch::<Client>(store, &client_query),
            fetch::<MaterialLog>(store, &all),
            fetch::<MaterialItem>(store, &all),
        )?;
        Ok(Self { clients, logs, items })
    }

    pub fn summary(&self) -> ExportSummary {
        ExportSummary {
            clients: self.clients.len(),
            logs: self.logs.len(),
            items: self.items.len(),
        }
    }

    pub fn rows(&self) -> Vec<ExportRow> {
        compose(&self.clients, &self.logs, &self.items)
    }

    /// Writes the export into `dir` under today's dated filename.
    pub fn write_to_dir(&self, dir: &Path, product: &str) -> Result<PathBuf> {
        let path = dir.join(export_filename(product, Local::now().date_naive()));
        let rows = self.rows();
        let file = std::fs::File::create(&path)?;
        write_csv(file, &rows)?;

        let summary = self.summary();
        info!(
            path = %path.display(),
            rows = rows.len(),
            clients = summary.clients,
            logs = summary.logs,
            items = summary.items,
            "export written"
        );
        Ok(path)
    }
}

/// Loads everything from the store and writes the export into `dir`.
pub async fn write_export(store: &dyn RecordStore, dir: &Path, product: &str) -> Result<PathBuf> {
    ExportData::load(store).await?.write_to_dir(dir, product)
}
