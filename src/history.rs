// src/history.rs

use crate::error::HistoryError;
use crate::invoice::InvoiceRecord;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Flattened, persisted form of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub date: String,
    pub vendor: String,
    pub total: f64,
    pub language: String,
    pub items: String,
}

impl From<&InvoiceRecord> for HistoryRow {
    fn from(record: &InvoiceRecord) -> Self {
        Self {
            date: record.date.clone(),
            vendor: record.vendor.clone(),
            total: record.total_amount,
            language: record.original_language.clone().unwrap_or_default(),
            items: record.items_summary(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub total: f64,
}

/// Append-only CSV log of successful extractions.
///
/// Header: `date,vendor,total,language,items`. There is no locking; one
/// writer at a time is assumed.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one row, creating the file (with header) if needed.
    pub fn append(&self, record: &InvoiceRecord) -> Result<HistoryRow, HistoryError> {
        let row = HistoryRow::from(record);

        let needs_header = match fs::metadata(&self.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(self.io_err(e)),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        // Serialize first so the file only ever sees whole rows
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(Vec::new());
        wtr.serialize(&row)?;
        let bytes = wtr.into_inner().map_err(|e| self.io_err(e.into_error()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(&bytes).map_err(|e| self.io_err(e))?;

        info!(path = %self.path.display(), vendor = %row.vendor, total = row.total, "Saved to history");
        Ok(row)
    }

    /// All rows in stored order; empty when there is no store yet.
    pub fn rows(&self) -> Result<Vec<HistoryRow>, HistoryError> {
        match self.export()? {
            Some(bytes) => parse_rows(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Row count and sum of `total`.
    pub fn summarize(&self) -> Result<Summary, HistoryError> {
        let rows = self.rows()?;
        Ok(Summary {
            count: rows.len(),
            total: rows.iter().map(|r| r.total).sum(),
        })
    }

    /// Delete the whole store. Returns whether there was anything to delete.
    pub fn clear(&self) -> Result<bool, HistoryError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "History deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// The stored bytes, unchanged.
    pub fn export(&self) -> Result<Option<Vec<u8>>, HistoryError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Copy the store to `dest`. Returns `false` when there is no store.
    pub fn export_to(&self, dest: impl AsRef<Path>) -> Result<bool, HistoryError> {
        let dest = dest.as_ref();
        let Some(bytes) = self.export()? else {
            return Ok(false);
        };
        fs::write(dest, bytes).map_err(|source| HistoryError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        info!(dest = %dest.display(), "History exported");
        Ok(true)
    }
}

/// Parse rows from exported store bytes.
pub fn parse_rows(bytes: &[u8]) -> Result<Vec<HistoryRow>, HistoryError> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let rows = rdr.deserialize().collect::<Result<Vec<HistoryRow>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::LineItem;

    fn record(vendor: &str, total: f64) -> InvoiceRecord {
        InvoiceRecord {
            vendor: vendor.to_string(),
            date: "2024-06-01".to_string(),
            line_items: vec![
                LineItem { item: "Coffee, large".into(), qty: 2, cost: 3.0 },
                LineItem { item: "Bagel".into(), qty: 1, cost: 1.5 },
            ],
            total_amount: total,
            original_language: Some("French".to_string()),
        }
    }

    #[test]
    fn test_append_and_summarize() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));

        store.append(&record("Cafe A", 10.50)).unwrap();
        store.append(&record("Cafe B", 4.25)).unwrap();

        let summary = store.summarize().unwrap();
        assert_eq!(summary, Summary { count: 2, total: 14.75 });
    }

    #[test]
    fn test_n_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        let totals = [1.0, 2.5, 3.25, 100.0, 0.75];
        for (i, t) in totals.iter().enumerate() {
            store.append(&record(&format!("V{i}"), *t)).unwrap();
        }
        let summary = store.summarize().unwrap();
        assert_eq!(summary.count, totals.len());
        assert_eq!(summary.total, totals.iter().sum::<f64>());
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("nested/dir/history.csv"));
        store.append(&record("Cafe A", 10.5)).unwrap();

        let text = String::from_utf8(store.export().unwrap().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("date,vendor,total,language,items"));
        assert_eq!(
            lines.next(),
            Some("2024-06-01,Cafe A,10.5,French,\"2x Coffee, large; 1x Bagel\"")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_missing_language_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        let mut r = record("Cafe A", 1.0);
        r.original_language = None;
        store.append(&r).unwrap();
        assert_eq!(store.rows().unwrap()[0].language, "");
    }

    #[test]
    fn test_clear_then_summarize() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        store.append(&record("Cafe A", 1.0)).unwrap();

        assert!(store.clear().unwrap());
        assert_eq!(store.summarize().unwrap(), Summary { count: 0, total: 0.0 });
        assert!(!store.clear().unwrap());
        assert!(store.export().unwrap().is_none());
    }

    #[test]
    fn test_append_after_clear_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        store.append(&record("Cafe A", 1.0)).unwrap();
        store.clear().unwrap();
        store.append(&record("Cafe B", 2.0)).unwrap();

        let rows = store.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vendor, "Cafe B");
    }

    #[test]
    fn test_export_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        let mut written = Vec::new();
        for (vendor, total) in [("Zeta", 3.0), ("Alpha", 1.25), ("Mid \"Quoted\"", 9.99)] {
            written.push(store.append(&record(vendor, total)).unwrap());
        }

        let exported = store.export().unwrap().unwrap();
        assert_eq!(parse_rows(&exported).unwrap(), written);

        let dest = dir.path().join("report.csv");
        assert!(store.export_to(&dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), exported);
    }

    #[test]
    fn test_export_without_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.csv"));
        assert!(!store.export_to(dir.path().join("out.csv")).unwrap());
        assert!(!dir.path().join("out.csv").exists());
    }
}
