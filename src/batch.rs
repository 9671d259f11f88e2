// src/batch.rs

use crate::document;
use crate::error::Error;
use crate::invoice::{Extraction, InvoiceRecord};
use crate::llm_extract::{Extractor, ModelClient};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Instrument, error, info, info_span};

/// What happened to one input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Success(InvoiceRecord),
    /// The model said the file is not an invoice.
    Error { reason: String },
    /// Reading, calling or parsing failed.
    CodeCrash { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub source_file: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input_dir: PathBuf,
    pub extensions: Vec<String>,
    /// Pause between successive model calls.
    pub delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub success: usize,
    pub rejected: usize,
    pub crashed: usize,
}

impl BatchReport {
    pub fn from_entries(entries: &[BatchEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut report, entry| {
            match entry.outcome {
                BatchOutcome::Success(_) => report.success += 1,
                BatchOutcome::Error { .. } => report.rejected += 1,
                BatchOutcome::CodeCrash { .. } => report.crashed += 1,
            }
            report
        })
    }
}

/// Files directly inside `dir` with one of `extensions`, sorted by name.
pub fn list_inputs(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, Error> {
    if !dir.is_dir() {
        return Err(Error::MissingInputDir(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = document::extension(&path);
        if extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Run every matching file through the extractor, one at a time.
///
/// Per-file failures become `code_crash` entries; only a missing or
/// unreadable input directory aborts the run.
pub async fn run_batch<M: ModelClient>(
    extractor: &Extractor<M>,
    options: &BatchOptions,
) -> Result<Vec<BatchEntry>, Error> {
    let files = list_inputs(&options.input_dir, &options.extensions)?;
    info!(count = files.len(), dir = %options.input_dir.display(), "Found invoices to process");

    let mut entries = Vec::with_capacity(files.len());
    for (idx, path) in files.iter().enumerate() {
        if idx > 0 && !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }

        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = info_span!("batch", file = %source_file, n = idx + 1, of = files.len());

        let outcome = process_file(extractor, path).instrument(span).await;
        entries.push(BatchEntry {
            source_file,
            outcome,
        });
    }

    let report = BatchReport::from_entries(&entries);
    info!(
        success = report.success,
        rejected = report.rejected,
        crashed = report.crashed,
        "Batch complete"
    );
    Ok(entries)
}

async fn process_file<M: ModelClient>(extractor: &Extractor<M>, path: &Path) -> BatchOutcome {
    let result = match document::load(path) {
        Ok(content) => extractor.extract(&content).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(Extraction::Success(record)) => {
            info!(status = "success", "Processed");
            BatchOutcome::Success(record)
        }
        Ok(Extraction::Rejected { reason }) => {
            info!(status = "error", reason = %reason, "Processed");
            BatchOutcome::Error { reason }
        }
        Err(e) => {
            error!(error = %e, "CRASH");
            BatchOutcome::CodeCrash {
                error: e.to_string(),
            }
        }
    }
}

/// Write all entries as one pretty-printed JSON array.
pub fn write_results(path: &Path, entries: &[BatchEntry]) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(path, json)?;
    info!(path = %path.display(), entries = entries.len(), "Results saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::llm_extract::Content;
    use crate::llm_extract::testing::StubModel;
    use serde_json::Value;

    const GOOD_REPLY: &str = r#"```json
{"status": "success", "vendor": "Northwind", "date": "2024-02-10",
 "line_items": [{"item": "Chai", "qty": 3, "cost": 18.0}], "total_amount": 54.0}
```"#;

    fn options(dir: &Path) -> BatchOptions {
        BatchOptions {
            input_dir: dir.to_path_buf(),
            extensions: vec!["txt".to_string()],
            delay: Duration::ZERO,
        }
    }

    /// Replies based on the file text: `CRASH` fails the call, `NOTE` gets
    /// Schema B, `GARBLE` gets prose, anything else a success.
    fn scripted(content: &Content) -> Result<String, ModelError> {
        let Content::Text(text) = content else {
            return Err(ModelError::EmptyResponse);
        };
        if text.contains("CRASH") {
            Err(ModelError::Status { status: 500, body: "internal".into() })
        } else if text.contains("NOTE") {
            Ok(r#"{"status": "error", "reason": "Not an invoice"}"#.to_string())
        } else if text.contains("GARBLE") {
            Ok("Here is what I found: nothing useful.".to_string())
        } else {
            Ok(GOOD_REPLY.to_string())
        }
    }

    #[tokio::test]
    async fn test_one_good_one_crash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_invoice.txt"), "Invoice from Northwind").unwrap();
        fs::write(dir.path().join("b_broken.txt"), "CRASH").unwrap();

        let model = StubModel::new(scripted);
        let entries = run_batch(&Extractor::new(&model), &options(dir.path()))
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source_file, "a_invoice.txt");
        assert!(matches!(entries[0].outcome, BatchOutcome::Success(ref r) if r.vendor == "Northwind"));
        assert_eq!(entries[1].source_file, "b_broken.txt");
        assert!(matches!(entries[1].outcome, BatchOutcome::CodeCrash { ref error } if error.contains("500")));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejections_and_garbage_output() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.txt"), "NOTE to self").unwrap();
        fs::write(dir.path().join("2.txt"), "GARBLE").unwrap();
        fs::write(dir.path().join("3.txt"), "   ").unwrap();

        let model = StubModel::new(scripted);
        let entries = run_batch(&Extractor::new(&model), &options(dir.path()))
            .await
            .unwrap();

        assert_eq!(
            entries[0].outcome,
            BatchOutcome::Error { reason: "Not an invoice".into() }
        );
        assert!(matches!(entries[1].outcome, BatchOutcome::CodeCrash { .. }));
        // Blank files never reach the model
        assert!(matches!(entries[2].outcome, BatchOutcome::CodeCrash { .. }));
        assert_eq!(model.calls(), 2);

        let report = BatchReport::from_entries(&entries);
        assert_eq!(report, BatchReport { success: 0, rejected: 1, crashed: 2 });
    }

    #[test]
    fn test_list_inputs_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "x").unwrap();
        fs::write(dir.path().join("a.TXT"), "x").unwrap();
        fs::write(dir.path().join("c.pdf"), "x").unwrap();
        fs::write(dir.path().join("notes"), "x").unwrap();
        fs::create_dir(dir.path().join("sub.txt")).unwrap();
        fs::write(dir.path().join("sub.txt").join("nested.txt"), "x").unwrap();

        let files = list_inputs(dir.path(), &["txt".to_string()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.TXT", "b.txt"]);
    }

    #[test]
    fn test_missing_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_inputs(&dir.path().join("invoices"), &["txt".to_string()]).unwrap_err();
        assert!(matches!(err, Error::MissingInputDir(_)));
    }

    #[test]
    fn test_output_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out/all_data.json");
        let entries = vec![
            BatchEntry {
                source_file: "a.txt".into(),
                outcome: BatchOutcome::Success(InvoiceRecord {
                    vendor: "Northwind".into(),
                    date: "2024-02-10".into(),
                    line_items: vec![],
                    total_amount: 54.0,
                    original_language: None,
                }),
            },
            BatchEntry {
                source_file: "b.txt".into(),
                outcome: BatchOutcome::Error { reason: "Not an invoice".into() },
            },
            BatchEntry {
                source_file: "c.txt".into(),
                outcome: BatchOutcome::CodeCrash { error: "boom".into() },
            },
        ];
        write_results(&out, &entries).unwrap();

        let doc: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        let arr = doc.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0]["status"], "success");
        assert_eq!(arr[0]["source_file"], "a.txt");
        assert_eq!(arr[0]["vendor"], "Northwind");
        assert_eq!(arr[0]["total_amount"], 54.0);
        assert_eq!(arr[1]["status"], "error");
        assert_eq!(arr[1]["reason"], "Not an invoice");
        assert_eq!(arr[2]["status"], "code_crash");
        assert_eq!(arr[2]["error"], "boom");

        let back: Vec<BatchEntry> = serde_json::from_value(doc).unwrap();
        assert_eq!(back, entries);
    }
}
