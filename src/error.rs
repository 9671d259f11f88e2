// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for every pipeline stage.
///
/// The batch runner turns any of these into a `code_crash` entry and moves on
/// to the next file; single-shot commands return it from `main`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("model call failed: {0}")]
    Model(#[from] ModelError),

    #[error("{0}")]
    Normalize(#[from] NormalizeError),

    #[error("history store error: {0}")]
    History(#[from] HistoryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("input folder '{}' not found", .0.display())]
    MissingInputDir(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures reading an input document.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("failed to read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error reading PDF: {0}")]
    Pdf(String),

    #[error("PDF is scanned / image-only; upload it as an image instead")]
    ScannedPdf,

    #[error("error reading Word document: {0}")]
    Word(String),

    #[error("error reading Excel workbook: {0}")]
    Excel(String),

    #[error("file is not valid UTF-8 text")]
    NotUtf8,

    #[error("document contains no text")]
    Empty,
}

/// Failures talking to the remote model.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no API key: set {0} or `model.api_key`")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("empty response from model")]
    EmptyResponse,

    #[error("prompt blocked by model: {0}")]
    Blocked(String),
}

impl ModelError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Http(e) => e.is_timeout() || e.is_connect(),
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// The model answered, but not with something we can use.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("the model did not output valid JSON ({reason}); raw output: {raw}")]
    NotJson { reason: String, raw: String },

    #[error("unknown status in model output: {0:?}")]
    UnknownStatus(Option<String>),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("I/O error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {}", .path.display(), .source)]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to edit config: {0}")]
    Edit(#[from] toml_edit::TomlError),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
