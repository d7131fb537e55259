use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop a command before or after duplicate resolution.
///
/// Validation problems and bad operator input are not errors; they are
/// logged or re-prompted and processing continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unable to open workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        source: calamine::Error,
    },
    #[error("workbook {0} does not contain any worksheets")]
    NoWorksheet(PathBuf),
    #[error("unable to read worksheet '{sheet}': {reason}")]
    Worksheet { sheet: String, reason: String },
    #[error("column '{0}' not found in header row")]
    MissingColumn(String),
    #[error("row {row}, column '{column}': expected an integer, found '{value}'")]
    InvalidCell {
        row: usize,
        column: String,
        value: String,
    },
    #[error("unable to write workbook: {0}")]
    Export(#[from] rust_xlsxwriter::XlsxError),
    #[error("unable to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
