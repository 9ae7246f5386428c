// crates/insight-core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("source '{source_name}' not found at {}", path.display())]
    NotFound { source_name: String, path: PathBuf },

    #[error("source '{source_name}' could not connect: {message}")]
    Connection {
        source_name: String,
        message: String,
    },

    #[error("source '{source_name}' query failed: {message}")]
    Query {
        source_name: String,
        message: String,
    },

    #[error("cannot parse date column '{column}' (first value: {sample:?})")]
    DateParse {
        column: String,
        sample: Option<String>,
    },

    #[error("missing column(s) {columns:?} required for {context}")]
    MissingColumn {
        columns: Vec<String>,
        context: &'static str,
    },

    #[error("none of the requested metrics {requested:?} exist in the table")]
    NoValidMetrics { requested: Vec<String> },

    #[error("cannot parse formula '{formula}': expected `<column> <op> <column>` with op one of + - * /")]
    Formula { formula: String },

    #[error("column '{column}' not found for formula '{formula}'")]
    ColumnNotFound { column: String, formula: String },

    #[error("column '{column}' in formula '{formula}' is not numeric")]
    NonNumericOperand { column: String, formula: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InsightError {
    pub(crate) fn missing(column: impl Into<String>, context: &'static str) -> Self {
        InsightError::MissingColumn {
            columns: vec![column.into()],
            context,
        }
    }
}

pub type Result<T> = std::result::Result<T, InsightError>;
