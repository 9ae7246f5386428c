pub mod aggregate;
pub mod config;
pub mod error;
pub mod insights;
pub mod join;
pub mod metrics;
pub mod periods;
pub mod pipeline;
pub mod sources;
pub mod table;

pub use config::InsightConfig;
pub use error::{InsightError, Result};
pub use pipeline::{InsightReport, ReportEcho};
