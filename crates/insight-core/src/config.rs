//! TOML configuration for an insight run: where the data comes from, which
//! metrics to derive, and which two periods to compare.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{InsightError, Result};

pub const DEFAULT_TOP_N: usize = 20;

static ENV_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env interpolation pattern"));

/// Replaces every `${NAME}` with the value of the environment variable `NAME`.
/// Unset variables resolve to an empty string.
pub fn resolve_env_vars(value: &str) -> String {
    ENV_PATTERN
        .replace_all(value, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InsightConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub derived_metrics: Vec<DerivedMetricSpec>,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    pub primary_source: String,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    pub date_col: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub join_key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Csv {
        path: PathBuf,
    },
    Sql {
        connection_string: String,
        query: String,
    },
    Database {
        connection: DatabaseConnection,
        table: String,
    },
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Csv { .. } => "csv",
            SourceKind::Sql { .. } => "sql",
            SourceKind::Database { .. } => "database",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    Postgresql,
    Mysql,
    Mssql,
    Sqlite,
}

impl Driver {
    pub fn default_port(self) -> Option<u16> {
        match self {
            Driver::Postgresql => Some(5432),
            Driver::Mysql => Some(3306),
            Driver::Mssql => Some(1433),
            Driver::Sqlite => None,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Driver::Postgresql => "postgres",
            Driver::Mysql => "mysql",
            Driver::Mssql => "mssql",
            Driver::Sqlite => "sqlite",
        }
    }

    /// Whether a client for this driver is compiled in. SQL Server parses but
    /// has no client.
    pub fn is_supported(self) -> bool {
        !matches!(self, Driver::Mssql)
    }

    /// Quotes an identifier for this driver's SQL dialect.
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Driver::Mysql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConnection {
    pub driver: Driver,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    /// Supports `${ENV_VAR}` interpolation.
    #[serde(default)]
    pub username: Option<String>,
    /// Supports `${ENV_VAR}` interpolation.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl DatabaseConnection {
    pub fn connection_string(&self) -> String {
        if self.driver == Driver::Sqlite {
            return format!("sqlite://{}", self.database);
        }

        let username = self
            .username
            .as_deref()
            .map(resolve_env_vars)
            .filter(|value| !value.is_empty());
        let password = self
            .password
            .as_deref()
            .map(resolve_env_vars)
            .filter(|value| !value.is_empty());

        let mut auth = String::new();
        if let Some(user) = username {
            auth.push_str(&user);
            if let Some(pass) = password {
                auth.push(':');
                auth.push_str(&pass);
            }
            auth.push('@');
        }

        let port = self
            .port
            .or_else(|| self.driver.default_port())
            .map(|port| format!(":{port}"))
            .unwrap_or_default();

        format!(
            "{}://{}{}{}/{}",
            self.driver.scheme(),
            auth,
            self.host,
            port,
            self.database
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DerivedMetricSpec {
    pub name: String,
    pub formula: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub primary_date_col: Option<String>,
    pub comparison: ComparisonConfig,
    #[serde(default)]
    pub primary_dims: Vec<String>,
    #[serde(default)]
    pub kpi_priority: Vec<String>,
    /// Zero disables truncation.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub min_impact: f64,
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ComparisonConfig {
    pub current_start: NaiveDate,
    pub current_end: NaiveDate,
    pub previous_start: NaiveDate,
    pub previous_end: NaiveDate,
}

impl ComparisonConfig {
    pub fn window(&self) -> Result<PeriodWindow> {
        Ok(PeriodWindow {
            current: DateRange::new(self.current_start, self.current_end)?,
            previous: DateRange::new(self.previous_start, self.previous_end)?,
        })
    }
}

/// Closed date interval, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(InsightError::Config(format!(
                "date range starts after it ends ({start} > {end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// The two windows being compared. Overlap is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub current: DateRange,
    pub previous: DateRange,
}

impl InsightConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: InsightConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.dataset.sources {
            if !names.insert(source.name.as_str()) {
                return Err(InsightError::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }

        if !names.contains(self.dataset.primary_source.as_str()) {
            return Err(InsightError::Config(format!(
                "primary_source '{}' is not one of the configured sources",
                self.dataset.primary_source
            )));
        }

        let mut derived = HashSet::new();
        for metric in &self.derived_metrics {
            if !derived.insert(metric.name.as_str()) {
                return Err(InsightError::Config(format!(
                    "derived metric '{}' is declared twice",
                    metric.name
                )));
            }
        }

        for source in &self.dataset.sources {
            let unsupported = match &source.kind {
                SourceKind::Database { connection, .. } => !connection.driver.is_supported(),
                SourceKind::Sql {
                    connection_string, ..
                } => {
                    let scheme = connection_string.split(':').next().unwrap_or_default();
                    scheme.eq_ignore_ascii_case("mssql") || scheme.eq_ignore_ascii_case("sqlserver")
                }
                SourceKind::Csv { .. } => false,
            };
            if unsupported {
                return Err(InsightError::Config(format!(
                    "source '{}' uses SQL Server, which has no available client",
                    source.name
                )));
            }
        }

        self.report.comparison.window()?;
        Ok(())
    }

    pub fn primary(&self) -> Result<&SourceSpec> {
        self.source(&self.dataset.primary_source)
    }

    pub fn source(&self, name: &str) -> Result<&SourceSpec> {
        self.dataset
            .sources
            .iter()
            .find(|source| source.name == name)
            .ok_or_else(|| InsightError::Config(format!("unknown source '{name}'")))
    }

    /// Canonical date column for period splitting.
    pub fn date_column(&self) -> Result<String> {
        match &self.report.primary_date_col {
            Some(col) => Ok(col.clone()),
            None => Ok(self.primary()?.date_col.clone()),
        }
    }

    /// Join keys shared across sources: primary dimensions plus the primary date column.
    pub fn join_keys(&self) -> Result<Vec<String>> {
        let mut keys = self.report.primary_dims.clone();
        let date_col = &self.primary()?.date_col;
        if !keys.contains(date_col) {
            keys.push(date_col.clone());
        }
        Ok(keys)
    }

    /// Every metric to aggregate: primary metrics, then derived, then any remaining KPIs.
    pub fn all_metrics(&self) -> Result<Vec<String>> {
        let mut metrics: Vec<String> = Vec::new();
        let candidates = self
            .primary()?
            .metrics
            .iter()
            .chain(self.derived_metrics.iter().map(|m| &m.name))
            .chain(self.report.kpi_priority.iter());
        for metric in candidates {
            if !metrics.contains(metric) {
                metrics.push(metric.clone());
            }
        }
        Ok(metrics)
    }

    /// Metric columns declared by any source; these get zero-filled after joining.
    pub fn declared_source_metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = Vec::new();
        for metric in self.dataset.sources.iter().flat_map(|s| s.metrics.iter()) {
            if !metrics.contains(metric) {
                metrics.push(metric.clone());
            }
        }
        metrics
    }
}
