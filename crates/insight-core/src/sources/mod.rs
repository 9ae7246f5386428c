// crates/insight-core/src/sources/mod.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt, TryStreamExt};
use polars::prelude::*;
use tracing::{debug, info};

use crate::config::{Driver, InsightConfig, SourceKind, SourceSpec};
use crate::config::resolve_env_vars;
use crate::error::{InsightError, Result};

pub mod sql;

pub const DEFAULT_MAX_PARALLEL_LOADS: usize = 4;

/// A loaded source, kept in configuration order.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub name: String,
    pub df: DataFrame,
}

/// Picks the most frequent of comma, semicolon and tab in the header line.
/// Comma wins unless another delimiter is strictly more frequent than both rivals.
pub fn detect_delimiter(header: &str) -> u8 {
    let commas = header.matches(',').count();
    let semicolons = header.matches(';').count();
    let tabs = header.matches('\t').count();

    if semicolons > commas && semicolons > tabs {
        b';'
    } else if tabs > commas && tabs > semicolons {
        b'\t'
    } else {
        b','
    }
}

pub fn resolve_path(base_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base_path.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base_path.join(path)
    }
}

pub fn load_csv(source_name: &str, path: &Path, base_path: &Path) -> Result<DataFrame> {
    let resolved = resolve_path(base_path, path);
    info!(source = source_name, path = %resolved.display(), "loading file source");

    if !resolved.exists() {
        return Err(InsightError::NotFound {
            source_name: source_name.to_string(),
            path: resolved,
        });
    }

    let mut header = String::new();
    BufReader::new(File::open(&resolved)?).read_line(&mut header)?;
    let delimiter = detect_delimiter(&header);
    debug!(
        source = source_name,
        delimiter = %(delimiter as char).escape_default(),
        "detected delimiter"
    );

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|opts| opts.with_separator(delimiter))
        .try_into_reader_with_file_path(Some(resolved))?
        .finish()?;

    info!(
        source = source_name,
        rows = df.height(),
        columns = ?df.get_column_names(),
        "loaded file source"
    );
    Ok(df)
}

/// Builds `SELECT <columns> FROM <table>` from the columns a source declares,
/// falling back to `SELECT *` when it declares none.
pub fn build_table_query(spec: &SourceSpec, driver: Driver, table: &str) -> String {
    let mut columns: Vec<&str> = Vec::new();
    let declared = spec
        .dimensions
        .iter()
        .chain(spec.metrics.iter())
        .chain(std::iter::once(&spec.date_col))
        .chain(spec.join_key.iter().flatten())
        .filter(|col| !col.is_empty());

    for col in declared {
        if !columns.contains(&col.as_str()) {
            columns.push(col.as_str());
        }
    }

    let select = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|col| driver.quote_ident(col))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!("SELECT {} FROM {}", select, driver.quote_ident(table))
}

pub async fn load_source(spec: &SourceSpec, base_path: &Path) -> Result<DataFrame> {
    match &spec.kind {
        SourceKind::Csv { path } => {
            let name = spec.name.clone();
            let path = path.clone();
            let base_path = base_path.to_path_buf();
            tokio::task::spawn_blocking(move || load_csv(&name, &path, &base_path))
                .await
                .map_err(|err| std::io::Error::other(err.to_string()))?
        }
        SourceKind::Sql {
            connection_string,
            query,
        } => {
            info!(source = %spec.name, "loading query source");
            sql::run_query(&spec.name, &resolve_env_vars(connection_string), query).await
        }
        SourceKind::Database { connection, table } => {
            info!(source = %spec.name, table = %table, "loading table source");
            let query = build_table_query(spec, connection.driver, table);
            sql::run_query(&spec.name, &connection.connection_string(), &query).await
        }
    }
}

/// Loads every configured source with at most `max_parallel` loads in flight.
/// Results keep configuration order; the first failure aborts ingestion.
pub async fn load_all_sources(
    config: &InsightConfig,
    base_path: &Path,
    max_parallel: usize,
) -> Result<Vec<LoadedSource>> {
    let sources: Vec<LoadedSource> = stream::iter(config.dataset.sources.iter())
        .map(|spec| async move {
            let df = load_source(spec, base_path).await?;
            Ok::<_, InsightError>(LoadedSource {
                name: spec.name.clone(),
                df,
            })
        })
        .buffered(max_parallel.max(1))
        .try_collect()
        .await?;

    info!(count = sources.len(), "loaded data sources");
    Ok(sources)
}
