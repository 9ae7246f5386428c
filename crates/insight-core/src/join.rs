//! Reconciles every loaded source into one table keyed on the shared
//! dimension and date columns.

use polars::prelude::*;
use polars::sql::SQLContext;
use tracing::{debug, info, warn};

use crate::config::InsightConfig;
use crate::error::{InsightError, Result};
use crate::sources::LoadedSource;
use crate::table::{column_names, has_column, zero_fill};

const ROW_ORDER_COLUMN: &str = "__insight_row_order";

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Builds the SQL used by the embedded engine: every primary column, plus
/// each secondary column that is neither in the primary table nor a join key,
/// left-joined on the join keys each secondary table actually has.
///
/// A secondary table sharing none of the keys is cross joined. That mirrors
/// long-standing behaviour and can multiply rows.
pub fn build_join_sql(primary: &str, tables: &[(String, Vec<String>)], join_keys: &[String]) -> String {
    let primary_cols: &[String] = tables
        .iter()
        .find(|(name, _)| name == primary)
        .map(|(_, cols)| cols.as_slice())
        .unwrap_or(&[]);

    let mut select_cols: Vec<String> = primary_cols
        .iter()
        .map(|col| format!("{}.{} AS {}", quote(primary), quote(col), quote(col)))
        .collect();

    for (name, cols) in tables.iter().filter(|(name, _)| name != primary) {
        for col in cols {
            if !primary_cols.contains(col) && !join_keys.contains(col) {
                select_cols.push(format!("{}.{} AS {}", quote(name), quote(col), quote(col)));
            }
        }
    }

    let mut sql = format!("SELECT {} FROM {}", select_cols.join(", "), quote(primary));

    for (name, cols) in tables.iter().filter(|(name, _)| name != primary) {
        let on_conditions: Vec<String> = join_keys
            .iter()
            .filter(|key| cols.contains(key))
            .map(|key| {
                format!(
                    "{}.{} = {}.{}",
                    quote(primary),
                    quote(key),
                    quote(name),
                    quote(key)
                )
            })
            .collect();

        if on_conditions.is_empty() {
            sql.push_str(&format!(" CROSS JOIN {}", quote(name)));
        } else {
            sql.push_str(&format!(
                " LEFT JOIN {} ON {}",
                quote(name),
                on_conditions.join(" AND ")
            ));
        }
    }

    sql
}

pub fn join_with_sql(
    sources: &[LoadedSource],
    primary: &str,
    join_keys: &[String],
) -> PolarsResult<DataFrame> {
    let mut ctx = SQLContext::new();
    let mut tables = Vec::with_capacity(sources.len());
    for source in sources {
        ctx.register(&source.name, source.df.clone().lazy());
        tables.push((source.name.clone(), column_names(&source.df)));
    }

    let sql = build_join_sql(primary, &tables, join_keys);
    debug!(%sql, "join SQL");

    let df = ctx.execute(&sql)?.collect()?;
    info!(rows = df.height(), "SQL join successful");
    Ok(df)
}

/// Joins secondaries onto the primary one at a time with dataframe left joins,
/// skipping any secondary that shares no key with the running result.
pub fn join_with_frames(
    sources: &[LoadedSource],
    primary: &str,
    join_keys: &[String],
) -> PolarsResult<DataFrame> {
    let Some(primary_source) = sources.iter().find(|source| source.name == primary) else {
        return Err(PolarsError::ColumnNotFound(
            format!("primary source '{primary}' was not loaded").into(),
        ));
    };

    let mut result = primary_source.df.clone();

    for source in sources.iter().filter(|source| source.name != primary) {
        let common_keys: Vec<String> = join_keys
            .iter()
            .filter(|key| has_column(&source.df, key) && has_column(&result, key))
            .cloned()
            .collect();

        if common_keys.is_empty() {
            debug!(source = %source.name, "no common join key, skipping");
            continue;
        }

        let right_cols: Vec<String> = column_names(&source.df)
            .into_iter()
            .filter(|col| !has_column(&result, col) || common_keys.contains(col))
            .collect();
        let right = source.df.select(right_cols)?;

        let on: Vec<Expr> = common_keys.iter().map(|key| col(key.as_str())).collect();
        result = result
            .lazy()
            .with_row_index(ROW_ORDER_COLUMN, None)
            .join(right.lazy(), on.clone(), on, JoinArgs::new(JoinType::Left))
            .sort([ROW_ORDER_COLUMN], SortMultipleOptions::default())
            .collect()?
            .drop(ROW_ORDER_COLUMN)?;

        debug!(source = %source.name, keys = ?common_keys, "joined source");
    }

    info!(rows = result.height(), "frame join complete");
    Ok(result)
}

/// Produces the unified table. One source passes through untouched; several
/// are joined with the SQL engine, falling back to dataframe joins once.
pub fn join_sources(sources: &[LoadedSource], config: &InsightConfig) -> Result<DataFrame> {
    match sources {
        [] => Err(InsightError::Config("no sources were loaded".into())),
        [single] => {
            info!(source = %single.name, "single source, no join needed");
            Ok(single.df.clone())
        }
        _ => {
            let primary = config.dataset.primary_source.as_str();
            let join_keys = config.join_keys()?;

            let joined = match join_with_sql(sources, primary, &join_keys) {
                Ok(df) => df,
                Err(err) => {
                    warn!(error = %err, "SQL join failed, falling back to frame join");
                    join_with_frames(sources, primary, &join_keys)?
                }
            };

            Ok(zero_fill(&joined, &config.declared_source_metrics())?)
        }
    }
}
