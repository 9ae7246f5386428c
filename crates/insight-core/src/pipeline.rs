//! End-to-end run: load, join, derive, split, aggregate, score.

use std::path::Path;

use polars::prelude::DataFrame;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    aggregate::aggregate_by_dimensions,
    config::InsightConfig,
    error::{InsightError, Result},
    insights::{generate_insights, InsightRecord, InsightSummary},
    join::join_sources,
    metrics::compute_all_derived_metrics,
    periods::{parse_date_column, split_by_period},
    sources::load_all_sources,
    table::{column_names, has_column},
};

/// Resolved settings echoed back so consumers can label the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEcho {
    pub dimensions: Vec<String>,
    pub kpis: Vec<String>,
    pub current_period: String,
    pub previous_period: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightReport {
    pub insights: Vec<InsightRecord>,
    pub summary: InsightSummary,
    pub config: ReportEcho,
}

/// Metrics scored by the insight engine, most important first. Falls back to
/// every aggregated metric when no priority list is configured.
pub fn effective_kpis(config: &InsightConfig) -> Result<Vec<String>> {
    if config.report.kpi_priority.is_empty() {
        config.all_metrics()
    } else {
        Ok(config.report.kpi_priority.clone())
    }
}

/// Loads every source and joins them into the unified table.
pub async fn ingest(
    config: &InsightConfig,
    base_path: &Path,
    max_parallel: usize,
) -> Result<DataFrame> {
    info!("starting data ingestion");

    let sources = load_all_sources(config, base_path, max_parallel).await?;
    let df = join_sources(&sources, config)?;

    let date_col = config.date_column()?;
    if !has_column(&df, &date_col) {
        let candidates: Vec<String> = column_names(&df)
            .into_iter()
            .filter(|name| {
                let lower = name.to_lowercase();
                lower.contains("date") || lower.contains("dt_")
            })
            .collect();
        warn!(
            date_col = %date_col,
            available = ?column_names(&df),
            candidates = ?candidates,
            "date column not found after join"
        );
        return Err(InsightError::missing(date_col, "period splitting"));
    }

    info!(
        rows = df.height(),
        columns = df.width(),
        "data ingestion complete"
    );
    Ok(df)
}

/// Runs every CPU-bound stage over an already ingested table.
pub fn analyze(df: &DataFrame, config: &InsightConfig) -> Result<InsightReport> {
    let date_col = config.date_column()?;
    let window = config.report.comparison.window()?;
    let dimensions = &config.report.primary_dims;
    let metrics = config.all_metrics()?;
    let kpis = effective_kpis(config)?;

    info!("processing metrics");
    let df = parse_date_column(df, &date_col)?;
    let df = compute_all_derived_metrics(&df, &config.derived_metrics)?;

    let (current, previous) = split_by_period(&df, &date_col, &window)?;
    let current = aggregate_by_dimensions(&current, dimensions, &metrics)?;
    let previous = aggregate_by_dimensions(&previous, dimensions, &metrics)?;

    let top_n = Some(config.report.top_n).filter(|&n| n > 0);
    let set = generate_insights(
        &current,
        &previous,
        dimensions,
        &kpis,
        top_n,
        config.report.min_impact,
    )?;

    Ok(InsightReport {
        insights: set.insights,
        summary: set.summary,
        config: ReportEcho {
            dimensions: dimensions.clone(),
            kpis,
            current_period: window.current.to_string(),
            previous_period: window.previous.to_string(),
        },
    })
}

pub async fn run(
    config: &InsightConfig,
    base_path: &Path,
    max_parallel: usize,
) -> Result<InsightReport> {
    let df = ingest(config, base_path, max_parallel).await?;
    let report = analyze(&df, config)?;
    info!(
        insights = report.insights.len(),
        "insight run complete"
    );
    Ok(report)
}
