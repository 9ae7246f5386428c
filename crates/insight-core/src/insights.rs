//! Period-over-period comparison: joins the two aggregated tables, scores
//! every (dimension combination, metric) pair and ranks the results.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use polars::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::table::{any_value_to_json, column_names, float_values, has_column, round_to, zero_fill};

pub const CURRENT_SUFFIX: &str = "_current";
pub const PREVIOUS_SUFFIX: &str = "_previous";

const CURRENT_ORDER: &str = "__insight_current_order";
const PREVIOUS_ORDER: &str = "__insight_previous_order";

/// Percentage changes beyond this are treated as equally dramatic when scoring.
const PCT_CAP: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn from_delta(delta: f64) -> Self {
        if delta > 0.0 {
            Direction::Up
        } else if delta < 0.0 {
            Direction::Down
        } else {
            Direction::Flat
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Flat => "flat",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightRecord {
    pub dimensions: BTreeMap<String, Value>,
    pub metric: String,
    pub current_value: f64,
    pub previous_value: f64,
    pub delta: f64,
    pub delta_pct: f64,
    pub impact_score: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightSummary {
    pub total_insights: usize,
    pub total_gains: usize,
    pub total_drops: usize,
    pub top_mover: Option<InsightRecord>,
    pub biggest_gain: Option<InsightRecord>,
    pub biggest_drop: Option<InsightRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightSet {
    pub insights: Vec<InsightRecord>,
    pub summary: InsightSummary,
}

pub fn compute_delta(current: f64, previous: f64) -> f64 {
    current - previous
}

/// Percentage change relative to `|previous|`. A zero baseline yields 0 when
/// nothing changed and ±100 otherwise.
pub fn compute_delta_pct(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return if current == 0.0 {
            0.0
        } else if current > 0.0 {
            100.0
        } else {
            -100.0
        };
    }
    ((current - previous) / previous.abs()) * 100.0
}

/// `|delta| * (1 + pct_factor) * (1 + priority_weight)`, rounded to 4 decimals.
///
/// `priority_index` 0 is the most important metric and weighs 1.0; the last of
/// `total_metrics` weighs `1 / total_metrics`.
pub fn compute_impact_score(
    delta: f64,
    delta_pct: f64,
    priority_index: usize,
    total_metrics: usize,
) -> f64 {
    let pct_factor = delta_pct.abs().min(PCT_CAP) / PCT_CAP;
    let priority_weight = if total_metrics == 0 {
        0.0
    } else {
        (total_metrics as f64 - priority_index as f64) / total_metrics as f64
    };
    round_to(delta.abs() * (1.0 + pct_factor) * (1.0 + priority_weight), 4)
}

fn with_suffix(df: &DataFrame, keep: &[String], suffix: &str) -> PolarsResult<DataFrame> {
    let renamed: Vec<String> = column_names(df)
        .into_iter()
        .map(|name| {
            if keep.contains(&name) {
                name
            } else {
                format!("{name}{suffix}")
            }
        })
        .collect();
    let mut output = df.clone();
    output.set_column_names(renamed)?;
    Ok(output)
}

/// Lines up both periods side by side. Metric columns get `_current` and
/// `_previous` suffixes; dimension combinations present in only one period
/// are kept with zeros on the other side.
///
/// Rows follow the current period's order, then previous-only combinations.
pub fn join_periods(
    current: &DataFrame,
    previous: &DataFrame,
    dimensions: &[String],
) -> Result<DataFrame> {
    let current = with_suffix(current, dimensions, CURRENT_SUFFIX)?;
    let previous = with_suffix(previous, dimensions, PREVIOUS_SUFFIX)?;

    let joined = if dimensions.is_empty() {
        debug!("no dimensions, cross joining period totals");
        current
            .lazy()
            .join(
                previous.lazy(),
                Vec::<Expr>::new(),
                Vec::<Expr>::new(),
                JoinArgs::new(JoinType::Cross),
            )
            .collect()?
    } else {
        let on: Vec<Expr> = dimensions.iter().map(|dim| col(dim.as_str())).collect();
        current
            .lazy()
            .with_row_index(CURRENT_ORDER, None)
            .join(
                previous.lazy().with_row_index(PREVIOUS_ORDER, None),
                on.clone(),
                on,
                JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
            )
            .sort(
                [CURRENT_ORDER, PREVIOUS_ORDER],
                SortMultipleOptions::default().with_nulls_last(true),
            )
            .collect()?
            .drop_many([CURRENT_ORDER, PREVIOUS_ORDER])
    };

    let period_columns: Vec<String> = column_names(&joined)
        .into_iter()
        .filter(|name| name.ends_with(CURRENT_SUFFIX) || name.ends_with(PREVIOUS_SUFFIX))
        .collect();
    let joined = zero_fill(&joined, &period_columns)?;

    debug!(combinations = joined.height(), "joined periods");
    Ok(joined)
}

/// Emits one record per row and metric, rows first then metrics in priority
/// order. Metrics missing on either side of the join are skipped.
pub fn extract_insights(
    joined: &DataFrame,
    dimensions: &[String],
    kpi_priority: &[String],
) -> Result<Vec<InsightRecord>> {
    let total_metrics = kpi_priority.len();

    let mut metric_columns = Vec::new();
    for (priority_index, metric) in kpi_priority.iter().enumerate() {
        let current_col = format!("{metric}{CURRENT_SUFFIX}");
        let previous_col = format!("{metric}{PREVIOUS_SUFFIX}");
        if !has_column(joined, &current_col) || !has_column(joined, &previous_col) {
            debug!(metric = %metric, "metric absent from one period, skipping");
            continue;
        }
        metric_columns.push((
            priority_index,
            metric,
            float_values(joined, &current_col)?,
            float_values(joined, &previous_col)?,
        ));
    }

    let dimension_columns: Vec<&Column> = dimensions
        .iter()
        .filter(|dim| has_column(joined, dim))
        .map(|dim| joined.column(dim))
        .collect::<PolarsResult<_>>()?;

    let mut insights = Vec::with_capacity(joined.height() * metric_columns.len());
    for row in 0..joined.height() {
        let mut dimension_values = BTreeMap::new();
        for column in &dimension_columns {
            let value = column.get(row)?;
            dimension_values.insert(column.name().to_string(), any_value_to_json(&value));
        }

        for (priority_index, metric, current_values, previous_values) in &metric_columns {
            let current = current_values[row].unwrap_or(0.0);
            let previous = previous_values[row].unwrap_or(0.0);

            let delta = compute_delta(current, previous);
            let delta_pct = compute_delta_pct(current, previous);
            let impact_score = compute_impact_score(delta, delta_pct, *priority_index, total_metrics);

            insights.push(InsightRecord {
                dimensions: dimension_values.clone(),
                metric: metric.to_string(),
                current_value: round_to(current, 4),
                previous_value: round_to(previous, 4),
                delta: round_to(delta, 4),
                delta_pct: round_to(delta_pct, 2),
                impact_score,
                direction: Direction::from_delta(delta),
            });
        }
    }

    info!(count = insights.len(), "extracted raw insights");
    Ok(insights)
}

/// Keeps records scoring at least `min_impact`, sorted by score descending.
/// Ties keep their emission order. `top_n` of `None` or `Some(0)` keeps all.
pub fn rank_insights(
    insights: Vec<InsightRecord>,
    top_n: Option<usize>,
    min_impact: f64,
) -> Vec<InsightRecord> {
    let mut ranked: Vec<InsightRecord> = insights
        .into_iter()
        .filter(|insight| insight.impact_score >= min_impact)
        .collect();

    ranked.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));

    if let Some(limit) = top_n.filter(|&n| n > 0) {
        ranked.truncate(limit);
    }

    info!(count = ranked.len(), min_impact, "ranked insights");
    ranked
}

/// First record whose `delta_pct` compares as `wanted` against every earlier pick.
fn extreme_by_pct<'a>(
    insights: impl Iterator<Item = &'a InsightRecord>,
    wanted: Ordering,
) -> Option<&'a InsightRecord> {
    insights.fold(None, |best, insight| match best {
        Some(current) if insight.delta_pct.total_cmp(&current.delta_pct) != wanted => Some(current),
        _ => Some(insight),
    })
}

pub fn generate_insight_summary(insights: &[InsightRecord]) -> InsightSummary {
    let gains = || insights.iter().filter(|i| i.direction == Direction::Up);
    let drops = || insights.iter().filter(|i| i.direction == Direction::Down);

    InsightSummary {
        total_insights: insights.len(),
        total_gains: gains().count(),
        total_drops: drops().count(),
        top_mover: insights.first().cloned(),
        biggest_gain: extreme_by_pct(gains(), Ordering::Greater).cloned(),
        biggest_drop: extreme_by_pct(drops(), Ordering::Less).cloned(),
    }
}

pub fn generate_insights(
    current: &DataFrame,
    previous: &DataFrame,
    dimensions: &[String],
    kpi_priority: &[String],
    top_n: Option<usize>,
    min_impact: f64,
) -> Result<InsightSet> {
    info!(
        dimensions = ?dimensions,
        kpis = ?kpi_priority,
        "generating insights"
    );

    let joined = join_periods(current, previous, dimensions)?;
    let raw = extract_insights(&joined, dimensions, kpi_priority)?;
    let insights = rank_insights(raw, top_n, min_impact);
    let summary = generate_insight_summary(&insights);

    match insights.first() {
        Some(top) => info!(metric = %top.metric, impact = top.impact_score, "top insight"),
        None => info!("no insights passed the filters"),
    }
    Ok(InsightSet { insights, summary })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(metric: &str, delta_pct: f64, impact_score: f64) -> InsightRecord {
        InsightRecord {
            dimensions: BTreeMap::new(),
            metric: metric.to_string(),
            current_value: 0.0,
            previous_value: 0.0,
            delta: delta_pct,
            delta_pct,
            impact_score,
            direction: Direction::from_delta(delta_pct),
        }
    }

    #[test]
    fn delta_pct_of_equal_values_is_zero() {
        for x in [0.0, 1.0, -3.5, 1e9] {
            assert_eq!(compute_delta_pct(x, x), 0.0);
        }
    }

    #[test]
    fn delta_pct_against_zero_baseline() {
        assert_eq!(compute_delta_pct(0.0, 0.0), 0.0);
        assert_eq!(compute_delta_pct(42.0, 0.0), 100.0);
        assert_eq!(compute_delta_pct(-0.5, 0.0), -100.0);
    }

    #[test]
    fn delta_pct_uses_absolute_baseline() {
        assert_eq!(compute_delta_pct(150.0, 100.0), 50.0);
        assert_eq!(compute_delta_pct(-50.0, -100.0), 50.0);
        assert_eq!(compute_delta_pct(-150.0, -100.0), -50.0);
    }

    #[test]
    fn impact_score_worked_example() {
        let delta = compute_delta(300.0, 200.0);
        let pct = compute_delta_pct(300.0, 200.0);
        assert_eq!(delta, 100.0);
        assert_eq!(pct, 50.0);
        assert_eq!(compute_impact_score(delta, pct, 0, 1), 250.0);
    }

    #[test]
    fn impact_score_is_monotonic() {
        let mut previous = 0.0;
        for delta in [0.0, 0.5, 1.0, 10.0, 250.0] {
            let score = compute_impact_score(delta, 30.0, 1, 3);
            assert!(score >= previous);
            previous = score;
        }

        let by_priority: Vec<f64> = (0..4)
            .map(|idx| compute_impact_score(10.0, 30.0, idx, 4))
            .collect();
        assert!(by_priority.windows(2).all(|pair| pair[0] >= pair[1]));

        // percentage beyond the cap stops adding weight
        assert_eq!(
            compute_impact_score(10.0, 200.0, 0, 1),
            compute_impact_score(10.0, 900.0, 0, 1)
        );
    }

    #[test]
    fn ranking_is_stable_and_idempotent() {
        let insights = vec![
            record("a", 10.0, 5.0),
            record("b", -10.0, 9.0),
            record("c", 1.0, 5.0),
            record("d", 1.0, 0.5),
        ];

        let ranked = rank_insights(insights, Some(3), 1.0);
        let order: Vec<&str> = ranked.iter().map(|r| r.metric.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);

        assert_eq!(rank_insights(ranked.clone(), Some(3), 1.0), ranked);
        assert_eq!(rank_insights(ranked.clone(), Some(0), 0.0).len(), 3);
    }

    #[test]
    fn summary_picks_extremes_first_on_ties() {
        let ranked = vec![
            record("drop", -40.0, 9.0),
            record("gain_a", 25.0, 8.0),
            record("gain_b", 25.0, 7.0),
            record("flat", 0.0, 0.0),
            record("drop_b", -40.0, 6.0),
        ];

        let summary = generate_insight_summary(&ranked);
        assert_eq!(summary.total_insights, 5);
        assert_eq!(summary.total_gains, 2);
        assert_eq!(summary.total_drops, 2);
        assert_eq!(summary.top_mover.unwrap().metric, "drop");
        assert_eq!(summary.biggest_gain.unwrap().metric, "gain_a");
        assert_eq!(summary.biggest_drop.unwrap().metric, "drop");
    }

    #[test]
    fn empty_summary_has_no_records() {
        let summary = generate_insight_summary(&[]);
        assert_eq!(summary.total_insights, 0);
        assert!(summary.top_mover.is_none());
        assert!(summary.biggest_gain.is_none());
        assert!(summary.biggest_drop.is_none());
    }
}
