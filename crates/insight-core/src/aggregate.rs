use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{InsightError, Result};
use crate::table::has_column;

/// Sums each metric per distinct combination of `dimensions`, keeping groups in
/// first-seen order. With no dimensions the whole table collapses to one row.
///
/// Metrics missing from the table are skipped; it is only an error when none
/// of them exist.
pub fn aggregate_by_dimensions(
    df: &DataFrame,
    dimensions: &[String],
    metrics: &[String],
) -> Result<DataFrame> {
    let missing: Vec<String> = dimensions
        .iter()
        .filter(|dim| !has_column(df, dim))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(InsightError::MissingColumn {
            columns: missing,
            context: "aggregation",
        });
    }

    let valid: Vec<&String> = metrics
        .iter()
        .filter(|metric| has_column(df, metric) && !dimensions.contains(metric))
        .collect();
    if valid.is_empty() {
        return Err(InsightError::NoValidMetrics {
            requested: metrics.to_vec(),
        });
    }
    if valid.len() < metrics.len() {
        debug!(
            requested = metrics.len(),
            present = valid.len(),
            "skipping metrics absent from the table"
        );
    }

    let sums: Vec<Expr> = valid
        .iter()
        .map(|metric| {
            col(metric.as_str())
                .cast(DataType::Float64)
                .sum()
                .alias(metric.as_str())
        })
        .collect();

    let aggregated = if dimensions.is_empty() {
        df.clone().lazy().select(sums).collect()?
    } else {
        let keys: Vec<Expr> = dimensions.iter().map(|dim| col(dim.as_str())).collect();
        df.clone().lazy().group_by_stable(keys).agg(sums).collect()?
    };

    info!(
        rows_in = df.height(),
        groups = aggregated.height(),
        dimensions = ?dimensions,
        "aggregated metrics"
    );
    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::float_values;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let df = df!(
            "campaign" => &["b", "a", "b", "a", "c"],
            "clicks" => &[1i64, 2, 3, 4, 5],
        )
        .unwrap();

        let out = aggregate_by_dimensions(&df, &names(&["campaign"]), &names(&["clicks", "ghost"])).unwrap();

        let campaigns: Vec<Option<&str>> = out.column("campaign").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(campaigns, [Some("b"), Some("a"), Some("c")]);
        assert_eq!(float_values(&out, "clicks").unwrap(), [Some(4.0), Some(6.0), Some(5.0)]);
        assert!(!has_column(&out, "ghost"));
    }
}
