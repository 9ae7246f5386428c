//! Small helpers over polars `DataFrame`, which is the table type passed
//! between every stage.

use chrono::NaiveDate;
use polars::prelude::*;
use serde_json::Value;

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

/// Reads a column as `f64` values, casting integers and treating nulls as `None`.
pub fn float_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<f64>>> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    Ok(column.f64()?.into_iter().collect())
}

/// Replaces nulls with zero in each listed column that exists in the frame.
pub fn zero_fill(df: &DataFrame, columns: &[String]) -> PolarsResult<DataFrame> {
    let exprs: Vec<Expr> = columns
        .iter()
        .filter(|name| has_column(df, name))
        .map(|name| col(name.as_str()).fill_null(lit(0)))
        .collect();

    if exprs.is_empty() {
        return Ok(df.clone());
    }
    df.clone().lazy().with_columns(exprs).collect()
}

/// Converts a single cell to JSON so dimension values keep their type in reports.
pub fn any_value_to_json(value: &AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(v) => Value::Bool(*v),
        AnyValue::String(v) => Value::String((*v).to_string()),
        AnyValue::StringOwned(v) => Value::String(v.to_string()),
        AnyValue::Int8(v) => Value::from(*v),
        AnyValue::Int16(v) => Value::from(*v),
        AnyValue::Int32(v) => Value::from(*v),
        AnyValue::Int64(v) => Value::from(*v),
        AnyValue::UInt8(v) => Value::from(*v),
        AnyValue::UInt16(v) => Value::from(*v),
        AnyValue::UInt32(v) => Value::from(*v),
        AnyValue::UInt64(v) => Value::from(*v),
        AnyValue::Float32(v) => Value::from(*v as f64),
        AnyValue::Float64(v) => Value::from(*v),
        other => Value::String(other.to_string()),
    }
}

/// Days since 1970-01-01, the physical representation of a polars `Date`.
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fill_only_touches_listed_columns() {
        let df = df!(
            "campaign" => &[Some("a"), None],
            "clicks" => &[Some(3i64), None],
            "spend" => &[None, Some(1.5f64)],
        )
        .unwrap();

        let filled = zero_fill(&df, &["clicks".into(), "spend".into(), "ghost".into()]).unwrap();

        assert_eq!(filled.column("clicks").unwrap().null_count(), 0);
        assert_eq!(filled.column("spend").unwrap().null_count(), 0);
        assert_eq!(filled.column("campaign").unwrap().null_count(), 1);
        assert_eq!(float_values(&filled, "clicks").unwrap(), [Some(3.0), Some(0.0)]);
    }

    #[test]
    fn round_to_matches_fixed_decimals() {
        assert_eq!(round_to(1.234_56, 4), 1.2346);
        assert_eq!(round_to(-33.333_33, 2), -33.33);
    }
}
