use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, info};

use crate::config::{DateRange, PeriodWindow};
use crate::error::{InsightError, Result};
use crate::table::{date_to_days, has_column};

/// Whole-column formats, tried in order. A format wins only if it parses every value.
pub const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y"];

const FALLBACK_DATETIME_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const FALLBACK_DATE_FORMATS: [&str; 8] = [
    "%Y%m%d",
    "%d-%m-%Y",
    "%Y.%m.%d",
    "%d.%m.%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Best-effort parse of a single value, used when no whole-column format fits.
pub fn parse_date_lenient(value: &str) -> Option<NaiveDate> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    for fmt in FALLBACK_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in DATE_FORMATS.iter().chain(FALLBACK_DATE_FORMATS.iter()) {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(date);
        }
    }
    None
}

fn parse_with_format(values: &[Option<&str>], fmt: &str) -> Option<Vec<Option<NaiveDate>>> {
    values
        .iter()
        .map(|value| match value {
            Some(v) => NaiveDate::parse_from_str(v.trim(), fmt).ok().map(Some),
            None => Some(None),
        })
        .collect()
}

fn parse_strings(column: &str, values: &[Option<&str>]) -> Result<Vec<Option<NaiveDate>>> {
    for fmt in DATE_FORMATS {
        if let Some(dates) = parse_with_format(values, fmt) {
            debug!(column, format = fmt, "parsed date column");
            return Ok(dates);
        }
    }

    values
        .iter()
        .map(|value| match value {
            Some(v) => parse_date_lenient(v).map(Some).ok_or_else(|| InsightError::DateParse {
                column: column.to_string(),
                sample: Some(v.to_string()),
            }),
            None => Ok(None),
        })
        .collect()
}

/// Returns a copy of `df` whose `date_col` has the polars `Date` type.
pub fn parse_date_column(df: &DataFrame, date_col: &str) -> Result<DataFrame> {
    if !has_column(df, date_col) {
        return Err(InsightError::missing(date_col, "date parsing"));
    }

    let column = df.column(date_col)?;
    match column.dtype() {
        DataType::Date => return Ok(df.clone()),
        DataType::Datetime(_, _) => {
            let mut output = df.clone();
            output.with_column(column.cast(&DataType::Date)?)?;
            return Ok(output);
        }
        _ => {}
    }

    debug!(column = date_col, "parsing date column from text");
    let text = column.cast(&DataType::String)?;
    let values: Vec<Option<&str>> = text.str()?.into_iter().collect();
    let dates = parse_strings(date_col, &values)?;

    let days: Vec<Option<i32>> = dates.into_iter().map(|d| d.map(date_to_days)).collect();
    let parsed = Series::new(date_col.into(), days).cast(&DataType::Date)?;

    let mut output = df.clone();
    output.with_column(parsed)?;
    Ok(output)
}

fn within(date_col: &str, range: &DateRange) -> Expr {
    let day = col(date_col).cast(DataType::Int32);
    day.clone()
        .gt_eq(lit(date_to_days(range.start)))
        .and(day.lt_eq(lit(date_to_days(range.end))))
}

/// Splits rows into (current, previous) by inclusive date bounds. Rows in
/// neither window are dropped; rows in both (overlapping windows) appear twice.
pub fn split_by_period(
    df: &DataFrame,
    date_col: &str,
    window: &PeriodWindow,
) -> Result<(DataFrame, DataFrame)> {
    info!(
        current = %window.current,
        previous = %window.previous,
        "splitting data by period"
    );
    let df = parse_date_column(df, date_col)?;

    let current = df
        .clone()
        .lazy()
        .filter(within(date_col, &window.current))
        .collect()?;
    let previous = df
        .lazy()
        .filter(within(date_col, &window.previous))
        .collect()?;

    info!(
        current_rows = current.height(),
        previous_rows = previous.height(),
        "split complete"
    );
    Ok((current, previous))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn whole_column_format_must_fit_every_value() {
        // 11/24/2025 fails day-first, so month-first is chosen for the whole column.
        let values = [Some("11/02/2025"), None, Some("11/24/2025")];
        let dates = parse_strings("date", &values).unwrap();
        assert_eq!(dates, [Some(ymd(2025, 11, 2)), None, Some(ymd(2025, 11, 24))]);

        let day_first = [Some("24/11/2025"), Some("02/11/2025")];
        assert_eq!(
            parse_strings("date", &day_first).unwrap(),
            [Some(ymd(2025, 11, 24)), Some(ymd(2025, 11, 2))]
        );
    }

    #[test]
    fn lenient_parse_handles_timestamps() {
        assert_eq!(parse_date_lenient("2025-11-24T08:30:00Z"), Some(ymd(2025, 11, 24)));
        assert_eq!(parse_date_lenient("2025-11-24 08:30:00"), Some(ymd(2025, 11, 24)));
        assert_eq!(parse_date_lenient("24 Nov 2025"), Some(ymd(2025, 11, 24)));
        assert_eq!(parse_date_lenient("not a date"), None);
    }

    #[test]
    fn unparseable_value_reports_sample() {
        let err = parse_strings("day", &[Some("2025-11-24"), Some("soon")]).unwrap_err();
        match err {
            InsightError::DateParse { column, sample } => {
                assert_eq!(column, "day");
                assert_eq!(sample.as_deref(), Some("soon"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
