use chrono::NaiveDate;
use insight_core::config::{DateRange, PeriodWindow};
use insight_core::periods::{parse_date_column, split_by_period};
use insight_core::table::{date_to_days, float_values};
use insight_core::InsightError;
use polars::prelude::*;

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn november_window() -> PeriodWindow {
    PeriodWindow {
        current: DateRange::new(ymd(2025, 11, 24), ymd(2025, 11, 30)).unwrap(),
        previous: DateRange::new(ymd(2025, 11, 17), ymd(2025, 11, 23)).unwrap(),
    }
}

fn daily(dates: &[&str]) -> DataFrame {
    let clicks: Vec<i64> = (1..=dates.len() as i64).collect();
    df!("date" => dates, "clicks" => clicks).unwrap()
}

#[test]
fn iso_strings_become_dates() {
    let df = parse_date_column(&daily(&["2025-11-24", "2025-11-30"]), "date").unwrap();
    assert_eq!(df.column("date").unwrap().dtype(), &DataType::Date);
}

#[test]
fn split_uses_inclusive_bounds_and_drops_outsiders() {
    let df = daily(&[
        "2025-11-16", // before both windows
        "2025-11-17",
        "2025-11-23",
        "2025-11-24",
        "2025-11-30",
        "2025-12-01", // after both windows
    ]);

    let (current, previous) = split_by_period(&df, "date", &november_window()).unwrap();

    assert_eq!(float_values(&current, "clicks").unwrap(), [Some(4.0), Some(5.0)]);
    assert_eq!(float_values(&previous, "clicks").unwrap(), [Some(2.0), Some(3.0)]);
}

#[test]
fn slash_formats_are_recognised() {
    let df = daily(&["11/24/2025", "11/18/2025"]);
    let (current, previous) = split_by_period(&df, "date", &november_window()).unwrap();
    assert_eq!(current.height(), 1);
    assert_eq!(previous.height(), 1);
}

#[test]
fn native_date_columns_pass_through() {
    let dates = Series::new(
        "date".into(),
        [date_to_days(ymd(2025, 11, 25)), date_to_days(ymd(2025, 11, 20))],
    )
    .cast(&DataType::Date)
    .unwrap();
    let df = DataFrame::new(vec![dates.into(), Column::new("clicks".into(), [1i64, 2])]).unwrap();

    let (current, previous) = split_by_period(&df, "date", &november_window()).unwrap();
    assert_eq!(float_values(&current, "clicks").unwrap(), [Some(1.0)]);
    assert_eq!(float_values(&previous, "clicks").unwrap(), [Some(2.0)]);
}

#[test]
fn unparseable_dates_fail_with_column_name() {
    let err = parse_date_column(&daily(&["2025-11-24", "yesterday"]), "date").unwrap_err();
    assert!(matches!(err, InsightError::DateParse { column, .. } if column == "date"));
}

#[test]
fn missing_date_column_is_reported() {
    let err = parse_date_column(&daily(&["2025-11-24"]), "day").unwrap_err();
    assert!(matches!(err, InsightError::MissingColumn { columns, .. } if columns == ["day"]));
}
