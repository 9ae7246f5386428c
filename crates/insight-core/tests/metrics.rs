use insight_core::config::DerivedMetricSpec;
use insight_core::metrics::{compute_all_derived_metrics, compute_derived_metric};
use insight_core::table::float_values;
use insight_core::InsightError;
use polars::prelude::*;

fn traffic() -> DataFrame {
    df!(
        "campaign" => &["Brand", "Search", "Display"],
        "clicks" => &[30i64, 0, 5],
        "impressions" => &[1000i64, 0, 0],
        "spend" => &[Some(15.0f64), Some(4.0), None],
    )
    .unwrap()
}

fn derived(name: &str, formula: &str) -> DerivedMetricSpec {
    DerivedMetricSpec {
        name: name.into(),
        formula: formula.into(),
    }
}

#[test]
fn division_by_zero_yields_zero_not_nan() {
    let df = compute_derived_metric(&traffic(), "ctr", "clicks / impressions").unwrap();

    let ctr = float_values(&df, "ctr").unwrap();
    assert_eq!(ctr, [Some(0.03), Some(0.0), Some(0.0)]);
    assert!(ctr.iter().flatten().all(|v| v.is_finite()));
    assert_eq!(df.column("ctr").unwrap().dtype(), &DataType::Float64);
}

#[test]
fn integer_operands_promote_to_float() {
    let df = compute_derived_metric(&traffic(), "total", "clicks+impressions").unwrap();
    assert_eq!(
        float_values(&df, "total").unwrap(),
        [Some(1030.0), Some(0.0), Some(5.0)]
    );
}

#[test]
fn nulls_propagate_through_non_division() {
    let df = compute_derived_metric(&traffic(), "cost_x", "spend * clicks").unwrap();
    assert_eq!(
        float_values(&df, "cost_x").unwrap(),
        [Some(450.0), Some(0.0), None]
    );
}

#[test]
fn later_formulas_see_earlier_results() {
    let specs = vec![
        derived("ctr", "clicks / impressions"),
        derived("cpc", "spend / clicks"),
        derived("ctr_per_cpc", "ctr / cpc"),
    ];

    let df = compute_all_derived_metrics(&traffic(), &specs).unwrap();

    let names: Vec<&str> = df.get_column_names().into_iter().map(|n| n.as_str()).collect();
    assert_eq!(&names[names.len() - 3..], ["ctr", "cpc", "ctr_per_cpc"]);
    assert_eq!(float_values(&df, "cpc").unwrap()[0], Some(0.5));
    assert_eq!(float_values(&df, "ctr_per_cpc").unwrap()[0], Some(0.06));
}

#[test]
fn unknown_operand_names_the_column() {
    let err = compute_derived_metric(&traffic(), "roas", "revenue / spend").unwrap_err();
    match err {
        InsightError::ColumnNotFound { column, formula } => {
            assert_eq!(column, "revenue");
            assert_eq!(formula, "revenue / spend");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn malformed_formula_is_rejected() {
    let err = compute_derived_metric(&traffic(), "weird", "clicks ** 2").unwrap_err();
    assert!(matches!(err, InsightError::Formula { formula } if formula == "clicks ** 2"));
}

#[test]
fn text_operand_is_rejected_instead_of_zeroed() {
    let df = df!("campaign" => &["Brand", "Search"], "clicks" => &[10i64, 5]).unwrap();

    let err = compute_derived_metric(&df, "per_campaign", "clicks / campaign").unwrap_err();
    match err {
        InsightError::NonNumericOperand { column, formula } => {
            assert_eq!(column, "campaign");
            assert_eq!(formula, "clicks / campaign");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn numeric_text_still_computes() {
    let df = df!("clicks" => &["10", "6"], "impressions" => &[100i64, 0]).unwrap();
    let out = compute_derived_metric(&df, "ctr", "clicks / impressions").unwrap();
    assert_eq!(float_values(&out, "ctr").unwrap(), [Some(0.1), Some(0.0)]);
}
