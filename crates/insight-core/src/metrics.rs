use once_cell::sync::Lazy;
use polars::prelude::*;
use regex::Regex;
use tracing::{debug, info};

use crate::config::DerivedMetricSpec;
use crate::error::{InsightError, Result};
use crate::table::has_column;

static FORMULA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\w+)\s*([+\-*/])\s*(\w+)\s*$").expect("valid formula pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operator {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "+" => Some(Operator::Add),
            "-" => Some(Operator::Subtract),
            "*" => Some(Operator::Multiply),
            "/" => Some(Operator::Divide),
            _ => None,
        }
    }

    /// Division by exactly zero yields 0.0 rather than NaN or infinity.
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Operator::Add => left + right,
            Operator::Subtract => left - right,
            Operator::Multiply => left * right,
            Operator::Divide if right == 0.0 => 0.0,
            Operator::Divide => left / right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub left: String,
    pub operator: Operator,
    pub right: String,
}

impl Formula {
    /// Parses `<column> <op> <column>`; nothing richer is accepted.
    pub fn parse(formula: &str) -> Result<Self> {
        let invalid = || InsightError::Formula {
            formula: formula.to_string(),
        };
        let caps = FORMULA_PATTERN.captures(formula).ok_or_else(invalid)?;
        let operator = Operator::from_symbol(&caps[2]).ok_or_else(invalid)?;

        Ok(Formula {
            left: caps[1].to_string(),
            operator,
            right: caps[3].to_string(),
        })
    }
}

/// Adds a `Float64` column named `name` computed element-wise from the formula.
/// Nulls propagate, except that a null divisor is treated like zero.
pub fn compute_derived_metric(df: &DataFrame, name: &str, formula: &str) -> Result<DataFrame> {
    debug!(metric = name, formula, "computing derived metric");
    let parsed = Formula::parse(formula)?;

    for operand in [&parsed.left, &parsed.right] {
        if !has_column(df, operand) {
            return Err(InsightError::ColumnNotFound {
                column: operand.clone(),
                formula: formula.to_string(),
            });
        }
    }

    let left = operand_values(df, &parsed.left, formula)?;
    let right = operand_values(df, &parsed.right, formula)?;

    let values: Vec<Option<f64>> = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| match (parsed.operator, l, r) {
            (Operator::Divide, _, r) if r.map_or(true, |r| r == 0.0) => Some(0.0),
            (op, Some(l), Some(r)) => Some(op.apply(*l, *r)),
            _ => None,
        })
        .collect();

    let mut output = df.clone();
    output.with_column(Series::new(name.into(), values))?;
    Ok(output)
}

// Text that does not parse as a number is an error, never a silent null.
fn operand_values(df: &DataFrame, column: &str, formula: &str) -> Result<Vec<Option<f64>>> {
    let non_numeric = || InsightError::NonNumericOperand {
        column: column.to_string(),
        formula: formula.to_string(),
    };
    let values = df
        .column(column)?
        .strict_cast(&DataType::Float64)
        .map_err(|_| non_numeric())?;
    Ok(values.f64()?.into_iter().collect())
}

/// Applies each derived metric in declaration order, so later formulas can
/// reference columns produced by earlier ones.
pub fn compute_all_derived_metrics(
    df: &DataFrame,
    derived_metrics: &[DerivedMetricSpec],
) -> Result<DataFrame> {
    info!(count = derived_metrics.len(), "computing derived metrics");

    let mut output = df.clone();
    for metric in derived_metrics {
        output = compute_derived_metric(&output, &metric.name, &metric.formula)?;
        info!(metric = %metric.name, "added derived metric");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_restricted_grammar() {
        let formula = Formula::parse("  clicks/impressions ").unwrap();
        assert_eq!(formula.left, "clicks");
        assert_eq!(formula.operator, Operator::Divide);
        assert_eq!(formula.right, "impressions");

        assert_eq!(Formula::parse("a - b").unwrap().operator, Operator::Subtract);
    }

    #[test]
    fn rejects_anything_beyond_two_operands() {
        for bad in ["clicks / impressions * 100", "clicks", "(a + b)", "a % b", ""] {
            assert!(
                matches!(Formula::parse(bad), Err(InsightError::Formula { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn division_by_zero_is_clamped() {
        assert_eq!(Operator::Divide.apply(5.0, 0.0), 0.0);
        assert_eq!(Operator::Divide.apply(0.0, 0.0), 0.0);
        assert_eq!(Operator::Divide.apply(6.0, 4.0), 1.5);
        assert_eq!(Operator::Divide.apply(6.0, -0.0), 0.0);
    }
}
