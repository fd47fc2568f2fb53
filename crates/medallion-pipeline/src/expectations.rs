//! Data-quality expectations.
//!
//! Expectations run in declaration order, each against the rows accepted by
//! the previous ones. A row is rejected when the predicate is false or null.

use std::collections::BTreeMap;

use serde_json::Value;

use medallion_expr::{parse_expr, DataFrame, Expr};
use medallion_types::{MedallionError, Result};

use crate::backend::DataFrameBackend;
use crate::config::{ExpectationAction, ExpectationConfig};

/// Column added to quarantined rows, holding the rejecting expectation's name.
pub const QUARANTINE_TAG_COLUMN: &str = "_dq_expectation";

#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub name: String,
    pub expr_src: String,
    pub expr: Expr,
    pub action: ExpectationAction,
}

impl Expectation {
    pub fn from_config(config: &ExpectationConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            expr_src: config.expr.clone(),
            expr: parse_expr(&config.expr)?,
            action: config.action,
        })
    }

    /// Predicate selecting the rows this expectation rejects.
    pub fn failure_condition(&self) -> String {
        format!("NOT COALESCE(({}), FALSE)", self.expr_src)
    }

    /// Split `df` into `(accepted, rejected)` rows.
    pub fn evaluate(
        &self,
        df: &DataFrame,
        backend: &dyn DataFrameBackend,
    ) -> Result<(DataFrame, DataFrame)> {
        let passed: Vec<bool> = backend
            .predicate(df, &self.expr)?
            .into_iter()
            .map(|b| b == Some(true))
            .collect();
        let failed: Vec<bool> = passed.iter().map(|p| !p).collect();
        Ok((backend.filter(df, &passed), backend.filter(df, &failed)))
    }
}

/// Result of running every expectation of a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectationOutcome {
    pub accepted: DataFrame,
    /// Rows removed by QUARANTINE expectations, tagged with [`QUARANTINE_TAG_COLUMN`].
    pub quarantined: DataFrame,
    pub rejected_per_expectation: BTreeMap<String, usize>,
    pub warned: BTreeMap<String, usize>,
}

impl ExpectationOutcome {
    pub fn rows_quarantined(&self) -> usize {
        self.quarantined.num_rows()
    }
}

/// Apply `expectations` to `df` in order.
///
/// FAIL aborts with `ExpectationFailure` when any currently accepted row
/// fails. DROP and QUARANTINE remove failing rows; WARN only counts them.
/// Counts of expectations sharing a name are summed.
pub fn apply_expectations(
    node: &str,
    df: DataFrame,
    expectations: &[Expectation],
    backend: &dyn DataFrameBackend,
) -> Result<ExpectationOutcome> {
    if df.has_column(QUARANTINE_TAG_COLUMN) {
        if let Some(e) = expectations
            .iter()
            .find(|e| e.action == ExpectationAction::Quarantine)
        {
            return Err(MedallionError::ExpectationError {
                node: node.to_string(),
                expectation: e.name.clone(),
                message: format!(
                    "input already has a '{QUARANTINE_TAG_COLUMN}' column; rename it before quarantining"
                ),
            });
        }
    }

    let mut outcome = ExpectationOutcome {
        accepted: df,
        ..ExpectationOutcome::default()
    };
    let mut quarantined: Option<DataFrame> = None;

    for expectation in expectations {
        let (accepted, rejected) = expectation
            .evaluate(&outcome.accepted, backend)
            .map_err(|e| MedallionError::ExpectationError {
                node: node.to_string(),
                expectation: expectation.name.clone(),
                message: e.to_string(),
            })?;
        let failing = rejected.num_rows();
        tracing::debug!(
            node,
            expectation = %expectation.name,
            action = %expectation.action,
            failing,
            "expectation evaluated"
        );

        match expectation.action {
            ExpectationAction::Fail => {
                if failing > 0 {
                    return Err(MedallionError::ExpectationFailure {
                        node: node.to_string(),
                        expectation: expectation.name.clone(),
                        failing_rows: failing,
                    });
                }
            }
            ExpectationAction::Warn => {
                if failing > 0 {
                    tracing::warn!(node, expectation = %expectation.name, failing, "expectation not met");
                }
                *outcome.warned.entry(expectation.name.clone()).or_default() += failing;
            }
            ExpectationAction::Drop => {
                *outcome
                    .rejected_per_expectation
                    .entry(expectation.name.clone())
                    .or_default() += failing;
                outcome.accepted = accepted;
            }
            ExpectationAction::Quarantine => {
                *outcome
                    .rejected_per_expectation
                    .entry(expectation.name.clone())
                    .or_default() += failing;
                outcome.accepted = accepted;
                let tagged = backend
                    .with_column(
                        &rejected,
                        QUARANTINE_TAG_COLUMN,
                        &Expr::Literal(Value::String(expectation.name.clone())),
                        None,
                    )
                    .map_err(|e| MedallionError::ExpectationError {
                        node: node.to_string(),
                        expectation: expectation.name.clone(),
                        message: e.to_string(),
                    })?;
                quarantined = Some(match quarantined {
                    Some(prev) => prev.union_by_name(&tagged),
                    None => tagged,
                });
            }
        }
    }

    if let Some(q) = quarantined {
        outcome.quarantined = q;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use serde_json::json;

    fn expectation(name: &str, expr: &str, action: ExpectationAction) -> Expectation {
        Expectation::from_config(&ExpectationConfig {
            name: name.into(),
            expr: expr.into(),
            action,
        })
        .unwrap()
    }

    fn prices() -> DataFrame {
        DataFrame::from_records(vec![
            json!({"open": 5}),
            json!({"open": -1}),
            json!({"open": null}),
        ])
        .unwrap()
    }

    #[test]
    fn drop_removes_false_and_null_rows() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[expectation("positive_price", "open > 0", ExpectationAction::Drop)],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.accepted.to_records(), vec![json!({"open": 5})]);
        assert_eq!(out.rejected_per_expectation["positive_price"], 2);
        assert_eq!(out.rows_quarantined(), 0);
    }

    #[test]
    fn fail_aborts_with_failing_count() {
        let err = apply_expectations(
            "slv",
            prices(),
            &[expectation("positive_price", "open > 0", ExpectationAction::Fail)],
            &LocalBackend::new(),
        )
        .unwrap_err();
        match err {
            MedallionError::ExpectationFailure {
                node,
                expectation,
                failing_rows,
            } => {
                assert_eq!(node, "slv");
                assert_eq!(expectation, "positive_price");
                assert_eq!(failing_rows, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fail_sees_only_rows_accepted_so_far() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[
                expectation("not_null", "open IS NOT NULL", ExpectationAction::Drop),
                expectation("non_zero", "open <> 0", ExpectationAction::Fail),
            ],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.accepted.num_rows(), 2);
    }

    #[test]
    fn quarantine_tags_first_rejecting_expectation() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[
                expectation("not_null", "open IS NOT NULL", ExpectationAction::Quarantine),
                expectation("positive", "open > 0", ExpectationAction::Quarantine),
            ],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.accepted.to_records(), vec![json!({"open": 5})]);
        assert_eq!(
            out.quarantined.to_records(),
            vec![
                json!({"open": null, "_dq_expectation": "not_null"}),
                json!({"open": -1, "_dq_expectation": "positive"}),
            ]
        );
        assert_eq!(out.rejected_per_expectation["not_null"], 1);
        assert_eq!(out.rejected_per_expectation["positive"], 1);
    }

    #[test]
    fn warn_keeps_rows_and_counts() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[expectation("positive", "open > 0", ExpectationAction::Warn)],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.accepted.num_rows(), 3);
        assert_eq!(out.warned["positive"], 2);
        assert!(out.rejected_per_expectation.is_empty());
    }

    #[test]
    fn evaluation_error_names_expectation() {
        let err = apply_expectations(
            "slv",
            prices(),
            &[expectation("has_close", "close > 0", ExpectationAction::Drop)],
            &LocalBackend::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MedallionError::ExpectationError { ref expectation, .. } if expectation == "has_close"
        ));
    }

    #[test]
    fn shared_names_sum_their_counts() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[
                expectation("e", "open IS NOT NULL", ExpectationAction::Drop),
                expectation("e", "open > 0", ExpectationAction::Drop),
            ],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.rejected_per_expectation["e"], 2);
        let rejected: usize = out.rejected_per_expectation.values().sum();
        assert_eq!(out.accepted.num_rows() + rejected, 3);
    }

    #[test]
    fn shared_warn_names_sum_their_counts() {
        let out = apply_expectations(
            "slv",
            prices(),
            &[
                expectation("w", "open > 0", ExpectationAction::Warn),
                expectation("w", "open IS NOT NULL", ExpectationAction::Warn),
            ],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.warned["w"], 3);
    }

    #[test]
    fn quarantine_refuses_existing_tag_column() {
        let df = DataFrame::from_records(vec![
            json!({"open": -1, "_dq_expectation": "upstream"}),
        ])
        .unwrap();
        let err = apply_expectations(
            "slv",
            df,
            &[expectation("positive", "open > 0", ExpectationAction::Quarantine)],
            &LocalBackend::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MedallionError::ExpectationError { ref expectation, ref message, .. }
                if expectation == "positive" && message.contains("_dq_expectation")
        ));
    }

    #[test]
    fn tag_column_is_allowed_without_quarantine() {
        let df = DataFrame::from_records(vec![
            json!({"open": 1, "_dq_expectation": "upstream"}),
        ])
        .unwrap();
        let out = apply_expectations(
            "slv",
            df,
            &[expectation("positive", "open > 0", ExpectationAction::Drop)],
            &LocalBackend::new(),
        )
        .unwrap();
        assert_eq!(out.accepted.num_rows(), 1);
    }

    #[test]
    fn failure_condition_wraps_predicate() {
        let e = expectation("positive", "open > 0", ExpectationAction::Drop);
        assert_eq!(e.failure_condition(), "NOT COALESCE((open > 0), FALSE)");
        assert!(parse_expr(&e.failure_condition()).is_ok());
    }
}
