//! Ordered transformer chain: SQL statements, column builders, and function calls.

use medallion_expr::{parse_expr, parse_query, DataFrame, DataType, Expr, Projection, SelectQuery};
use medallion_types::{MedallionError, Result};

use crate::backend::DataFrameBackend;
use crate::config::{ColumnConfig, TransformerStepConfig};
use crate::functions::{FunctionCall, FunctionRegistry};
use crate::node::UpstreamOutputs;

#[derive(Debug)]
pub struct ColumnBuilder {
    pub name: String,
    pub dtype: Option<DataType>,
    pub expr: Expr,
}

impl ColumnBuilder {
    fn from_config(config: &ColumnConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            dtype: config.dtype.as_deref().map(DataType::parse).transpose()?,
            expr: parse_expr(&config.expr)?,
        })
    }
}

#[derive(Debug)]
pub enum TransformerStep {
    Sql(SelectQuery),
    WithColumns(Vec<ColumnBuilder>),
    Function {
        name: String,
        call: Box<dyn FunctionCall>,
    },
}

impl TransformerStep {
    pub fn from_config(config: &TransformerStepConfig, registry: &FunctionRegistry) -> Result<Self> {
        match config {
            TransformerStepConfig::Sql { sql_expr } => Ok(TransformerStep::Sql(parse_query(sql_expr)?)),
            TransformerStepConfig::WithColumns { with_columns } => Ok(TransformerStep::WithColumns(
                with_columns
                    .iter()
                    .map(ColumnBuilder::from_config)
                    .collect::<Result<_>>()?,
            )),
            TransformerStepConfig::Function {
                func_name,
                func_kwargs,
            } => Ok(TransformerStep::Function {
                name: func_name.clone(),
                call: registry.build(func_name, func_kwargs)?,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            TransformerStep::Sql(_) => "sql",
            TransformerStep::WithColumns(_) => "with_columns",
            TransformerStep::Function { name, .. } => name,
        }
    }

    /// Columns this step creates or re-derives.
    pub fn derived_columns(&self) -> Vec<String> {
        match self {
            TransformerStep::Sql(query) => query
                .projections
                .iter()
                .filter_map(|p| match p {
                    Projection::Expr { alias: Some(a), .. } => Some(a.clone()),
                    _ => None,
                })
                .collect(),
            TransformerStep::WithColumns(columns) => columns.iter().map(|c| c.name.clone()).collect(),
            TransformerStep::Function { call, .. } => call.derived_columns(),
        }
    }

    fn apply(
        &self,
        df: DataFrame,
        backend: &dyn DataFrameBackend,
        upstream: &UpstreamOutputs,
    ) -> Result<DataFrame> {
        match self {
            TransformerStep::Sql(query) => backend.sql(&df, query),
            TransformerStep::WithColumns(columns) => {
                let mut df = df;
                for c in columns {
                    df = backend.with_column(&df, &c.name, &c.expr, c.dtype)?;
                }
                Ok(df)
            }
            TransformerStep::Function { call, .. } => call.apply(&df, upstream),
        }
    }
}

#[derive(Debug)]
pub struct TransformerChain {
    node: String,
    steps: Vec<TransformerStep>,
}

impl TransformerChain {
    /// Parse every step. A failing step is reported as a `TransformError`
    /// carrying its 0-based index.
    pub fn build(
        node: &str,
        steps: &[TransformerStepConfig],
        registry: &FunctionRegistry,
    ) -> Result<Self> {
        let steps = steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                TransformerStep::from_config(step, registry).map_err(|e| {
                    MedallionError::TransformError {
                        node: node.to_string(),
                        step: i,
                        message: e.to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            node: node.to_string(),
            steps,
        })
    }

    pub fn steps(&self) -> &[TransformerStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every column created or re-derived by some step, deduplicated.
    pub fn derived_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in self.steps.iter().flat_map(TransformerStep::derived_columns) {
            if !out.contains(&c) {
                out.push(c);
            }
        }
        out
    }

    /// Run the steps in order.
    pub fn apply(
        &self,
        df: DataFrame,
        backend: &dyn DataFrameBackend,
        upstream: &UpstreamOutputs,
    ) -> Result<DataFrame> {
        let mut df = df;
        for (i, step) in self.steps.iter().enumerate() {
            df = step
                .apply(df, backend, upstream)
                .map_err(|e| MedallionError::TransformError {
                    node: self.node.clone(),
                    step: i,
                    message: e.to_string(),
                })?;
            tracing::debug!(
                node = %self.node,
                step = i,
                kind = step.kind(),
                rows = df.num_rows(),
                "transformer step applied"
            );
        }
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::functions::default_registry;
    use serde_json::json;

    fn steps(value: serde_json::Value) -> Vec<TransformerStepConfig> {
        serde_json::from_value(value).unwrap()
    }

    fn raw() -> DataFrame {
        DataFrame::from_records(vec![
            json!({"data": {"symbol": "AAPL", "open": "5"}}),
            json!({"data": {"symbol": "MSFT", "open": "-1"}}),
        ])
        .unwrap()
    }

    #[test]
    fn chain_runs_steps_in_order() {
        let chain = TransformerChain::build(
            "slv",
            &steps(json!([
                {"with_columns": [
                    {"name": "symbol", "expr": "data.symbol"},
                    {"name": "open", "type": "double", "expr": "data.open"},
                    {"name": "open_x2", "expr": "open * 2"}
                ]},
                {"sql_expr": "SELECT symbol, open_x2 AS doubled FROM {df} WHERE open > 0"},
                {"func_name": "limit", "func_kwargs": {"n": 10}}
            ])),
            &default_registry(),
        )
        .unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.derived_columns(), vec!["symbol", "open", "open_x2", "doubled"]);

        let out = chain
            .apply(raw(), &LocalBackend::new(), &UpstreamOutputs::new())
            .unwrap();
        assert_eq!(out.to_records(), vec![json!({"symbol": "AAPL", "doubled": 10.0})]);
    }

    #[test]
    fn build_errors_carry_step_index() {
        let err = TransformerChain::build(
            "slv",
            &steps(json!([
                {"sql_expr": "SELECT * FROM {df}"},
                {"func_name": "no_such_function"}
            ])),
            &default_registry(),
        )
        .unwrap_err();
        match err {
            MedallionError::TransformError { node, step, message } => {
                assert_eq!(node, "slv");
                assert_eq!(step, 1);
                assert!(message.contains("no_such_function"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = TransformerChain::build(
            "slv",
            &steps(json!([{"with_columns": [{"name": "x", "type": "money", "expr": "1"}]}])),
            &default_registry(),
        )
        .unwrap_err();
        assert!(matches!(err, MedallionError::TransformError { step: 0, .. }));
    }

    #[test]
    fn evaluation_errors_surface_at_apply() {
        let chain = TransformerChain::build(
            "slv",
            &steps(json!([
                {"func_name": "limit", "func_kwargs": {"n": 5}},
                {"func_name": "select", "func_kwargs": {"columns": ["close"]}}
            ])),
            &default_registry(),
        )
        .unwrap();
        let err = chain
            .apply(raw(), &LocalBackend::new(), &UpstreamOutputs::new())
            .unwrap_err();
        assert!(matches!(err, MedallionError::TransformError { step: 1, .. }));
        assert_eq!(err.step(), Some(medallion_types::STEP_TRANSFORM));
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = TransformerChain::build("brz", &[], &default_registry()).unwrap();
        assert!(chain.is_empty());
        let out = chain
            .apply(raw(), &LocalBackend::new(), &UpstreamOutputs::new())
            .unwrap();
        assert_eq!(out, raw());
    }
}
