//! Named dataframe functions usable as `{func_name, func_kwargs}` transformer steps.
//!
//! Each [`TransformFunction`] validates its keyword arguments once, when the
//! chain is built, and returns a [`FunctionCall`] that is applied per run.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use medallion_expr::{parse_expr, Aggregation, DataFrame, Expr, SortKey};
use medallion_types::{MedallionError, Result};

use crate::config::{AggConfig, JoinKwargs, NodeRef, OneOrMany};
use crate::node::UpstreamOutputs;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait TransformFunction: Send + Sync {
    fn name(&self) -> &str;

    /// Validate keyword arguments and prepare the call.
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>>;
}

pub trait FunctionCall: Send + Sync + std::fmt::Debug {
    fn apply(&self, df: &DataFrame, upstream: &UpstreamOutputs) -> Result<DataFrame>;

    /// Output columns this call creates or re-derives.
    fn derived_columns(&self) -> Vec<String> {
        Vec::new()
    }
}

fn parse_kwargs<T: DeserializeOwned>(function: &str, kwargs: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(kwargs.clone())).map_err(|e| {
        MedallionError::ConfigError(format!("invalid kwargs for function '{function}': {e}"))
    })
}

fn boxed<T>(function: &str, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>>
where
    T: FunctionCall + DeserializeOwned + 'static,
{
    Ok(Box::new(parse_kwargs::<T>(function, kwargs)?))
}

fn upstream_frame<'a>(upstream: &'a UpstreamOutputs, r: &NodeRef) -> Result<&'a DataFrame> {
    upstream.get(&r.node_name, r.as_stream).ok_or_else(|| {
        MedallionError::EvalError(format!("output of node '{}' is not available", r.node_name))
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct FunctionRegistry {
    functions: HashMap<String, Box<dyn TransformFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register(&mut self, function: impl TransformFunction + 'static) {
        self.functions
            .insert(function.name().to_string(), Box::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&dyn TransformFunction> {
        self.functions.get(name).map(|f| f.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn build(&self, name: &str, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        let function = self.get(name).ok_or_else(|| {
            MedallionError::ConfigError(format!(
                "unknown transformer function '{name}' (available: {})",
                self.names().join(", ")
            ))
        })?;
        function.build(kwargs)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Registry with every built-in function.
pub fn default_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register(DropDuplicates);
    registry.register(Select);
    registry.register(DropColumns);
    registry.register(Rename);
    registry.register(Filter);
    registry.register(Join);
    registry.register(Union);
    registry.register(GroupByAndAgg);
    registry.register(Limit);
    registry.register(Sort);
    registry
}

// ---------------------------------------------------------------------------
// Column selection
// ---------------------------------------------------------------------------

pub struct DropDuplicates;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DropDuplicatesCall {
    #[serde(default)]
    subset: Option<OneOrMany<String>>,
}

impl TransformFunction for DropDuplicates {
    fn name(&self) -> &str {
        "drop_duplicates"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<DropDuplicatesCall>(self.name(), kwargs)
    }
}

impl FunctionCall for DropDuplicatesCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        df.distinct(self.subset.as_ref().map(OneOrMany::as_slice))
    }
}

pub struct Select;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectCall {
    columns: OneOrMany<String>,
}

impl TransformFunction for Select {
    fn name(&self) -> &str {
        "select"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<SelectCall>(self.name(), kwargs)
    }
}

impl FunctionCall for SelectCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        df.select(self.columns.as_slice())
    }
}

pub struct DropColumns;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DropCall {
    columns: OneOrMany<String>,
}

impl TransformFunction for DropColumns {
    fn name(&self) -> &str {
        "drop"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<DropCall>(self.name(), kwargs)
    }
}

impl FunctionCall for DropCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        Ok(df.drop_columns(self.columns.as_slice()))
    }
}

pub struct Rename;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameCall {
    /// old name -> new name
    columns: BTreeMap<String, String>,
}

impl TransformFunction for Rename {
    fn name(&self) -> &str {
        "rename"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<RenameCall>(self.name(), kwargs)
    }
}

impl FunctionCall for RenameCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        let mapping: Vec<(String, String)> = self
            .columns
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        df.rename(&mapping)
    }

    fn derived_columns(&self) -> Vec<String> {
        self.columns.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Row selection
// ---------------------------------------------------------------------------

pub struct Filter;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterKwargs {
    expr: String,
}

#[derive(Debug)]
struct FilterCall {
    expr: Expr,
}

impl TransformFunction for Filter {
    fn name(&self) -> &str {
        "filter"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        let kwargs: FilterKwargs = parse_kwargs(self.name(), kwargs)?;
        Ok(Box::new(FilterCall {
            expr: parse_expr(&kwargs.expr)?,
        }))
    }
}

impl FunctionCall for FilterCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        df.filter(&self.expr)
    }
}

pub struct Limit;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitCall {
    n: usize,
}

impl TransformFunction for Limit {
    fn name(&self) -> &str {
        "limit"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<LimitCall>(self.name(), kwargs)
    }
}

impl FunctionCall for LimitCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        Ok(df.limit(self.n))
    }
}

pub struct Sort;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SortCall {
    by: OneOrMany<String>,
    #[serde(default)]
    descending: bool,
}

impl TransformFunction for Sort {
    fn name(&self) -> &str {
        "sort"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<SortCall>(self.name(), kwargs)
    }
}

impl FunctionCall for SortCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        let keys: Vec<SortKey> = self
            .by
            .as_slice()
            .iter()
            .map(|c| SortKey {
                column: c.clone(),
                descending: self.descending,
            })
            .collect();
        df.sort(&keys)
    }
}

// ---------------------------------------------------------------------------
// Combining nodes
// ---------------------------------------------------------------------------

pub struct Join;

#[derive(Debug)]
struct JoinCall(JoinKwargs);

impl TransformFunction for Join {
    fn name(&self) -> &str {
        "join"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        let kwargs: JoinKwargs = parse_kwargs(self.name(), kwargs)?;
        if kwargs.on.as_slice().is_empty() {
            return Err(MedallionError::ConfigError(
                "invalid kwargs for function 'join': 'on' must name at least one column".into(),
            ));
        }
        Ok(Box::new(JoinCall(kwargs)))
    }
}

impl FunctionCall for JoinCall {
    fn apply(&self, df: &DataFrame, upstream: &UpstreamOutputs) -> Result<DataFrame> {
        let other = upstream_frame(upstream, &self.0.other)?;
        df.join(other, self.0.on.as_slice(), self.0.how)
    }

    fn derived_columns(&self) -> Vec<String> {
        self.0.on.as_slice().to_vec()
    }
}

pub struct Union;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnionCall {
    others: OneOrMany<NodeRef>,
}

impl TransformFunction for Union {
    fn name(&self) -> &str {
        "union"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        boxed::<UnionCall>(self.name(), kwargs)
    }
}

impl FunctionCall for UnionCall {
    fn apply(&self, df: &DataFrame, upstream: &UpstreamOutputs) -> Result<DataFrame> {
        let mut out = df.clone();
        for r in self.others.as_slice() {
            out = out.union_by_name(upstream_frame(upstream, r)?);
        }
        Ok(out)
    }
}

pub struct GroupByAndAgg;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupByAndAggCall {
    #[serde(default = "no_columns")]
    groupby_columns: OneOrMany<String>,
    #[serde(alias = "agg_expressions")]
    aggs: Vec<AggConfig>,
}

fn no_columns() -> OneOrMany<String> {
    OneOrMany::Many(Vec::new())
}

impl TransformFunction for GroupByAndAgg {
    fn name(&self) -> &str {
        "groupby_and_agg"
    }
    fn build(&self, kwargs: &Map<String, Value>) -> Result<Box<dyn FunctionCall>> {
        let call: GroupByAndAggCall = parse_kwargs(self.name(), kwargs)?;
        if call.aggs.is_empty() {
            return Err(MedallionError::ConfigError(
                "invalid kwargs for function 'groupby_and_agg': 'aggs' must not be empty".into(),
            ));
        }
        Ok(Box::new(call))
    }
}

impl FunctionCall for GroupByAndAggCall {
    fn apply(&self, df: &DataFrame, _upstream: &UpstreamOutputs) -> Result<DataFrame> {
        let aggs: Vec<Aggregation> = self
            .aggs
            .iter()
            .map(|a| Aggregation {
                column: a.column.clone(),
                func: a.func,
                alias: a.name.clone(),
            })
            .collect();
        df.group_by(self.groupby_columns.as_slice(), &aggs)
    }

    fn derived_columns(&self) -> Vec<String> {
        self.groupby_columns
            .as_slice()
            .iter()
            .cloned()
            .chain(self.aggs.iter().map(|a| a.name.clone()))
            .collect()
    }
}
