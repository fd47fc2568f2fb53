//! Pipeline configuration document: serde models, loading, and variable expansion.
//!
//! Documents are YAML or JSON. Either a mapping with `nodes` plus optional
//! pipeline settings, or a bare list of node specifications. `${vars.NAME}` and
//! `${env.NAME}` placeholders in string values are expanded before the document
//! is deserialized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use medallion_expr::{AggFunc, JoinHow};
use medallion_types::{ExecutionMode, MedallionError, Result};

use crate::backend::BackendKind;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub backend: BackendKind,
    /// Root for derived checkpoint locations and the local table warehouse.
    #[serde(default)]
    pub root_path: Option<PathBuf>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub layer: Option<Layer>,
    pub source: SourceConfig,
    #[serde(default, alias = "transformers")]
    pub transformer: Vec<TransformerStepConfig>,
    #[serde(default)]
    pub expectations: Vec<ExpectationConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub drop_source_columns: bool,
}

/// Descriptive layer tag; it has no effect on execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    #[serde(alias = "bronze")]
    Bronze,
    #[serde(alias = "silver")]
    Silver,
    #[serde(alias = "gold")]
    Gold,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// One JSON array (or a single object) per file.
    Json,
    /// One JSON object per line.
    #[serde(alias = "jsonl", alias = "ndjson")]
    JsonLines,
}

impl FileFormat {
    /// Format implied by a path's extension; anything but `.json` is JSON lines.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::JsonLines,
        }
    }
}

/// Reference to the output of another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRef {
    pub node_name: String,
    #[serde(default)]
    pub as_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<FileFormat>,
    #[serde(default)]
    pub as_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSourceConfig {
    pub table_name: String,
    #[serde(default)]
    pub as_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceConfig {
    Node(NodeRef),
    File(FileSourceConfig),
    Table(TableSourceConfig),
}

impl SourceConfig {
    pub fn as_stream(&self) -> bool {
        match self {
            SourceConfig::Node(r) => r.as_stream,
            SourceConfig::File(f) => f.as_stream,
            SourceConfig::Table(t) => t.as_stream,
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        match self {
            SourceConfig::Node(r) => Some(&r.node_name),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transformer steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub dtype: Option<String>,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformerStepConfig {
    Sql {
        sql_expr: String,
    },
    WithColumns {
        with_columns: Vec<ColumnConfig>,
    },
    Function {
        func_name: String,
        #[serde(default)]
        func_kwargs: Map<String, Value>,
    },
}

// ---------------------------------------------------------------------------
// Expectations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectationAction {
    /// Count failing rows, keep them.
    #[default]
    #[serde(alias = "warn")]
    Warn,
    #[serde(alias = "drop")]
    Drop,
    #[serde(alias = "quarantine")]
    Quarantine,
    #[serde(alias = "fail")]
    Fail,
}

impl std::fmt::Display for ExpectationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectationAction::Warn => write!(f, "WARN"),
            ExpectationAction::Drop => write!(f, "DROP"),
            ExpectationAction::Quarantine => write!(f, "QUARANTINE"),
            ExpectationAction::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectationConfig {
    pub name: String,
    pub expr: String,
    #[serde(default)]
    pub action: ExpectationAction,
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteMode {
    #[serde(alias = "overwrite")]
    Overwrite,
    #[default]
    #[serde(alias = "append")]
    Append,
    #[serde(alias = "merge")]
    Merge,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Overwrite => write!(f, "OVERWRITE"),
            WriteMode::Append => write!(f, "APPEND"),
            WriteMode::Merge => write!(f, "MERGE"),
        }
    }
}

/// Slowly changing dimension type of a `MERGE` sink.
///
/// Type 1 updates rows in place. Type 2 keeps every version of a key, bounded
/// by start and end columns; the open version has a null end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ScdType {
    #[default]
    Type1,
    Type2,
}

impl TryFrom<u8> for ScdType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ScdType::Type1),
            2 => Ok(ScdType::Type2),
            other => Err(format!("unsupported scd_type {other}, expected 1 or 2")),
        }
    }
}

impl From<ScdType> for u8 {
    fn from(value: ScdType) -> Self {
        match value {
            ScdType::Type1 => 1,
            ScdType::Type2 => 2,
        }
    }
}

fn default_start_at() -> String {
    "__start_at".to_string()
}

fn default_end_at() -> String {
    "__end_at".to_string()
}

/// Change-data-capture options for `MERGE` sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeOptions {
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Column ordering changes for the same key; the greatest value wins.
    #[serde(default)]
    pub order_by: Option<String>,
    /// Rows matching this predicate delete their key from the target.
    #[serde(default)]
    pub delete_where: Option<String>,
    #[serde(default)]
    pub include_columns: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_columns: Option<Vec<String>>,
    /// Null source values leave the target value unchanged.
    #[serde(default)]
    pub ignore_null_updates: bool,
    #[serde(default)]
    pub scd_type: ScdType,
    #[serde(default = "default_start_at")]
    pub start_at_column_name: String,
    #[serde(default = "default_end_at")]
    pub end_at_column_name: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            primary_keys: Vec::new(),
            order_by: None,
            delete_where: None,
            include_columns: None,
            exclude_columns: None,
            ignore_null_updates: false,
            scd_type: ScdType::Type1,
            start_at_column_name: default_start_at(),
            end_at_column_name: default_end_at(),
        }
    }
}

impl MergeOptions {
    /// Inconsistent option combinations, other than missing primary keys.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.scd_type == ScdType::Type2 && self.order_by.is_none() {
            out.push("scd_type 2 requires merge_cdc_options.order_by".to_string());
        }
        if self.include_columns.is_some() && self.exclude_columns.is_some() {
            out.push("include_columns and exclude_columns are mutually exclusive".to_string());
        }
        if let (Some(order_by), Some(excluded)) = (&self.order_by, &self.exclude_columns) {
            if excluded.contains(order_by) {
                out.push(format!("order_by column '{order_by}' cannot be in exclude_columns"));
            }
        }
        if self.scd_type == ScdType::Type2 && self.start_at_column_name == self.end_at_column_name {
            out.push(format!(
                "start_at_column_name and end_at_column_name are both '{}'",
                self.end_at_column_name
            ));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub format: Option<FileFormat>,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub is_quarantine: bool,
    #[serde(default)]
    pub merge_cdc_options: Option<MergeOptions>,
    #[serde(default)]
    pub checkpoint_location: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Function keyword arguments shared with validation
// ---------------------------------------------------------------------------

/// Accepts either a single value or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v),
            OneOrMany::Many(v) => v,
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggConfig {
    pub name: String,
    pub func: AggFunc,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinKwargs {
    pub other: NodeRef,
    pub on: OneOrMany<String>,
    #[serde(default)]
    pub how: JoinHow,
}

fn collect_node_refs(value: &Value, out: &mut Vec<NodeRef>) {
    match value {
        Value::Object(map) => {
            if map.get("node_name").is_some_and(Value::is_string) {
                if let Ok(r) = serde_json::from_value::<NodeRef>(value.clone()) {
                    out.push(r);
                    return;
                }
            }
            for v in map.values() {
                collect_node_refs(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_node_refs(v, out);
            }
        }
        _ => {}
    }
}

impl NodeConfig {
    /// Every node reference: the source first, then references found in
    /// function kwargs (any `{node_name: ...}` object), in order.
    pub fn node_refs(&self) -> Vec<NodeRef> {
        let mut refs = Vec::new();
        if let SourceConfig::Node(r) = &self.source {
            refs.push(r.clone());
        }
        for step in &self.transformer {
            if let TransformerStepConfig::Function { func_kwargs, .. } = step {
                for v in func_kwargs.values() {
                    collect_node_refs(v, &mut refs);
                }
            }
        }
        refs
    }

    /// Names of the nodes this node depends on, deduplicated, in reference order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        for r in self.node_refs() {
            if !deps.contains(&r.node_name) {
                deps.push(r.node_name);
            }
        }
        deps
    }

    pub fn has_quarantine_expectations(&self) -> bool {
        self.expectations
            .iter()
            .any(|e| e.action == ExpectationAction::Quarantine)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{(vars|env)\.([A-Za-z_][A-Za-z0-9_]*)\}")
            .expect("placeholder pattern is a valid regex")
    })
}

fn lookup_placeholder(kind: &str, key: &str, vars: &HashMap<String, Value>) -> Option<Value> {
    match kind {
        "vars" => vars.get(key).cloned(),
        "env" => std::env::var(key).ok().map(Value::String),
        _ => None,
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand `${vars.NAME}` and `${env.NAME}` placeholders in a string.
///
/// Placeholders that cannot be resolved are left as-is.
pub fn expand_variables(template: &str, vars: &HashMap<String, Value>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match lookup_placeholder(&caps[1], &caps[2], vars) {
                Some(v) => scalar_to_string(&v),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Expand placeholders in every string of a document. A string that is exactly
/// one `${vars.NAME}` placeholder takes the variable's value with its type.
fn expand_value(value: &mut Value, vars: &HashMap<String, Value>) {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder_regex().captures(s) {
                if caps[0].len() == s.len() {
                    if let Some(v) = lookup_placeholder(&caps[1], &caps[2], vars) {
                        *value = v;
                        return;
                    }
                }
            }
            let expanded = expand_variables(s, vars);
            if expanded != *s {
                *s = expanded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| expand_value(v, vars)),
        Value::Object(map) => map.values_mut().for_each(|v| expand_value(v, vars)),
        _ => {}
    }
}

fn config_error(message: impl std::fmt::Display) -> MedallionError {
    MedallionError::ConfigError(format!("invalid pipeline document: {message}"))
}

impl PipelineConfig {
    /// Build a config from a parsed document, expanding variables first.
    pub fn from_value(document: Value) -> Result<Self> {
        let mut document = match document {
            Value::Array(nodes) => {
                let mut map = Map::new();
                map.insert("nodes".into(), Value::Array(nodes));
                Value::Object(map)
            }
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(config_error(format!(
                    "expected a mapping or a list of nodes, got {other}"
                )))
            }
        };

        let vars: HashMap<String, Value> = match document.get("variables") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(Value::Null) | None => HashMap::new(),
            Some(other) => {
                return Err(config_error(format!(
                    "'variables' must be a mapping, got {other}"
                )))
            }
        };
        expand_value(&mut document, &vars);

        serde_json::from_value(document).map_err(config_error)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(source).map_err(config_error)?;
        Self::from_value(document)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(source).map_err(config_error)?;
        Self::from_value(document)
    }

    /// Load a document, choosing JSON or YAML by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&source)?
        } else {
            Self::from_yaml_str(&source)?
        };
        tracing::debug!(path = %path.display(), nodes = config.nodes.len(), "loaded pipeline config");
        Ok(config)
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STOCKS: &str = r#"
name: stocks
mode: batch
root_path: /tmp/medallion
variables:
  env_name: dev
nodes:
  - name: brz_stock_prices
    layer: BRONZE
    source:
      path: ./data/${vars.env_name}/stock_prices
      format: jsonl
    sinks:
      - table_name: brz_stock_prices
        mode: APPEND
  - name: slv_stock_prices
    layer: SILVER
    source:
      node_name: brz_stock_prices
    drop_source_columns: true
    transformer:
      - with_columns:
          - name: symbol
            expr: data.symbol
          - name: open
            type: double
            expr: data.open
      - func_name: drop_duplicates
        func_kwargs:
          subset: [symbol]
    expectations:
      - name: positive_price
        expr: open > 0
        action: DROP
    sinks:
      - table_name: slv_stock_prices
        mode: OVERWRITE
"#;

    #[test]
    fn parse_yaml_document() {
        let config = PipelineConfig::from_yaml_str(STOCKS).unwrap();
        assert_eq!(config.name, "stocks");
        assert_eq!(config.mode, ExecutionMode::Batch);
        assert_eq!(config.nodes.len(), 2);

        let brz = &config.nodes[0];
        assert_eq!(brz.layer, Some(Layer::Bronze));
        match &brz.source {
            SourceConfig::File(f) => {
                assert_eq!(f.path, PathBuf::from("./data/dev/stock_prices"));
                assert_eq!(f.format, Some(FileFormat::JsonLines));
            }
            other => panic!("expected file source, got {other:?}"),
        }

        let slv = &config.nodes[1];
        assert!(slv.drop_source_columns);
        assert_eq!(slv.dependencies(), vec!["brz_stock_prices".to_string()]);
        assert_eq!(slv.transformer.len(), 2);
        assert!(matches!(
            slv.transformer[1],
            TransformerStepConfig::Function { ref func_name, .. } if func_name == "drop_duplicates"
        ));
        assert_eq!(slv.expectations[0].action, ExpectationAction::Drop);
        assert_eq!(slv.sinks[0].mode, WriteMode::Overwrite);
    }

    #[test]
    fn bare_node_list_is_accepted() {
        let config = PipelineConfig::from_json_str(
            r#"[{"name": "a", "source": {"table_name": "raw"}}]"#,
        )
        .unwrap();
        assert_eq!(config.name, "pipeline");
        assert!(matches!(config.nodes[0].source, SourceConfig::Table(_)));
        assert_eq!(config.nodes[0].expectations.len(), 0);
    }

    #[test]
    fn unknown_node_field_is_a_config_error() {
        let err = PipelineConfig::from_json_str(
            r#"[{"name": "a", "source": {"table_name": "raw"}, "sinkz": []}]"#,
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn whole_placeholder_keeps_variable_type() {
        let config = PipelineConfig::from_value(json!({
            "variables": {"stream": true},
            "nodes": [{"name": "a", "source": {"table_name": "raw", "as_stream": "${vars.stream}"}}]
        }))
        .unwrap();
        assert!(config.nodes[0].source.as_stream());
    }

    #[test]
    fn expand_env_and_unknown_placeholders() {
        std::env::set_var("MEDALLION_TEST_CATALOG", "prod");
        let vars = HashMap::new();
        assert_eq!(
            expand_variables("${env.MEDALLION_TEST_CATALOG}.prices", &vars),
            "prod.prices"
        );
        assert_eq!(expand_variables("${vars.missing}", &vars), "${vars.missing}");
    }

    #[test]
    fn node_refs_found_in_function_kwargs() {
        let node: NodeConfig = serde_json::from_value(json!({
            "name": "gld",
            "source": {"node_name": "slv"},
            "transformer": [
                {"func_name": "join", "func_kwargs": {"other": {"node_name": "meta"}, "on": "symbol"}},
                {"func_name": "union", "func_kwargs": {"others": [{"node_name": "slv", "as_stream": true}]}}
            ]
        }))
        .unwrap();
        assert_eq!(node.dependencies(), vec!["slv".to_string(), "meta".to_string()]);
        assert_eq!(node.node_refs().len(), 3);
    }

    #[test]
    fn sink_defaults() {
        let sink: SinkConfig = serde_json::from_value(json!({"table_name": "t"})).unwrap();
        assert_eq!(sink.mode, WriteMode::Append);
        assert!(!sink.is_quarantine);
        let exp: ExpectationConfig =
            serde_json::from_value(json!({"name": "e", "expr": "x > 0"})).unwrap();
        assert_eq!(exp.action, ExpectationAction::Warn);
    }

    #[test]
    fn malformed_documents_are_config_errors() {
        let err = PipelineConfig::from_json_str("{").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("invalid pipeline document"));

        let err = PipelineConfig::from_yaml_str("nodes: [").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn merge_options_scd2_and_defaults() {
        let options: MergeOptions = serde_json::from_value(json!({
            "primary_keys": ["symbol"],
            "order_by": "ts",
            "scd_type": 2
        }))
        .unwrap();
        assert_eq!(options.scd_type, ScdType::Type2);
        assert_eq!(options.start_at_column_name, "__start_at");
        assert_eq!(options.end_at_column_name, "__end_at");
        assert!(options.problems().is_empty());
        assert_eq!(MergeOptions::default().scd_type, ScdType::Type1);

        assert!(serde_json::from_value::<MergeOptions>(json!({"scd_type": 3})).is_err());
    }

    #[test]
    fn merge_option_conflicts_are_listed() {
        let options = MergeOptions {
            primary_keys: vec!["id".into()],
            order_by: Some("ts".into()),
            include_columns: Some(vec!["a".into()]),
            exclude_columns: Some(vec!["ts".into()]),
            ..MergeOptions::default()
        };
        let problems = options.problems();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("mutually exclusive"));
        assert!(problems[1].contains("'ts'"));

        let scd2 = MergeOptions {
            primary_keys: vec!["id".into()],
            scd_type: ScdType::Type2,
            ..MergeOptions::default()
        };
        assert!(scd2.problems()[0].contains("order_by"));
    }

    #[test]
    fn file_format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a/b.json")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("a/b.jsonl")), FileFormat::JsonLines);
        assert_eq!(FileFormat::from_path(Path::new("a/dir")), FileFormat::JsonLines);
    }
}
