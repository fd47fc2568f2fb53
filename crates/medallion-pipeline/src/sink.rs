//! Node sinks: overwrite / append writes and key-based merges.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::{Map, Value};
use uuid::Uuid;

use medallion_expr::{parse_expr, total_cmp, DataFrame, Expr};
use medallion_types::{MedallionError, Result};

use crate::backend::{DataFrameBackend, Location};
use crate::config::{MergeOptions, ScdType, SinkConfig, WriteMode};

/// Parsed `merge_cdc_options`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSpec {
    pub primary_keys: Vec<String>,
    pub order_by: Option<String>,
    pub delete_where: Option<Expr>,
    pub include_columns: Option<Vec<String>>,
    pub exclude_columns: Option<Vec<String>>,
    pub ignore_null_updates: bool,
    pub scd_type: ScdType,
    pub start_at_column_name: String,
    pub end_at_column_name: String,
}

impl MergeSpec {
    fn from_options(options: &MergeOptions) -> Result<Self> {
        if options.primary_keys.is_empty() {
            return Err(MedallionError::ConfigError(
                "MERGE sinks require merge_cdc_options.primary_keys".into(),
            ));
        }
        if let Some(problem) = options.problems().into_iter().next() {
            return Err(MedallionError::ConfigError(problem));
        }
        let delete_where = options.delete_where.as_deref().map(parse_expr).transpose()?;
        Ok(Self {
            primary_keys: options.primary_keys.clone(),
            order_by: options.order_by.clone(),
            delete_where,
            include_columns: options.include_columns.clone(),
            exclude_columns: options.exclude_columns.clone(),
            ignore_null_updates: options.ignore_null_updates,
            scd_type: options.scd_type,
            start_at_column_name: options.start_at_column_name.clone(),
            end_at_column_name: options.end_at_column_name.clone(),
        })
    }

    fn updates_column(&self, column: &str) -> bool {
        if self.primary_keys.iter().any(|k| k == column) {
            return true;
        }
        let included = self
            .include_columns
            .as_ref()
            .map_or(true, |cols| cols.iter().any(|c| c == column));
        let excluded = self
            .exclude_columns
            .as_ref()
            .is_some_and(|cols| cols.iter().any(|c| c == column));
        included && !excluded
    }

    fn key(&self, record: &Map<String, Value>) -> String {
        let values: Vec<Value> = self
            .primary_keys
            .iter()
            .map(|k| record.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        Value::Array(values).to_string()
    }

    /// Merge `changes` into `target` according to the SCD type.
    ///
    /// Type 1 reduces changes to one row per key: the greatest `order_by`
    /// value, or the last row when no ordering column is set. Keys whose
    /// surviving change matches `delete_where` are removed from the target.
    ///
    /// Type 2 applies every change of a key in `order_by` order. A change
    /// closes the open version (null end column) at its order value and opens
    /// a new one, unless its tracked values equal the open version. A delete
    /// only closes the open version.
    pub fn merge(&self, target: &DataFrame, changes: &DataFrame) -> Result<DataFrame> {
        for key in &self.primary_keys {
            if !changes.has_column(key) {
                return Err(MedallionError::EvalError(format!(
                    "merge key column '{key}' not found"
                )));
            }
        }
        let deletes: Vec<bool> = match &self.delete_where {
            Some(expr) => changes
                .predicate(expr)?
                .into_iter()
                .map(|b| b == Some(true))
                .collect(),
            None => vec![false; changes.num_rows()],
        };
        let order: Option<Vec<Value>> = self
            .order_by
            .as_ref()
            .map(|c| changes.column_values(c))
            .transpose()?;
        let records = objects(changes.to_records());

        match self.scd_type {
            ScdType::Type1 => self.merge_type1(target, &records, &deletes, order.as_deref()),
            ScdType::Type2 => {
                let Some(order) = order else {
                    return Err(MedallionError::ConfigError(
                        "scd_type 2 requires merge_cdc_options.order_by".into(),
                    ));
                };
                self.merge_type2(target, &records, &deletes, &order)
            }
        }
    }

    fn merge_type1(
        &self,
        target: &DataFrame,
        records: &[Map<String, Value>],
        deletes: &[bool],
        order: Option<&[Value]>,
    ) -> Result<DataFrame> {
        // key -> latest change index; first-seen key order kept separately.
        let mut latest: HashMap<String, usize> = HashMap::new();
        let mut key_order: Vec<String> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let key = self.key(record);
            match latest.get(&key) {
                None => {
                    key_order.push(key.clone());
                    latest.insert(key, i);
                }
                Some(&prev) => {
                    let newer = match order {
                        Some(values) => total_cmp(&values[i], &values[prev]).is_ge(),
                        None => true,
                    };
                    if newer {
                        latest.insert(key, i);
                    }
                }
            }
        }

        let mut out: Vec<Value> = Vec::with_capacity(target.num_rows() + key_order.len());
        let mut applied: HashSet<String> = HashSet::new();
        for mut existing in objects(target.to_records()) {
            let key = self.key(&existing);
            let Some(&i) = latest.get(&key) else {
                out.push(Value::Object(existing));
                continue;
            };
            applied.insert(key);
            if deletes[i] {
                continue;
            }
            for (column, value) in &records[i] {
                if !self.updates_column(column) || (self.ignore_null_updates && value.is_null()) {
                    continue;
                }
                existing.insert(column.clone(), value.clone());
            }
            out.push(Value::Object(existing));
        }

        for key in key_order {
            if applied.contains(&key) {
                continue;
            }
            let i = latest[&key];
            if deletes[i] {
                continue;
            }
            let inserted: Map<String, Value> = records[i]
                .iter()
                .filter(|(column, _)| self.updates_column(column))
                .map(|(c, v)| (c.clone(), v.clone()))
                .collect();
            out.push(Value::Object(inserted));
        }

        DataFrame::from_records(out)
    }

    fn merge_type2(
        &self,
        target: &DataFrame,
        records: &[Map<String, Value>],
        deletes: &[bool],
        order: &[Value],
    ) -> Result<DataFrame> {
        let start_at = self.start_at_column_name.as_str();
        let end_at = self.end_at_column_name.as_str();

        let mut out = objects(target.to_records());
        let mut open: HashMap<String, usize> = HashMap::new();
        for (i, row) in out.iter().enumerate() {
            if row.get(end_at).map_or(true, Value::is_null) {
                open.insert(self.key(row), i);
            }
        }

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        let mut key_order: Vec<String> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let key = self.key(record);
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    key_order.push(key);
                    Vec::new()
                })
                .push(i);
        }

        for key in key_order {
            let mut versions = groups.remove(&key).unwrap_or_default();
            versions.sort_by(|a, b| total_cmp(&order[*a], &order[*b]));
            for i in versions {
                let at = order[i].clone();
                if deletes[i] {
                    if let Some(row) = open.remove(&key) {
                        out[row].insert(end_at.to_string(), at);
                    }
                    continue;
                }

                let mut version: Map<String, Value> = records[i]
                    .iter()
                    .filter(|(c, _)| self.updates_column(c) && *c != start_at && *c != end_at)
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect();
                if let Some(&row) = open.get(&key) {
                    if self.ignore_null_updates {
                        for (column, value) in version.iter_mut() {
                            if value.is_null() {
                                if let Some(previous) = out[row].get(column) {
                                    *value = previous.clone();
                                }
                            }
                        }
                    }
                    let unchanged = version
                        .iter()
                        .all(|(c, v)| out[row].get(c).unwrap_or(&Value::Null) == v);
                    if unchanged {
                        continue;
                    }
                    out[row].insert(end_at.to_string(), at.clone());
                }

                version.insert(start_at.to_string(), at);
                version.insert(end_at.to_string(), Value::Null);
                out.push(version);
                open.insert(key.clone(), out.len() - 1);
            }
        }

        DataFrame::from_records(out.into_iter().map(Value::Object))
    }
}

fn objects(records: Vec<Value>) -> Vec<Map<String, Value>> {
    records
        .into_iter()
        .filter_map(|r| match r {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSink {
    location: Location,
    mode: WriteMode,
    is_quarantine: bool,
    merge: Option<MergeSpec>,
    checkpoint_location: String,
    streaming: bool,
}

/// `<root>/<node>/checkpoints/sink-<id>`, with a stable id derived from the
/// sink target. Without a root the path is relative.
fn default_checkpoint(node: &str, location: &Location, root: Option<&Path>) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, location.to_string().as_bytes());
    let relative = Path::new(node)
        .join("checkpoints")
        .join(format!("sink-{id}"));
    match root {
        Some(root) => root.join(relative).display().to_string(),
        None => relative.display().to_string(),
    }
}

impl DataSink {
    pub fn from_config(
        node: &str,
        config: &SinkConfig,
        root: Option<&Path>,
        streaming: bool,
    ) -> Result<Self> {
        let location = match (&config.table_name, &config.path) {
            (Some(table), None) => Location::table(table),
            (None, Some(path)) => Location::file(path, config.format),
            (Some(_), Some(_)) => {
                return Err(MedallionError::ConfigError(format!(
                    "node '{node}': a sink takes either table_name or path, not both"
                )))
            }
            (None, None) => {
                return Err(MedallionError::ConfigError(format!(
                    "node '{node}': a sink requires table_name or path"
                )))
            }
        };

        let merge = match config.mode {
            WriteMode::Merge => {
                let options = config.merge_cdc_options.clone().unwrap_or_default();
                let spec = MergeSpec::from_options(&options).map_err(|e| match e {
                    MedallionError::ConfigError(msg) => {
                        MedallionError::ConfigError(format!("node '{node}': {msg}"))
                    }
                    other => other,
                })?;
                Some(spec)
            }
            _ => None,
        };

        let checkpoint_location = match &config.checkpoint_location {
            Some(path) => path.display().to_string(),
            None => default_checkpoint(node, &location, root),
        };

        Ok(Self {
            location,
            mode: config.mode,
            is_quarantine: config.is_quarantine,
            merge,
            checkpoint_location,
            streaming,
        })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn is_quarantine(&self) -> bool {
        self.is_quarantine
    }

    pub fn merge_spec(&self) -> Option<&MergeSpec> {
        self.merge.as_ref()
    }

    pub fn checkpoint_location(&self) -> &str {
        &self.checkpoint_location
    }

    /// Whether the sink is fed by a streaming source.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn describe(&self) -> String {
        self.location.to_string()
    }

    /// Write `df` for `node`. A full refresh replaces the target.
    pub async fn write(
        &self,
        node: &str,
        df: &DataFrame,
        backend: &dyn DataFrameBackend,
        full_refresh: bool,
    ) -> Result<()> {
        self.write_inner(df, backend, full_refresh)
            .await
            .map_err(|e| MedallionError::SinkWriteError {
                node: node.to_string(),
                sink: self.describe(),
                message: e.to_string(),
            })?;
        tracing::debug!(
            node,
            sink = %self.location,
            mode = %self.mode,
            rows = df.num_rows(),
            quarantine = self.is_quarantine,
            "sink written"
        );
        Ok(())
    }

    async fn write_inner(
        &self,
        df: &DataFrame,
        backend: &dyn DataFrameBackend,
        full_refresh: bool,
    ) -> Result<()> {
        match &self.merge {
            Some(spec) => {
                let target = if !full_refresh && backend.exists(&self.location).await? {
                    backend.read(&self.location, None).await?
                } else {
                    DataFrame::default()
                };
                let merged = spec.merge(&target, df)?;
                backend
                    .write(&self.location, &merged, WriteMode::Overwrite)
                    .await
            }
            None => {
                let mode = if full_refresh {
                    WriteMode::Overwrite
                } else {
                    self.mode
                };
                backend.write(&self.location, df, mode).await
            }
        }
    }

    /// Delete the sink's data and its checkpoint.
    pub async fn purge(&self, backend: &dyn DataFrameBackend) -> Result<()> {
        backend.purge(&self.location).await?;
        backend.reset_checkpoint(&self.checkpoint_location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use serde_json::json;

    fn sink(node: &str, value: Value) -> Result<DataSink> {
        let config: SinkConfig = serde_json::from_value(value).unwrap();
        DataSink::from_config(node, &config, Some(Path::new("/tmp/wh")), false)
    }

    fn frame(records: Vec<Value>) -> DataFrame {
        DataFrame::from_records(records).unwrap()
    }

    #[test]
    fn target_is_required_and_exclusive() {
        let err = sink("slv", json!({"mode": "APPEND"})).unwrap_err();
        assert!(err.is_config_error());
        let err = sink("slv", json!({"table_name": "t", "path": "/x.json"})).unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn merge_requires_primary_keys() {
        let err = sink("slv", json!({"table_name": "t", "mode": "MERGE"})).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("primary_keys"));
    }

    #[test]
    fn default_checkpoint_is_stable_per_target() {
        let a = sink("slv", json!({"table_name": "t"})).unwrap();
        let b = sink("slv", json!({"table_name": "t", "mode": "OVERWRITE"})).unwrap();
        let c = sink("slv", json!({"table_name": "u"})).unwrap();
        assert!(a.checkpoint_location().starts_with("/tmp/wh/slv/checkpoints/sink-"));
        assert_eq!(a.checkpoint_location(), b.checkpoint_location());
        assert_ne!(a.checkpoint_location(), c.checkpoint_location());

        let explicit = sink("slv", json!({"table_name": "t", "checkpoint_location": "/cp"})).unwrap();
        assert_eq!(explicit.checkpoint_location(), "/cp");
    }

    #[tokio::test]
    async fn full_refresh_overwrites_append_sink() {
        let backend = LocalBackend::new();
        let s = sink("slv", json!({"table_name": "t"})).unwrap();
        let df = frame(vec![json!({"a": 1})]);

        s.write("slv", &df, &backend, false).await.unwrap();
        s.write("slv", &df, &backend, false).await.unwrap();
        assert_eq!(backend.table("t").await.unwrap().unwrap().num_rows(), 2);

        s.write("slv", &df, &backend, true).await.unwrap();
        assert_eq!(backend.table("t").await.unwrap().unwrap().num_rows(), 1);
    }

    #[tokio::test]
    async fn write_failure_is_sink_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let s = sink(
            "gld",
            json!({"path": blocker.join("out.jsonl").display().to_string()}),
        )
        .unwrap();

        let err = s
            .write("gld", &frame(vec![json!({"a": 1})]), &LocalBackend::new(), false)
            .await
            .unwrap_err();
        match err {
            MedallionError::SinkWriteError { node, sink, .. } => {
                assert_eq!(node, "gld");
                assert!(sink.ends_with("out.jsonl"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn merge_upserts_by_key() {
        let backend = LocalBackend::new();
        let s = sink(
            "slv",
            json!({
                "table_name": "quotes",
                "mode": "MERGE",
                "merge_cdc_options": {"primary_keys": ["symbol"], "order_by": "ts"}
            }),
        )
        .unwrap();

        s.write(
            "slv",
            &frame(vec![
                json!({"symbol": "AAPL", "ts": 1, "price": 10}),
                json!({"symbol": "MSFT", "ts": 1, "price": 20}),
            ]),
            &backend,
            false,
        )
        .await
        .unwrap();
        s.write(
            "slv",
            &frame(vec![
                json!({"symbol": "AAPL", "ts": 3, "price": 12}),
                json!({"symbol": "AAPL", "ts": 2, "price": 11}),
                json!({"symbol": "GOOG", "ts": 1, "price": 30}),
            ]),
            &backend,
            false,
        )
        .await
        .unwrap();

        let table = backend.table("quotes").await.unwrap().unwrap();
        assert_eq!(
            table.to_records(),
            vec![
                json!({"symbol": "AAPL", "ts": 3, "price": 12}),
                json!({"symbol": "MSFT", "ts": 1, "price": 20}),
                json!({"symbol": "GOOG", "ts": 1, "price": 30}),
            ]
        );
    }

    #[test]
    fn merge_deletes_and_column_filters() {
        let spec = MergeSpec::from_options(&MergeOptions {
            primary_keys: vec!["id".into()],
            delete_where: Some("op = 'D'".into()),
            exclude_columns: Some(vec!["op".into()]),
            ignore_null_updates: true,
            ..MergeOptions::default()
        })
        .unwrap();
        let target = frame(vec![
            json!({"id": 1, "name": "a", "score": 1}),
            json!({"id": 2, "name": "b", "score": 2}),
        ]);
        let changes = frame(vec![
            json!({"id": 1, "name": null, "score": 5, "op": "U"}),
            json!({"id": 2, "name": "b", "score": 2, "op": "D"}),
            json!({"id": 3, "name": "c", "score": 3, "op": "I"}),
        ]);

        let merged = spec.merge(&target, &changes).unwrap();
        assert_eq!(
            merged.to_records(),
            vec![
                json!({"id": 1, "name": "a", "score": 5}),
                json!({"id": 3, "name": "c", "score": 3}),
            ]
        );
    }

    #[test]
    fn merge_rejects_inconsistent_options() {
        let err = sink(
            "slv",
            json!({
                "table_name": "t",
                "mode": "MERGE",
                "merge_cdc_options": {"primary_keys": ["id"], "scd_type": 2}
            }),
        )
        .unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("node 'slv'"));
        assert!(err.to_string().contains("order_by"));

        let err = sink(
            "slv",
            json!({
                "table_name": "t",
                "mode": "MERGE",
                "merge_cdc_options": {
                    "primary_keys": ["id"],
                    "include_columns": ["a"],
                    "exclude_columns": ["b"]
                }
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn scd2_merge_keeps_history() {
        let spec = MergeSpec::from_options(&MergeOptions {
            primary_keys: vec!["id".into()],
            order_by: Some("ts".into()),
            delete_where: Some("op = 'D'".into()),
            exclude_columns: Some(vec!["op".into()]),
            scd_type: ScdType::Type2,
            ..MergeOptions::default()
        })
        .unwrap();

        let first = spec
            .merge(
                &DataFrame::default(),
                &frame(vec![
                    json!({"id": 1, "name": "a", "ts": 1, "op": "I"}),
                    json!({"id": 2, "name": "x", "ts": 1, "op": "I"}),
                ]),
            )
            .unwrap();
        assert_eq!(
            first.to_records(),
            vec![
                json!({"id": 1, "name": "a", "ts": 1, "__start_at": 1, "__end_at": null}),
                json!({"id": 2, "name": "x", "ts": 1, "__start_at": 1, "__end_at": null}),
            ]
        );

        let second = spec
            .merge(
                &first,
                &frame(vec![
                    json!({"id": 1, "name": "c", "ts": 3, "op": "U"}),
                    json!({"id": 1, "name": "b", "ts": 2, "op": "U"}),
                    json!({"id": 1, "name": "b", "ts": 2, "op": "U"}),
                    json!({"id": 2, "name": "x", "ts": 4, "op": "D"}),
                ]),
            )
            .unwrap();
        assert_eq!(
            second.to_records(),
            vec![
                json!({"id": 1, "name": "a", "ts": 1, "__start_at": 1, "__end_at": 2}),
                json!({"id": 2, "name": "x", "ts": 1, "__start_at": 1, "__end_at": 4}),
                json!({"id": 1, "name": "b", "ts": 2, "__start_at": 2, "__end_at": 3}),
                json!({"id": 1, "name": "c", "ts": 3, "__start_at": 3, "__end_at": null}),
            ]
        );
    }

    #[test]
    fn scd2_null_updates_reuse_open_version() {
        let spec = MergeSpec::from_options(&MergeOptions {
            primary_keys: vec!["id".into()],
            order_by: Some("ts".into()),
            ignore_null_updates: true,
            scd_type: ScdType::Type2,
            start_at_column_name: "valid_from".into(),
            end_at_column_name: "valid_to".into(),
            ..MergeOptions::default()
        })
        .unwrap();
        let target = frame(vec![json!({
            "id": 1, "name": "a", "score": 1, "ts": 1, "valid_from": 1, "valid_to": null
        })]);
        let merged = spec
            .merge(&target, &frame(vec![json!({"id": 1, "name": null, "score": 2, "ts": 5})]))
            .unwrap();
        assert_eq!(
            merged.to_records(),
            vec![
                json!({"id": 1, "name": "a", "score": 1, "ts": 1, "valid_from": 1, "valid_to": 5}),
                json!({"id": 1, "name": "a", "score": 2, "ts": 5, "valid_from": 5, "valid_to": null}),
            ]
        );
    }

    #[test]
    fn merge_missing_key_column_is_an_error() {
        let spec = MergeSpec::from_options(&MergeOptions {
            primary_keys: vec!["id".into()],
            ..MergeOptions::default()
        })
        .unwrap();
        let err = spec
            .merge(&DataFrame::default(), &frame(vec![json!({"x": 1})]))
            .unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }
}
