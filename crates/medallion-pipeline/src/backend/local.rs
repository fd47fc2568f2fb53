use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use medallion_expr::DataFrame;
use medallion_types::{MedallionError, Result};

use super::{BackendKind, DataFrameBackend, Location};
use crate::config::{FileFormat, WriteMode};

const OFFSETS_FILE: &str = "offsets.json";

/// Offsets for one checkpoint, keyed by source location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointState {
    committed: BTreeMap<String, usize>,
    #[serde(skip)]
    pending: BTreeMap<String, usize>,
}

/// Single-process backend over in-memory tables and JSON / JSON-lines files.
///
/// Without a warehouse, tables and checkpoints live in memory for the lifetime
/// of the backend. With a warehouse, tables are stored as
/// `<warehouse>/tables/<name>.jsonl` and committed offsets as
/// `<checkpoint>/offsets.json`, so incremental reads resume across processes.
#[derive(Debug, Default)]
pub struct LocalBackend {
    warehouse: Option<PathBuf>,
    tables: RwLock<HashMap<String, DataFrame>>,
    checkpoints: RwLock<HashMap<String, CheckpointState>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warehouse(root: impl Into<PathBuf>) -> Self {
        Self {
            warehouse: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn warehouse(&self) -> Option<&Path> {
        self.warehouse.as_deref()
    }

    /// Create or replace a table.
    pub async fn register_table(&self, name: &str, df: DataFrame) -> Result<()> {
        self.write(&Location::table(name), &df, WriteMode::Overwrite)
            .await
    }

    /// Current contents of a table, if it exists.
    pub async fn table(&self, name: &str) -> Result<Option<DataFrame>> {
        let location = Location::table(name);
        if !self.exists(&location).await? {
            return Ok(None);
        }
        self.load(&location).await.map(Some)
    }

    /// Committed offset of `location` under `checkpoint` (0 when none).
    pub async fn committed_offset(&self, checkpoint: &str, location: &Location) -> Result<usize> {
        let mut checkpoints = self.checkpoints.write().await;
        let state = self.state_mut(&mut checkpoints, checkpoint).await?;
        Ok(state
            .committed
            .get(&location.to_string())
            .copied()
            .unwrap_or(0))
    }

    fn table_path(&self, name: &str) -> Option<PathBuf> {
        self.warehouse
            .as_ref()
            .map(|root| root.join("tables").join(format!("{name}.jsonl")))
    }

    async fn load(&self, location: &Location) -> Result<DataFrame> {
        match location {
            Location::Table { name } => match self.table_path(name) {
                Some(path) => {
                    if !tokio::fs::try_exists(&path).await? {
                        return Err(MedallionError::Other(format!(
                            "table '{name}' does not exist"
                        )));
                    }
                    DataFrame::from_records(read_records(&path, FileFormat::JsonLines).await?)
                }
                None => self.tables.read().await.get(name).cloned().ok_or_else(|| {
                    MedallionError::Other(format!("table '{name}' does not exist"))
                }),
            },
            Location::File { path, format } => {
                DataFrame::from_records(read_records(path, *format).await?)
            }
        }
    }

    async fn load_state(&self, checkpoint: &str) -> Result<CheckpointState> {
        if self.warehouse.is_none() {
            return Ok(CheckpointState::default());
        }
        let path = Path::new(checkpoint).join(OFFSETS_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(CheckpointState::default());
        }
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn state_mut<'a>(
        &self,
        checkpoints: &'a mut HashMap<String, CheckpointState>,
        checkpoint: &str,
    ) -> Result<&'a mut CheckpointState> {
        Ok(match checkpoints.entry(checkpoint.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(self.load_state(checkpoint).await?),
        })
    }

    async fn persist_state(&self, checkpoint: &str, state: &CheckpointState) -> Result<()> {
        if self.warehouse.is_none() {
            return Ok(());
        }
        let dir = Path::new(checkpoint);
        tokio::fs::create_dir_all(dir).await?;
        let text = serde_json::to_string_pretty(state)?;
        tokio::fs::write(dir.join(OFFSETS_FILE), text).await?;
        Ok(())
    }
}

#[async_trait]
impl DataFrameBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn read(&self, location: &Location, checkpoint: Option<&str>) -> Result<DataFrame> {
        let df = self.load(location).await?;
        let Some(checkpoint) = checkpoint else {
            return Ok(df);
        };

        let key = location.to_string();
        let mut checkpoints = self.checkpoints.write().await;
        let state = self.state_mut(&mut checkpoints, checkpoint).await?;
        let offset = state.committed.get(&key).copied().unwrap_or(0);
        state.pending.insert(key, df.num_rows().max(offset));

        let batch = df.slice(offset);
        tracing::debug!(
            location = %location,
            checkpoint,
            offset,
            rows = batch.num_rows(),
            "incremental read"
        );
        Ok(batch)
    }

    async fn write(&self, location: &Location, df: &DataFrame, mode: WriteMode) -> Result<()> {
        if mode == WriteMode::Merge {
            return Err(MedallionError::Other(
                "MERGE must be resolved into an overwrite before writing".into(),
            ));
        }
        match location {
            Location::Table { name } => match self.table_path(name) {
                Some(path) => write_records(&path, FileFormat::JsonLines, df, mode).await?,
                None => {
                    let mut tables = self.tables.write().await;
                    let merged = match (mode, tables.get(name)) {
                        (WriteMode::Append, Some(existing)) => existing.union_by_name(df),
                        _ => df.clone(),
                    };
                    tables.insert(name.clone(), merged);
                }
            },
            Location::File { path, format } => write_records(path, *format, df, mode).await?,
        }
        tracing::debug!(location = %location, mode = %mode, rows = df.num_rows(), "write complete");
        Ok(())
    }

    async fn commit(&self, checkpoint: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let Some(state) = checkpoints.get_mut(checkpoint) else {
            return Ok(());
        };
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        let snapshot = state.clone();
        drop(checkpoints);
        self.persist_state(checkpoint, &snapshot).await
    }

    async fn exists(&self, location: &Location) -> Result<bool> {
        match location {
            Location::Table { name } => match self.table_path(name) {
                Some(path) => Ok(tokio::fs::try_exists(&path).await?),
                None => Ok(self.tables.read().await.contains_key(name)),
            },
            Location::File { path, .. } => Ok(tokio::fs::try_exists(path).await?),
        }
    }

    async fn purge(&self, location: &Location) -> Result<()> {
        let path = match location {
            Location::Table { name } => match self.table_path(name) {
                Some(path) => path,
                None => {
                    self.tables.write().await.remove(name);
                    return Ok(());
                }
            },
            Location::File { path, .. } => path.clone(),
        };
        remove_path(&path).await?;
        tracing::info!(location = %location, "purged sink data");
        Ok(())
    }

    async fn reset_checkpoint(&self, checkpoint: &str) -> Result<()> {
        self.checkpoints.write().await.remove(checkpoint);
        if self.warehouse.is_some() {
            remove_path(Path::new(checkpoint)).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn is_data_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') || n.starts_with('_'));
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "json" | "jsonl" | "ndjson"));
    !hidden && known
}

fn parse_records(text: &str, format: FileFormat, origin: &Path) -> Result<Vec<Value>> {
    match format {
        FileFormat::Json => match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            obj @ Value::Object(_) => Ok(vec![obj]),
            other => Err(MedallionError::Other(format!(
                "{}: expected a JSON array of records, got {other}",
                origin.display()
            ))),
        },
        FileFormat::JsonLines => text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    MedallionError::Other(format!("{}:{}: {e}", origin.display(), i + 1))
                })
            })
            .collect(),
    }
}

/// Read all records from a file, or from every data file of a directory in
/// file-name order.
async fn read_records(path: &Path, format: FileFormat) -> Result<Vec<Value>> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        MedallionError::Other(format!("cannot read '{}': {e}", path.display()))
    })?;
    if !meta.is_dir() {
        let text = tokio::fs::read_to_string(path).await?;
        return parse_records(&text, format, path);
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let p = entry.path();
        if entry.file_type().await?.is_file() && is_data_file(&p) {
            files.push(p);
        }
    }
    files.sort();

    let mut records = Vec::new();
    for file in files {
        let text = tokio::fs::read_to_string(&file).await?;
        records.extend(parse_records(&text, FileFormat::from_path(&file), &file)?);
    }
    Ok(records)
}

fn render_lines(records: &[Value]) -> String {
    let mut out = String::new();
    for r in records {
        out.push_str(&r.to_string());
        out.push('\n');
    }
    out
}

async fn write_records(path: &Path, format: FileFormat, df: &DataFrame, mode: WriteMode) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let records = df.to_records();
    let exists = tokio::fs::try_exists(path).await?;

    match (format, mode) {
        (FileFormat::JsonLines, WriteMode::Append) if exists => {
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .await?;
            file.write_all(render_lines(&records).as_bytes()).await?;
            file.flush().await?;
        }
        (FileFormat::JsonLines, _) => {
            tokio::fs::write(path, render_lines(&records)).await?;
        }
        (FileFormat::Json, mode) => {
            let mut all = if mode == WriteMode::Append && exists {
                read_records(path, FileFormat::Json).await?
            } else {
                Vec::new()
            };
            all.extend(records);
            tokio::fs::write(path, serde_json::to_string_pretty(&Value::Array(all))?).await?;
        }
    }
    Ok(())
}

async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(records: Vec<Value>) -> DataFrame {
        DataFrame::from_records(records).unwrap()
    }

    #[tokio::test]
    async fn memory_table_overwrite_and_append() {
        let backend = LocalBackend::new();
        let loc = Location::table("prices");
        assert!(!backend.exists(&loc).await.unwrap());

        backend
            .write(&loc, &frame(vec![json!({"a": 1})]), WriteMode::Append)
            .await
            .unwrap();
        backend
            .write(&loc, &frame(vec![json!({"a": 2, "b": "x"})]), WriteMode::Append)
            .await
            .unwrap();
        let df = backend.read(&loc, None).await.unwrap();
        assert_eq!(
            df.to_records(),
            vec![json!({"a": 1, "b": null}), json!({"a": 2, "b": "x"})]
        );

        backend
            .write(&loc, &frame(vec![json!({"a": 3})]), WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(backend.read(&loc, None).await.unwrap().num_rows(), 1);

        backend.purge(&loc).await.unwrap();
        assert!(!backend.exists(&loc).await.unwrap());
        assert!(backend.read(&loc, None).await.is_err());
    }

    #[tokio::test]
    async fn jsonl_file_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::file(dir.path().join("out/prices.jsonl"), None);
        let backend = LocalBackend::new();

        backend
            .write(&loc, &frame(vec![json!({"open": 1})]), WriteMode::Append)
            .await
            .unwrap();
        backend
            .write(&loc, &frame(vec![json!({"open": 2})]), WriteMode::Append)
            .await
            .unwrap();
        let df = backend.read(&loc, None).await.unwrap();
        assert_eq!(df.column_values("open").unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn json_file_overwrite_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let loc = Location::file(dir.path().join("prices.json"), None);
        let backend = LocalBackend::new();

        backend
            .write(&loc, &frame(vec![json!({"x": 1})]), WriteMode::Overwrite)
            .await
            .unwrap();
        backend
            .write(&loc, &frame(vec![json!({"x": 2})]), WriteMode::Append)
            .await
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("prices.json")).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!([{"x": 1}, {"x": 2}]));
    }

    #[tokio::test]
    async fn directory_read_in_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "{\"n\": 2}\n").unwrap();
        std::fs::write(dir.path().join("a.json"), "[{\"n\": 1}]").unwrap();
        std::fs::write(dir.path().join("_SUCCESS"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let backend = LocalBackend::new();
        let df = backend
            .read(&Location::file(dir.path(), None), None)
            .await
            .unwrap();
        assert_eq!(df.column_values("n").unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"n\": 1}\n{oops\n").unwrap();
        let err = LocalBackend::new()
            .read(&Location::file(&path, None), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad.jsonl:2"));
    }

    #[tokio::test]
    async fn incremental_reads_follow_committed_offsets() {
        let backend = LocalBackend::new();
        let loc = Location::table("events");
        backend
            .register_table("events", frame(vec![json!({"n": 1}), json!({"n": 2})]))
            .await
            .unwrap();

        let first = backend.read(&loc, Some("cp")).await.unwrap();
        assert_eq!(first.num_rows(), 2);

        // Not committed: the same rows are read again.
        let again = backend.read(&loc, Some("cp")).await.unwrap();
        assert_eq!(again.num_rows(), 2);
        backend.commit("cp").await.unwrap();
        assert_eq!(backend.committed_offset("cp", &loc).await.unwrap(), 2);

        backend
            .write(&loc, &frame(vec![json!({"n": 3})]), WriteMode::Append)
            .await
            .unwrap();
        let next = backend.read(&loc, Some("cp")).await.unwrap();
        assert_eq!(next.column_values("n").unwrap(), vec![json!(3)]);

        // Other checkpoints are independent.
        assert_eq!(backend.read(&loc, Some("other")).await.unwrap().num_rows(), 3);

        backend.reset_checkpoint("cp").await.unwrap();
        assert_eq!(backend.read(&loc, Some("cp")).await.unwrap().num_rows(), 3);
    }

    #[tokio::test]
    async fn warehouse_persists_tables_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("node/checkpoints/sink-1");
        let checkpoint = checkpoint.to_str().unwrap();
        let loc = Location::table("raw");

        {
            let backend = LocalBackend::with_warehouse(dir.path());
            backend
                .register_table("raw", frame(vec![json!({"n": 1})]))
                .await
                .unwrap();
            assert_eq!(backend.read(&loc, Some(checkpoint)).await.unwrap().num_rows(), 1);
            backend.commit(checkpoint).await.unwrap();
        }
        assert!(dir.path().join("tables/raw.jsonl").exists());

        let backend = LocalBackend::with_warehouse(dir.path());
        backend
            .write(&loc, &frame(vec![json!({"n": 2})]), WriteMode::Append)
            .await
            .unwrap();
        let batch = backend.read(&loc, Some(checkpoint)).await.unwrap();
        assert_eq!(batch.column_values("n").unwrap(), vec![json!(2)]);

        backend.reset_checkpoint(checkpoint).await.unwrap();
        assert!(!Path::new(checkpoint).exists());
    }

    #[tokio::test]
    async fn merge_mode_is_rejected() {
        let backend = LocalBackend::new();
        let err = backend
            .write(&Location::table("t"), &frame(vec![json!({"a": 1})]), WriteMode::Merge)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MERGE"));
    }
}
