//! Dataframe backend boundary.
//!
//! A backend owns storage (tables, files) and incremental-read bookkeeping
//! (offsets keyed by checkpoint location). Dataframe operations default to the
//! in-process [`DataFrame`] implementation.

mod local;

pub use local::LocalBackend;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use medallion_expr::{DataFrame, DataType, Expr, Field, SelectQuery};
use medallion_types::Result;

use crate::config::{FileFormat, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// Where a dataframe is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Table { name: String },
    File { path: PathBuf, format: FileFormat },
}

impl Location {
    pub fn table(name: impl Into<String>) -> Self {
        Location::Table { name: name.into() }
    }

    /// A file or directory location; the format defaults from the extension.
    pub fn file(path: impl Into<PathBuf>, format: Option<FileFormat>) -> Self {
        let path = path.into();
        let format = format.unwrap_or_else(|| FileFormat::from_path(&path));
        Location::File { path, format }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Table { name } => write!(f, "table:{name}"),
            Location::File { path, .. } => write!(f, "file:{}", path.display()),
        }
    }
}

#[async_trait]
pub trait DataFrameBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Read a location. With a checkpoint, only rows past the committed offset
    /// are returned and the new offset is staged until [`commit`](Self::commit).
    async fn read(&self, location: &Location, checkpoint: Option<&str>) -> Result<DataFrame>;

    /// Write with `OVERWRITE` or `APPEND` semantics. `MERGE` is resolved by the
    /// sink before it reaches the backend.
    async fn write(&self, location: &Location, df: &DataFrame, mode: WriteMode) -> Result<()>;

    /// Promote offsets staged under `checkpoint` to committed.
    async fn commit(&self, checkpoint: &str) -> Result<()>;

    async fn exists(&self, location: &Location) -> Result<bool>;

    /// Delete the data stored at a location. Missing data is not an error.
    async fn purge(&self, location: &Location) -> Result<()>;

    /// Forget all offsets recorded under a checkpoint.
    async fn reset_checkpoint(&self, checkpoint: &str) -> Result<()>;

    fn sql(&self, df: &DataFrame, query: &SelectQuery) -> Result<DataFrame> {
        df.query(query)
    }

    fn with_column(
        &self,
        df: &DataFrame,
        name: &str,
        expr: &Expr,
        dtype: Option<DataType>,
    ) -> Result<DataFrame> {
        df.with_column(name, expr, dtype)
    }

    fn predicate(&self, df: &DataFrame, expr: &Expr) -> Result<Vec<Option<bool>>> {
        df.predicate(expr)
    }

    fn filter(&self, df: &DataFrame, mask: &[bool]) -> DataFrame {
        df.filter_mask(mask)
    }

    fn schema(&self, df: &DataFrame) -> Vec<Field> {
        df.schema().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_display_and_format_default() {
        assert_eq!(Location::table("slv_prices").to_string(), "table:slv_prices");
        let loc = Location::file("/data/prices.json", None);
        assert_eq!(
            loc,
            Location::File {
                path: PathBuf::from("/data/prices.json"),
                format: FileFormat::Json
            }
        );
        assert_eq!(loc.to_string(), "file:/data/prices.json");
    }

    #[test]
    fn location_serializes_tagged() {
        let json = serde_json::to_value(Location::table("t")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "table", "name": "t"}));
    }
}
