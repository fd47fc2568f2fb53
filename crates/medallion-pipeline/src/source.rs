//! Node sources: another node's output, or an external table / file.

use medallion_expr::DataFrame;
use medallion_types::{MedallionError, Result};

use crate::backend::Location;
use crate::config::SourceConfig;
use crate::node::ExecutionContext;

#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// Output of an upstream node of the same pipeline.
    Node { node: String, as_stream: bool },
    External { location: Location, as_stream: bool },
}

impl DataSource {
    pub fn from_config(config: &SourceConfig) -> Self {
        match config {
            SourceConfig::Node(r) => DataSource::Node {
                node: r.node_name.clone(),
                as_stream: r.as_stream,
            },
            SourceConfig::File(f) => DataSource::External {
                location: Location::file(&f.path, f.format),
                as_stream: f.as_stream,
            },
            SourceConfig::Table(t) => DataSource::External {
                location: Location::table(&t.table_name),
                as_stream: t.as_stream,
            },
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            DataSource::Node { as_stream, .. } | DataSource::External { as_stream, .. } => {
                *as_stream
            }
        }
    }

    /// Name of the upstream node, for node sources.
    pub fn upstream(&self) -> Option<&str> {
        match self {
            DataSource::Node { node, .. } => Some(node),
            DataSource::External { .. } => None,
        }
    }

    /// External location, if any.
    pub fn location(&self) -> Option<&Location> {
        match self {
            DataSource::External { location, .. } => Some(location),
            DataSource::Node { .. } => None,
        }
    }

    /// Whether reads go through backend offsets under a checkpoint.
    pub fn is_incremental(&self) -> bool {
        matches!(self, DataSource::External { as_stream: true, .. })
    }

    pub fn describe(&self) -> String {
        match self {
            DataSource::Node { node, .. } => format!("node:{node}"),
            DataSource::External { location, .. } => location.to_string(),
        }
    }

    /// Read the source for `node`.
    ///
    /// A streaming node source yields the upstream's latest micro-batch, a
    /// non-streaming one its full output. Streaming external sources only return
    /// rows past the offsets committed under `checkpoint`.
    pub async fn read(
        &self,
        node: &str,
        ctx: &ExecutionContext<'_>,
        checkpoint: Option<&str>,
    ) -> Result<DataFrame> {
        let read_error = |message: String| MedallionError::SourceReadError {
            node: node.to_string(),
            message,
        };

        match self {
            DataSource::Node {
                node: upstream,
                as_stream,
            } => ctx
                .upstream
                .get(upstream, *as_stream)
                .cloned()
                .ok_or_else(|| read_error(format!("output of node '{upstream}' is not available"))),
            DataSource::External {
                location,
                as_stream,
            } => {
                let checkpoint = if *as_stream { checkpoint } else { None };
                ctx.backend
                    .read(location, checkpoint)
                    .await
                    .map_err(|e| read_error(e.to_string()))
            }
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataFrameBackend, LocalBackend};
    use crate::config::WriteMode;
    use crate::node::UpstreamOutputs;
    use medallion_types::ExecutionMode;
    use serde_json::json;

    fn source(value: serde_json::Value) -> DataSource {
        DataSource::from_config(&serde_json::from_value(value).unwrap())
    }

    #[test]
    fn from_config_variants() {
        let s = source(json!({"node_name": "brz", "as_stream": true}));
        assert_eq!(s.upstream(), Some("brz"));
        assert!(s.is_streaming());
        assert!(!s.is_incremental());

        let s = source(json!({"table_name": "raw"}));
        assert_eq!(s.describe(), "table:raw");
        assert!(!s.is_streaming());

        let s = source(json!({"path": "/data/in.json", "as_stream": true}));
        assert!(s.is_incremental());
        assert_eq!(s.to_string(), "file:/data/in.json");
    }

    #[tokio::test]
    async fn reads_upstream_snapshot_or_latest_batch() {
        let backend = LocalBackend::new();
        let mut upstream = UpstreamOutputs::new();
        let batch = |n: i64| DataFrame::from_records(vec![json!({"n": n})]).unwrap();
        upstream.insert_increment("brz", batch(2), batch(1).union_by_name(&batch(2)));
        let ctx = ExecutionContext::new(&backend, &upstream, ExecutionMode::Streaming);

        let full = source(json!({"node_name": "brz"}))
            .read("slv", &ctx, None)
            .await
            .unwrap();
        assert_eq!(full.num_rows(), 2);

        let latest = source(json!({"node_name": "brz", "as_stream": true}))
            .read("slv", &ctx, None)
            .await
            .unwrap();
        assert_eq!(latest.column_values("n").unwrap(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn missing_inputs_are_source_read_errors() {
        let backend = LocalBackend::new();
        let upstream = UpstreamOutputs::new();
        let ctx = ExecutionContext::new(&backend, &upstream, ExecutionMode::Batch);

        let err = source(json!({"node_name": "brz"}))
            .read("slv", &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MedallionError::SourceReadError { ref node, .. } if node == "slv"));

        let err = source(json!({"table_name": "nope"}))
            .read("brz", &ctx, None)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some(medallion_types::STEP_SOURCE));
    }

    #[tokio::test]
    async fn streaming_external_source_uses_checkpoint() {
        let backend = LocalBackend::new();
        backend
            .write(
                &Location::table("raw"),
                &DataFrame::from_records(vec![json!({"n": 1})]).unwrap(),
                WriteMode::Append,
            )
            .await
            .unwrap();
        let upstream = UpstreamOutputs::new();
        let ctx = ExecutionContext::new(&backend, &upstream, ExecutionMode::Streaming);
        let s = source(json!({"table_name": "raw", "as_stream": true}));

        assert_eq!(s.read("brz", &ctx, Some("cp")).await.unwrap().num_rows(), 1);
        backend.commit("cp").await.unwrap();
        assert_eq!(s.read("brz", &ctx, Some("cp")).await.unwrap().num_rows(), 0);
    }
}
