//! Shared types and errors for the Medallion pipeline engine.
//!
//! This crate provides the foundational types used across all other Medallion crates:
//! - `MedallionError`: unified error taxonomy (build-time and node-scoped)
//! - `ExecutionMode`: batch vs streaming execution
//! - `NodeStatus` / `NodeReport`: outcome of a single node invocation
//! - `RunReport`: outcome of a whole pipeline run

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Step names attached to node-scoped errors.
pub const STEP_SOURCE: &str = "source";
pub const STEP_TRANSFORM: &str = "transform";
pub const STEP_EXPECTATIONS: &str = "expectations";
pub const STEP_SINK: &str = "sink";

/// Unified error type for all Medallion subsystems.
#[derive(Debug, thiserror::Error)]
pub enum MedallionError {
    // === Build-time Errors ===
    #[error("Pipeline configuration error: {0}")]
    ConfigError(String),

    #[error("Expression parse error at offset {offset}: {message}")]
    ParseError {
        offset: usize,
        message: String,
        expr: String,
    },

    // === Node Errors ===
    #[error("Node '{node}' failed to read its source: {message}")]
    SourceReadError { node: String, message: String },

    #[error("Node '{node}' failed at transformer step {step}: {message}")]
    TransformError {
        node: String,
        step: usize,
        message: String,
    },

    #[error("Node '{node}' expectation '{expectation}' failed for {failing_rows} row(s)")]
    ExpectationFailure {
        node: String,
        expectation: String,
        failing_rows: usize,
    },

    #[error("Node '{node}' could not evaluate expectation '{expectation}': {message}")]
    ExpectationError {
        node: String,
        expectation: String,
        message: String,
    },

    #[error("Node '{node}' failed to write sink '{sink}': {message}")]
    SinkWriteError {
        node: String,
        sink: String,
        message: String,
    },

    #[error("Node '{node}' was not executed because upstream node '{upstream}' failed")]
    UpstreamFailed { node: String, upstream: String },

    // === Pipeline Errors ===
    #[error("Pipeline run failed at node '{node}': {message}")]
    NodeExecutionError {
        node: String,
        message: String,
        report: Box<RunReport>,
    },

    // === Dataframe Errors ===
    #[error("Expression evaluation error: {0}")]
    EvalError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl MedallionError {
    /// Name of the node the error originated from, if it is node-scoped.
    pub fn node(&self) -> Option<&str> {
        match self {
            MedallionError::SourceReadError { node, .. }
            | MedallionError::TransformError { node, .. }
            | MedallionError::ExpectationFailure { node, .. }
            | MedallionError::ExpectationError { node, .. }
            | MedallionError::SinkWriteError { node, .. }
            | MedallionError::UpstreamFailed { node, .. }
            | MedallionError::NodeExecutionError { node, .. } => Some(node),
            _ => None,
        }
    }

    /// The node lifecycle step at which the error occurred.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            MedallionError::SourceReadError { .. } => Some(STEP_SOURCE),
            MedallionError::TransformError { .. } => Some(STEP_TRANSFORM),
            MedallionError::ExpectationFailure { .. } | MedallionError::ExpectationError { .. } => {
                Some(STEP_EXPECTATIONS)
            }
            MedallionError::SinkWriteError { .. } => Some(STEP_SINK),
            _ => None,
        }
    }

    /// Returns `true` for errors raised while building a pipeline, before any
    /// node runs. Malformed pipeline documents surface as `ConfigError`, so
    /// the generic `Json` and `Yaml` conversions are not counted.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            MedallionError::ConfigError(_) | MedallionError::ParseError { .. }
        )
    }

    /// Returns `true` if the error is fatal to one node only.
    pub fn is_node_scoped(&self) -> bool {
        matches!(
            self,
            MedallionError::SourceReadError { .. }
                | MedallionError::TransformError { .. }
                | MedallionError::ExpectationFailure { .. }
                | MedallionError::ExpectationError { .. }
                | MedallionError::SinkWriteError { .. }
                | MedallionError::UpstreamFailed { .. }
        )
    }
}

/// A convenience alias for `Result<T, MedallionError>`.
pub type Result<T> = std::result::Result<T, MedallionError>;

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Batch,
    Streaming,
}

impl ExecutionMode {
    pub fn is_streaming(self) -> bool {
        self == ExecutionMode::Streaming
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Batch => write!(f, "batch"),
            ExecutionMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = MedallionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "batch" => Ok(ExecutionMode::Batch),
            "streaming" | "stream" => Ok(ExecutionMode::Streaming),
            other => Err(MedallionError::ConfigError(format!(
                "unknown execution mode '{other}' (expected batch or streaming)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Registered with an orchestrator, no micro-batch processed yet.
    Registered,
    Success,
    Failed,
}

// ---------------------------------------------------------------------------
// NodeReport: result of one node invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: String,
    pub status: NodeStatus,
    pub rows_input: usize,
    pub rows_accepted: usize,
    /// Rejected row count keyed by expectation name (DROP and QUARANTINE only).
    pub rows_rejected_per_expectation: BTreeMap<String, usize>,
    pub rows_quarantined: usize,
    /// Failing row count of WARN expectations; those rows stay accepted.
    pub rows_warned: BTreeMap<String, usize>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    /// Set when the node was never attempted because an upstream node failed.
    pub propagated_from: Option<String>,
    pub duration_ms: u64,
}

impl NodeReport {
    fn empty(node: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            node: node.into(),
            status,
            rows_input: 0,
            rows_accepted: 0,
            rows_rejected_per_expectation: BTreeMap::new(),
            rows_quarantined: 0,
            rows_warned: BTreeMap::new(),
            error: None,
            failed_step: None,
            propagated_from: None,
            duration_ms: 0,
        }
    }

    /// A report for a node handed to an orchestrator but not yet triggered.
    pub fn registered(node: impl Into<String>) -> Self {
        Self::empty(node, NodeStatus::Registered)
    }

    /// A successful report; counters are filled in by the caller.
    pub fn success(node: impl Into<String>) -> Self {
        Self::empty(node, NodeStatus::Success)
    }

    /// A failed report built from the error that aborted the node.
    pub fn failed(node: impl Into<String>, error: &MedallionError) -> Self {
        let mut report = Self::empty(node, NodeStatus::Failed);
        report.error = Some(error.to_string());
        report.failed_step = error.step().map(String::from);
        if let MedallionError::UpstreamFailed { upstream, .. } = error {
            report.propagated_from = Some(upstream.clone());
        }
        report
    }

    /// A failed report for a node skipped because `upstream` failed.
    pub fn failed_by_propagation(node: impl Into<String>, upstream: impl Into<String>) -> Self {
        let node = node.into();
        let err = MedallionError::UpstreamFailed {
            node: node.clone(),
            upstream: upstream.into(),
        };
        Self::failed(node, &err)
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }

    /// Total number of rows removed from the main output.
    pub fn rows_rejected(&self) -> usize {
        self.rows_rejected_per_expectation.values().sum()
    }
}

// ---------------------------------------------------------------------------
// RunReport: result of a pipeline run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub pipeline: String,
    pub mode: ExecutionMode,
    pub backend: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    /// Node reports in execution (topological) order.
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub fn new(pipeline: impl Into<String>, mode: ExecutionMode, backend: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            pipeline: pipeline.into(),
            mode,
            backend: backend.into(),
            started_at: chrono::Utc::now(),
            duration_ms: 0,
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node == name)
    }

    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.status != NodeStatus::Failed)
    }

    /// The first node (in execution order) that failed on its own, as opposed
    /// to failing by propagation.
    pub fn first_failure(&self) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|n| n.status == NodeStatus::Failed && n.propagated_from.is_none())
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .map(|n| n.node.as_str())
            .collect()
    }

    /// Convert into `Err(NodeExecutionError)` when any node failed.
    pub fn into_result(self) -> Result<RunReport> {
        let failure = self
            .first_failure()
            .map(|n| (n.node.clone(), n.error.clone().unwrap_or_default()));
        match failure {
            Some((node, message)) => Err(MedallionError::NodeExecutionError {
                node,
                message,
                report: Box::new(self),
            }),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transform_error() {
        let err = MedallionError::TransformError {
            node: "slv_prices".into(),
            step: 2,
            message: "column 'close' not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "Node 'slv_prices' failed at transformer step 2: column 'close' not found"
        );
    }

    #[test]
    fn error_display_expectation_failure() {
        let err = MedallionError::ExpectationFailure {
            node: "slv".into(),
            expectation: "positive_price".into(),
            failing_rows: 3,
        };
        assert_eq!(
            err.to_string(),
            "Node 'slv' expectation 'positive_price' failed for 3 row(s)"
        );
    }

    #[test]
    fn error_display_config_error() {
        let err = MedallionError::ConfigError("cycle detected".into());
        assert_eq!(err.to_string(), "Pipeline configuration error: cycle detected");
    }

    #[test]
    fn node_and_step_accessors() {
        let err = MedallionError::SinkWriteError {
            node: "gld".into(),
            sink: "gold.prices".into(),
            message: "disk full".into(),
        };
        assert_eq!(err.node(), Some("gld"));
        assert_eq!(err.step(), Some(STEP_SINK));
        assert!(err.is_node_scoped());
        assert!(!err.is_config_error());

        let err = MedallionError::ConfigError("dup".into());
        assert_eq!(err.node(), None);
        assert_eq!(err.step(), None);
        assert!(err.is_config_error());
    }

    #[test]
    fn serde_conversions_are_not_config_errors() {
        let json: MedallionError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        let yaml: MedallionError = serde_yaml::from_str::<serde_json::Value>("[").unwrap_err().into();
        assert!(!json.is_config_error());
        assert!(!yaml.is_config_error());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MedallionError = io_err.into();
        assert!(matches!(err, MedallionError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn execution_mode_parse_and_display() {
        assert_eq!("batch".parse::<ExecutionMode>().unwrap(), ExecutionMode::Batch);
        assert_eq!(
            "STREAMING".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Streaming
        );
        assert!("hourly".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Streaming.to_string(), "streaming");
    }

    #[test]
    fn node_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(serde_json::to_string(&NodeStatus::Failed).unwrap(), "\"FAILED\"");
    }

    #[test]
    fn failed_report_records_step() {
        let err = MedallionError::TransformError {
            node: "slv".into(),
            step: 0,
            message: "boom".into(),
        };
        let report = NodeReport::failed("slv", &err);
        assert_eq!(report.status, NodeStatus::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("transform"));
        assert!(report.propagated_from.is_none());
    }

    #[test]
    fn propagated_failure_is_not_first_failure() {
        let mut run = RunReport::new("stocks", ExecutionMode::Batch, "local");
        let err = MedallionError::TransformError {
            node: "slv".into(),
            step: 0,
            message: "boom".into(),
        };
        run.nodes.push(NodeReport::success("brz"));
        run.nodes.push(NodeReport::failed("slv", &err));
        run.nodes.push(NodeReport::failed_by_propagation("gld", "slv"));

        assert!(!run.is_success());
        assert_eq!(run.first_failure().unwrap().node, "slv");
        assert_eq!(run.failed_nodes(), vec!["slv", "gld"]);
        assert_eq!(
            run.node("gld").unwrap().propagated_from.as_deref(),
            Some("slv")
        );

        match run.into_result() {
            Err(MedallionError::NodeExecutionError { node, report, .. }) => {
                assert_eq!(node, "slv");
                assert_eq!(report.nodes.len(), 3);
            }
            other => panic!("expected NodeExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn successful_run_into_result_is_ok() {
        let mut run = RunReport::new("stocks", ExecutionMode::Batch, "local");
        let mut report = NodeReport::success("brz");
        report.rows_rejected_per_expectation.insert("positive".into(), 2);
        report.rows_rejected_per_expectation.insert("not_null".into(), 1);
        assert_eq!(report.rows_rejected(), 3);
        run.nodes.push(report);
        assert!(run.into_result().is_ok());
    }
}
