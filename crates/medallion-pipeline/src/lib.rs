//! Declarative medallion pipelines: nodes, validation, and execution strategies.
//!
//! A node reads one source, applies an ordered transformer chain, evaluates
//! data-quality expectations, and writes to zero or more sinks. A [`Pipeline`]
//! validates the node set, orders it by dependency, and runs it either in
//! batch (every node once, in order) or in streaming mode (nodes registered
//! with an [`Orchestrator`] that drives micro-batches).

pub mod backend;
pub mod config;
pub mod events;
pub mod executor;
pub mod expectations;
pub mod functions;
pub mod graph;
pub mod node;
pub mod pipeline;
pub mod plan;
pub mod sink;
pub mod source;
pub mod transformer;
pub mod validation;

pub use backend::{BackendKind, DataFrameBackend, LocalBackend, Location};
pub use config::{
    expand_variables, ExpectationAction, ExpectationConfig, Layer, MergeOptions, NodeConfig,
    PipelineConfig, ScdType, SinkConfig, SourceConfig, TransformerStepConfig, WriteMode,
};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::{
    BatchExecutor, ExecutionStrategy, LocalOrchestrator, Orchestrator, PlanRecorder, StatusBoard,
    StreamingExecutor, StreamingUnit,
};
pub use expectations::{apply_expectations, Expectation, ExpectationOutcome, QUARANTINE_TAG_COLUMN};
pub use functions::{default_registry, FunctionCall, FunctionRegistry, TransformFunction};
pub use graph::DependencyGraph;
pub use node::{ExecutionContext, NodeResult, PipelineNode, StreamOutputs, UpstreamOutputs};
pub use pipeline::{Pipeline, PipelineOptions};
pub use plan::{NodePlan, PipelinePlan, SinkRef};
pub use sink::{DataSink, MergeSpec};
pub use source::DataSource;
pub use transformer::{ColumnBuilder, TransformerChain, TransformerStep};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
