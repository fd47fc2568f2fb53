//! Pipeline node: source → transformer chain → expectations → sinks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use medallion_expr::DataFrame;
use medallion_types::{ExecutionMode, MedallionError, NodeReport, Result};

use crate::backend::DataFrameBackend;
use crate::config::{Layer, NodeConfig};
use crate::events::{EventEmitter, PipelineEvent};
use crate::expectations::{apply_expectations, Expectation};
use crate::functions::FunctionRegistry;
use crate::sink::DataSink;
use crate::source::DataSource;
use crate::transformer::TransformerChain;

// ---------------------------------------------------------------------------
// Upstream outputs
// ---------------------------------------------------------------------------

/// Outputs of already-executed nodes, visible to their dependents.
///
/// `latest` is the most recent batch a node produced; `snapshots` is
/// everything it produced so far. In batch mode both are the same frame.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOutputs {
    latest: HashMap<String, DataFrame>,
    snapshots: HashMap<String, DataFrame>,
}

impl UpstreamOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's complete output.
    pub fn insert_batch(&mut self, node: &str, df: DataFrame) {
        self.snapshots.insert(node.to_string(), df.clone());
        self.latest.insert(node.to_string(), df);
    }

    /// Record the rows a consumer has not seen yet next to the full output.
    pub fn insert_increment(&mut self, node: &str, new_rows: DataFrame, snapshot: DataFrame) {
        self.latest.insert(node.to_string(), new_rows);
        self.snapshots.insert(node.to_string(), snapshot);
    }

    /// Unseen rows when `as_stream`, otherwise the full snapshot.
    pub fn get(&self, node: &str, as_stream: bool) -> Option<&DataFrame> {
        if as_stream {
            self.latest.get(node)
        } else {
            self.snapshots.get(node)
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.snapshots.contains_key(node)
    }
}

/// Streaming outputs accumulated across micro-batches, and how far each
/// consumer has read every upstream output.
///
/// Offsets only advance through [`commit`](StreamOutputs::commit), so a
/// consumer that fails sees the same rows again on the next round.
#[derive(Debug, Clone, Default)]
pub struct StreamOutputs {
    outputs: HashMap<String, DataFrame>,
    offsets: HashMap<(String, String), usize>,
}

impl StreamOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one micro-batch of `node`'s output.
    pub fn append(&mut self, node: &str, df: DataFrame) {
        let output = match self.outputs.remove(node) {
            Some(prev) => prev.union_by_name(&df),
            None => df,
        };
        self.outputs.insert(node.to_string(), output);
    }

    pub fn output(&self, node: &str) -> Option<&DataFrame> {
        self.outputs.get(node)
    }

    /// Rows of `upstream` already committed by `consumer`.
    pub fn offset(&self, consumer: &str, upstream: &str) -> usize {
        self.offsets
            .get(&(consumer.to_string(), upstream.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Upstream outputs as seen by `consumer`, plus the offsets to commit
    /// once it succeeds.
    pub fn view(
        &self,
        consumer: &str,
        dependencies: &[String],
    ) -> (UpstreamOutputs, Vec<(String, usize)>) {
        let mut upstream = UpstreamOutputs::new();
        let mut staged = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let Some(output) = self.outputs.get(dep) else {
                continue;
            };
            let offset = self.offset(consumer, dep);
            upstream.insert_increment(dep, output.slice(offset), output.clone());
            staged.push((dep.clone(), output.num_rows()));
        }
        (upstream, staged)
    }

    pub fn commit(&mut self, consumer: &str, staged: Vec<(String, usize)>) {
        for (upstream, rows) in staged {
            self.offsets.insert((consumer.to_string(), upstream), rows);
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

pub struct ExecutionContext<'a> {
    pub backend: &'a dyn DataFrameBackend,
    pub upstream: &'a UpstreamOutputs,
    pub mode: ExecutionMode,
    pub full_refresh: bool,
    pub events: Option<&'a EventEmitter>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        backend: &'a dyn DataFrameBackend,
        upstream: &'a UpstreamOutputs,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            backend,
            upstream,
            mode,
            full_refresh: false,
            events: None,
        }
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn with_events(mut self, events: &'a EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = self.events {
            events.emit(event);
        }
    }
}

/// Output of one successful node invocation.
#[derive(Debug, Clone)]
pub struct NodeResult {
    /// Accepted rows; this is what downstream nodes read.
    pub output: DataFrame,
    pub quarantined: DataFrame,
    pub report: NodeReport,
}

// ---------------------------------------------------------------------------
// PipelineNode
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PipelineNode {
    config: NodeConfig,
    source: DataSource,
    chain: TransformerChain,
    expectations: Vec<Expectation>,
    sinks: Vec<DataSink>,
    checkpoint_location: String,
    dependencies: Vec<String>,
}

fn node_config_error(node: &str, err: MedallionError) -> MedallionError {
    match err {
        MedallionError::ConfigError(msg) => MedallionError::ConfigError(msg),
        MedallionError::TransformError {
            node,
            step,
            message,
        } => MedallionError::ConfigError(format!("node '{node}' transformer step {step}: {message}")),
        other => MedallionError::ConfigError(format!("node '{node}': {other}")),
    }
}

impl PipelineNode {
    /// Compile a node. Unknown functions, malformed kwargs, and expression
    /// syntax errors are all reported as `ConfigError`.
    pub fn from_config(
        config: &NodeConfig,
        registry: &FunctionRegistry,
        root: Option<&Path>,
    ) -> Result<Self> {
        let name = config.name.as_str();
        let source = DataSource::from_config(&config.source);
        let chain = TransformerChain::build(name, &config.transformer, registry)
            .map_err(|e| node_config_error(name, e))?;
        let expectations = config
            .expectations
            .iter()
            .map(Expectation::from_config)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| node_config_error(name, e))?;
        let sinks = config
            .sinks
            .iter()
            .map(|s| DataSink::from_config(name, s, root, source.is_streaming()))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| node_config_error(name, e))?;

        let checkpoint_location = match sinks.iter().find(|s| !s.is_quarantine()) {
            Some(sink) => sink.checkpoint_location().to_string(),
            None => {
                let relative = PathBuf::from(name).join("checkpoints").join("node");
                match root {
                    Some(root) => root.join(relative).display().to_string(),
                    None => relative.display().to_string(),
                }
            }
        };

        Ok(Self {
            dependencies: config.dependencies(),
            config: config.clone(),
            source,
            chain,
            expectations,
            sinks,
            checkpoint_location,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn layer(&self) -> Option<Layer> {
        self.config.layer
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    pub fn chain(&self) -> &TransformerChain {
        &self.chain
    }

    pub fn expectations(&self) -> &[Expectation] {
        &self.expectations
    }

    pub fn sinks(&self) -> &[DataSink] {
        &self.sinks
    }

    /// Checkpoint under which incremental source offsets are tracked.
    pub fn checkpoint_location(&self) -> &str {
        &self.checkpoint_location
    }

    /// Upstream nodes: the source node plus nodes referenced by function kwargs.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn is_streaming(&self) -> bool {
        self.source.is_streaming()
    }

    /// Run the node once. Nothing is written if any step before the sinks
    /// fails; a failing sink leaves earlier sink writes in place.
    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<NodeResult> {
        let started = Instant::now();
        let name = self.name();
        let incremental = self.source.is_incremental();

        if incremental && ctx.full_refresh {
            ctx.backend
                .reset_checkpoint(&self.checkpoint_location)
                .await
                .map_err(|e| MedallionError::SourceReadError {
                    node: name.to_string(),
                    message: e.to_string(),
                })?;
        }

        let checkpoint = incremental.then_some(self.checkpoint_location.as_str());
        let df = self.source.read(name, ctx, checkpoint).await?;
        let source_columns: Vec<String> = df.columns().iter().map(|c| c.to_string()).collect();
        tracing::debug!(node = name, source = %self.source, rows = df.num_rows(), "source read");

        let mut df = self.chain.apply(df, ctx.backend, ctx.upstream)?;
        if self.config.drop_source_columns {
            let derived = self.chain.derived_columns();
            let dropped: Vec<&String> = source_columns
                .iter()
                .filter(|c| !derived.contains(c))
                .collect();
            df = df.drop_columns(&dropped);
        }

        let rows_input = df.num_rows();
        let outcome = apply_expectations(name, df, &self.expectations, ctx.backend)?;
        for e in &self.expectations {
            let failing_rows = outcome
                .rejected_per_expectation
                .get(&e.name)
                .or_else(|| outcome.warned.get(&e.name))
                .copied()
                .unwrap_or(0);
            ctx.emit(PipelineEvent::ExpectationEvaluated {
                node: name.to_string(),
                expectation: e.name.clone(),
                action: e.action.to_string(),
                failing_rows,
            });
        }

        for sink in &self.sinks {
            let rows = if sink.is_quarantine() {
                &outcome.quarantined
            } else {
                &outcome.accepted
            };
            sink.write(name, rows, ctx.backend, ctx.full_refresh).await?;
            ctx.emit(PipelineEvent::SinkWritten {
                node: name.to_string(),
                sink: sink.describe(),
                mode: sink.mode().to_string(),
                rows: rows.num_rows(),
            });
        }

        if incremental {
            ctx.backend
                .commit(&self.checkpoint_location)
                .await
                .map_err(|e| MedallionError::SinkWriteError {
                    node: name.to_string(),
                    sink: self.checkpoint_location.clone(),
                    message: format!("failed to commit offsets: {e}"),
                })?;
            ctx.emit(PipelineEvent::OffsetsCommitted {
                node: name.to_string(),
                checkpoint: self.checkpoint_location.clone(),
            });
        }

        let mut report = NodeReport::success(name);
        report.rows_input = rows_input;
        report.rows_accepted = outcome.accepted.num_rows();
        report.rows_quarantined = outcome.rows_quarantined();
        report.rows_rejected_per_expectation = outcome.rejected_per_expectation;
        report.rows_warned = outcome.warned;
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            node = name,
            rows_input,
            rows_accepted = report.rows_accepted,
            rows_quarantined = report.rows_quarantined,
            duration_ms = report.duration_ms,
            "node completed"
        );

        Ok(NodeResult {
            output: outcome.accepted,
            quarantined: outcome.quarantined,
            report,
        })
    }
}
