//! Pipeline: a validated, topologically ordered set of nodes bound to a
//! backend and an execution strategy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use medallion_types::{ExecutionMode, MedallionError, NodeReport, Result, RunReport};

use crate::backend::{BackendKind, DataFrameBackend, LocalBackend};
use crate::config::PipelineConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::{
    BatchExecutor, ExecutionStrategy, LocalOrchestrator, Orchestrator, StatusBoard,
    StreamingExecutor,
};
use crate::functions::{default_registry, FunctionRegistry};
use crate::graph::DependencyGraph;
use crate::node::PipelineNode;
use crate::plan::{NodePlan, PipelinePlan};
use crate::validation::{validate_or_raise, Diagnostic};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Build-time choices that override or complete the configuration document.
#[derive(Clone, Default)]
pub struct PipelineOptions {
    /// Overrides the document's `mode`.
    pub mode: Option<ExecutionMode>,
    /// Defaults to a [`LocalBackend`], file-backed when a root path is set.
    pub backend: Option<Arc<dyn DataFrameBackend>>,
    /// Streaming only; defaults to a [`LocalOrchestrator`].
    pub orchestrator: Option<Arc<dyn Orchestrator>>,
    pub registry: Option<Arc<FunctionRegistry>>,
    /// Overwrite sinks and reset streaming offsets.
    pub full_refresh: bool,
    /// Overrides the document's `root_path`.
    pub root_path: Option<PathBuf>,
    pub events: Option<EventEmitter>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn DataFrameBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn with_root_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = Some(root.into());
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    /// In execution (topological) order.
    nodes: Vec<Arc<PipelineNode>>,
    graph: DependencyGraph,
    backend: Arc<dyn DataFrameBackend>,
    strategy: Box<dyn ExecutionStrategy>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    diagnostics: Vec<Diagnostic>,
    events: EventEmitter,
    status: StatusBoard,
    full_refresh: bool,
}

fn default_backend(kind: BackendKind, root: Option<&Path>) -> Arc<dyn DataFrameBackend> {
    match (kind, root) {
        (BackendKind::Local, Some(root)) => Arc::new(LocalBackend::with_warehouse(root)),
        (BackendKind::Local, None) => Arc::new(LocalBackend::new()),
    }
}

impl Pipeline {
    /// Validate `config`, compile its nodes, and bind the backend and strategy.
    ///
    /// Every structural problem (duplicate names, dangling references, cycles,
    /// unknown functions, missing quarantine sinks, stream incompatibilities,
    /// merges without keys, expression syntax) is a `ConfigError`.
    pub fn build(mut config: PipelineConfig, options: PipelineOptions) -> Result<Self> {
        if let Some(mode) = options.mode {
            config.mode = mode;
        }
        if let Some(root) = options.root_path {
            config.root_path = Some(root);
        }

        let diagnostics = validate_or_raise(&config)?;
        for d in &diagnostics {
            tracing::warn!(rule = %d.rule, node = ?d.node, "{}", d.message);
        }

        let graph = DependencyGraph::new(
            config
                .nodes
                .iter()
                .map(|n| (n.name.clone(), n.dependencies())),
        );
        let order = graph.topological_order()?;

        let registry = options
            .registry
            .unwrap_or_else(|| Arc::new(default_registry()));
        let root = config.root_path.as_deref();
        let nodes = order
            .iter()
            .map(|name| {
                let node_config = config.node(name).ok_or_else(|| {
                    MedallionError::ConfigError(format!("node '{name}' is not declared"))
                })?;
                PipelineNode::from_config(node_config, &registry, root).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let backend = options
            .backend
            .unwrap_or_else(|| default_backend(config.backend, root));

        let (strategy, orchestrator): (Box<dyn ExecutionStrategy>, Option<Arc<dyn Orchestrator>>) =
            match config.mode {
                ExecutionMode::Batch => (Box::new(BatchExecutor), None),
                ExecutionMode::Streaming => {
                    let orchestrator = options
                        .orchestrator
                        .unwrap_or_else(|| Arc::new(LocalOrchestrator::new()));
                    (
                        Box::new(StreamingExecutor::new(Arc::clone(&orchestrator))),
                        Some(orchestrator),
                    )
                }
            };

        tracing::info!(
            pipeline = %config.name,
            mode = %config.mode,
            backend = %backend.kind(),
            nodes = nodes.len(),
            "pipeline built"
        );

        Ok(Self {
            config,
            nodes,
            graph,
            backend,
            strategy,
            orchestrator,
            diagnostics,
            events: options.events.unwrap_or_default(),
            status: StatusBoard::new(),
            full_refresh: options.full_refresh,
        })
    }

    /// Load a YAML or JSON document and build it.
    pub fn from_path(path: &Path, options: PipelineOptions) -> Result<Self> {
        Self::build(PipelineConfig::load(path)?, options)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.strategy.mode()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn DataFrameBackend> {
        &self.backend
    }

    pub fn orchestrator(&self) -> Option<&Arc<dyn Orchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.status
    }

    pub fn full_refresh(&self) -> bool {
        self.full_refresh
    }

    /// Non-fatal diagnostics found while building.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Nodes in execution order.
    pub fn sorted_nodes(&self) -> &[Arc<PipelineNode>] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Arc<PipelineNode>> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Each node with its upstream nodes, in execution order.
    pub fn dependencies(&self) -> Vec<(&str, &[String])> {
        self.nodes
            .iter()
            .map(|n| (n.name(), n.dependencies()))
            .collect()
    }

    /// Declarative description of every node for a managed orchestrator.
    pub fn plans(&self) -> PipelinePlan {
        PipelinePlan {
            pipeline: self.name().to_string(),
            mode: self.mode(),
            backend: self.backend.kind().to_string(),
            nodes: self.nodes.iter().map(|n| NodePlan::from_node(n)).collect(),
        }
    }

    /// Run (batch) or register (streaming) every node. Node failures are
    /// reported, never returned.
    pub async fn execute(&self) -> RunReport {
        let started = Instant::now();
        tracing::info!(pipeline = self.name(), mode = %self.mode(), "pipeline started");
        self.events.emit(PipelineEvent::PipelineStarted {
            pipeline: self.name().to_string(),
            mode: self.mode().to_string(),
            node_count: self.nodes.len(),
        });

        let report = self.strategy.execute(self).await;

        let failed_nodes: Vec<String> = report.failed_nodes().into_iter().map(String::from).collect();
        let duration_ms = started.elapsed().as_millis() as u64;
        if failed_nodes.is_empty() {
            tracing::info!(pipeline = self.name(), duration_ms, "pipeline completed");
        } else {
            tracing::warn!(pipeline = self.name(), failed = ?failed_nodes, duration_ms, "pipeline completed with failures");
        }
        self.events.emit(PipelineEvent::PipelineCompleted {
            pipeline: self.name().to_string(),
            failed_nodes,
            duration_ms,
        });
        report
    }

    /// Like [`execute`](Self::execute), but a failed node is returned as
    /// `NodeExecutionError` naming the first failed node.
    pub async fn run(&self) -> Result<RunReport> {
        self.execute().await.into_result()
    }

    /// Run one micro-batch round through the orchestrator (streaming only).
    pub async fn trigger(&self) -> Result<RunReport> {
        match &self.orchestrator {
            Some(orchestrator) => orchestrator.trigger().await,
            None => Err(MedallionError::ConfigError(
                "micro-batch triggers require streaming mode".into(),
            )),
        }
    }

    /// Last-known report of a node.
    pub async fn node_status(&self, name: &str) -> Option<NodeReport> {
        self.status.get(name).await
    }

    /// Delete every sink's data and all streaming checkpoints.
    pub async fn purge(&self) -> Result<()> {
        for node in &self.nodes {
            for sink in node.sinks() {
                sink.purge(self.backend.as_ref()).await?;
            }
            self.backend
                .reset_checkpoint(node.checkpoint_location())
                .await?;
            tracing::info!(node = node.name(), "node purged");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("mode", &self.mode())
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
