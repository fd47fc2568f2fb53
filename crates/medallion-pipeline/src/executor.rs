//! Execution strategies and orchestrators.
//!
//! [`BatchExecutor`] runs every node once, in dependency order. The
//! [`StreamingExecutor`] hands each node to an [`Orchestrator`] as a
//! [`StreamingUnit`]; [`LocalOrchestrator`] then drives micro-batch rounds in
//! process, while [`PlanRecorder`] only keeps the declarative plans.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use medallion_types::{ExecutionMode, MedallionError, NodeReport, Result, RunReport};

use crate::backend::DataFrameBackend;
use crate::events::{EventEmitter, PipelineEvent};
use crate::graph::DependencyGraph;
use crate::node::{ExecutionContext, NodeResult, PipelineNode, StreamOutputs, UpstreamOutputs};
use crate::pipeline::Pipeline;
use crate::plan::NodePlan;

// ---------------------------------------------------------------------------
// Status board
// ---------------------------------------------------------------------------

/// Last-known report per node, shared between a pipeline and its orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<String, NodeReport>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, report: NodeReport) {
        self.inner.write().await.insert(report.node.clone(), report);
    }

    pub async fn get(&self, node: &str) -> Option<NodeReport> {
        self.inner.read().await.get(node).cloned()
    }
}

// ---------------------------------------------------------------------------
// Node invocation shared by strategies
// ---------------------------------------------------------------------------

/// Execute one node, emitting lifecycle events. A failure is turned into the
/// node's failed report.
async fn run_node(
    node: &PipelineNode,
    ctx: &ExecutionContext<'_>,
) -> std::result::Result<NodeResult, NodeReport> {
    let name = node.name();
    let emit = |event: PipelineEvent| {
        if let Some(events) = ctx.events {
            events.emit(event);
        }
    };
    emit(PipelineEvent::NodeStarted {
        node: name.to_string(),
    });

    let started = Instant::now();
    match node.execute(ctx).await {
        Ok(result) => {
            emit(PipelineEvent::NodeCompleted {
                node: name.to_string(),
                rows_input: result.report.rows_input,
                rows_accepted: result.report.rows_accepted,
                duration_ms: result.report.duration_ms,
            });
            Ok(result)
        }
        Err(e) => {
            tracing::warn!(node = name, step = ?e.step(), error = %e, "node failed");
            emit(PipelineEvent::NodeFailed {
                node: name.to_string(),
                step: e.step().map(String::from),
                error: e.to_string(),
            });
            let mut report = NodeReport::failed(name, &e);
            report.duration_ms = started.elapsed().as_millis() as u64;
            Err(report)
        }
    }
}

fn skipped(node: &str, upstream: &str, events: &EventEmitter) -> NodeReport {
    tracing::warn!(node, upstream, "node skipped: upstream failed");
    events.emit(PipelineEvent::NodeSkipped {
        node: node.to_string(),
        upstream: upstream.to_string(),
    });
    NodeReport::failed_by_propagation(node, upstream)
}

// ---------------------------------------------------------------------------
// ExecutionStrategy
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Run (batch) or register (streaming) every node of `pipeline`. Node
    /// failures are recorded in the report, never returned.
    async fn execute(&self, pipeline: &Pipeline) -> RunReport;
}

#[derive(Debug, Default)]
pub struct BatchExecutor;

#[async_trait]
impl ExecutionStrategy for BatchExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Batch
    }

    async fn execute(&self, pipeline: &Pipeline) -> RunReport {
        let started = Instant::now();
        let backend = pipeline.backend();
        let mut report = RunReport::new(pipeline.name(), ExecutionMode::Batch, backend.kind().to_string());
        let mut upstream = UpstreamOutputs::new();
        // failed node -> node whose own failure caused it
        let mut failed: HashMap<String, String> = HashMap::new();

        for node in pipeline.sorted_nodes() {
            let name = node.name();
            let root = node
                .dependencies()
                .iter()
                .find_map(|d| failed.get(d))
                .cloned();

            let node_report = match root {
                Some(root) => {
                    failed.insert(name.to_string(), root.clone());
                    skipped(name, &root, pipeline.events())
                }
                None => {
                    let ctx = ExecutionContext::new(backend.as_ref(), &upstream, ExecutionMode::Batch)
                        .with_full_refresh(pipeline.full_refresh())
                        .with_events(pipeline.events());
                    match run_node(node, &ctx).await {
                        Ok(result) => {
                            upstream.insert_batch(name, result.output);
                            result.report
                        }
                        Err(failure) => {
                            failed.insert(name.to_string(), name.to_string());
                            failure
                        }
                    }
                }
            };
            pipeline.status_board().set(node_report.clone()).await;
            report.nodes.push(node_report);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }
}

// ---------------------------------------------------------------------------
// Orchestrators
// ---------------------------------------------------------------------------

/// A node handed to an orchestrator.
#[derive(Clone)]
pub struct StreamingUnit {
    pub pipeline: String,
    pub plan: NodePlan,
    pub node: Arc<PipelineNode>,
    pub backend: Arc<dyn DataFrameBackend>,
    pub status: StatusBoard,
    pub events: EventEmitter,
    /// Rewrite sinks and reset offsets on the first micro-batch.
    pub full_refresh: bool,
}

impl std::fmt::Debug for StreamingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingUnit")
            .field("pipeline", &self.pipeline)
            .field("node", &self.plan.name)
            .field("full_refresh", &self.full_refresh)
            .finish()
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn name(&self) -> &str;

    /// Register a unit, replacing any earlier registration of the same node.
    async fn register(&self, unit: StreamingUnit) -> Result<()>;

    /// Names of registered nodes, in registration order.
    async fn registered(&self) -> Vec<String>;

    /// Run one micro-batch round over every registered node.
    async fn trigger(&self) -> Result<RunReport> {
        Err(MedallionError::Other(format!(
            "orchestrator '{}' does not run micro-batches in process",
            self.name()
        )))
    }
}

/// In-process orchestrator. Each [`trigger`](Orchestrator::trigger) runs one
/// micro-batch per node; nodes of equal depth run concurrently. A streaming
/// read of another node's output returns the rows that reader has not yet
/// processed successfully.
#[derive(Debug, Default)]
pub struct LocalOrchestrator {
    units: RwLock<Vec<Arc<StreamingUnit>>>,
    state: Mutex<StreamOutputs>,
    triggers: AtomicU64,
}

impl LocalOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed micro-batch rounds.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    fn name(&self) -> &str {
        "local"
    }

    async fn register(&self, unit: StreamingUnit) -> Result<()> {
        let mut units = self.units.write().await;
        let unit = Arc::new(unit);
        match units.iter_mut().find(|u| u.plan.name == unit.plan.name) {
            Some(existing) => *existing = unit,
            None => units.push(unit),
        }
        Ok(())
    }

    async fn registered(&self) -> Vec<String> {
        self.units
            .read()
            .await
            .iter()
            .map(|u| u.plan.name.clone())
            .collect()
    }

    async fn trigger(&self) -> Result<RunReport> {
        let units: Vec<Arc<StreamingUnit>> = self.units.read().await.clone();
        let Some(first) = units.first() else {
            return Err(MedallionError::Other(
                "no nodes registered with the local orchestrator".into(),
            ));
        };

        // Serialises rounds; outputs of previous rounds feed the next one.
        let mut state = self.state.lock().await;
        let started = Instant::now();
        let round = self.triggers.load(Ordering::SeqCst);
        let pipeline = first.pipeline.clone();
        let events = first.events.clone();
        let mut report = RunReport::new(&pipeline, ExecutionMode::Streaming, first.backend.kind().to_string());

        let graph = DependencyGraph::new(
            units
                .iter()
                .map(|u| (u.plan.name.clone(), u.node.dependencies().to_vec())),
        );
        let by_name: HashMap<&str, &Arc<StreamingUnit>> =
            units.iter().map(|u| (u.plan.name.as_str(), u)).collect();
        let mut reports: HashMap<String, NodeReport> = HashMap::new();
        let mut failed: HashMap<String, String> = HashMap::new();

        for level in graph.levels()? {
            let mut tasks = JoinSet::new();

            for name in &level {
                let unit = Arc::clone(by_name[name.as_str()]);
                let root = unit
                    .node
                    .dependencies()
                    .iter()
                    .find_map(|d| failed.get(d))
                    .cloned();
                if let Some(root) = root {
                    failed.insert(name.clone(), root.clone());
                    reports.insert(name.clone(), skipped(name, &root, &events));
                    continue;
                }

                let (upstream, staged) = state.view(name, unit.node.dependencies());
                let full_refresh = unit.full_refresh && round == 0;
                tasks.spawn(async move {
                    let ctx = ExecutionContext::new(unit.backend.as_ref(), &upstream, ExecutionMode::Streaming)
                        .with_full_refresh(full_refresh)
                        .with_events(&unit.events);
                    let outcome = run_node(&unit.node, &ctx).await;
                    (unit.plan.name.clone(), staged, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, staged, Ok(result))) => {
                        state.commit(&name, staged);
                        state.append(&name, result.output);
                        reports.insert(name, result.report);
                    }
                    Ok((name, _, Err(failure))) => {
                        failed.insert(name.clone(), name.clone());
                        reports.insert(name, failure);
                    }
                    Err(e) => tracing::error!(error = %e, "node task did not complete"),
                }
            }

            for name in &level {
                if !reports.contains_key(name) {
                    let err = MedallionError::Other(format!("task running node '{name}' panicked"));
                    failed.insert(name.clone(), name.clone());
                    reports.insert(name.clone(), NodeReport::failed(name.as_str(), &err));
                }
            }
        }

        for unit in &units {
            if let Some(r) = reports.remove(&unit.plan.name) {
                unit.status.set(r.clone()).await;
                report.nodes.push(r);
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        let round = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        let failed_nodes: Vec<String> = report.failed_nodes().into_iter().map(String::from).collect();
        tracing::info!(pipeline = %pipeline, trigger = round, failed = failed_nodes.len(), "micro-batch round complete");
        events.emit(PipelineEvent::TriggerCompleted {
            pipeline,
            trigger: round,
            failed_nodes,
        });
        Ok(report)
    }
}

/// Orchestrator that only records node plans, for handing off to an external
/// scheduler.
#[derive(Debug, Default)]
pub struct PlanRecorder {
    plans: RwLock<Vec<NodePlan>>,
}

impl PlanRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn plans(&self) -> Vec<NodePlan> {
        self.plans.read().await.clone()
    }
}

#[async_trait]
impl Orchestrator for PlanRecorder {
    fn name(&self) -> &str {
        "plan_recorder"
    }

    async fn register(&self, unit: StreamingUnit) -> Result<()> {
        let mut plans = self.plans.write().await;
        match plans.iter_mut().find(|p| p.name == unit.plan.name) {
            Some(existing) => *existing = unit.plan,
            None => plans.push(unit.plan),
        }
        Ok(())
    }

    async fn registered(&self) -> Vec<String> {
        self.plans.read().await.iter().map(|p| p.name.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// StreamingExecutor
// ---------------------------------------------------------------------------

pub struct StreamingExecutor {
    orchestrator: Arc<dyn Orchestrator>,
}

impl StreamingExecutor {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }
}

#[async_trait]
impl ExecutionStrategy for StreamingExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Streaming
    }

    /// Register every node; no micro-batch runs here.
    async fn execute(&self, pipeline: &Pipeline) -> RunReport {
        let started = Instant::now();
        let backend = pipeline.backend();
        let mut report =
            RunReport::new(pipeline.name(), ExecutionMode::Streaming, backend.kind().to_string());

        for node in pipeline.sorted_nodes() {
            let unit = StreamingUnit {
                pipeline: pipeline.name().to_string(),
                plan: NodePlan::from_node(node),
                node: Arc::clone(node),
                backend: Arc::clone(backend),
                status: pipeline.status_board().clone(),
                events: pipeline.events().clone(),
                full_refresh: pipeline.full_refresh(),
            };
            let node_report = match self.orchestrator.register(unit).await {
                Ok(()) => {
                    pipeline.events().emit(PipelineEvent::NodeRegistered {
                        node: node.name().to_string(),
                        orchestrator: self.orchestrator.name().to_string(),
                    });
                    NodeReport::registered(node.name())
                }
                Err(e) => {
                    tracing::warn!(node = node.name(), error = %e, "node registration failed");
                    NodeReport::failed(node.name(), &e)
                }
            };
            pipeline.status_board().set(node_report.clone()).await;
            report.nodes.push(node_report);
        }

        tracing::info!(
            pipeline = pipeline.name(),
            orchestrator = self.orchestrator.name(),
            nodes = report.nodes.len(),
            "nodes registered"
        );
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_types::NodeStatus;

    #[tokio::test]
    async fn status_board_keeps_last_report() {
        let board = StatusBoard::new();
        assert!(board.get("brz").await.is_none());
        board.set(NodeReport::registered("brz")).await;
        board.set(NodeReport::success("brz")).await;
        assert_eq!(board.get("brz").await.unwrap().status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn empty_local_orchestrator_cannot_trigger() {
        let orchestrator = LocalOrchestrator::new();
        assert!(orchestrator.trigger().await.is_err());
        assert_eq!(orchestrator.trigger_count(), 0);
        assert!(orchestrator.registered().await.is_empty());
    }

    #[tokio::test]
    async fn plan_recorder_does_not_trigger() {
        let recorder = PlanRecorder::new();
        let err = recorder.trigger().await.unwrap_err();
        assert!(err.to_string().contains("plan_recorder"));
    }
}
