//! Run events broadcast to observers.
//!
//! Executors publish [`PipelineEvent`]s on a [`tokio::sync::broadcast`]
//! channel; subscribers see node lifecycle, expectation results, sink writes
//! and committed offsets.

use serde::{Deserialize, Serialize};

/// Events emitted while a pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline: String,
        mode: String,
        node_count: usize,
    },
    PipelineCompleted {
        pipeline: String,
        failed_nodes: Vec<String>,
        duration_ms: u64,
    },
    NodeRegistered {
        node: String,
        orchestrator: String,
    },
    NodeStarted {
        node: String,
    },
    NodeCompleted {
        node: String,
        rows_input: usize,
        rows_accepted: usize,
        duration_ms: u64,
    },
    NodeFailed {
        node: String,
        step: Option<String>,
        error: String,
    },
    /// Not attempted because an upstream node failed.
    NodeSkipped {
        node: String,
        upstream: String,
    },
    ExpectationEvaluated {
        node: String,
        expectation: String,
        action: String,
        failing_rows: usize,
    },
    SinkWritten {
        node: String,
        sink: String,
        mode: String,
        rows: usize,
    },
    OffsetsCommitted {
        node: String,
        checkpoint: String,
    },
    TriggerCompleted {
        pipeline: String,
        trigger: u64,
        failed_nodes: Vec<String>,
    },
}

/// Cloneable handle on the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Subscribers lagging more than `capacity` events miss the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Events sent while nobody is subscribed are discarded.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
