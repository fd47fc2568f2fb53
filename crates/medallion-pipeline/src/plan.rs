//! Declarative node plans for managed streaming orchestrators.

use serde::{Deserialize, Serialize};

use medallion_types::{ExecutionMode, Result};

use crate::backend::Location;
use crate::config::{ExpectationAction, ExpectationConfig, Layer, TransformerStepConfig, WriteMode};
use crate::node::PipelineNode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRef {
    pub location: Location,
    pub mode: WriteMode,
    pub is_quarantine: bool,
    pub checkpoint_location: String,
}

/// Everything an orchestrator needs to materialise one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePlan {
    pub name: String,
    pub layer: Option<Layer>,
    /// `node:<name>`, `table:<name>`, or `file:<path>`.
    pub source_ref: String,
    pub as_stream: bool,
    pub transform_steps: Vec<TransformerStepConfig>,
    pub expectation_rules: Vec<ExpectationConfig>,
    pub sink_refs: Vec<SinkRef>,
    /// Predicate selecting quarantined rows: the OR of the failure conditions
    /// of every QUARANTINE expectation.
    pub quarantine_condition: Option<String>,
    pub checkpoint_location: String,
    pub dependencies: Vec<String>,
}

impl NodePlan {
    pub fn from_node(node: &PipelineNode) -> Self {
        let conditions: Vec<String> = node
            .expectations()
            .iter()
            .filter(|e| e.action == ExpectationAction::Quarantine)
            .map(|e| e.failure_condition())
            .collect();
        let quarantine_condition = match conditions.len() {
            0 => None,
            1 => conditions.into_iter().next(),
            _ => Some(
                conditions
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            ),
        };

        Self {
            name: node.name().to_string(),
            layer: node.layer(),
            source_ref: node.source().describe(),
            as_stream: node.is_streaming(),
            transform_steps: node.config().transformer.clone(),
            expectation_rules: node.config().expectations.clone(),
            sink_refs: node
                .sinks()
                .iter()
                .map(|s| SinkRef {
                    location: s.location().clone(),
                    mode: s.mode(),
                    is_quarantine: s.is_quarantine(),
                    checkpoint_location: s.checkpoint_location().to_string(),
                })
                .collect(),
            quarantine_condition,
            checkpoint_location: node.checkpoint_location().to_string(),
            dependencies: node.dependencies().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub pipeline: String,
    pub mode: ExecutionMode,
    pub backend: String,
    /// In execution order.
    pub nodes: Vec<NodePlan>,
}

impl PipelinePlan {
    pub fn node(&self, name: &str) -> Option<&NodePlan> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::functions::default_registry;
    use serde_json::json;
    use std::path::Path;

    fn plan(value: serde_json::Value) -> NodePlan {
        let config: NodeConfig = serde_json::from_value(value).unwrap();
        let node = PipelineNode::from_config(&config, &default_registry(), Some(Path::new("/wh"))).unwrap();
        NodePlan::from_node(&node)
    }

    #[test]
    fn plan_describes_node() {
        let p = plan(json!({
            "name": "slv",
            "layer": "SILVER",
            "source": {"node_name": "brz", "as_stream": true},
            "transformer": [{"sql_expr": "SELECT * FROM {df}"}],
            "expectations": [
                {"name": "not_null", "expr": "open IS NOT NULL", "action": "QUARANTINE"},
                {"name": "positive", "expr": "open > 0", "action": "QUARANTINE"},
                {"name": "small", "expr": "open < 1000", "action": "DROP"}
            ],
            "sinks": [
                {"table_name": "slv"},
                {"table_name": "slv_q", "is_quarantine": true}
            ]
        }));

        assert_eq!(p.layer, Some(Layer::Silver));
        assert_eq!(p.source_ref, "node:brz");
        assert!(p.as_stream);
        assert_eq!(p.dependencies, vec!["brz"]);
        assert_eq!(p.transform_steps.len(), 1);
        assert_eq!(p.expectation_rules.len(), 3);
        assert_eq!(
            p.quarantine_condition.as_deref(),
            Some("(NOT COALESCE((open IS NOT NULL), FALSE)) OR (NOT COALESCE((open > 0), FALSE))")
        );
        assert!(p.checkpoint_location.starts_with("/wh/slv/checkpoints/sink-"));
        assert_eq!(p.checkpoint_location, p.sink_refs[0].checkpoint_location);
        assert!(p.sink_refs[1].is_quarantine);
        assert!(medallion_expr::parse_expr(p.quarantine_condition.as_deref().unwrap()).is_ok());
    }

    #[test]
    fn plan_serializes_to_json() {
        let p = plan(json!({"name": "brz", "source": {"table_name": "raw"}}));
        assert!(p.quarantine_condition.is_none());
        assert_eq!(p.checkpoint_location, "/wh/brz/checkpoints/node");

        let pipeline = PipelinePlan {
            pipeline: "stocks".into(),
            mode: ExecutionMode::Streaming,
            backend: "local".into(),
            nodes: vec![p],
        };
        let value: serde_json::Value = serde_json::from_str(&pipeline.to_json().unwrap()).unwrap();
        assert_eq!(value["nodes"][0]["source_ref"], json!("table:raw"));
        assert_eq!(value["mode"], json!("streaming"));
        assert!(pipeline.node("brz").is_some());
    }
}
