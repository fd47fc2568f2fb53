//! Pipeline validation: lint rules and diagnostics.
//!
//! Rules check the structure (names, references, cycles, stream compatibility)
//! and the semantics (quarantine routing, sink targets, expression syntax) of a
//! [`PipelineConfig`]. Call [`validate`] for all diagnostics or
//! [`validate_or_raise`] to fail on any `Error`-severity issue.

use std::collections::{HashMap, HashSet};

use medallion_expr::{parse_expr, parse_query, DataType};
use medallion_types::{MedallionError, Result};

use crate::config::{PipelineConfig, SourceConfig, TransformerStepConfig, WriteMode};
use crate::graph::DependencyGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{level}[{}]: {}", self.rule, self.message)?;
        if let Some(fix) = &self.fix {
            write!(f, " (fix: {fix})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic>;
}

fn diagnostic(
    rule: &dyn LintRule,
    severity: Severity,
    node: Option<&str>,
    message: String,
    fix: Option<&str>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        node: node.map(String::from),
        fix: fix.map(String::from),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueNodeNamesRule;
impl LintRule for UniqueNodeNamesRule {
    fn name(&self) -> &str { "unique_node_names" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for n in &config.nodes {
            *counts.entry(n.name.as_str()).or_default() += 1;
        }
        let mut reported = HashSet::new();
        config
            .nodes
            .iter()
            .filter(|n| counts[n.name.as_str()] > 1 && reported.insert(n.name.as_str()))
            .map(|n| {
                diagnostic(
                    self,
                    Severity::Error,
                    Some(&n.name),
                    format!(
                        "node name '{}' is declared {} times",
                        n.name,
                        counts[n.name.as_str()]
                    ),
                    Some("Give every node a unique name"),
                )
            })
            .collect()
    }
}

struct SourceReferenceExistsRule;
impl LintRule for SourceReferenceExistsRule {
    fn name(&self) -> &str { "source_reference_exists" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let names: HashSet<&str> = config.nodes.iter().map(|n| n.name.as_str()).collect();
        let mut out = Vec::new();
        for n in &config.nodes {
            for r in n.node_refs() {
                if r.node_name == n.name {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!("node '{}' references itself", n.name),
                        None,
                    ));
                } else if !names.contains(r.node_name.as_str()) {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!(
                            "node '{}' references unknown node '{}'",
                            n.name, r.node_name
                        ),
                        Some("Declare the referenced node or fix the node_name"),
                    ));
                }
            }
        }
        out
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let graph = DependencyGraph::new(
            config
                .nodes
                .iter()
                .map(|n| (n.name.clone(), n.dependencies())),
        );
        match graph.find_cycle() {
            // Self references are reported by source_reference_exists.
            Some(cycle) if cycle.len() > 2 => vec![diagnostic(
                self,
                Severity::Error,
                cycle.first().map(String::as_str),
                format!("dependency cycle detected: {}", cycle.join(" -> ")),
                Some("Remove one of the references in the cycle"),
            )],
            _ => vec![],
        }
    }
}

struct StreamCompatibilityRule;
impl LintRule for StreamCompatibilityRule {
    fn name(&self) -> &str { "stream_compatibility" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            for r in n.node_refs().into_iter().filter(|r| r.as_stream) {
                let Some(upstream) = config.node(&r.node_name) else {
                    continue;
                };
                if !upstream.source.as_stream() {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!(
                            "node '{}' reads node '{}' as a stream, but '{}' does not read its own source as a stream",
                            n.name, r.node_name, r.node_name
                        ),
                        Some("Set as_stream on the upstream source or drop it on this reference"),
                    ));
                }
            }
        }
        out
    }
}

struct QuarantineSinkRule;
impl LintRule for QuarantineSinkRule {
    fn name(&self) -> &str { "quarantine_sink" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            let has_sink = n.sinks.iter().any(|s| s.is_quarantine);
            let has_expectation = n.has_quarantine_expectations();
            if has_expectation && !has_sink {
                out.push(diagnostic(
                    self,
                    Severity::Error,
                    Some(&n.name),
                    format!(
                        "node '{}' has QUARANTINE expectations but no quarantine sink",
                        n.name
                    ),
                    Some("Add a sink with is_quarantine: true"),
                ));
            } else if has_sink && !has_expectation {
                out.push(diagnostic(
                    self,
                    Severity::Warning,
                    Some(&n.name),
                    format!(
                        "node '{}' has a quarantine sink but no QUARANTINE expectation; it will only receive empty writes",
                        n.name
                    ),
                    None,
                ));
            }
        }
        out
    }
}

struct SinkTargetRule;
impl LintRule for SinkTargetRule {
    fn name(&self) -> &str { "sink_target" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            for (i, s) in n.sinks.iter().enumerate() {
                let message = match (&s.table_name, &s.path) {
                    (None, None) => format!("node '{}' sink {i} has neither table_name nor path", n.name),
                    (Some(_), Some(_)) => format!("node '{}' sink {i} has both table_name and path", n.name),
                    _ => continue,
                };
                out.push(diagnostic(self, Severity::Error, Some(&n.name), message, None));
            }
        }
        out
    }
}

struct MergePrimaryKeysRule;
impl LintRule for MergePrimaryKeysRule {
    fn name(&self) -> &str { "merge_primary_keys" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            for (i, s) in n.sinks.iter().enumerate() {
                let has_keys = s
                    .merge_cdc_options
                    .as_ref()
                    .is_some_and(|m| !m.primary_keys.is_empty());
                if s.mode == WriteMode::Merge && !has_keys {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!("node '{}' sink {i} uses MERGE without primary_keys", n.name),
                        Some("Set merge_cdc_options.primary_keys"),
                    ));
                }
            }
        }
        out
    }
}

struct MergeOptionsRule;
impl LintRule for MergeOptionsRule {
    fn name(&self) -> &str { "merge_options" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            for (i, s) in n.sinks.iter().enumerate() {
                let Some(options) = s.merge_cdc_options.as_ref() else {
                    continue;
                };
                if s.mode != WriteMode::Merge {
                    continue;
                }
                for problem in options.problems() {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!("node '{}' sink {i}: {problem}", n.name),
                        None,
                    ));
                }
            }
        }
        out
    }
}

struct ExpressionSyntaxRule;
impl LintRule for ExpressionSyntaxRule {
    fn name(&self) -> &str { "expression_syntax" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            let mut check = |what: String, result: Result<()>| {
                if let Err(e) = result {
                    out.push(diagnostic(
                        self,
                        Severity::Error,
                        Some(&n.name),
                        format!("node '{}' {what}: {e}", n.name),
                        None,
                    ));
                }
            };
            for e in &n.expectations {
                check(format!("expectation '{}'", e.name), parse_expr(&e.expr).map(drop));
            }
            for (i, step) in n.transformer.iter().enumerate() {
                match step {
                    TransformerStepConfig::Sql { sql_expr } => {
                        check(format!("transformer step {i}"), parse_query(sql_expr).map(drop));
                    }
                    TransformerStepConfig::WithColumns { with_columns } => {
                        for c in with_columns {
                            check(format!("column '{}'", c.name), parse_expr(&c.expr).map(drop));
                            if let Some(t) = &c.dtype {
                                check(format!("column '{}'", c.name), DataType::parse(t).map(drop));
                            }
                        }
                    }
                    TransformerStepConfig::Function { .. } => {}
                }
            }
            for s in &n.sinks {
                if let Some(cond) = s.merge_cdc_options.as_ref().and_then(|m| m.delete_where.as_ref()) {
                    check("merge delete_where".to_string(), parse_expr(cond).map(drop));
                }
            }
        }
        out
    }
}

struct HasSinksRule;
impl LintRule for HasSinksRule {
    fn name(&self) -> &str { "has_sinks" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let referenced: HashSet<String> = config
            .nodes
            .iter()
            .flat_map(|n| n.dependencies())
            .collect();
        config
            .nodes
            .iter()
            .filter(|n| n.sinks.is_empty() && !referenced.contains(&n.name))
            .map(|n| {
                diagnostic(
                    self,
                    Severity::Warning,
                    Some(&n.name),
                    format!("node '{}' has no sinks and no dependents; its output is discarded", n.name),
                    Some("Add a sink or remove the node"),
                )
            })
            .collect()
    }
}

struct UniqueExpectationNamesRule;
impl LintRule for UniqueExpectationNamesRule {
    fn name(&self) -> &str { "unique_expectation_names" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for n in &config.nodes {
            let mut seen = HashSet::new();
            for e in &n.expectations {
                if !seen.insert(e.name.as_str()) {
                    out.push(diagnostic(
                        self,
                        Severity::Warning,
                        Some(&n.name),
                        format!(
                            "node '{}' declares expectation '{}' more than once; its counts are summed in the report",
                            n.name, e.name
                        ),
                        None,
                    ));
                }
            }
        }
        out
    }
}

struct StreamingSourceRule;
impl LintRule for StreamingSourceRule {
    fn name(&self) -> &str { "streaming_source" }
    fn apply(&self, config: &PipelineConfig) -> Vec<Diagnostic> {
        if !config.mode.is_streaming() {
            return vec![];
        }
        config
            .nodes
            .iter()
            .filter(|n| matches!(n.source, SourceConfig::File(_) | SourceConfig::Table(_)))
            .filter(|n| !n.source.as_stream())
            .map(|n| {
                diagnostic(
                    self,
                    Severity::Info,
                    Some(&n.name),
                    format!(
                        "node '{}' reads its external source in full on every micro-batch",
                        n.name
                    ),
                    Some("Set as_stream: true to read only new rows"),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(config: &PipelineConfig) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueNodeNamesRule),
        Box::new(SourceReferenceExistsRule),
        Box::new(AcyclicRule),
        Box::new(StreamCompatibilityRule),
        Box::new(QuarantineSinkRule),
        Box::new(SinkTargetRule),
        Box::new(MergePrimaryKeysRule),
        Box::new(MergeOptionsRule),
        Box::new(ExpressionSyntaxRule),
        Box::new(HasSinksRule),
        Box::new(UniqueExpectationNamesRule),
        Box::new(StreamingSourceRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(config));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(config: &PipelineConfig) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(config);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(MedallionError::ConfigError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(nodes: serde_json::Value) -> PipelineConfig {
        PipelineConfig::from_value(nodes).unwrap()
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn valid_pipeline_passes() {
        let c = config(json!([
            {"name": "brz", "source": {"table_name": "raw"}, "sinks": [{"table_name": "brz"}]},
            {
                "name": "slv",
                "source": {"node_name": "brz"},
                "expectations": [{"name": "positive", "expr": "open > 0", "action": "QUARANTINE"}],
                "sinks": [{"table_name": "slv"}, {"table_name": "slv_q", "is_quarantine": true}]
            }
        ]));
        let diags = validate(&c);
        let errors: Vec<_> = diags.iter().filter(|d| d.severity == Severity::Error).collect();
        assert!(errors.is_empty(), "Expected no errors, got: {errors:?}");
        assert!(validate_or_raise(&c).is_ok());
    }

    #[test]
    fn duplicate_names_error() {
        let c = config(json!([
            {"name": "brz", "source": {"table_name": "a"}, "sinks": [{"table_name": "a1"}]},
            {"name": "brz", "source": {"table_name": "b"}, "sinks": [{"table_name": "b1"}]}
        ]));
        let diags = validate(&c);
        assert_eq!(diags.iter().filter(|d| d.rule == "unique_node_names").count(), 1);
    }

    #[test]
    fn dangling_reference_error() {
        let c = config(json!([
            {"name": "slv", "source": {"node_name": "brz"}, "sinks": [{"table_name": "slv"}]}
        ]));
        let err = validate_or_raise(&c).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("unknown node 'brz'"));
    }

    #[test]
    fn cycle_error() {
        let c = config(json!([
            {"name": "a", "source": {"node_name": "b"}, "sinks": [{"table_name": "a"}]},
            {"name": "b", "source": {"node_name": "a"}, "sinks": [{"table_name": "b"}]}
        ]));
        assert!(has(&validate(&c), "acyclic", Severity::Error));
    }

    #[test]
    fn stream_reference_to_batch_node_error() {
        let c = config(json!([
            {"name": "brz", "source": {"table_name": "raw"}, "sinks": [{"table_name": "brz"}]},
            {"name": "slv", "source": {"node_name": "brz", "as_stream": true}, "sinks": [{"table_name": "slv"}]}
        ]));
        assert!(has(&validate(&c), "stream_compatibility", Severity::Error));
    }

    #[test]
    fn quarantine_without_sink_error_and_unused_sink_warning() {
        let c = config(json!([
            {
                "name": "slv",
                "source": {"table_name": "raw"},
                "expectations": [{"name": "e", "expr": "x > 0", "action": "QUARANTINE"}],
                "sinks": [{"table_name": "slv"}]
            },
            {
                "name": "gld",
                "source": {"table_name": "raw"},
                "sinks": [{"table_name": "gld"}, {"table_name": "gld_q", "is_quarantine": true}]
            }
        ]));
        let diags = validate(&c);
        assert!(diags.iter().any(|d| d.rule == "quarantine_sink"
            && d.severity == Severity::Error
            && d.node.as_deref() == Some("slv")));
        assert!(diags.iter().any(|d| d.rule == "quarantine_sink"
            && d.severity == Severity::Warning
            && d.node.as_deref() == Some("gld")));
    }

    #[test]
    fn sink_and_merge_errors() {
        let c = config(json!([
            {
                "name": "slv",
                "source": {"table_name": "raw"},
                "sinks": [
                    {"mode": "APPEND"},
                    {"table_name": "t", "mode": "MERGE"}
                ]
            }
        ]));
        let diags = validate(&c);
        assert!(has(&diags, "sink_target", Severity::Error));
        assert!(has(&diags, "merge_primary_keys", Severity::Error));
    }

    #[test]
    fn merge_option_conflicts() {
        let c = config(json!([
            {
                "name": "slv",
                "source": {"table_name": "raw"},
                "sinks": [{
                    "table_name": "t",
                    "mode": "MERGE",
                    "merge_cdc_options": {
                        "primary_keys": ["id"],
                        "scd_type": 2,
                        "exclude_columns": ["op"]
                    }
                }]
            }
        ]));
        let diags = validate(&c);
        let merge: Vec<_> = diags.iter().filter(|d| d.rule == "merge_options").collect();
        assert_eq!(merge.len(), 1);
        assert_eq!(merge[0].severity, Severity::Error);
        assert!(merge[0].message.contains("order_by"));
        assert!(!has(&diags, "merge_primary_keys", Severity::Error));
    }

    #[test]
    fn expression_syntax_errors() {
        let c = config(json!([
            {
                "name": "slv",
                "source": {"table_name": "raw"},
                "transformer": [
                    {"sql_expr": "SELECT FROM {df}"},
                    {"with_columns": [{"name": "x", "type": "money", "expr": "a +"}]}
                ],
                "expectations": [{"name": "e", "expr": "open >"}],
                "sinks": [{"table_name": "slv"}]
            }
        ]));
        let count = validate(&c)
            .iter()
            .filter(|d| d.rule == "expression_syntax")
            .count();
        assert_eq!(count, 4);
    }

    #[test]
    fn warnings_do_not_raise() {
        let c = config(json!([
            {
                "name": "orphan",
                "source": {"table_name": "raw"},
                "expectations": [
                    {"name": "e", "expr": "x > 0"},
                    {"name": "e", "expr": "x < 10"}
                ]
            }
        ]));
        let diags = validate_or_raise(&c).unwrap();
        assert!(has(&diags, "has_sinks", Severity::Warning));
        assert!(has(&diags, "unique_expectation_names", Severity::Warning));
    }

    #[test]
    fn diagnostic_display() {
        let d = Diagnostic {
            rule: "has_sinks".into(),
            severity: Severity::Warning,
            message: "node 'x' has no sinks".into(),
            node: Some("x".into()),
            fix: Some("Add a sink".into()),
        };
        assert_eq!(d.to_string(), "warning[has_sinks]: node 'x' has no sinks (fix: Add a sink)");
    }
}
