//! CLI binary for validating, planning, and running Medallion pipelines.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use medallion_pipeline::{Pipeline, PipelineConfig, PipelineOptions, Severity};
use medallion_types::{ExecutionMode, NodeStatus, RunReport};

#[derive(Parser)]
#[command(name = "medallion", version, about = "Declarative batch and streaming data pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline document (YAML or JSON)
    Run {
        /// Path to the pipeline document
        pipeline: PathBuf,

        /// Override the document's execution mode (batch or streaming)
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Warehouse root for tables and checkpoints
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Overwrite sinks and reset streaming offsets
        #[arg(long)]
        full_refresh: bool,

        /// Micro-batch rounds to run in streaming mode
        #[arg(long, default_value = "1")]
        triggers: u64,

        /// Print run reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline document
    Validate {
        /// Path to the pipeline document
        pipeline: PathBuf,
    },

    /// Show nodes and their dependencies
    Info {
        /// Path to the pipeline document
        pipeline: PathBuf,
    },

    /// Write the orchestrator plan of every node as JSON
    Plan {
        /// Path to the pipeline document
        pipeline: PathBuf,

        /// Warehouse root used to derive checkpoint locations
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete sink data and checkpoints of every node
    Purge {
        /// Path to the pipeline document
        pipeline: PathBuf,

        /// Warehouse root for tables and checkpoints
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            mode,
            root,
            full_refresh,
            triggers,
            json,
        } => {
            let options = PipelineOptions {
                mode,
                root_path: root,
                full_refresh,
                ..PipelineOptions::default()
            };
            cmd_run(&pipeline, options, triggers, json).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::Plan {
            pipeline,
            root,
            output,
        } => {
            cmd_plan(&pipeline, root, output.as_deref())?;
        }
        Commands::Purge { pipeline, root } => {
            cmd_purge(&pipeline, root).await?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &Path, options: PipelineOptions) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::from_path(path, options)?)
}

fn root_options(root: Option<PathBuf>) -> PipelineOptions {
    PipelineOptions {
        root_path: root,
        ..PipelineOptions::default()
    }
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = PipelineConfig::load(path)?;
    let diagnostics = medallion_pipeline::validate(&config);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.node {
            Some(node) => println!("[{}] {} ({}): {}", severity, diag.rule, node, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path, PipelineOptions::default())?;

    println!("Pipeline: {}", pipeline.name());
    println!("Mode: {}", pipeline.mode());
    println!("Backend: {}", pipeline.backend().kind());
    println!("Nodes: {}", pipeline.sorted_nodes().len());

    println!("\nExecution order:");
    for node in pipeline.sorted_nodes() {
        let layer = node
            .layer()
            .map(|l| format!("{l:?}").to_uppercase())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} [{}] source={} steps={} expectations={} sinks={}",
            node.name(),
            layer,
            node.source().describe(),
            node.chain().len(),
            node.expectations().len(),
            node.sinks().len()
        );
        if !node.dependencies().is_empty() {
            println!("    depends on: {}", node.dependencies().join(", "));
        }
    }

    for diag in pipeline.diagnostics() {
        println!("{diag}");
    }
    Ok(())
}

fn cmd_plan(path: &Path, root: Option<PathBuf>, output: Option<&Path>) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path, root_options(root))?;
    let json = pipeline.plans().to_json()?;

    match output {
        Some(output) => {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(output, json)?;
            println!("Wrote plan for {} nodes to {}", pipeline.sorted_nodes().len(), output.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_purge(path: &Path, root: Option<PathBuf>) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path, root_options(root))?;
    pipeline.purge().await?;
    println!("Purged {} nodes", pipeline.sorted_nodes().len());
    Ok(())
}

async fn cmd_run(
    path: &Path,
    options: PipelineOptions,
    triggers: u64,
    json: bool,
) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path, options)?;

    println!("Running pipeline: {} ({})", pipeline.name(), pipeline.mode());
    if pipeline.full_refresh() {
        println!("(full refresh)");
    }

    let report = pipeline.execute().await;
    print_report(&report, json)?;
    if pipeline.mode() == ExecutionMode::Batch {
        return Ok(());
    }

    for round in 1..=triggers {
        let report = pipeline.trigger().await?;
        println!("\nMicro-batch {round}");
        print_report(&report, json)?;
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for line in summary_lines(report) {
            println!("{line}");
        }
    }
    if let Some(failure) = report.first_failure() {
        anyhow::bail!(
            "node '{}' failed: {}",
            failure.node,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn summary_lines(report: &RunReport) -> Vec<String> {
    report
        .nodes
        .iter()
        .map(|n| match n.status {
            NodeStatus::Registered => format!("  {} registered", n.node),
            NodeStatus::Success => {
                let mut line = format!(
                    "  {} ok: {} in, {} accepted",
                    n.node, n.rows_input, n.rows_accepted
                );
                if n.rows_quarantined > 0 {
                    line.push_str(&format!(", {} quarantined", n.rows_quarantined));
                }
                for (expectation, rows) in &n.rows_rejected_per_expectation {
                    if *rows > 0 {
                        line.push_str(&format!(", {expectation} rejected {rows}"));
                    }
                }
                line
            }
            NodeStatus::Failed => match &n.propagated_from {
                Some(upstream) => format!("  {} skipped: upstream '{}' failed", n.node, upstream),
                None => format!(
                    "  {} FAILED at {}: {}",
                    n.node,
                    n.failed_step.as_deref().unwrap_or("unknown step"),
                    n.error.as_deref().unwrap_or("")
                ),
            },
        })
        .collect()
}
