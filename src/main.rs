//! mcpflow - Workflow orchestration for MCP servers
//!
//! Interprets declarative YAML workflow graphs and executes them against
//! Model Context Protocol servers over stdio, SSE, or HTTP transports.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mcpflow::engine::{Engine, EngineOptions};
use mcpflow::pool::{ConnectionPool, PoolConfig};
use mcpflow::workflow::{export_sanitized, Workflow};
use mcpflow::ExecutionStatus;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mcpflow")]
#[command(about = "Workflow orchestration runtime for MCP servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCPFLOW_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Workflow YAML file
        workflow: PathBuf,

        /// Input variable as key=value (value parsed as JSON, falling
        /// back to a plain string); repeatable
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Overall execution timeout (e.g. 30s, 5m)
        #[arg(long)]
        timeout: Option<String>,

        /// Fail on undefined template variables
        #[arg(long)]
        strict: bool,
    },

    /// Parse and validate a workflow file
    Validate {
        /// Workflow YAML file
        workflow: PathBuf,
    },

    /// Export a workflow with credentials stripped
    Export {
        /// Workflow YAML file
        workflow: PathBuf,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the tools a configured server offers
    Tools {
        /// Workflow YAML file declaring the server
        workflow: PathBuf,

        /// Server ID to query
        #[arg(long)]
        server: String,
    },

    /// Probe a configured server
    Ping {
        /// Workflow YAML file declaring the server
        workflow: PathBuf,

        /// Server ID to probe
        #[arg(long)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Run { workflow, inputs, timeout, strict } => {
            run_workflow(workflow, inputs, timeout, strict).await
        },
        Commands::Validate { workflow } => {
            let parsed = Workflow::from_file(&workflow)
                .with_context(|| format!("validation failed for {}", workflow.display()))?;
            println!(
                "OK: {} ({} nodes, {} edges, {} servers)",
                parsed.name,
                parsed.nodes.len(),
                parsed.edges.len(),
                parsed.servers.len()
            );
            Ok(())
        },
        Commands::Export { workflow, output } => {
            let parsed = Workflow::from_file(&workflow)?;
            let yaml = export_sanitized(&parsed)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "exported workflow");
                },
                None => print!("{}", yaml),
            }
            Ok(())
        },
        Commands::Tools { workflow, server } => list_tools(workflow, server).await,
        Commands::Ping { workflow, server } => ping_server(workflow, server).await,
    }
}

async fn run_workflow(
    path: PathBuf,
    raw_inputs: Vec<String>,
    timeout: Option<String>,
    strict: bool,
) -> anyhow::Result<()> {
    let workflow = Workflow::from_file(&path)?;
    let inputs = parse_inputs(&raw_inputs)?;
    let timeout = timeout
        .map(|t| humantime::parse_duration(&t))
        .transpose()
        .context("invalid --timeout value")?;

    let pool = ConnectionPool::new(PoolConfig::default());
    for server in &workflow.servers {
        pool.register(server.clone())?;
    }

    let options = EngineOptions {
        strict_templates: strict,
        ..EngineOptions::default()
    };
    let engine = std::sync::Arc::new(Engine::with_options(pool.clone(), options));

    if let Some(limit) = timeout {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            engine.cancel();
        });
    }

    let execution = engine.execute(workflow, inputs).await?;
    pool.close().await.ok();

    match execution.status {
        ExecutionStatus::Completed => {
            if let Some(value) = &execution.return_value {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            info!(
                execution = %execution.id,
                nodes = execution.nodes.len(),
                "workflow completed"
            );
            Ok(())
        },
        ExecutionStatus::Cancelled => {
            error!(execution = %execution.id, "workflow cancelled");
            std::process::exit(2);
        },
        _ => {
            error!(
                execution = %execution.id,
                error = execution.error.as_deref().unwrap_or("unknown"),
                "workflow failed"
            );
            std::process::exit(1);
        },
    }
}

async fn list_tools(path: PathBuf, server_id: String) -> anyhow::Result<()> {
    let workflow = Workflow::from_file(&path)?;
    let pool = ConnectionPool::new(PoolConfig::default());
    for server in &workflow.servers {
        pool.register(server.clone())?;
    }

    let conn = pool.get(&server_id).await?;
    let tools = conn.list_tools(Duration::from_secs(30)).await;
    pool.release(&server_id);
    pool.close().await.ok();

    for tool in tools? {
        match tool.description {
            Some(description) => println!("{}\t{}", tool.name, description),
            None => println!("{}", tool.name),
        }
    }
    Ok(())
}

async fn ping_server(path: PathBuf, server_id: String) -> anyhow::Result<()> {
    let workflow = Workflow::from_file(&path)?;
    let pool = ConnectionPool::new(PoolConfig::default());
    for server in &workflow.servers {
        pool.register(server.clone())?;
    }

    let started = std::time::Instant::now();
    let conn = pool.get(&server_id).await?;
    let result = conn.ping(Duration::from_secs(5)).await;
    pool.release(&server_id);
    pool.close().await.ok();

    result?;
    println!("{}: ok ({} ms)", server_id, started.elapsed().as_millis());
    Ok(())
}

/// Parse `key=value` inputs; values are JSON when they parse as JSON,
/// plain strings otherwise.
fn parse_inputs(raw: &[String]) -> anyhow::Result<HashMap<String, Value>> {
    let mut inputs = HashMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("input {:?} is not key=value", item))?;
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), parsed);
    }
    Ok(inputs)
}
