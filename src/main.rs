use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::approval::ApprovalDecision;
use weft_core::config::AppConfig;
use weft_core::types::{LiveStopReason, RunEvent, RunStatus};
use weft_engine::{DirGraphSource, Engine, Graph, LiveMode, LiveOptions};
use weft_nodes::backend::{HttpToolBackend, OpenAiModel};

#[derive(Parser)]
#[command(name = "weft", version, about = "Validate and run workflow graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Log engine internals at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph and print its execution plan
    Validate {
        /// Workflow graph (JSON)
        graph: PathBuf,
    },
    /// Run a graph once and print the result as JSON
    Run {
        /// Workflow graph (JSON)
        graph: PathBuf,
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        approvals: ApprovalArgs,
        /// Override engine.max_concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run a graph repeatedly until stopped
    Live {
        /// Workflow graph (JSON)
        graph: PathBuf,
        #[command(flatten)]
        inputs: InputArgs,
        #[command(flatten)]
        approvals: ApprovalArgs,
        /// Delay between passes (continuous mode)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Stop after this many passes (0 = unbounded)
        #[arg(long)]
        max_passes: Option<u64>,
        /// Start one pass per line read on stdin
        #[arg(long)]
        trigger: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Run input as KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(long = "input", value_name = "KEY=VALUE")]
    pairs: Vec<String>,
    /// JSON object of run inputs
    #[arg(long)]
    inputs_file: Option<PathBuf>,
}

#[derive(Args)]
struct ApprovalArgs {
    /// Approve every approval request
    #[arg(long, conflicts_with = "auto_deny")]
    auto_approve: bool,
    /// Deny every approval request
    #[arg(long)]
    auto_deny: bool,
}

/// How approval requests raised during a run are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalMode {
    Prompt,
    Approve,
    Deny,
    /// Leave requests pending until they time out.
    Wait,
}

impl ApprovalArgs {
    fn mode(&self, stdin_free: bool) -> ApprovalMode {
        if self.auto_approve {
            ApprovalMode::Approve
        } else if self.auto_deny {
            ApprovalMode::Deny
        } else if stdin_free {
            ApprovalMode::Prompt
        } else {
            ApprovalMode::Wait
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "weft=debug,warn"
    } else {
        "weft=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { graph } => {
            let engine = build_engine(&config, &graph);
            let graph = Graph::from_file(&graph)?;
            validate(&engine, &graph)
        }
        Commands::Run {
            graph,
            inputs,
            approvals,
            concurrency,
        } => {
            if let Some(n) = concurrency {
                config.engine.max_concurrency = n.max(1);
            }
            let engine = build_engine(&config, &graph);
            let graph = Graph::from_file(&graph)?;
            let inputs = collect_inputs(&inputs)?;
            run_once(&engine, &graph, inputs, approvals.mode(true)).await
        }
        Commands::Live {
            graph,
            inputs,
            approvals,
            interval_ms,
            max_passes,
            trigger,
        } => {
            let mut options = LiveOptions::from_config(&config.live, trigger);
            if let (Some(ms), LiveMode::Continuous { .. }) = (interval_ms, options.mode) {
                options.mode = LiveMode::Continuous {
                    interval: Duration::from_millis(ms),
                };
            }
            if let Some(n) = max_passes {
                options.max_passes = n;
            }
            // Trigger mode reads stdin, so approvals cannot prompt there
            let mode = approvals.mode(!trigger);
            if trigger && mode == ApprovalMode::Wait {
                warn!("Approval requests will wait for their timeout; pass --auto-approve or --auto-deny to answer them");
            }
            let engine = build_engine(&config, &graph);
            let graph = Graph::from_file(&graph)?;
            let inputs = collect_inputs(&inputs)?;
            run_live(&engine, &graph, inputs, options, mode).await
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        debug!(path = %path.display(), "No config file; using defaults");
        Ok(AppConfig::default())
    }
}

/// Engine wired to the configured backends. Subworkflows resolve from the
/// workflow library, or from the graph file's directory when none is set.
fn build_engine(config: &AppConfig, graph_path: &Path) -> Engine {
    let mut builder = Engine::builder().with_config(config.engine.clone());
    if let Some(model) = &config.model {
        info!(model = %model.model_id, "Model backend configured");
        builder = builder.with_model(Arc::new(OpenAiModel::new(model.clone())));
    }
    if let Some(tools) = &config.tools {
        info!(endpoint = %tools.endpoint, "Tool backend configured");
        builder = builder.with_tools(Arc::new(HttpToolBackend::new(tools)));
    }
    let library = config
        .workflows
        .as_ref()
        .map(|w| w.dir())
        .or_else(|| graph_path.parent().map(Path::to_path_buf));
    if let Some(dir) = library {
        builder = builder.with_graph_source(Arc::new(DirGraphSource::new(dir)));
    }
    builder.build()
}

fn validate(engine: &Engine, graph: &Graph) -> anyhow::Result<ExitCode> {
    let report = engine.check(graph);
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if !report.is_ok() {
        for issue in &report.errors {
            eprintln!("error: {issue}");
        }
        eprintln!("{} validation error(s)", report.errors.len());
        return Ok(ExitCode::FAILURE);
    }
    let plan = engine.validate(graph)?;
    println!("{}", serde_json::to_string_pretty(&plan.summary())?);
    Ok(ExitCode::SUCCESS)
}

async fn run_once(
    engine: &Engine,
    graph: &Graph,
    inputs: HashMap<String, Value>,
    mode: ApprovalMode,
) -> anyhow::Result<ExitCode> {
    // Subscribe before starting so no transition is missed
    let printer = spawn_event_printer(engine, mode);
    let handle = engine.start(graph, inputs)?;

    let run_id = handle.run_id().clone();
    let signal_engine = engine.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(run_id = %run_id, "Interrupted; cancelling run");
            signal_engine.cancel(&run_id);
        }
    });

    let result = handle.join().await?;
    signal.abort();
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(match result.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Cancelled => ExitCode::FAILURE,
    })
}

async fn run_live(
    engine: &Engine,
    graph: &Graph,
    inputs: HashMap<String, Value>,
    options: LiveOptions,
    mode: ApprovalMode,
) -> anyhow::Result<ExitCode> {
    let triggered = options.mode == LiveMode::Triggered;
    let printer = spawn_event_printer(engine, mode);
    let mut handle = engine.start_live(graph, inputs, options)?;
    info!(live_id = %handle.live_id(), "Press Ctrl-C to stop");

    let stop = handle.cancel_token();
    let signal = tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopping live run...");
                stop.cancel();
            }
        }
    });

    if triggered {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                line = lines.next_line() => match line.context("reading trigger input")? {
                    Some(line) => {
                        if handle.fire(trigger_inputs(&line)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        handle.close_trigger();
                        break;
                    }
                },
            }
        }
    }

    let summary = handle.join().await?;
    signal.abort();
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(match summary.reason {
        LiveStopReason::ErrorPolicy | LiveStopReason::ConsecutiveErrors => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Streams engine events to stderr and answers approval requests.
fn spawn_event_printer(engine: &Engine, mode: ApprovalMode) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.subscribe();
    let engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                RunEvent::NodeStatusChanged {
                    node_id, status, ..
                } => {
                    eprintln!("[{node_id}] {status}");
                }
                RunEvent::IterationProgress {
                    node_id,
                    completed,
                    total,
                    ..
                } => {
                    eprintln!("[{node_id}] {completed}/{total} items");
                }
                RunEvent::ApprovalRequested { request } => {
                    eprintln!(
                        "\n[APPROVAL] {} ({}): {}",
                        request.node_id,
                        short_id(&request.id),
                        request.message
                    );
                    if !request.preview.is_empty() {
                        eprintln!("  {}", request.preview);
                    }
                    let decision = match mode {
                        ApprovalMode::Approve => ApprovalDecision::Approved,
                        ApprovalMode::Deny => ApprovalDecision::Denied {
                            reason: "denied by --auto-deny".into(),
                        },
                        ApprovalMode::Prompt => prompt_decision().await,
                        ApprovalMode::Wait => continue,
                    };
                    if !engine.resolve_approval(&request.id, decision).await {
                        warn!(request_id = %request.id, "Approval request was already resolved");
                    }
                }
                RunEvent::ApprovalResolved {
                    request_id,
                    outcome,
                } => {
                    debug!(request_id = %request_id, outcome = ?outcome, "Approval resolved");
                }
                RunEvent::LivePassCompleted {
                    pass,
                    status,
                    duration_ms,
                    tokens,
                    output_summary,
                    ..
                } => {
                    eprintln!(
                        "[pass {pass}] {status} in {duration_ms}ms ({tokens} tokens) {output_summary}"
                    );
                }
                RunEvent::LiveStopped { passes, reason, .. } => {
                    eprintln!("[live] stopped after {passes} passes: {reason}");
                }
                RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. } => {}
            }
        }
    })
}

async fn prompt_decision() -> ApprovalDecision {
    let approved = tokio::task::spawn_blocking(|| {
        dialoguer::Confirm::new()
            .with_prompt("Approve?")
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);
    decision_for(approved)
}

fn decision_for(approved: bool) -> ApprovalDecision {
    if approved {
        ApprovalDecision::Approved
    } else {
        ApprovalDecision::Denied {
            reason: "denied by user".into(),
        }
    }
}

fn collect_inputs(args: &InputArgs) -> anyhow::Result<HashMap<String, Value>> {
    let mut inputs = HashMap::new();
    if let Some(path) = &args.inputs_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Value>(&raw)
            .with_context(|| format!("parsing {}", path.display()))?
        {
            Value::Object(map) => inputs.extend(map),
            _ => anyhow::bail!("{} must contain a JSON object", path.display()),
        }
    }
    for pair in &args.pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got '{pair}'"))?;
        inputs.insert(key.trim().to_string(), parse_value(raw));
    }
    Ok(inputs)
}

/// A trigger line: a JSON object of inputs, or any other value as `input`.
fn trigger_inputs(line: &str) -> HashMap<String, Value> {
    let line = line.trim();
    if line.is_empty() {
        return HashMap::new();
    }
    match parse_value(line) {
        Value::Object(map) => map.into_iter().collect(),
        other => HashMap::from([("input".to_string(), other)]),
    }
}

/// JSON when it parses, otherwise the raw text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
