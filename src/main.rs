use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowloom_core::config::AppConfig;
use flowloom_core::control::ControlMessage;
use flowloom_core::definition::WorkflowDefinition;
use flowloom_core::event::{Envelope, EventBus, FlowEvent};
use flowloom_core::traits::{BusSink, ScriptCatalog};
use flowloom_core::types::RunRecord;
use flowloom_core::vars::StoreVars;
use flowloom_engine::{
    Broadcaster, DirectoryCatalog, DirectorySource, Interpreter, ProjectCoordinator,
    ReqwestClient, RunSupervisor, ScriptSandbox,
};

#[derive(Parser)]
#[command(name = "flowloom", version, about = "Scripted workflow graph runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "FLOWLOOM_CONFIG", default_value = "flowloom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition and stream its events
    Run {
        /// Workflow definition (JSON with `nodes` and `edges`)
        workflow: PathBuf,
        /// Initial vars: a JSON file or an inline JSON object
        #[arg(long)]
        vars: Option<String>,
        /// Project id the run belongs to (defaults to the file stem)
        #[arg(long)]
        project: Option<String>,
        /// Execute in-process without registering a run
        #[arg(long)]
        preview: bool,
    },
    /// List known runs, newest first
    Runs,
    /// Show one run by run id or project id
    Status { id: String },
    /// Remove a finished run from the registry
    Cleanup { run_id: String },
    /// Keep the projects in a directory converged on their desired status
    Live {
        /// Directory of `*.json` project files
        projects_dir: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowloom", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            workflow,
            vars,
            project,
            preview,
        } => {
            let definition = read_definition(&workflow)?;
            let vars = parse_vars(vars.as_deref())?;
            if preview {
                run_preview(&config, definition, vars).await?;
            } else {
                let project = project.unwrap_or_else(|| project_id_for(&workflow));
                run_supervised(&config, &project, definition, vars).await?;
            }
        }
        Commands::Runs => {
            let supervisor = build_supervisor(&config)?;
            supervisor.restore().await;
            for record in supervisor.list_runs().await {
                print_record(&record);
            }
        }
        Commands::Status { id } => {
            let supervisor = build_supervisor(&config)?;
            supervisor.restore().await;
            let record = supervisor.get_run_status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Cleanup { run_id } => {
            let supervisor = build_supervisor(&config)?;
            supervisor.restore().await;
            let removed = supervisor.remove_run(&run_id).await?;
            println!("Removed run {} ({})", removed.run_id, removed.status);
        }
        Commands::Live { projects_dir } => {
            run_live(&config, projects_dir).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn read_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    let definition: WorkflowDefinition = serde_json::from_str(&content)
        .with_context(|| format!("parsing workflow {}", path.display()))?;
    Ok(definition)
}

fn parse_vars(raw: Option<&str>) -> anyhow::Result<StoreVars> {
    let Some(raw) = raw else {
        return Ok(StoreVars::new());
    };
    let path = Path::new(raw);
    let json = if path.is_file() {
        std::fs::read_to_string(path).with_context(|| format!("reading vars {}", raw))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&json).context("--vars must be a JSON object")
}

fn project_id_for(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}

fn load_catalog(config: &AppConfig) -> Arc<dyn ScriptCatalog> {
    let catalog = match config.sandbox.scripts_dir.as_deref() {
        Some(dir) => DirectoryCatalog::load(&flowloom_core::config::expand_home(dir)),
        None => DirectoryCatalog::new(),
    };
    Arc::new(catalog)
}

fn build_sandbox(config: &AppConfig) -> anyhow::Result<ScriptSandbox> {
    let network = ReqwestClient::new(&config.sandbox)?;
    Ok(ScriptSandbox::new(Arc::new(network), &config.sandbox))
}

fn build_supervisor(config: &AppConfig) -> anyhow::Result<Arc<RunSupervisor>> {
    let event_bus = Arc::new(EventBus::default());
    let broadcaster = Arc::new(Broadcaster::new(config.watchers.buffer, event_bus));
    Ok(Arc::new(RunSupervisor::new(
        config,
        broadcaster,
        build_sandbox(config)?,
        load_catalog(config),
    )))
}

/// Drive a definition in-process. Nothing is registered or persisted.
///
/// Control messages are read from stdin, one per line, so a node that
/// calls `wait()` can be resumed with `resume <nodeId>`.
async fn run_preview(
    config: &AppConfig,
    definition: WorkflowDefinition,
    vars: StoreVars,
) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let sink = Arc::new(BusSink {
        subject: "preview".to_string(),
        bus: bus.clone(),
    });

    // The sender lives until the preview ends, so EOF on stdin never
    // aborts a waiting node.
    let (control_tx, control_rx) = mpsc::channel(config.supervisor.control_buffer.max(1));
    let interpreter = Interpreter::new(definition, vars, build_sandbox(config)?, sink)
        .with_catalog(load_catalog(config))
        .with_config(config.interpreter.clone())
        .with_control(control_rx);
    let cancel = interpreter.cancel_token();
    let task = tokio::spawn(interpreter.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, aborting preview");
                cancel.cancel();
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match ControlMessage::parse_line(&line) {
                    Ok(Some(msg)) => {
                        info!(event = msg.name(), "Sending control message");
                        if control_tx.send(msg).await.is_err() {
                            stdin_open = false;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Ignoring control line"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            received = rx.recv() => match received {
                Ok(envelope) => {
                    print_envelope(&envelope);
                    match &envelope.event {
                        FlowEvent::WorkflowComplete {} => break,
                        FlowEvent::NodeWait { node_id, .. } if stdin_open => {
                            info!(
                                node_id = %node_id,
                                "Waiting; type `resume {}` to continue",
                                node_id
                            );
                        }
                        FlowEvent::NodeWait { node_id, .. } => {
                            warn!(node_id = %node_id, "Waiting with stdin closed; Ctrl-C to abort");
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Preview output lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let report = task.await??;
    info!(outcome = ?report.outcome, steps = report.steps, "Preview finished");
    Ok(())
}

/// Register a run with the supervisor and stream it until it ends.
async fn run_supervised(
    config: &AppConfig,
    project_id: &str,
    definition: WorkflowDefinition,
    vars: StoreVars,
) -> anyhow::Result<()> {
    let supervisor = build_supervisor(config)?;
    supervisor.restore().await;

    let mut watcher = supervisor.watch(project_id).await;
    let record = supervisor.start_run(project_id, definition, vars).await?;
    info!(run_id = %record.run_id, project_id = %project_id, "Watching run");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping run");
                supervisor.stop_run(record.run_id.as_str()).await?;
            }
            envelope = watcher.recv() => {
                let Some(envelope) = envelope else { break };
                print_envelope(&envelope);
                if envelope.event.is_run_terminal() {
                    break;
                }
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

/// Reconcile a directory of projects until Ctrl-C.
async fn run_live(config: &AppConfig, projects_dir: PathBuf) -> anyhow::Result<()> {
    let supervisor = build_supervisor(config)?;
    supervisor.restore().await;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down live coordinator...");
        cancel_clone.cancel();
    });

    // Print every event from every run.
    let mut firehose = supervisor.broadcaster().event_bus().subscribe();
    let printer_cancel = cancel.clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_cancel.cancelled() => break,
                received = firehose.recv() => match received {
                    Ok(envelope) => print_envelope(&envelope),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event output lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let coordinator = ProjectCoordinator::new(supervisor.clone(), &config.coordinator, cancel)
        .with_source(Arc::new(DirectorySource::new(projects_dir)));
    coordinator.run().await;

    supervisor.shutdown().await;
    printer.await.ok();
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize event"),
    }
}

fn print_record(record: &RunRecord) {
    println!(
        "{}  {:<10} {:<20} {}  {}",
        record.run_id,
        record.status.to_string(),
        record.project_id,
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        record.current_node_id.as_deref().unwrap_or("-"),
    );
}
