use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datalab_flow::api::AppState;
use datalab_flow::{
    AnalysisService, AnalysisStatus, ApiServer, ApiServerConfig, Collaborators, DagEditMask,
    FlowConfig, HttpExecutor, MemoryStore, ReplayRequest, StoreState,
};

const SNAPSHOT_FILE: &str = "store.json";

#[derive(Parser)]
#[command(name = "datalab")]
#[command(about = "Dependency-aware replay of DataLab experiments", long_about = None)]
struct Cli {
    /// Data directory holding the store snapshot
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an empty store snapshot
    Init,

    /// Show the dependency graph and wave schedule of an experiment
    Graph {
        experiment_id: String,

        /// Print the graph as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay an analysis against the function workers
    Replay {
        analysis_id: String,

        /// User charged for the replay
        #[arg(short, long)]
        user: String,

        /// Task to leave out (repeatable)
        #[arg(long = "disable")]
        disabled: Vec<String>,

        /// Skip tasks that only depend on disabled work instead of failing
        #[arg(long)]
        cascade: bool,

        /// Override a node value, as node_id=<json> (repeatable)
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,

        /// Submit the tasks of a wave concurrently
        #[arg(long)]
        parallel: bool,
    },

    /// Start API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "datalab_flow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let snapshot = cli.data_dir.join(SNAPSHOT_FILE);

    match cli.command {
        Commands::Init => {
            init_store(&cli.data_dir, &snapshot).await?;
            println!("Store initialized at {:?}", snapshot);
        }

        Commands::Graph { ref experiment_id, json } => {
            let config = load_config(cli.config.as_deref())?;
            let (service, _) = create_service(&snapshot, config)?;
            let plan = service
                .plan_experiment(experiment_id)
                .await
                .with_context(|| format!("Failed to build graph for {}", experiment_id))?;

            if json {
                let state = plan.graph().to_state();
                let out = serde_json::json!({
                    "experiment_id": experiment_id,
                    "tasks": state.tasks,
                    "edges": state.edges,
                    "waves": plan.waves(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if plan.graph().is_empty() {
                println!("No tasks found for experiment {}", experiment_id);
            } else {
                println!("Experiment {} ({} tasks):", experiment_id, plan.graph().len());
                for (i, wave) in plan.waves().iter().enumerate() {
                    println!("  wave {}: {}", i + 1, wave.join(", "));
                }
                let pins: Vec<&str> = plan
                    .dependencies()
                    .output_pins()
                    .map(|n| n.id.as_str())
                    .collect();
                if !pins.is_empty() {
                    println!("  outputs: {}", pins.join(", "));
                }
            }
        }

        Commands::Replay {
            ref analysis_id,
            ref user,
            ref disabled,
            cascade,
            ref inputs,
            parallel,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            config.parallel_waves |= parallel;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, no further tasks will be submitted");
                    on_signal.cancel();
                }
            });

            let (service, store) = create_service(&snapshot, config)?;
            let service = service.with_cancellation(cancel);

            let dag_edit_mask = (!disabled.is_empty() || cascade).then(|| DagEditMask {
                disabled_task_ids: disabled.iter().cloned().collect(),
                cascade_disabled: cascade,
            });
            let request = ReplayRequest {
                analysis_id: analysis_id.clone(),
                user_id: user.clone(),
                dag_edit_mask,
                outer_input: inputs.iter().cloned().collect(),
            };

            let result = service.replay_analysis(request).await;
            store
                .save(&snapshot)
                .await
                .with_context(|| format!("Failed to save {:?}", snapshot))?;
            let outcome = result.with_context(|| format!("Replay of {} failed", analysis_id))?;

            let icon = match outcome.status {
                AnalysisStatus::Success => "✓",
                _ => "✗",
            };
            println!("[{}] Analysis {} {:?}", icon, outcome.analysis_id, outcome.status);
            for run in &outcome.runs {
                println!(
                    "  {} -> {} ({}) {:?}",
                    run.old_task_id, run.execution_id, run.tool_name, run.state
                );
            }
            if let Some(task_id) = &outcome.failing_task_id {
                println!("  failing task: {}", task_id);
            }
            if let Some(message) = &outcome.message {
                println!("  message: {}", message);
            }
            println!(
                "  cost: {:.4} ({} tasks at flat rate)",
                outcome.cost, outcome.fallback_count
            );
        }

        Commands::Serve { host, port } => {
            let config = load_config(cli.config.as_deref())?;
            let (service, store) = create_service(&snapshot, config)?;
            let state = AppState {
                service,
                store,
                snapshot_path: Some(snapshot.clone()),
            };

            println!("Starting API server on {}:{}", host, port);
            ApiServer::new(ApiServerConfig { host, port }, state).start().await?;
        }
    }

    Ok(())
}

async fn init_store(data_dir: &Path, snapshot: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
    if snapshot.exists() {
        return Ok(());
    }
    MemoryStore::from_state(StoreState::default())
        .save(snapshot)
        .await
        .context("Failed to write store snapshot")?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FlowConfig> {
    let config = match path {
        Some(path) => FlowConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FlowConfig::default(),
    };
    config.with_env_overrides().context("Invalid environment override")
}

fn create_service(
    snapshot: &Path,
    config: FlowConfig,
) -> Result<(AnalysisService, Arc<MemoryStore>)> {
    let store = MemoryStore::load(snapshot)
        .with_context(|| format!("Failed to load {:?}, run 'datalab init' first", snapshot))?;
    let store = Arc::new(store);
    let worker = HttpExecutor::new(config.worker.clone())
        .context("Failed to create worker client")?;
    let worker = Arc::new(worker);
    let service = AnalysisService::new(Collaborators::new(store.clone(), worker), config);
    Ok((service, store))
}

fn parse_input(raw: &str) -> std::result::Result<(String, Value), String> {
    let (node_id, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected node_id=<json>, got '{}'", raw))?;
    // Bare words are taken as strings
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((node_id.to_string(), value))
}
