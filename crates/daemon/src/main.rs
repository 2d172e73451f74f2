use anyhow::{Context, Result};
use arbor_core::{DagId, DagRunState, DagState, Orchestrator, OrchestratorError, RunId};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod config;
mod pipelines;

use config::ArborConfig;

#[derive(Parser, Debug)]
#[command(name = "arbor")]
#[command(about = "Arbor - DAG task orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "arbor.toml", env = "ARBOR_CONFIG")]
    config: PathBuf,

    /// Data directory for run state and event logs
    #[arg(short, long, default_value = "./data", env = "ARBOR_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,

    /// Create a manual run and wait for it to finish
    Trigger {
        dag: String,

        /// JSON object handed to tasks as the run configuration
        #[arg(long)]
        conf: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        wait_secs: u64,
    },

    /// List registered DAGs with their failure counters
    Dags,

    /// List runs, optionally for one DAG
    Runs {
        #[arg(long)]
        dag: Option<String>,
    },

    /// Show a run's task instances and events
    Show { run_id: RunId },

    /// Clear a DAG's consecutive failure counter
    ResetFailures { dag: String },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "arbor=info,arbor_core=info".into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ArborConfig::load(&args.config, args.data_dir)?;
    init_tracing(config.logging.json);

    tracing::info!("Data directory: {}", config.data_dir.display());

    let orchestrator = config.open_orchestrator()?;
    for dag in pipelines::bundled_dags(&config)? {
        orchestrator.register_dag(dag)?;
    }

    match args.command {
        Command::Run => run(&orchestrator).await,
        Command::Trigger {
            dag,
            conf,
            wait_secs,
        } => trigger(&orchestrator, DagId::new(dag), conf, wait_secs).await,
        Command::Dags => list_dags(&orchestrator),
        Command::Runs { dag } => list_runs(&orchestrator, dag.map(DagId::new)),
        Command::Show { run_id } => show_run(&orchestrator, run_id).await,
        Command::ResetFailures { dag } => {
            let state = orchestrator.reset_failures(&DagId::new(dag))?;
            println!(
                "DAG {}: consecutive failed runs reset to {}",
                state.dag_id, state.consecutive_failed_runs
            );
            Ok(())
        }
    }
}

async fn run(orchestrator: &Orchestrator) -> Result<()> {
    tracing::info!("Starting Arbor scheduler");

    let resumed = orchestrator.recover().await?;
    if resumed > 0 {
        tracing::info!("Resumed {} runs from a previous process", resumed);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    orchestrator.run(shutdown).await?;
    Ok(())
}

async fn trigger(
    orchestrator: &Orchestrator,
    dag_id: DagId,
    conf: Option<String>,
    wait_secs: u64,
) -> Result<()> {
    let conf = match conf {
        Some(raw) => serde_json::from_str(&raw).context("Invalid --conf JSON")?,
        None => serde_json::Value::Null,
    };

    let run_id = orchestrator.trigger_run(&dag_id, conf).await?;
    println!("Triggered run {} of DAG {}", run_id, dag_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    let record = loop {
        match orchestrator
            .wait_for_run(&run_id, Duration::from_secs(1))
            .await
        {
            Ok(record) => break record,
            Err(OrchestratorError::Timeout(_)) if tokio::time::Instant::now() < deadline => {
                orchestrator.start_queued_runs(&dag_id).await?;
            }
            Err(e) => {
                orchestrator.shutdown().await?;
                return Err(e.into());
            }
        }
    };
    orchestrator.shutdown().await?;

    println!("Run {} finished: {}", run_id, record.run.state);
    for ti in record.task_instances.values() {
        println!(
            "  {:<24} {:<16} tries={}",
            ti.task_id.to_string(),
            ti.state.to_string(),
            ti.try_number
        );
    }
    if record.run.state != DagRunState::Success {
        anyhow::bail!("Run {} ended {}", run_id, record.run.state);
    }
    Ok(())
}

fn list_dags(orchestrator: &Orchestrator) -> Result<()> {
    let mut states: HashMap<DagId, DagState> = orchestrator
        .dag_states()?
        .into_iter()
        .map(|state| (state.dag_id.clone(), state))
        .collect();

    for dag in orchestrator.dags() {
        let state = states
            .remove(dag.id())
            .unwrap_or_else(|| DagState::new(dag.id().clone()));
        let last_scheduled = state
            .last_scheduled_logical_date
            .map_or_else(|| "-".to_string(), |d| d.to_rfc3339());
        println!(
            "{:<20} schedule={:<24} tasks={:<3} failed_in_a_row={}/{} last_scheduled={}",
            dag.id().to_string(),
            dag.schedule().to_string(),
            dag.topological_order().len(),
            state.consecutive_failed_runs,
            dag.max_consecutive_failed_runs(),
            last_scheduled
        );
    }

    // History left by DAGs this build no longer bundles
    for state in states.into_values() {
        println!(
            "{:<20} (not registered) failed_in_a_row={}",
            state.dag_id.to_string(),
            state.consecutive_failed_runs
        );
    }
    Ok(())
}

fn list_runs(orchestrator: &Orchestrator, dag_id: Option<DagId>) -> Result<()> {
    for run in orchestrator.list_runs(dag_id.as_ref())? {
        println!(
            "{} {:<20} {:<16} {:<10} {}",
            run.id,
            run.dag_id.to_string(),
            format!("{:?}", run.run_type),
            run.state.to_string(),
            run.logical_date
        );
    }
    Ok(())
}

async fn show_run(orchestrator: &Orchestrator, run_id: RunId) -> Result<()> {
    let record = orchestrator.get_run(&run_id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("Failed to encode run")?
    );

    let events = orchestrator.event_log().get_run_events(run_id).await?;
    for event in events {
        println!(
            "{} {}",
            event.timestamp,
            serde_json::to_string(&event.event_type).context("Failed to encode event")?
        );
    }
    Ok(())
}
