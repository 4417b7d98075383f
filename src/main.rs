use std::sync::Arc;

use chrono::NaiveDate;
use clap::Parser;
use conductor::config::AppConfig;
use conductor::daemon::MarketAwareDaemon;
use conductor::dag::{build_global_dag, build_market_dag};
use conductor::engine_run::{EngineRunStore, RunPhase};
use conductor::error::{ConductorError, Result};
use conductor::executor::{JobRegistry, PhaseAdvanceBody};
use conductor::market_state::MarketStateMachine;
use conductor::store::JobExecutionStore;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "conductor", about = "Market-aware job orchestration daemon")]
struct Cli {
    /// Configuration directory (default.toml + environment overlay)
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Markets to orchestrate; overrides daemon.markets from config
    #[arg(long = "market")]
    markets: Vec<String>,

    /// Seconds between poll cycles; overrides daemon.poll_interval_secs
    #[arg(long)]
    poll_interval_seconds: Option<u64>,

    /// Fixed as-of date (YYYY-MM-DD) instead of the wall clock's date
    #[arg(long)]
    as_of_date: Option<NaiveDate>,

    /// Stop each market worker after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the orchestration daemon (default)
    Run,
    /// Print the job DAG for the configured markets and exit
    ShowDag,
    /// Print current session state for every configured market and exit
    ShowStates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)?;
    if !cli.markets.is_empty() {
        config.daemon.markets = cli.markets.clone();
    }
    if let Some(poll) = cli.poll_interval_seconds {
        config.daemon.poll_interval_secs = poll;
    }
    if let Some(date) = cli.as_of_date {
        config.daemon.as_of_date = Some(date);
    }
    if let Some(cycles) = cli.cycles {
        config.daemon.max_cycles = Some(cycles);
    }

    if let Err(errors) = config.validate() {
        return Err(ConductorError::ConfigValidation(errors.join("; ")));
    }

    init_logging(&config);

    let states = Arc::new(if config.markets.is_empty() {
        MarketStateMachine::with_defaults()
    } else {
        MarketStateMachine::new(config.markets.clone())
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, states).await,
        Command::ShowDag => show_dag(&config),
        Command::ShowStates => show_states(&config, &states),
    }
}

async fn run_daemon(config: AppConfig, states: Arc<MarketStateMachine>) -> Result<()> {
    info!(
        markets = ?config.daemon.markets,
        poll_interval_secs = config.daemon.poll_interval_secs,
        "starting conductor"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    let executions = JobExecutionStore::new(pool.clone());
    let runs = EngineRunStore::new(pool);
    executions.ensure_schema().await?;
    runs.ensure_schema().await?;
    let registry = build_registry(&runs, &states);

    let daemon = Arc::new(MarketAwareDaemon::new(
        config.daemon,
        states,
        executions,
        registry,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining workers");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await
}

/// Wire one body per job_type.
///
/// Feature jobs (ingestion, derived data, profiles) are stubs here: the
/// daemon only cares that a body exists and reports success or failure.
/// Deployments replace them with real implementations. The engine-chain
/// jobs advance the region's run phase; ingest_prices marks data ready.
fn build_registry(runs: &EngineRunStore, states: &Arc<MarketStateMachine>) -> JobRegistry {
    let region_for: Arc<dyn Fn(&str) -> Result<String> + Send + Sync> = {
        let states = Arc::clone(states);
        Arc::new(move |market_id: &str| Ok(states.config(market_id)?.region.clone()))
    };

    let phase_body = |target: RunPhase| {
        Arc::new(PhaseAdvanceBody::new(
            runs.clone(),
            Arc::clone(&region_for),
            target,
        ))
    };

    let noop = |job_type: &'static str| {
        Arc::new(move |market_id: String, as_of_date: NaiveDate| async move {
            warn!(
                job_type,
                market_id,
                %as_of_date,
                "no implementation wired for job, treating as success"
            );
            Ok::<(), ConductorError>(())
        })
    };

    let mut registry = JobRegistry::new();
    registry.register("ingest_prices", phase_body(RunPhase::DataReady));
    registry.register("ingest_factors", noop("ingest_factors"));
    registry.register("compute_returns", noop("compute_returns"));
    registry.register("compute_volatility", noop("compute_volatility"));
    registry.register("build_numeric_windows", noop("build_numeric_windows"));
    registry.register("update_profiles", noop("update_profiles"));
    registry.register("run_signals", phase_body(RunPhase::SignalsDone));
    registry.register("run_universes", phase_body(RunPhase::UniversesDone));
    registry.register("run_books", phase_body(RunPhase::BooksDone));
    registry
}

fn show_dag(config: &AppConfig) -> Result<()> {
    let as_of_date = config
        .daemon
        .as_of_date
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    let dag = build_global_dag(as_of_date, &config.daemon.markets)?;

    println!("{} ({} jobs)", dag.dag_id, dag.len());
    for market_id in &config.daemon.markets {
        let market_dag = build_market_dag(market_id, as_of_date)?;
        println!("\n{}", market_dag.dag_id);
        for job in market_dag.jobs() {
            let gate = job
                .required_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "any".to_string());
            println!(
                "  {:<40} {:>8?}  state={:<11} deps={:?}",
                job.job_type, job.priority, gate, job.dependencies
            );
        }
    }
    Ok(())
}

fn show_states(config: &AppConfig, states: &MarketStateMachine) -> Result<()> {
    let now = chrono::Utc::now();
    for market_id in &config.daemon.markets {
        let state = states.state_for(market_id, now)?;
        let (next_state, at) = states.next_transition(market_id, now)?;
        println!("{market_id}: {state} (next: {next_state} at {at})");
    }
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn", config.logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
