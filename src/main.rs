use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use clusterflow::blackboard::{clear_all, Blackboard, Signal};
use clusterflow::cluster::ClusterRecord;
use clusterflow::{init_telemetry, App, ClusterflowConfig, ShutdownCoordinator, TickOutcome, Trigger};

#[derive(Parser)]
#[command(name = "clusterflow")]
#[command(about = "Ephemeral cluster provisioning and job pipeline orchestration")]
#[command(long_about = "Clusterflow provisions a short-lived compute cluster, runs job pipelines \
                       against it, and tears it down once the final pipeline reports. Chains \
                       coordinate only through a shared blackboard of well-known keys.")]
struct Cli {
    /// Configuration file (defaults to ./clusterflow.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke one chain once: `provisioning` or a pipeline name
    Run {
        chain: String,
    },
    /// Tick every chain on the configured interval until ctrl-c
    Daemon,
    /// Inspect or edit the shared blackboard
    Board {
        #[command(subcommand)]
        action: BoardAction,
    },
    /// Show the cluster record and the state of every chain's run
    Status,
    /// Forget a chain's run so a failed chain can start again
    Clear {
        chain: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum BoardAction {
    /// Print one key
    Get { key: Signal },
    /// Store a value under a key
    Set { key: Signal, value: String },
    /// Delete a key
    Delete { key: Signal },
    /// Print every key that holds a value
    List,
    /// Delete every key
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    ClusterflowConfig::load_env_file()?;
    let config = ClusterflowConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_telemetry(&config.observability);

    tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Run { chain } => run_command(config, &chain).await,
            Commands::Daemon => daemon_command(config).await,
            Commands::Board { action } => board_command(config, action).await,
            Commands::Status => status_command(config).await,
            Commands::Clear { chain } => clear_command(config, &chain).await,
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    })
}

async fn run_command(config: ClusterflowConfig, name: &str) -> Result<()> {
    let app = App::from_config(config).await?;
    let chain = app
        .chain(name)
        .ok_or_else(|| anyhow!("Unknown chain '{name}'"))?;

    match app.scheduler().invoke(chain, Utc::now(), Trigger::Manual).await? {
        TickOutcome::Advanced { run_id, state } => {
            println!("{name}: run {run_id} is now {state:?}");
        }
        TickOutcome::Waiting { run_id, until } => {
            println!("{name}: run {run_id} waits until {until}");
        }
        TickOutcome::Blocked { run_id } => {
            println!("{name}: blocked by failed run {run_id}; use 'clusterflow clear {name}'");
        }
        TickOutcome::NotDue { next_run_at } => {
            println!("{name}: next run due at {next_run_at}");
        }
    }
    Ok(())
}

async fn daemon_command(config: ClusterflowConfig) -> Result<()> {
    let tick = config.scheduler.tick();
    let app = App::from_config(config).await?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let listener = coordinator.subscribe();
    coordinator.install_signal_handlers();

    app.scheduler().run(app.chains(), tick, listener).await;
    Ok(())
}

async fn board_command(config: ClusterflowConfig, action: BoardAction) -> Result<()> {
    let board = clusterflow::open_blackboard(&config.blackboard).await?;

    match action {
        BoardAction::Get { key } => match board.get(key).await?.into_option() {
            Some(value) => println!("{value}"),
            None => println!("{key} is absent"),
        },
        BoardAction::Set { key, value } => {
            board.set(key, &value).await?;
            println!("{key} = {value}");
        }
        BoardAction::Delete { key } => {
            board.delete(key).await?;
            println!("{key} deleted");
        }
        BoardAction::List => {
            let entries = board.snapshot().await?;
            if entries.is_empty() {
                println!("Blackboard is empty");
            }
            for entry in entries {
                println!("{:<28} {:<24} {}", entry.signal.as_key(), entry.value, entry.updated_at);
            }
        }
        BoardAction::Reset => {
            clear_all(board.as_ref()).await?;
            println!("Blackboard cleared");
        }
    }
    Ok(())
}

async fn status_command(config: ClusterflowConfig) -> Result<()> {
    let app = App::from_config(config).await?;

    let record = ClusterRecord::observe(app.board().as_ref()).await?;
    println!("Cluster: {:?}", record.phase());
    if let Some(cluster_id) = &record.cluster_id {
        println!("  cluster_id: {cluster_id}");
    }
    for signal in Signal::PIPELINE_STATES {
        if let Some(value) = app.board().get(signal).await?.into_option() {
            println!("  {signal}: {value}");
        }
    }

    println!();
    println!("Chains:");
    for chain in app.chains() {
        match app.scheduler().ledger().load(&chain.name).await? {
            Some(run) => {
                let step = chain
                    .steps
                    .get(run.cursor)
                    .map(|s| s.task_id.as_str())
                    .unwrap_or("-");
                println!(
                    "  {:<20} {:<40} {:?} (next step: {step}, attempts: {})",
                    chain.name, run.run_id, run.state, run.attempts
                );
            }
            None => println!("  {:<20} no runs", chain.name),
        }
    }
    Ok(())
}

async fn clear_command(config: ClusterflowConfig, name: &str) -> Result<()> {
    let app = App::from_config(config).await?;
    if app.chain(name).is_none() {
        return Err(anyhow!("Unknown chain '{name}'"));
    }

    if app.scheduler().ledger().clear(name).await? {
        println!("{name}: run cleared");
    } else {
        println!("{name}: nothing to clear");
    }
    Ok(())
}
