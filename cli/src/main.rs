//! Command-line adapter for the monico monitoring service.
//!
//! Loads layered configuration, resolves a storage backend, and dispatches
//! to the `monico-core` facade. Long-running subcommands (`run`,
//! `run-manager`, `run-worker`) shut down gracefully on SIGINT/SIGTERM.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod bootstrap;
mod commands;
mod format;

use clap::{Parser, Subcommand};
use monico_core::MonicoError;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "monico")]
#[command(about = "Distributed HTTP endpoint monitoring service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initializes the storage backend's schema.
    Setup {
        /// Drop and recreate the schema. DANGER: destroys all data.
        #[arg(short, long)]
        force: bool,
    },
    /// Creates a new monitor.
    Create {
        /// ID of the monitor; a UUID is generated if omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 60)]
        interval: i64,
        /// Regular expression to match against the response body.
        #[arg(long = "body-regexp")]
        body_regexp: Option<String>,
    },
    /// Lists configured monitors.
    List {
        /// Print as JSON instead of a plain-text table.
        #[arg(long)]
        json: bool,
    },
    /// Deletes a monitor, cascading to its tasks and probes.
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Displays a monitor's recent probe history.
    Status {
        #[arg(long)]
        id: String,
        /// Refresh the view every second instead of printing once.
        #[arg(short, long)]
        live: bool,
        #[arg(
            short = 'n',
            long = "number-of-probes",
            default_value_t = 10,
            value_parser = clap::value_parser!(i64).range(1..=100)
        )]
        number_of_probes: i64,
        /// Print as JSON instead of a plain-text table.
        #[arg(long)]
        json: bool,
    },
    /// Starts both the manager and a worker, concurrently.
    Run {
        #[arg(short, long = "worker-id")]
        worker_id: Option<String>,
    },
    /// Starts only the manager, which schedules probe tasks.
    RunManager,
    /// Starts only a worker, which executes leased probe tasks.
    RunWorker {
        #[arg(short, long = "worker-id")]
        worker_id: Option<String>,
    },
    /// Prints the package version.
    Version,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprint_cli_error(&e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("monico {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = bootstrap::load_config()?;
    let _log_guard = init_logging(&config);

    let app = bootstrap::build_app(&config).await?;

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::Setup { force } => commands::setup(&app, force).await?,
        Command::Create {
            id,
            name,
            endpoint,
            interval,
            body_regexp,
        } => commands::create(&app, id, name, endpoint, interval, body_regexp).await?,
        Command::List { json } => commands::list(&app, json).await?,
        Command::Delete { id } => commands::delete(&app, id).await?,
        Command::Status {
            id,
            live,
            number_of_probes,
            json,
        } => {
            if live {
                commands::status_live(&app, id, number_of_probes).await?
            } else {
                commands::status(&app, id, number_of_probes, json).await?
            }
        }
        Command::Run { worker_id } => {
            let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
            spawn_shutdown_relay(shutdown_tx.clone());
            commands::run(&app, worker_id, shutdown_tx).await;
        }
        Command::RunManager => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            spawn_shutdown_relay(shutdown_tx);
            commands::run_manager(&app, shutdown_rx).await;
        }
        Command::RunWorker { worker_id } => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            spawn_shutdown_relay(shutdown_tx);
            commands::run_worker(&app, worker_id, shutdown_rx).await;
        }
    }

    app.shutdown().await?;
    Ok(())
}

/// Maps the closed domain error taxonomy to a terse, user-facing message;
/// anything else (driver errors, I/O) prints its full chain.
fn eprint_cli_error(e: &anyhow::Error) {
    match e.downcast_ref::<MonicoError>() {
        Some(MonicoError::StorageConnectionError(_)) => {
            eprintln!("Error: failed to connect to storage backend. Please check your configuration.");
        }
        Some(domain_error) => {
            eprintln!("Error: {domain_error}");
        }
        None => {
            error!("unexpected error: {e:#}");
            eprintln!("Error: {e}");
        }
    }
}

fn init_logging(config: &monico_core::config::Config) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("./logs", "monico.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter_str()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    guard
}

/// Relays the first SIGINT/SIGTERM onto `shutdown_tx`, so callers can just
/// `.await` the command future instead of racing it against the signal.
/// Dropping a manager/worker future mid-select would skip its own graceful
/// shutdown path.
fn spawn_shutdown_relay(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => { info!("received SIGTERM"); }
            _ = sigint.recv() => { info!("received SIGINT"); }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    }
}
