//! terraform-ci daemon: plans and applies a terraform checkout on demand and on change.
//!
//! Serves run status and control over HTTP, watches the checkout for changes,
//! and keeps run history under the state directory.

mod error;
mod routes;
mod server;
mod state;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tfci::config::{ConfigError, ConfigOptions, ServerConfig};
use tfci::core::types::{RunKind, Trigger};
use tfci::exit_codes;
use tfci::io::provisioner::{CommandProvisioner, Provisioner};
use tfci::io::store::RunStore;
use tfci::logging;
use tfci::registry::Registry;
use tfci::scheduler::Scheduler;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::server::RouteTable;
use crate::state::AppState;

/// How long shutdown waits for a running run before exiting anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Parser)]
#[command(name = "terraform-ci", version)]
#[command(about = "Run terraform plan/apply for a checkout and serve the results over HTTP")]
struct Args {
    /// Terraform checkout to provision
    checkout_dir: Option<PathBuf>,

    /// Discard run history before starting
    #[arg(long)]
    clear_state: bool,

    /// Directory for the daemon log (defaults to <state-dir>/logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// DEBUG, INFO, WARN or ERROR
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,

    /// Record plan requests as succeeded without running terraform
    #[arg(long)]
    no_plans: bool,

    /// Address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Directory containing the dashboard files
    #[arg(long, env = "SITE_DIR", default_value = "site")]
    site_dir: PathBuf,

    /// Directory for run history (defaults to <checkout>/.terraform-ci)
    #[arg(long, env = "STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Shorthand for --log-level DEBUG
    #[arg(short, long)]
    verbose: bool,
}

impl From<Args> for ConfigOptions {
    fn from(args: Args) -> Self {
        Self {
            checkout_dir: args.checkout_dir,
            clear_state: args.clear_state,
            log_dir: args.log_dir,
            log_level: args.log_level,
            no_plans: args.no_plans,
            bind: args.bind,
            port: args.port,
            site_dir: args.site_dir,
            state_dir: args.state_dir,
            verbose: args.verbose,
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match ServerConfig::resolve(Args::parse().into()) {
        Ok(config) => config,
        Err(ConfigError::MissingCheckoutDir) => {
            eprintln!("{}", Args::command().render_help());
            std::process::exit(exit_codes::USAGE);
        }
        Err(err) => {
            eprintln!("terraform-ci: {err}");
            std::process::exit(exit_codes::USAGE);
        }
    };
    let config = match config.load_provisioner() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("terraform-ci: {err}");
            std::process::exit(exit_codes::USAGE);
        }
    };

    if let Err(err) = run(config).await {
        error!(err = %format!("{err:#}"), "terraform-ci stopped");
        eprintln!("terraform-ci: {err:#}");
        std::process::exit(exit_codes::FATAL);
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let log_path = logging::init(config.log_level, &config.log_dir)?;
    info!(
        checkout = %config.checkout_dir.display(),
        state_dir = %config.state_dir.display(),
        log_file = %log_path.display(),
        level = %config.log_level,
        run_plan_enabled = config.run_plan_enabled,
        "starting terraform-ci"
    );

    let store = Arc::new(RunStore::open(&config.state_dir).context("open state directory")?);
    let provisioner: Arc<dyn Provisioner> = Arc::new(CommandProvisioner::new(&config.provisioner));
    let scheduler = Scheduler::start(&config, store, provisioner).context("start scheduler")?;

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), scheduler.clone());

    let registry = Registry::<RouteTable>::new();
    routes::register_all(&registry, &config).context("register routes")?;
    let app = server::build_router(&registry, state)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = watcher::spawn(config.clone(), scheduler.clone(), shutdown_rx.clone());

    if config.provisioner.plan_on_startup {
        let startup = scheduler.clone();
        match tokio::task::spawn_blocking(move || {
            startup.request_run(RunKind::Plan, Trigger::StartupRecovery)
        })
        .await?
        {
            Ok(id) => info!(run_id = id, "startup plan requested"),
            Err(err) => warn!(err = %err, "could not request startup plan"),
        }
    }

    let mut server_shutdown = shutdown_rx;
    let served = server::serve(&config.bind, config.port, app, async move {
        let _ = server_shutdown.changed().await;
    });
    let signal = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => error!(err = %err, "could not listen for interrupt"),
        }
        let _ = shutdown_tx.send(true);
    };

    tokio::pin!(served);
    let served = tokio::select! {
        result = &mut served => result,
        () = signal => served.await,
    };
    // The server may have stopped on its own.
    let _ = shutdown_tx.send(true);
    if let Err(err) = watcher.await {
        warn!(err = %err, "change watcher task failed");
    }

    let draining = scheduler.clone();
    let drained = tokio::task::spawn_blocking(move || {
        draining.shutdown();
        draining.wait_idle(DRAIN_TIMEOUT)
    })
    .await?;
    if drained {
        info!("scheduler idle, exiting");
    } else {
        warn!("running run still in progress at exit");
    }

    served
}
