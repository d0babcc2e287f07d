mod browser;
mod commands;
mod console;
mod probe;
mod supervisor;
mod update;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tether_core::config::{BackendLayout, ConfigError, LauncherConfig, resolve_backend_path};
use tether_core::controller::{Collaborators, ControllerConfig, ExitReason, LaunchController};
use tether_core::gateway::Gateway;
use tether_core::tray::TrayAction;

use browser::SystemBrowser;
use console::ConsoleGateway;
use probe::DnsProbe;
use supervisor::ProcessSupervisor;
use update::HttpUpdateChecker;

const GATEWAY_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Launch and supervise the Tether backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: search for tether.yaml upwards from the cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the launcher (default)
    Run {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Check the backend binary, network, and update manifest
    Doctor,
}

/// Everything resolved from the config file and the process environment.
pub struct LaunchEnv {
    pub config_path: Option<PathBuf>,
    pub config: LauncherConfig,
    pub layout: BackendLayout,
    pub backend_path: PathBuf,
}

impl LaunchEnv {
    fn load(config_override: Option<&Path>) -> Result<Self, ConfigError> {
        let work_dir = std::env::current_dir()?;

        let (config_path, config) = match config_override {
            Some(path) => (Some(path.to_path_buf()), LauncherConfig::load(path)?),
            None => match LauncherConfig::discover(&work_dir)? {
                Some((path, config)) => (Some(path), config),
                None => (None, LauncherConfig::default()),
            },
        };

        let exe_dir = std::env::current_exe()?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| work_dir.clone());

        let layout = BackendLayout::from_env();
        let backend_path = resolve_backend_path(&config.backend, layout, &exe_dir, &work_dir);

        Ok(Self {
            config_path,
            config,
            layout,
            backend_path,
        })
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("TETHER_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let env = match LaunchEnv::load(cli.config.as_deref()) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Doctor) => match commands::run_doctor(&env).await {
            Ok(()) => Ok(()),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Run { json }) => run_launcher(env, json).await,
        None => run_launcher(env, false).await,
    }
}

async fn run_launcher(env: LaunchEnv, json: bool) -> io::Result<()> {
    info!(
        version = %env.config.current_version(),
        layout = env.layout.as_str(),
        backend = %env.backend_path.display(),
        "starting launcher"
    );

    let updates = match HttpUpdateChecker::new(
        env.config.manifest_url().map(str::to_string),
        env.config.update_timeout(),
    ) {
        Ok(checker) => checker,
        Err(e) => {
            warn!("update checks disabled: {}", e);
            HttpUpdateChecker::disabled()
        }
    };

    let (backend_tx, backend_rx) = mpsc::unbounded_channel();
    let parts = Collaborators {
        probe: Box::new(DnsProbe::from_config(&env.config)),
        updates: Box::new(updates),
        supervisor: Box::new(ProcessSupervisor::new(
            env.backend_path.clone(),
            env.config.stop_grace(),
            backend_tx,
        )),
        opener: Box::new(SystemBrowser),
    };

    let (gateway, publisher, command_rx) = Gateway::channel(GATEWAY_CAPACITY);
    // Subscribe before the controller starts so startup events are not missed.
    let events = gateway.subscribe();

    let controller =
        LaunchController::new(ControllerConfig::from_launcher(&env.config), parts, publisher);
    let controller = tokio::spawn(controller.run(command_rx, backend_rx));

    let console = std::sync::Arc::new(ConsoleGateway::new(gateway.clone(), json));
    let render = {
        let console = console.clone();
        tokio::spawn(async move { console.render_events(events).await })
    };
    tokio::spawn(async move { console.read_input().await });

    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, quitting");
                gateway.tray(TrayAction::Quit).await;
            }
        });
    }

    let reason = controller
        .await
        .map_err(|e| io::Error::other(format!("controller task failed: {}", e)))?;

    // Let the console print the final events.
    let _ = tokio::time::timeout(Duration::from_millis(500), render).await;

    let code = match reason {
        ExitReason::Quit { code } => code,
        ExitReason::Exit | ExitReason::GatewayClosed => 0,
    };
    info!(?reason, "launcher stopped");
    // Stdin reads block shutdown of the runtime, so leave directly.
    std::process::exit(code);
}
