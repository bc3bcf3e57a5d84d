use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ward_core::config::{AgentConfig, AGENT_VERSION};
use ward_protocol::Request;
use ward_scheduler::{Backend, Configuration, MultiSink, ReportSink, SqliteReportSink, TracingSink};

mod backend;
mod client;
mod controller;
mod error;
mod server;

#[derive(Parser)]
#[command(name = "ward-agent", version, about = "Backup scheduling agent")]
struct Cli {
    /// Agent configuration file (default: $WARD_CONFIG or ~/.ward/ward.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Control socket path, overriding `agent.socket_path`.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent in the foreground.
    Daemon,
    /// Start the scheduler with the stored configuration.
    Start,
    /// Stop the running scheduler.
    Stop,
    /// Send a scheduler configuration; a running scheduler is restarted on it.
    Configure { file: PathBuf },
    /// Shut the agent down.
    Terminate,
    /// Print the most recent task reports as JSON lines.
    Reports {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // load config: --config > WARD_CONFIG env > ~/.ward/ward.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("WARD_CONFIG").ok());
    let (config, load_error) = match AgentConfig::load(config_path.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (AgentConfig::default(), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.agent.log_filter.as_str().into()),
        )
        .init();
    if let Some(e) = load_error {
        warn!("Config load failed ({}), using defaults", e);
    }

    let socket = cli
        .socket
        .unwrap_or_else(|| PathBuf::from(&config.agent.socket_path));

    match cli.command {
        Command::Daemon => {
            run_daemon(&config, config_path, &socket).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Start => control(&socket, Request::start()).await,
        Command::Stop => control(&socket, Request::stop()).await,
        Command::Terminate => control(&socket, Request::terminate()).await,
        Command::Configure { file } => {
            let jobs = Configuration::load(&file)?;
            info!(jobs = jobs.jobs.len(), file = %file.display(), "sending configuration");
            control(&socket, Request::configure(jobs.to_json()?)).await
        }
        Command::Reports { limit } => {
            let sink = SqliteReportSink::open(&config.database.path)?;
            for report in sink.recent(limit)? {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_daemon(config: &AgentConfig, config_path: Option<String>, socket: &Path) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        }
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening report database");
    let sink: Arc<dyn ReportSink> = match SqliteReportSink::open(db_path) {
        Ok(db) => Arc::new(MultiSink::new(vec![
            Arc::new(TracingSink) as Arc<dyn ReportSink>,
            Arc::new(db) as Arc<dyn ReportSink>,
        ])),
        Err(e) => {
            warn!(error = %e, "report database unavailable, reports go to the log only");
            Arc::new(TracingSink)
        }
    };

    let commands = Arc::new(backend::CommandBackend::new(config_path));
    let launcher = Arc::new(controller::ServiceLauncher::new(
        Backend::new(commands.clone(), commands),
        sink,
    ));
    let (controller, controller_done) = controller::spawn(shutdown.clone(), launcher);

    let served = server::listen_and_serve(socket, controller, AGENT_VERSION.to_string(), shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = controller_done.await {
        warn!(error = %e, "controller task panicked");
    }
    info!("agent stopped");
    served
}

/// Send one request and turn the response into the process exit code.
async fn control(socket: &Path, request: Request) -> anyhow::Result<ExitCode> {
    let response = client::send_request(socket, &request).await?;
    if response.is_ok() {
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!("{}", response.err);
    Ok(ExitCode::from(u8::try_from(response.exit_code).unwrap_or(1)))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
