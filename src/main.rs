mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use agentd::clock::SystemClock;
use agentd::config;
use agentd::config::ResolvedLogging;
use agentd::error::{AppError, ExitCode};
use agentd::metrics::{MetricsProbe, SystemMetricsProbe};
use agentd::orchestrator::Orchestrator;
use agentd::process_host::TokioProcessHost;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.init_config {
        match config::init_config(cli.config.as_deref()) {
            Ok(path) => {
                println!("wrote default config to {}", path.display());
                std::process::exit(ExitCode::Success as i32);
            }
            Err(e) => {
                let err = AppError::from(e);
                err.print_json_stderr();
                std::process::exit(err.code as i32);
            }
        }
    }

    match run(&cli).await {
        Ok(()) => std::process::exit(ExitCode::Success as i32),
        Err(e) => {
            e.print_json_stderr();
            std::process::exit(e.code as i32);
        }
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    let (config_path, mut file) = config::load_config(cli.config.as_deref());
    if let Some(url) = &cli.operator_url {
        file.operator.url = Some(url.clone());
    }
    if let Some(id) = &cli.agent_id {
        file.agent.id = Some(id.clone());
    }
    if let Some(level) = &cli.log_level {
        file.logging.level = Some(level.clone());
    }

    let resolved = config::resolve_config(&file, config_path).map_err(AppError::from)?;

    init_logging(&resolved.logging);

    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(SystemMetricsProbe::new());
    let process_host = Arc::new(TokioProcessHost);

    let info = metrics.system_info();
    tracing::info!(
        agent_id = %resolved.agent.id,
        hostname = %info.hostname,
        platform = %info.platform,
        arch = %info.architecture,
        cpu_count = info.cpu_count,
        pi_model = ?info.pi_model,
        operator_url = %resolved.operator.url,
        "starting agent"
    );

    let orchestrator = Orchestrator::start(&resolved, clock, metrics, process_host);

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    orchestrator.stop().await;
    tracing::info!("stopped cleanly");

    Ok(())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the stderr sink plus, if `logging.file` is set, a second sink
/// writing to that file, mirroring the Python prototype's dual
/// `StreamHandler`/`FileHandler` setup. `logging.format` ("json" or
/// "pretty") applies to both sinks.
fn init_logging(logging: &ResolvedLogging) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = logging.format == "json";

    let stderr_layer: BoxedLayer = if json {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file_layer: Option<BoxedLayer> = logging.file.as_deref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let layer: BoxedLayer = if json {
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .json()
                        .boxed()
                } else {
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .boxed()
                };
                Some(layer)
            }
            Err(e) => {
                eprintln!("failed to open log file {path}: {e}, logging to stderr only");
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
