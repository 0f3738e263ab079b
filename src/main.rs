use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use structopt::StructOpt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use menoetius::{Config, HttpForwarder, LogFormat, Scheduler, ShutdownHandle};

#[derive(StructOpt, Debug)]
pub struct Command {
    /// Path to the YAML configuration file
    #[structopt(short, long, default_value = "./config.yaml", parse(from_os_str))]
    pub config: PathBuf,

    /// Overrides `log_level` from the configuration file
    #[structopt(long)]
    pub log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // parse the command line args
    let opt: Command = Command::from_args();

    let config = Config::load(&opt.config)
        .with_context(|| format!("loading {}", opt.config.display()))?;

    init_tracing(&config, opt.log_level.as_deref())?;

    let forwarder = HttpForwarder::from_config(&config).context("building http client")?;
    let scheduler = Scheduler::new(config.endpoints(), forwarder);

    tracing::info!(
        gateway = %config.gateway,
        endpoints = config.endpoints.len(),
        "starting"
    );

    tokio::spawn(handle_signals(scheduler.shutdown_handle()));

    let in_flight = scheduler.run().await;

    // workers are bounded by their own timeouts; give them that long to land
    let drain = config.scrape_timeout().saturating_add(config.push_timeout());
    if tokio::time::timeout(drain, in_flight.wait_idle()).await.is_err() {
        tracing::warn!(in_flight = in_flight.len(), "exiting with workers still in flight");
    }

    tracing::info!("stopped");
    Ok(())
}

fn init_tracing(config: &Config, level_override: Option<&str>) -> Result<(), anyhow::Error> {
    let level = level_override.unwrap_or(&config.log_level);
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {:?}", level))?,
    };

    let writer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.log_file.is_none())
        .with_thread_names(true);

    let installed = match config.log_format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("setting default subscriber failed: {}", e))
}

async fn handle_signals(shutdown: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down gracefully"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down gracefully"),
    }

    shutdown.request_shutdown();
}
