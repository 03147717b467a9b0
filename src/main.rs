use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};
use tempd::{application::Application, config::ConfigManager};

mod cli;

use cli::Cli;

const DAEMON_LOG: &str = "/var/tmp/tempd.log";

fn init_log() -> Result<()> {
    let logger = syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "tempd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))?;

    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
        .map(|()| log::set_max_level(LevelFilter::Info))
        .map_err(|e| anyhow!("{e}"))
}

/// Stderr logger for hosts without a syslog socket.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

fn into_daemon() -> Result<()> {
    let stdout = File::create(DAEMON_LOG).with_context(|| format!("Failed to create {DAEMON_LOG}"))?;
    let stderr = stdout.try_clone()?;

    Daemonize::new()
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| anyhow!("{e}"))
}

async fn run(cli: Cli) -> Result<()> {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    let config_manager = ConfigManager::load(cli.config).await?;
    if let Some(store) = cli.store {
        config_manager.get_mut().await.store.path = store;
    }

    info!("tempd {} starting", env!("CARGO_PKG_VERSION"));
    Application::builder()
        .with_config_manager(config_manager)
        .build()
        .await?
        .run()
        .await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Fork before any runtime threads exist and before syslog records the pid.
    if cli.daemonize {
        into_daemon()?;
    }

    if let Err(e) = init_log() {
        eprintln!("syslog unavailable ({e}), logging to stderr");
        log::set_logger(&StderrLogger)
            .map(|()| log::set_max_level(LevelFilter::Info))
            .map_err(|e| anyhow!("{e}"))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cli)).inspect_err(|e| error!("tempd exited: {e:#}"))
}
