use clap::Parser;
use std::path::PathBuf;

/// tempd — platform temperature sensor daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $TEMPD_CONFIG, the user config dir, then /etc/tempd/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// State store document, overrides `store.path` from the config
    #[arg(short = 's', long = "store")]
    pub store: Option<PathBuf>,
}
