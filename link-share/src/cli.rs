use std::path::PathBuf;

use clap::Parser;

use link_share_lib::config::{self, LogLevel};

/// link-share — turns a VPN-tunnel-holding host into a transparent LAN gateway
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Log verbosity
    #[arg(long, env = "LINK_SHARE_LOG", default_value = "INFO")]
    pub log: LogLevel,

    /// Where to write the daemon's log file
    #[arg(long, env = "LINK_SHARE_LOG_FILE", default_value = config::DEFAULT_LOG_FILE)]
    pub log_file: PathBuf,

    /// Where to write this process's pid for external signalling
    #[arg(long, env = "LINK_SHARE_PID_FILE", default_value = config::DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl From<Cli> for config::Config {
    fn from(cli: Cli) -> Self {
        Self {
            log_level: cli.log,
            log_path: cli.log_file,
            pid_file: cli.pid_file,
            ..config::Config::default()
        }
    }
}
