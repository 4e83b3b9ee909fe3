//! Explicit, non-singleton configuration threaded through every constructor.
//!
//! Replaces package-level argument globals with a value built once in
//! `main()` and passed down to the interface/route/dns managers and the
//! protocol engine.

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Multicast group every standard interface joins.
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0210);
/// UDP port carrying HELO/ANNOUNCE frames.
pub const MULTICAST_PORT: u16 = 10210;
/// Largest datagram this daemon will read or write.
pub const MAX_DATAGRAM: usize = 9000;
/// Cadence of the HELO/host-accounting driver.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// A host entry not refreshed within this many poll intervals is evicted.
pub const HOST_EVICTION_INTERVALS: u32 = 3;

pub const DEFAULT_PID_FILE: &str = "/var/tmp/link-share.pid";
pub const DEFAULT_LOG_FILE: &str = "/var/log/code-ointment/link-share/link-share.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Explicit daemon configuration, built once from CLI arguments and passed
/// by value into every constructor that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub log_path: PathBuf,
    pub pid_file: PathBuf,
    pub poll_interval: Duration,
    pub max_datagram: usize,
    pub multicast_group: Ipv6Addr,
    pub multicast_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_path: PathBuf::from(DEFAULT_LOG_FILE),
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            poll_interval: POLL_INTERVAL,
            max_datagram: MAX_DATAGRAM,
            multicast_group: MULTICAST_GROUP,
            multicast_port: MULTICAST_PORT,
        }
    }
}
