//! Explicit logger installation, replacing the package-init-time logger
//! registration pattern with a function called once from the process entry
//! point.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::LogLevel;

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

pub fn make_file_fmt_layer(log_path: &Path) -> io::Result<FileFmtLayer> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Install the global tracing subscriber, writing to `log_path` at `level`.
/// `RUST_LOG` overrides `level` when set. Returns a handle that `SIGHUP`
/// handling uses to reopen the log file after external rotation.
pub fn install(level: LogLevel, log_path: &Path) -> io::Result<LogReloadHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));
    let layer = make_file_fmt_layer(log_path)?;
    let (reload_layer, handle): (reload::Layer<FileFmtLayer, tracing_subscriber::Registry>, LogReloadHandle) =
        reload::Layer::new(layer);
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    Ok(handle)
}

/// Reopen the log file in place, for use after external log rotation
/// (`SIGHUP`).
pub fn reopen(handle: &LogReloadHandle, log_path: &Path) -> io::Result<()> {
    let layer = make_file_fmt_layer(log_path)?;
    handle
        .reload(layer)
        .map_err(|e| io::Error::other(format!("failed to reload log layer: {e}")))
}
