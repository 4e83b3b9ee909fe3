//! C1 — command executor.
//!
//! Spawns a child process, captures stdout/stderr/exit status, and optionally
//! pipes data to its stdin. Grounded on the teacher's `ShellCommandExt`.

use std::future::Future;
use std::io;
use std::process::{ExitStatus, Output, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error("command exited with status {status:?}: {stderr}")]
    CommandFailed { status: ExitStatus, stderr: String },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Whether a non-zero exit or non-empty stderr should be logged.
#[derive(Debug, Clone, Copy)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait CommandExt {
    fn run(&mut self, logs: Logs) -> impl Future<Output = Result<(), Error>> + Send;
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
    /// Run the command, writing `stdin` to its standard input before waiting
    /// for completion.
    fn run_with_stdin(&mut self, stdin: &[u8], logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl CommandExt for Command {
    async fn run(&mut self, logs: Logs) -> Result<(), Error> {
        let output = self.output().await?;
        report(&output, &logs)
    }

    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        report(&output, &logs)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_with_stdin(&mut self, stdin: &[u8], logs: Logs) -> Result<String, Error> {
        let mut child = self.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        report(&output, &logs)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn report(output: &Output, logs: &Logs) -> Result<(), Error> {
    if !output.status.success() {
        if matches!(logs, Logs::Print) {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(status = ?output.status.code(), %stdout, %stderr, "command failed");
        }
        return Err(Error::CommandFailed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    if !output.stderr.is_empty() && matches!(logs, Logs::Print) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(%stderr, "non-empty stderr on successful command");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_stdout_captures_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = cmd.run_stdout(Logs::Suppress).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn run_with_stdin_pipes_data() {
        let mut cmd = Command::new("cat");
        let out = cmd.run_with_stdin(b"piped data", Logs::Suppress).await.unwrap();
        assert_eq!(out, "piped data");
    }

    #[tokio::test]
    async fn run_fails_on_non_zero_exit() {
        let mut cmd = Command::new("false");
        let res = cmd.run(Logs::Suppress).await;
        assert!(res.is_err());
    }
}
