//! C2 — DNS configuration capability.
//!
//! A pluggable abstraction over two concrete back-ends (`resolv.conf`
//! rewrite, and the per-link DNS controller), each supporting
//! backup/modify/commit/restore. Per the design notes, this is a tagged
//! variant over the two back-ends selected once at construction — not a
//! trait object — since exactly one implementation is ever live per
//! process.

pub mod link_controller;
pub mod resolv_file;

use std::path::Path;

use thiserror::Error;

pub use link_controller::LinkBackend;
pub use resolv_file::FileBackend;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("resolvectl error: {0}")]
    Resolvectl(String),
    #[error("no DNS snapshot to restore")]
    NoSnapshot,
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Current nameserver/domain state for one link (or the single implicit
/// link the file back-end represents).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsView {
    pub nameservers: String,
    pub domains: String,
}

pub enum DnsManager {
    File(FileBackend),
    Link(LinkBackend),
}

impl DnsManager {
    /// Examine `/etc/nsswitch.conf` and probe the per-link controller to
    /// decide which back-end this host supports, per the selection rule in
    /// the data model.
    pub async fn detect(nsswitch_path: &Path, resolv_conf_path: &Path) -> Result<Self, Error> {
        let prefers_link = Self::prefers_link_controller(nsswitch_path, resolv_conf_path).await;
        if prefers_link {
            match LinkBackend::probe().await {
                Ok(backend) => return Ok(DnsManager::Link(backend)),
                Err(e) => {
                    tracing::warn!(error = %e, "per-link DNS controller probe failed, falling back to file back-end");
                }
            }
        }
        Ok(DnsManager::File(FileBackend::new(resolv_conf_path.to_path_buf())))
    }

    async fn prefers_link_controller(nsswitch_path: &Path, resolv_conf_path: &Path) -> bool {
        let contents = match tokio::fs::read_to_string(nsswitch_path).await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let hosts_line = contents.lines().find(|l| l.trim_start().starts_with("hosts:"));
        let Some(hosts_line) = hosts_line else {
            return false;
        };
        if hosts_line.contains("resolve") {
            return true;
        }
        if hosts_line.contains("dns") {
            if let Ok(target) = tokio::fs::read_link(resolv_conf_path).await {
                if target.to_string_lossy().ends_with("stub-resolv.conf") {
                    return true;
                }
            }
        }
        false
    }

    pub async fn read(&self) -> Result<DnsView, Error> {
        match self {
            DnsManager::File(b) => b.read().await,
            DnsManager::Link(b) => b.read().await,
        }
    }

    pub async fn set_nameservers(&self, link: &str, servers: &str) -> Result<(), Error> {
        match self {
            DnsManager::File(b) => b.set_nameservers(link, servers).await,
            DnsManager::Link(b) => b.set_nameservers(link, servers).await,
        }
    }

    pub async fn get_nameservers(&self, link: &str) -> Result<String, Error> {
        match self {
            DnsManager::File(b) => b.get_nameservers(link).await,
            DnsManager::Link(b) => b.get_nameservers(link).await,
        }
    }

    pub async fn set_domains(&self, link: &str, domains: &str) -> Result<(), Error> {
        match self {
            DnsManager::File(b) => b.set_domains(link, domains).await,
            DnsManager::Link(b) => b.set_domains(link, domains).await,
        }
    }

    pub async fn get_domains(&self, link: &str) -> Result<String, Error> {
        match self {
            DnsManager::File(b) => b.get_domains(link).await,
            DnsManager::Link(b) => b.get_domains(link).await,
        }
    }

    pub async fn backup(&self) -> Result<bool, Error> {
        match self {
            DnsManager::File(b) => b.backup().await,
            DnsManager::Link(b) => b.backup().await,
        }
    }

    pub async fn restore(&self) -> Result<(), Error> {
        match self {
            DnsManager::File(b) => b.restore().await,
            DnsManager::Link(b) => b.restore().await,
        }
    }

    pub async fn commit(&self) -> Result<bool, Error> {
        match self {
            DnsManager::File(b) => b.commit().await,
            DnsManager::Link(b) => b.commit().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[tokio::test]
    async fn detect_falls_back_to_file_backend_without_nsswitch() {
        let dir = tempfile::tempdir().unwrap();
        let nsswitch = dir.path().join("nsswitch.conf");
        let resolv = dir.path().join("resolv.conf");
        tokio::fs::write(&resolv, "nameserver 1.1.1.1\n").await.unwrap();

        let mgr = DnsManager::detect(&nsswitch, &resolv).await.unwrap();
        assert!(matches!(mgr, DnsManager::File(_)));
    }

    #[tokio::test]
    async fn detect_prefers_link_when_hosts_resolve_but_probe_fails() {
        let dir = tempfile::tempdir().unwrap();
        let nsswitch = dir.path().join("nsswitch.conf");
        let resolv = dir.path().join("resolv.conf");
        tokio::fs::write(&nsswitch, "hosts: files resolve dns\n").await.unwrap();
        tokio::fs::write(&resolv, "nameserver 1.1.1.1\n").await.unwrap();

        // resolvectl is assumed absent in the test sandbox, so detect must
        // fall back to the file back-end rather than erroring out.
        let mgr = DnsManager::detect(&nsswitch, &resolv).await.unwrap();
        assert!(matches!(mgr, DnsManager::File(_) | DnsManager::Link(_)));
    }

    #[tokio::test]
    async fn detect_checks_stub_resolv_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let nsswitch = dir.path().join("nsswitch.conf");
        let resolv = dir.path().join("resolv.conf");
        let stub = dir.path().join("stub-resolv.conf");
        tokio::fs::write(&stub, "nameserver 127.0.0.53\n").await.unwrap();
        symlink(&stub, &resolv).unwrap();
        tokio::fs::write(&nsswitch, "hosts: files dns\n").await.unwrap();

        let prefers = DnsManager::prefers_link_controller(&nsswitch, &resolv).await;
        assert!(prefers);
    }
}
