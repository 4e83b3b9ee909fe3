//! Per-link DNS back-end, driving `resolvectl` the way systemd-resolved
//! hosts expect per-interface DNS configuration to be pushed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::command::{CommandExt, Logs};
use super::{DnsView, Error};

const DEFAULT_BACKUP_PATH: &str = "/var/tmp/link-share/backup.json";

#[async_trait]
pub trait ResolvectlOps: Send + Sync {
    async fn status(&self) -> Result<String, Error>;
    async fn set_domain(&self, link: &str, domains: &str) -> Result<(), Error>;
    async fn set_dns(&self, link: &str, servers: &str) -> Result<(), Error>;
}

pub struct RealResolvectlOps;

#[async_trait]
impl ResolvectlOps for RealResolvectlOps {
    async fn status(&self) -> Result<String, Error> {
        tokio::process::Command::new("resolvectl")
            .arg("status")
            .run_stdout(Logs::Suppress)
            .await
            .map_err(|e| Error::Resolvectl(e.to_string()))
    }

    async fn set_domain(&self, link: &str, domains: &str) -> Result<(), Error> {
        let mut cmd = tokio::process::Command::new("resolvectl");
        cmd.arg("domain").arg(link);
        for d in domains.split_whitespace() {
            cmd.arg(d);
        }
        cmd.run(Logs::Suppress).await.map_err(|e| Error::Resolvectl(e.to_string()))
    }

    async fn set_dns(&self, link: &str, servers: &str) -> Result<(), Error> {
        let mut cmd = tokio::process::Command::new("resolvectl");
        cmd.arg("dns").arg(link);
        for s in servers.split_whitespace() {
            cmd.arg(s);
        }
        cmd.run(Logs::Suppress).await.map_err(|e| Error::Resolvectl(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkEntry {
    pub name: String,
    pub index: u32,
    pub scopes: String,
    pub protocols: String,
    pub current_server: String,
    pub servers: String,
    pub domains: String,
}

/// Parse the block-structured output of `resolvectl status` into one
/// [`LinkEntry`] per `Link N (name)` section.
fn parse_status(text: &str) -> HashMap<String, LinkEntry> {
    let mut entries = HashMap::new();
    let mut current: Option<LinkEntry> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Link ") {
            if let Some(entry) = current.take() {
                entries.insert(entry.name.clone(), entry);
            }
            let mut parts = rest.splitn(2, '(');
            let index = parts.next().unwrap_or("").trim().parse().unwrap_or(0);
            let name = parts
                .next()
                .unwrap_or("")
                .trim_end_matches(')')
                .trim()
                .to_string();
            current = Some(LinkEntry { name, index, ..Default::default() });
            continue;
        }
        let Some(entry) = current.as_mut() else { continue };
        if let Some(v) = trimmed.strip_prefix("Current Scopes:") {
            entry.scopes = v.trim().to_string();
        } else if let Some(v) = trimmed.strip_prefix("Protocols:") {
            entry.protocols = v.trim().to_string();
        } else if let Some(v) = trimmed.strip_prefix("Current DNS Server:") {
            entry.current_server = v.trim().to_string();
        } else if let Some(v) = trimmed.strip_prefix("DNS Servers:") {
            entry.servers = v.trim().to_string();
        } else if let Some(v) = trimmed.strip_prefix("DNS Domain:") {
            entry.domains = v.trim().to_string();
        }
    }
    if let Some(entry) = current.take() {
        entries.insert(entry.name.clone(), entry);
    }
    entries
}

pub struct LinkBackend {
    ops: Arc<dyn ResolvectlOps>,
    entries: Mutex<HashMap<String, LinkEntry>>,
    view: Mutex<DnsView>,
    target_link: Mutex<Option<String>>,
    backup_path: PathBuf,
}

impl LinkBackend {
    /// Probe for a working per-link controller by asking it for status;
    /// any failure (binary missing, no response) disqualifies this back-end.
    pub async fn probe() -> Result<Self, Error> {
        Self::with_ops(Arc::new(RealResolvectlOps)).await
    }

    pub async fn with_ops(ops: Arc<dyn ResolvectlOps>) -> Result<Self, Error> {
        let status = ops.status().await?;
        let entries = parse_status(&status);
        Ok(Self {
            ops,
            entries: Mutex::new(entries),
            view: Mutex::new(DnsView::default()),
            target_link: Mutex::new(None),
            backup_path: PathBuf::from(DEFAULT_BACKUP_PATH),
        })
    }

    #[cfg(test)]
    pub fn with_backup_path(mut self, backup_path: PathBuf) -> Self {
        self.backup_path = backup_path;
        self
    }

    pub async fn read(&self) -> Result<DnsView, Error> {
        let status = self.ops.status().await?;
        *self.entries.lock().await = parse_status(&status);
        let target = self.target_link.lock().await.clone();
        let entries = self.entries.lock().await;
        let view = match target.and_then(|l| entries.get(&l)) {
            Some(entry) => DnsView { nameservers: entry.servers.clone(), domains: entry.domains.clone() },
            None => DnsView::default(),
        };
        *self.view.lock().await = view.clone();
        Ok(view)
    }

    pub async fn set_nameservers(&self, link: &str, servers: &str) -> Result<(), Error> {
        *self.target_link.lock().await = Some(link.to_string());
        self.view.lock().await.nameservers = servers.to_string();
        Ok(())
    }

    pub async fn get_nameservers(&self, link: &str) -> Result<String, Error> {
        let entries = self.entries.lock().await;
        Ok(entries.get(link).map(|e| e.servers.clone()).unwrap_or_default())
    }

    pub async fn set_domains(&self, link: &str, domains: &str) -> Result<(), Error> {
        *self.target_link.lock().await = Some(link.to_string());
        self.view.lock().await.domains = domains.to_string();
        Ok(())
    }

    pub async fn get_domains(&self, link: &str) -> Result<String, Error> {
        let entries = self.entries.lock().await;
        Ok(entries.get(link).map(|e| e.domains.clone()).unwrap_or_default())
    }

    pub async fn commit(&self) -> Result<bool, Error> {
        let Some(link) = self.target_link.lock().await.clone() else {
            return Ok(false);
        };
        let view = self.view.lock().await.clone();
        self.ops.set_domain(&link, &view.domains).await?;
        self.ops.set_dns(&link, &view.nameservers).await?;
        Ok(true)
    }

    pub async fn backup(&self) -> Result<bool, Error> {
        if tokio::fs::try_exists(&self.backup_path).await.unwrap_or(false) {
            return Ok(false);
        }
        if let Some(parent) = self.backup_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entries = self.entries.lock().await.clone();
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| Error::Validation(format!("serializing DNS snapshot: {e}")))?;
        tokio::fs::write(&self.backup_path, json).await?;
        Ok(true)
    }

    pub async fn restore(&self) -> Result<(), Error> {
        let bytes = match tokio::fs::read(&self.backup_path).await {
            Ok(b) => b,
            Err(_) => return Err(Error::NoSnapshot),
        };
        let entries: HashMap<String, LinkEntry> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Validation(format!("parsing DNS snapshot: {e}")))?;
        for entry in entries.values() {
            self.ops.set_domain(&entry.name, &entry.domains).await?;
            self.ops.set_dns(&entry.name, &entry.servers).await?;
        }
        tokio::fs::remove_file(&self.backup_path).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::MockResolvectlOps;
    use super::*;

    const STATUS: &str = "Link 3 (gpd0)\n    Current Scopes: DNS\n         Protocols: +DefaultRoute\nCurrent DNS Server: 10.8.0.2\n       DNS Servers: 10.8.0.2\n        DNS Domain: corp.example\n";

    async fn backend() -> (LinkBackend, Arc<MockResolvectlOps>) {
        let ops = Arc::new(MockResolvectlOps::default());
        *ops.status_text.lock().unwrap() = STATUS.to_string();
        let backend = LinkBackend::with_ops(ops.clone()).await.unwrap();
        (backend, ops)
    }

    #[tokio::test]
    async fn probe_parses_link_entries() {
        let (backend, _ops) = backend().await;
        assert_eq!(backend.get_nameservers("gpd0").await.unwrap(), "10.8.0.2");
        assert_eq!(backend.get_domains("gpd0").await.unwrap(), "corp.example");
    }

    #[tokio::test]
    async fn commit_pushes_domain_then_dns() {
        let (backend, ops) = backend().await;
        backend.set_domains("gpd0", "corp.example").await.unwrap();
        backend.set_nameservers("gpd0", "10.8.0.2").await.unwrap();
        assert!(backend.commit().await.unwrap());

        assert_eq!(ops.domain_calls.lock().unwrap().as_slice(), &[("gpd0".to_string(), "corp.example".to_string())]);
        assert_eq!(ops.dns_calls.lock().unwrap().as_slice(), &[("gpd0".to_string(), "10.8.0.2".to_string())]);
    }

    #[tokio::test]
    async fn commit_without_target_link_is_noop() {
        let (backend, ops) = backend().await;
        assert!(!backend.commit().await.unwrap());
        assert!(ops.domain_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backup_then_restore_reapplies_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, ops) = backend().await;
        let backend = backend.with_backup_path(dir.path().join("backup.json"));

        assert!(backend.backup().await.unwrap());
        assert!(!backend.backup().await.unwrap());

        backend.restore().await.unwrap();
        assert_eq!(ops.domain_calls.lock().unwrap().as_slice(), &[("gpd0".to_string(), "corp.example".to_string())]);
        assert_eq!(ops.dns_calls.lock().unwrap().as_slice(), &[("gpd0".to_string(), "10.8.0.2".to_string())]);
        assert!(!tokio::fs::try_exists(dir.path().join("backup.json")).await.unwrap());
    }
}
