//! `resolv.conf`-rewrite DNS back-end.

use std::path::PathBuf;

use tokio::sync::Mutex;

use super::{DnsView, Error};

const DEFAULT_BACKUP_PATH: &str = "/var/tmp/link-share/backup.conf";
const MAX_NAMESERVERS: usize = 3;

pub struct FileBackend {
    path: PathBuf,
    backup_path: PathBuf,
    view: Mutex<DnsView>,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            backup_path: PathBuf::from(DEFAULT_BACKUP_PATH),
            view: Mutex::new(DnsView::default()),
        }
    }

    #[cfg(test)]
    pub fn with_backup_path(mut self, backup_path: PathBuf) -> Self {
        self.backup_path = backup_path;
        self
    }

    /// Parse `/etc/resolv.conf`: the first `nameserver` line's value becomes
    /// the working nameserver set, the first `search` line's value becomes
    /// the working domain set.
    pub async fn read(&self) -> Result<DnsView, Error> {
        let contents = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        let nameservers = contents
            .lines()
            .find_map(|l| l.strip_prefix("nameserver "))
            .unwrap_or("")
            .trim()
            .to_string();
        let domains = contents
            .lines()
            .find_map(|l| l.strip_prefix("search "))
            .unwrap_or("")
            .trim()
            .to_string();
        let view = DnsView { nameservers, domains };
        *self.view.lock().await = view.clone();
        Ok(view)
    }

    pub async fn set_nameservers(&self, _link: &str, servers: &str) -> Result<(), Error> {
        self.view.lock().await.nameservers = servers.to_string();
        Ok(())
    }

    pub async fn get_nameservers(&self, _link: &str) -> Result<String, Error> {
        Ok(self.view.lock().await.nameservers.clone())
    }

    /// Strip the systemd-resolved global marker `~.`, which the file format
    /// cannot express.
    pub async fn set_domains(&self, _link: &str, domains: &str) -> Result<(), Error> {
        let stripped = domains.split_whitespace().filter(|d| *d != "~.").collect::<Vec<_>>().join(" ");
        self.view.lock().await.domains = stripped;
        Ok(())
    }

    pub async fn get_domains(&self, _link: &str) -> Result<String, Error> {
        Ok(self.view.lock().await.domains.clone())
    }

    pub async fn backup(&self) -> Result<bool, Error> {
        if tokio::fs::try_exists(&self.backup_path).await.unwrap_or(false) {
            return Ok(false);
        }
        if let Some(parent) = self.backup_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&self.path, &self.backup_path).await?;
        set_mode_0600(&self.backup_path).await?;
        Ok(true)
    }

    pub async fn restore(&self) -> Result<(), Error> {
        if !tokio::fs::try_exists(&self.backup_path).await.unwrap_or(false) {
            return Err(Error::NoSnapshot);
        }
        tokio::fs::copy(&self.backup_path, &self.path).await?;
        tokio::fs::remove_file(&self.backup_path).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<bool, Error> {
        let view = self.view.lock().await.clone();
        if view.nameservers.split_whitespace().count() > MAX_NAMESERVERS {
            tracing::warn!(nameservers = %view.nameservers, "too many nameservers for file back-end");
            return Ok(false);
        }
        let mut out = format!("search {}\n", view.domains);
        for server in view.nameservers.split_whitespace() {
            out.push_str("nameserver ");
            out.push_str(server);
            out.push('\n');
        }
        match tokio::fs::write(&self.path, out).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "failed to rewrite resolv.conf");
                Ok(false)
            }
        }
    }
}

#[cfg(unix)]
async fn set_mode_0600(path: &std::path::Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode_0600(_path: &std::path::Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (FileBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        tokio::fs::write(&path, "nameserver 8.8.8.8\nsearch example.com\n").await.unwrap();
        let backend = FileBackend::new(path).with_backup_path(dir.path().join("backup.conf"));
        (backend, dir)
    }

    #[tokio::test]
    async fn read_extracts_first_nameserver_and_search_lines() {
        let (backend, _dir) = backend().await;
        let view = backend.read().await.unwrap();
        assert_eq!(view.nameservers, "8.8.8.8");
        assert_eq!(view.domains, "example.com");
    }

    #[tokio::test]
    async fn set_domains_strips_global_marker() {
        let (backend, _dir) = backend().await;
        backend.read().await.unwrap();
        backend.set_domains("eth0", "~. corp.example").await.unwrap();
        assert_eq!(backend.get_domains("eth0").await.unwrap(), "corp.example");
    }

    #[tokio::test]
    async fn commit_rejects_too_many_nameservers() {
        let (backend, _dir) = backend().await;
        backend.read().await.unwrap();
        backend.set_nameservers("eth0", "1.1.1.1 2.2.2.2 3.3.3.3 4.4.4.4").await.unwrap();
        assert!(!backend.commit().await.unwrap());
    }

    #[tokio::test]
    async fn commit_writes_search_then_nameserver_lines() {
        let (backend, dir) = backend().await;
        backend.read().await.unwrap();
        backend.set_nameservers("eth0", "10.8.0.2").await.unwrap();
        backend.set_domains("eth0", "corp.example").await.unwrap();
        assert!(backend.commit().await.unwrap());
        let contents = tokio::fs::read_to_string(dir.path().join("resolv.conf")).await.unwrap();
        assert_eq!(contents, "search corp.example\nnameserver 10.8.0.2\n");
    }

    #[tokio::test]
    async fn backup_is_idempotent_false() {
        let (backend, _dir) = backend().await;
        assert!(backend.backup().await.unwrap());
        assert!(!backend.backup().await.unwrap());
    }

    #[tokio::test]
    async fn restore_roundtrips_and_deletes_backup() {
        let (backend, dir) = backend().await;
        backend.backup().await.unwrap();
        backend.read().await.unwrap();
        backend.set_nameservers("eth0", "10.8.0.2").await.unwrap();
        backend.set_domains("eth0", "corp.example").await.unwrap();
        backend.commit().await.unwrap();

        backend.restore().await.unwrap();
        let contents = tokio::fs::read_to_string(dir.path().join("resolv.conf")).await.unwrap();
        assert_eq!(contents, "nameserver 8.8.8.8\nsearch example.com\n");
        assert!(!tokio::fs::try_exists(dir.path().join("backup.conf")).await.unwrap());
    }
}
