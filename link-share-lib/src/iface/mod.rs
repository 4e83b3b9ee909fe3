//! C3 — interface manager.
//!
//! Enumerates kernel links, classifies each as TUNNEL/STANDARD/IGNORED, and
//! tracks link-state changes so the route manager and protocol engine can
//! ask "is this index a tunnel" / "give me the default link" without
//! touching netlink themselves.

pub mod netlink;

#[cfg(test)]
pub mod mocks;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

pub use netlink::{LinkSnapshot, NetlinkOps, RealNetlinkOps};

const IGNORED_PREFIXES: &[&str] = &["vmnet", "docker", "vibr"];
const TUNNEL_MARKERS: &[&str] = &["gpd", "tun"];
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Well-known address used to resolve the link the kernel would route
/// general internet traffic through.
pub const DEFAULT_LINK_PROBE: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("no route toward {0} — cannot resolve a default link")]
    NoDefaultLink(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Tunnel,
    Standard,
    Ignored,
}

/// Classify a link from its name and raw flags, per the naming/flag rules
/// in the data model: ignored prefixes and loopback beat everything else,
/// then point-to-point links are tunnels, everything remaining is standard.
pub fn classify(name: &str, point_to_point: bool, loopback: bool) -> Class {
    if loopback || IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        Class::Ignored
    } else if point_to_point {
        Class::Tunnel
    } else {
        Class::Standard
    }
}

/// Whether a tunnel-class link's name qualifies it for route advertising.
pub fn is_tunnel_name(name: &str) -> bool {
    TUNNEL_MARKERS.iter().any(|m| name.contains(m))
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub lower_up: bool,
    pub class: Class,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.up && self.lower_up
    }

    fn from_snapshot(s: &LinkSnapshot) -> Self {
        Interface {
            index: s.index,
            name: s.name.clone(),
            up: s.up,
            lower_up: s.lower_up,
            class: classify(&s.name, s.point_to_point, s.loopback),
        }
    }
}

pub struct InterfaceManager<N: NetlinkOps> {
    ops: N,
    interfaces: Arc<Mutex<HashMap<u32, Interface>>>,
}

impl<N: NetlinkOps> InterfaceManager<N> {
    pub fn new(ops: N) -> Self {
        Self {
            ops,
            interfaces: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot all kernel links, classify each, and store.
    pub async fn enumerate(&self) -> Result<(), Error> {
        let snapshots = self.ops.link_list().await.map_err(|e| Error::Netlink(e.to_string()))?;
        let mut interfaces = self.interfaces.lock().await;
        interfaces.clear();
        for snapshot in &snapshots {
            let iface = Interface::from_snapshot(snapshot);
            interfaces.insert(iface.index, iface);
        }
        Ok(())
    }

    /// Current STANDARD-class links.
    pub async fn get_interfaces(&self) -> Vec<Interface> {
        self.interfaces
            .lock()
            .await
            .values()
            .filter(|i| i.class == Class::Standard)
            .cloned()
            .collect()
    }

    pub async fn get_tunnel_by_index(&self, index: u32) -> Option<Interface> {
        let interfaces = self.interfaces.lock().await;
        interfaces.get(&index).filter(|i| i.class == Class::Tunnel).cloned()
    }

    pub async fn get_link_by_index(&self, index: u32) -> Option<Interface> {
        let interfaces = self.interfaces.lock().await;
        interfaces
            .get(&index)
            .filter(|i| matches!(i.class, Class::Standard | Class::Tunnel))
            .cloned()
    }

    /// Resolve the link the kernel would route traffic to `probe` through.
    pub async fn get_default_link(&self, probe: Ipv4Addr) -> Result<Interface, Error> {
        let index = self
            .ops
            .resolve_egress(probe)
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?
            .ok_or(Error::NoDefaultLink(IpAddr::V4(probe)))?;
        self.get_link_by_index(index)
            .await
            .ok_or(Error::NoDefaultLink(IpAddr::V4(probe)))
    }

    /// All addresses currently assigned to `index`, both families.
    pub async fn get_addresses(&self, index: u32) -> Result<Vec<IpAddr>, Error> {
        self.ops.addresses(index).await.map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Long-lived task: poll the kernel link table and report state changes.
    /// Unknown indices are classified and inserted; known indices are
    /// compared for an `is_up` transition, which is logged.
    pub async fn monitor(&self) -> Result<(), Error> {
        loop {
            let snapshots = self.ops.link_list().await.map_err(|e| Error::Netlink(e.to_string()))?;
            let mut interfaces = self.interfaces.lock().await;
            for snapshot in &snapshots {
                let new = Interface::from_snapshot(snapshot);
                match interfaces.get(&new.index) {
                    Some(prior) if prior.is_up() != new.is_up() => {
                        tracing::info!(index = new.index, name = %new.name, was_up = prior.is_up(), now_up = new.is_up(), "link state changed");
                        interfaces.insert(new.index, new);
                    }
                    Some(_) => {
                        interfaces.insert(new.index, new);
                    }
                    None => {
                        tracing::debug!(index = new.index, name = %new.name, class = ?new.class, "discovered link");
                        interfaces.insert(new.index, new);
                    }
                }
            }
            drop(interfaces);
            tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
        }
    }
}
