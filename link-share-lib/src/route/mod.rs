//! C4 — route manager.
//!
//! Polls the kernel route table and diffs successive snapshots, classifies
//! tunnel-borne prefixes into the learned-route table, keeps the
//! self-route bookkeeping for routes this daemon installed on a peer's
//! behalf, flips forwarding/NAT on and off as tunnel routes come and go,
//! and wakes the protocol engine whenever something changed.

pub mod netlink_ops;
pub mod nftables_ops;

#[cfg(test)]
pub mod mocks;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cidr::IpCidr;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::iface::{self, InterfaceManager};
pub use netlink_ops::{RealRouteOps, RouteOps, RouteSpec};
pub use nftables_ops::{NfTablesOps, RealNfTablesOps};

const ROUTE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SYSCTL_IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const SYSCTL_IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink error: {0}")]
    Netlink(#[from] netlink_ops::Error),
    #[error("nftables error: {0}")]
    NfTables(#[from] nftables_ops::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("interface error: {0}")]
    Iface(String),
    #[error("no kernel route toward gateway {0}")]
    NoEgress(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    New,
    Del,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteUpdate {
    pub op: RouteOp,
    pub dst: IpCidr,
}

#[derive(Debug, Clone)]
struct SelfRoute {
    dst: IpCidr,
    gateway: IpAddr,
    link_index: u32,
}

/// Non-default, non-host, non-multicast/link-local prefix riding a TUNNEL
/// link, per the data model's LearnedRoute invariants.
fn qualifies(dst: &IpCidr) -> bool {
    match dst {
        IpCidr::V4(c) => {
            let len = c.network_length();
            if len == 0 || len == 32 {
                return false;
            }
            let a = c.first_address();
            !(a.is_multicast() || a.is_link_local())
        }
        IpCidr::V6(c) => {
            let len = c.network_length();
            if len == 0 || len == 128 {
                return false;
            }
            let a = c.first_address();
            let link_local = (a.segments()[0] & 0xffc0) == 0xfe80;
            !(a.is_multicast() || link_local)
        }
    }
}

pub struct RouteManager<R: RouteOps, F: NfTablesOps, N: iface::NetlinkOps> {
    route_ops: R,
    nft_ops: F,
    ifaces: Arc<InterfaceManager<N>>,
    learned: Mutex<Vec<RouteUpdate>>,
    self_routes: Mutex<Vec<SelfRoute>>,
    routing_enabled: Mutex<bool>,
    notify: Notify,
    sysctl_ipv4: PathBuf,
    sysctl_ipv6: PathBuf,
}

impl<R: RouteOps, F: NfTablesOps, N: iface::NetlinkOps> RouteManager<R, F, N> {
    pub fn new(route_ops: R, nft_ops: F, ifaces: Arc<InterfaceManager<N>>) -> Self {
        Self {
            route_ops,
            nft_ops,
            ifaces,
            learned: Mutex::new(Vec::new()),
            self_routes: Mutex::new(Vec::new()),
            routing_enabled: Mutex::new(false),
            notify: Notify::new(),
            sysctl_ipv4: PathBuf::from(SYSCTL_IPV4_FORWARD),
            sysctl_ipv6: PathBuf::from(SYSCTL_IPV6_FORWARD),
        }
    }

    #[cfg(test)]
    pub fn with_sysctl_paths(mut self, ipv4: PathBuf, ipv6: PathBuf) -> Self {
        self.sysctl_ipv4 = ipv4;
        self.sysctl_ipv6 = ipv6;
        self
    }

    /// Install a route on behalf of a peer's ANNOUNCE. Returns whether a new
    /// kernel route was installed (`false` if `dest` is already self-owned).
    pub async fn add_route(&self, dest: IpCidr, gateway: IpAddr) -> Result<bool, Error> {
        let mut self_routes = self.self_routes.lock().await;
        if self_routes.iter().any(|r| r.dst == dest) {
            return Ok(false);
        }
        let link_index = self
            .route_ops
            .resolve_egress(gateway)
            .await?
            .ok_or(Error::NoEgress(gateway))?;
        let spec = RouteSpec {
            dst: dest,
            gateway: Some(gateway),
            link_index,
        };
        self.route_ops.route_add(&spec).await?;
        self_routes.push(SelfRoute {
            dst: dest,
            gateway,
            link_index,
        });
        Ok(true)
    }

    /// Remove a previously installed self-route. Returns whether it was
    /// present.
    pub async fn delete_route(&self, dest: IpCidr, gateway: IpAddr) -> Result<bool, Error> {
        let mut self_routes = self.self_routes.lock().await;
        let Some(pos) = self_routes.iter().position(|r| r.dst == dest) else {
            return Ok(false);
        };
        let removed = self_routes.remove(pos);
        let spec = RouteSpec {
            dst: removed.dst,
            gateway: Some(gateway),
            link_index: removed.link_index,
        };
        self.route_ops.route_del(&spec).await?;
        Ok(true)
    }

    pub async fn get_route_updates(&self) -> Vec<RouteUpdate> {
        self.learned.lock().await.clone()
    }

    pub async fn learned_count(&self) -> usize {
        self.learned.lock().await.len()
    }

    /// Blocks until the next routes-ready signal. A burst of updates
    /// coalesces into exactly one wake via `Notify`'s single stored permit.
    pub async fn wait_for_update(&self) {
        self.notify.notified().await;
    }

    pub async fn enable_routing(&self) -> Result<(), Error> {
        let mut enabled = self.routing_enabled.lock().await;
        if *enabled {
            return Ok(());
        }
        let default_link = self
            .ifaces
            .get_default_link(iface::DEFAULT_LINK_PROBE)
            .await
            .map_err(|e| Error::Iface(e.to_string()))?;
        tokio::fs::write(&self.sysctl_ipv4, b"1").await?;
        tokio::fs::write(&self.sysctl_ipv6, b"1").await?;
        self.nft_ops.enable(&default_link.name)?;
        *enabled = true;
        tracing::info!(link = %default_link.name, "routing enabled");
        Ok(())
    }

    pub async fn disable_routing(&self) -> Result<(), Error> {
        let mut enabled = self.routing_enabled.lock().await;
        if !*enabled {
            return Ok(());
        }
        tokio::fs::write(&self.sysctl_ipv4, b"0").await?;
        tokio::fs::write(&self.sysctl_ipv6, b"0").await?;
        self.nft_ops.disable()?;
        *enabled = false;
        tracing::info!("routing disabled");
        Ok(())
    }

    /// Orderly shutdown: remove every self-installed kernel route and force
    /// forwarding off, regardless of the current routing-enabled state.
    /// Errors removing individual routes are logged and do not stop the
    /// sweep.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let routes: Vec<SelfRoute> = self.self_routes.lock().await.drain(..).collect();
        for route in routes {
            let spec = RouteSpec { dst: route.dst, gateway: Some(route.gateway), link_index: route.link_index };
            if let Err(e) = self.route_ops.route_del(&spec).await {
                tracing::warn!(error = %e, dst = %route.dst, "failed to remove self-route on shutdown");
            }
        }
        *self.routing_enabled.lock().await = true;
        self.disable_routing().await
    }

    /// Classify one observed route event and merge it into the learned
    /// table by the coalescing rule. Returns whether the event was accepted
    /// (self-installed and non-qualifying events are silently ignored).
    async fn classify_and_merge(&self, link_index: u32, dst: IpCidr, op: RouteOp) -> Result<bool, Error> {
        if self.self_routes.lock().await.iter().any(|r| r.dst == dst) {
            return Ok(false);
        }
        let Some(link) = self.ifaces.get_tunnel_by_index(link_index).await else {
            return Ok(false);
        };
        if !iface::is_tunnel_name(&link.name) || !qualifies(&dst) {
            return Ok(false);
        }

        let mut learned = self.learned.lock().await;
        let was_new = learned.iter().find(|r| r.dst == dst).is_some_and(|r| r.op == RouteOp::New);
        match learned.iter_mut().find(|r| r.dst == dst) {
            Some(r) => r.op = op,
            None => learned.push(RouteUpdate { op, dst }),
        }
        let became_new = !was_new && op == RouteOp::New;
        let no_active_tunnel_routes = !learned.iter().any(|r| r.op == RouteOp::New);
        drop(learned);

        if became_new {
            self.enable_routing().await?;
        } else if op == RouteOp::Del && no_active_tunnel_routes {
            self.disable_routing().await?;
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Enumerate the existing route table at start-up and feed every row
    /// through the same classify/merge path the monitor uses, as Op=NEW.
    pub async fn init(&self) -> Result<(), Error> {
        let routes = self.route_ops.route_list().await?;
        for r in routes {
            self.classify_and_merge(r.link_index, r.dst, RouteOp::New).await?;
        }
        Ok(())
    }

    /// Long-lived task: poll the kernel route table and classify/merge
    /// additions and removals, signalling `wait_for_update` exactly once
    /// per qualifying event.
    pub async fn monitor(&self) -> Result<(), Error> {
        let mut previous: HashMap<IpCidr, RouteSpec> = HashMap::new();
        loop {
            let current: HashMap<IpCidr, RouteSpec> =
                self.route_ops.route_list().await?.into_iter().map(|r| (r.dst, r)).collect();

            for (dst, spec) in &current {
                if !previous.contains_key(dst) {
                    self.classify_and_merge(spec.link_index, *dst, RouteOp::New).await?;
                }
            }
            for (dst, spec) in &previous {
                if !current.contains_key(dst) {
                    self.classify_and_merge(spec.link_index, *dst, RouteOp::Del).await?;
                }
            }
            previous = current;
            tokio::time::sleep(ROUTE_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::mocks::MockNetlinkOps;
    use crate::iface::netlink::LinkSnapshot;
    use crate::route::mocks::{MockNfTablesOps, MockRouteOps};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    async fn manager_with_tunnel() -> (
        RouteManager<MockRouteOps, MockNfTablesOps, MockNetlinkOps>,
        MockNfTablesOps,
        tempfile::TempDir,
    ) {
        let net_ops = MockNetlinkOps::new();
        net_ops.set_links(vec![LinkSnapshot {
            index: 3,
            name: "gpd0".into(),
            up: true,
            lower_up: true,
            point_to_point: true,
            loopback: false,
        }]);
        net_ops.set_egress(iface::DEFAULT_LINK_PROBE, Some(3));
        let ifaces = Arc::new(InterfaceManager::new(net_ops));
        ifaces.enumerate().await.unwrap();

        let route_ops = MockRouteOps::new();
        let nft_ops = MockNfTablesOps::new();
        let dir = tempfile::tempdir().unwrap();
        let v4 = dir.path().join("ip_forward");
        let v6 = dir.path().join("forwarding");
        std::fs::write(&v4, "0").unwrap();
        std::fs::write(&v6, "0").unwrap();

        let mgr = RouteManager::new(route_ops, nft_ops.clone(), ifaces).with_sysctl_paths(v4, v6);
        (mgr, nft_ops, dir)
    }

    #[tokio::test]
    async fn new_tunnel_route_enables_routing() {
        let (mgr, nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("10.8.0.0/24").unwrap();
        let accepted = mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(accepted);
        assert_eq!(mgr.learned_count().await, 1);
        assert!(nft_ops.state.lock().unwrap().enabled);
    }

    #[tokio::test]
    async fn withdrawing_last_tunnel_route_disables_routing() {
        let (mgr, nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("10.8.0.0/24").unwrap();
        mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(nft_ops.state.lock().unwrap().enabled);
        mgr.classify_and_merge(3, dst, RouteOp::Del).await.unwrap();
        assert!(!nft_ops.state.lock().unwrap().enabled);
    }

    #[tokio::test]
    async fn re_adding_a_withdrawn_route_re_enables_routing() {
        let (mgr, nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("10.8.0.0/24").unwrap();

        mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(nft_ops.state.lock().unwrap().enabled);

        mgr.classify_and_merge(3, dst, RouteOp::Del).await.unwrap();
        assert!(!nft_ops.state.lock().unwrap().enabled);

        mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(nft_ops.state.lock().unwrap().enabled);
        assert_eq!(mgr.learned_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_new_events_coalesce_to_one_row() {
        let (mgr, _nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("10.8.0.0/24").unwrap();
        mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert_eq!(mgr.learned_count().await, 1);
    }

    #[tokio::test]
    async fn host_route_is_rejected() {
        let (mgr, _nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("10.8.0.1/32").unwrap();
        let accepted = mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(!accepted);
        assert_eq!(mgr.learned_count().await, 0);
    }

    #[tokio::test]
    async fn default_route_is_rejected() {
        let (mgr, _nft_ops, _dir) = manager_with_tunnel().await;
        let dst = IpCidr::from_str("0.0.0.0/0").unwrap();
        let accepted = mgr.classify_and_merge(3, dst, RouteOp::New).await.unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn add_route_skips_when_already_self_owned() {
        let (mgr, _nft_ops, _dir) = manager_with_tunnel().await;
        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        mgr.route_ops.state.lock().unwrap().egress.insert(gw, 3);
        let dest = IpCidr::from_str("10.8.0.0/24").unwrap();
        assert!(mgr.add_route(dest, gw).await.unwrap());
        assert!(!mgr.add_route(dest, gw).await.unwrap());
    }

    #[tokio::test]
    async fn delete_route_reports_presence() {
        let (mgr, _nft_ops, _dir) = manager_with_tunnel().await;
        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        mgr.route_ops.state.lock().unwrap().egress.insert(gw, 3);
        let dest = IpCidr::from_str("10.8.0.0/24").unwrap();
        mgr.add_route(dest, gw).await.unwrap();
        assert!(mgr.delete_route(dest, gw).await.unwrap());
        assert!(!mgr.delete_route(dest, gw).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_removes_self_routes_and_disables_routing() {
        let (mgr, nft_ops, _dir) = manager_with_tunnel().await;
        let gw = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5));
        mgr.route_ops.state.lock().unwrap().egress.insert(gw, 3);
        let dest = IpCidr::from_str("10.8.0.0/24").unwrap();
        mgr.add_route(dest, gw).await.unwrap();

        mgr.shutdown().await.unwrap();

        assert!(mgr.route_ops.state.lock().unwrap().routes.is_empty());
        assert!(!nft_ops.state.lock().unwrap().enabled);
    }
}
