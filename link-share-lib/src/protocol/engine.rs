//! C5 — protocol engine.
//!
//! Owns one [`ConnectionContext`] per STANDARD interface, the host table,
//! and the set of this host's own addresses (for the echo check). Dispatches
//! inbound HELO/ANNOUNCE frames and drives outbound HELO and advertise
//! fan-out. Holds the engine lock only around host-table mutation and
//! send fan-out, never across a self-call into `advertise_routes()`.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cidr::IpCidr;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::dns::DnsManager;
use crate::iface::{self, Interface, InterfaceManager, NetlinkOps};
use crate::route::{NfTablesOps, RouteOp, RouteOps, RouteManager};

use super::codec::{self, Announce, Envelope, Helo, Request, Route};
use super::host_table::HostTable;
use super::transport::Transport;

#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] codec::Error),
    #[error("route manager error: {0}")]
    Route(#[from] crate::route::Error),
    #[error("dns error: {0}")]
    Dns(#[from] crate::dns::Error),
    #[error("interface manager error: {0}")]
    Iface(#[from] iface::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}

/// One STANDARD interface's multicast membership: its addresses (for the
/// echo check and as the gateway field on outbound frames) and the socket
/// joined to the group on it.
#[derive(Clone)]
pub struct ConnectionContext {
    pub interface: Interface,
    pub local_addrs: Vec<IpAddr>,
    pub transport: Arc<dyn Transport>,
}

impl ConnectionContext {
    /// This connection's preferred source address: IPv6 first, IPv4 as
    /// fallback, per the outbound HELO contract.
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.local_addrs
            .iter()
            .find(|a| a.is_ipv6())
            .or_else(|| self.local_addrs.iter().find(|a| a.is_ipv4()))
            .copied()
    }
}

fn family_matches(addr: &IpAddr, dst: &IpCidr) -> bool {
    matches!((addr, dst), (IpAddr::V4(_), IpCidr::V4(_)) | (IpAddr::V6(_), IpCidr::V6(_)))
}

struct EngineState {
    connections: Vec<ConnectionContext>,
    hosts: HostTable,
    local_addresses: HashSet<IpAddr>,
    domain: String,
}

pub struct Engine<R: RouteOps, F: NfTablesOps, N: NetlinkOps> {
    state: Mutex<EngineState>,
    routes: Arc<RouteManager<R, F, N>>,
    ifaces: Arc<InterfaceManager<N>>,
    dns: DnsManager,
    multicast_group: Ipv6Addr,
    multicast_port: u16,
    eviction_window: Duration,
}

impl<R: RouteOps, F: NfTablesOps, N: NetlinkOps> Engine<R, F, N> {
    pub fn new(
        routes: Arc<RouteManager<R, F, N>>,
        ifaces: Arc<InterfaceManager<N>>,
        dns: DnsManager,
        multicast_group: Ipv6Addr,
        multicast_port: u16,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                connections: Vec::new(),
                hosts: HostTable::new(),
                local_addresses: HashSet::new(),
                domain: String::new(),
            }),
            routes,
            ifaces,
            dns,
            multicast_group,
            multicast_port,
            eviction_window: poll_interval * crate::config::HOST_EVICTION_INTERVALS,
        }
    }

    fn multicast_dest(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(self.multicast_group), self.multicast_port)
    }

    /// Register a connection's addresses into the local-address set and add
    /// it to the fan-out list. Called once per STANDARD interface at
    /// start-up.
    pub async fn add_connection(&self, ctx: ConnectionContext) {
        let mut state = self.state.lock().await;
        for addr in &ctx.local_addrs {
            state.local_addresses.insert(*addr);
        }
        state.connections.push(ctx);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn host_count(&self) -> usize {
        self.state.lock().await.hosts.len()
    }

    /// Long-lived receive loop for one connection. Exits only on a fatal
    /// socket error; per-frame failures are logged and the loop continues.
    pub async fn run_connection(&self, ctx: ConnectionContext) -> Result<(), Error> {
        let mut buf = vec![0u8; crate::config::MAX_DATAGRAM];
        loop {
            let (len, source) = ctx.transport.recv(&mut buf).await?;
            if let Err(e) = self.handle_frame(&buf[..len], source.ip()).await {
                tracing::warn!(error = %e, link = %ctx.interface.name, "failed to process inbound frame");
            }
        }
    }

    /// Decode and dispatch one inbound frame. Discards silently if `source`
    /// is one of this host's own addresses (echo check).
    pub async fn handle_frame(&self, bytes: &[u8], source: IpAddr) -> Result<(), Error> {
        if self.state.lock().await.local_addresses.contains(&source) {
            return Ok(());
        }
        match codec::decode(bytes)? {
            Envelope::Helo(helo) => self.handle_helo(helo, source).await,
            Envelope::Announce(announce) => self.handle_announce(announce).await,
        }
    }

    async fn handle_helo(&self, helo: Helo, source: IpAddr) -> Result<(), Error> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let is_new = state.hosts.insert_new(source, now);
        if !is_new {
            state.hosts.refresh(source, now);
        }
        drop(state);

        if is_new || helo.request == Request::Init {
            self.advertise_routes().await?;
        }
        Ok(())
    }

    async fn handle_announce(&self, announce: Announce) -> Result<(), Error> {
        let gateway = announce.gateway_addr()?;
        {
            let mut state = self.state.lock().await;
            state.domain = announce.domain.clone();
        }

        for route in &announce.routes {
            let (op, dest) = route.decode()?;
            match op {
                RouteOp::New => {
                    let installed = self.routes.add_route(dest, gateway).await?;
                    if installed {
                        self.apply_announced_dns(&announce).await;
                    }
                }
                RouteOp::Del => {
                    let removed = self.routes.delete_route(dest, gateway).await?;
                    if removed {
                        if let Err(e) = self.dns.restore().await {
                            tracing::warn!(error = %e, "dns restore failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Best-effort: snapshot, write, commit. Never layers a second snapshot
    /// on top of one already in flight.
    async fn apply_announced_dns(&self, announce: &Announce) {
        match self.dns.backup().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("dns snapshot already exists, skipping announced mutation");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dns backup failed");
                return;
            }
        }

        let link = match self.ifaces.get_default_link(iface::DEFAULT_LINK_PROBE).await {
            Ok(link) => link.name,
            Err(e) => {
                tracing::warn!(error = %e, "cannot resolve default link for announced dns");
                return;
            }
        };

        if let Err(e) = self.dns.set_nameservers(&link, &announce.nameservers).await {
            tracing::warn!(error = %e, "setting announced nameservers failed");
            return;
        }
        if let Err(e) = self.dns.set_domains(&link, &announce.search_domains).await {
            tracing::warn!(error = %e, "setting announced search domains failed");
            return;
        }
        match self.dns.commit().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("dns commit rejected announced configuration"),
            Err(e) => tracing::warn!(error = %e, "dns commit failed"),
        }
    }

    /// Outbound HELO: one frame per connection, carrying its preferred
    /// address and this host's administrative domain.
    pub async fn send_helo(&self) -> Result<(), Error> {
        let dest = self.multicast_dest();
        let state = self.state.lock().await;
        let domain = state.domain.clone();
        for ctx in &state.connections {
            let Some(addr) = ctx.preferred_address() else { continue };
            let helo = Helo { ip_addr: addr.to_string(), domain: domain.clone(), request: Request::None };
            let payload = codec::encode(&Envelope::Helo(helo))?;
            if let Err(e) = ctx.transport.send_to(&payload, dest).await {
                tracing::warn!(error = %e, link = %ctx.interface.name, "failed to send helo");
            }
        }
        Ok(())
    }

    /// For every learned route, send one ANNOUNCE per connection, with the
    /// gateway field set to this host's address matching the route's
    /// family.
    pub async fn advertise_routes(&self) -> Result<(), Error> {
        let updates = self.routes.get_route_updates().await;
        if updates.is_empty() {
            return Ok(());
        }
        let dns_view = self.dns.read().await?;
        let dest = self.multicast_dest();

        let state = self.state.lock().await;
        let domain = state.domain.clone();
        for update in &updates {
            let link_state = match update.op {
                RouteOp::New => super::codec::LinkState::Up,
                RouteOp::Del => super::codec::LinkState::Down,
            };
            for ctx in &state.connections {
                let Some(gateway) = ctx.local_addrs.iter().find(|a| family_matches(a, &update.dst)).copied() else {
                    continue;
                };
                let announce = Announce {
                    link_state,
                    gateway: gateway.to_string(),
                    domain: domain.clone(),
                    nameservers: dns_view.nameservers.clone(),
                    search_domains: dns_view.domains.clone(),
                    routes: vec![Route::new(update.op, update.dst)],
                };
                let payload = codec::encode(&Envelope::Announce(announce))?;
                if let Err(e) = ctx.transport.send_to(&payload, dest).await {
                    tracing::warn!(error = %e, link = %ctx.interface.name, "failed to send announce");
                }
            }
        }
        Ok(())
    }

    /// Long-lived task: advertise immediately if routes already exist, then
    /// advertise again on every coalesced routes-ready wake.
    pub async fn run_advertise_on_update(&self) -> Result<(), Error> {
        if self.routes.learned_count().await > 0 {
            self.advertise_routes().await?;
        }
        loop {
            self.routes.wait_for_update().await;
            if let Err(e) = self.advertise_routes().await {
                tracing::warn!(error = %e, "advertise-on-update failed");
            }
        }
    }

    /// Evict host entries not refreshed within `HOST_EVICTION_INTERVALS`
    /// poll periods.
    pub async fn host_accounting(&self) {
        let mut state = self.state.lock().await;
        state.hosts.evict_stale(Instant::now(), self.eviction_window);
    }

    /// Roll back any DNS changes applied from an ANNOUNCE, for orderly
    /// shutdown.
    pub async fn dns_restore(&self) -> Result<(), Error> {
        self.dns.restore().await.map_err(Error::from)
    }
}
