//! Abstraction over the netlink calls the interface manager needs, so tests
//! can run without a real kernel. Grounded on the teacher's
//! `routing/netlink_ops.rs` split between a `NetlinkOps` trait and a
//! `RealNetlinkOps` backed by `rtnetlink::Handle`.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use thiserror::Error;

fn flag_set(flags: u32, bit: i32) -> bool {
    flags & (bit as u32) != 0
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
}

/// A link as reported by the kernel, decoupled from the netlink wire format.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub lower_up: bool,
    pub point_to_point: bool,
    pub loopback: bool,
}

#[async_trait]
pub trait NetlinkOps: Send + Sync {
    async fn link_list(&self) -> Result<Vec<LinkSnapshot>, Error>;

    /// Resolve the egress interface index the kernel would use to reach
    /// `dst`, preferring the longest matching prefix and falling back to
    /// the default route.
    async fn resolve_egress(&self, dst: Ipv4Addr) -> Result<Option<u32>, Error>;

    /// All addresses (v4 and v6) currently assigned to `link_index`.
    async fn addresses(&self, link_index: u32) -> Result<Vec<IpAddr>, Error>;
}

#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkSnapshot>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;

        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                let flags = link.header.flags;
                Some(LinkSnapshot {
                    index: link.header.index,
                    up: flag_set(flags, libc::IFF_UP),
                    lower_up: flag_set(flags, libc::IFF_LOWER_UP),
                    point_to_point: flag_set(flags, libc::IFF_POINTOPOINT),
                    loopback: flag_set(flags, libc::IFF_LOOPBACK),
                    name,
                })
            })
            .collect())
    }

    async fn resolve_egress(&self, dst: Ipv4Addr) -> Result<Option<u32>, Error> {
        let routes: Vec<_> = self
            .handle
            .route()
            .get(rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default().build())
            .execute()
            .try_collect()
            .await?;

        let best = routes
            .iter()
            .filter_map(|r| {
                let dest = r.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                    _ => None,
                });
                let prefix_len = r.header.destination_prefix_length;
                let matches = match dest {
                    Some(network) => {
                        let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
                        (u32::from(network) & mask) == (u32::from(dst) & mask)
                    }
                    None => prefix_len == 0,
                };
                matches.then_some((prefix_len, r))
            })
            .max_by_key(|(prefix_len, _)| *prefix_len)
            .map(|(_, r)| r);

        Ok(best.and_then(|r| {
            r.attributes.iter().find_map(|a| match a {
                RouteAttribute::Oif(idx) => Some(*idx),
                _ => None,
            })
        }))
    }

    async fn addresses(&self, link_index: u32) -> Result<Vec<IpAddr>, Error> {
        let addrs: Vec<_> = self.handle.address().get().set_link_index_filter(link_index).execute().try_collect().await?;
        Ok(addrs
            .iter()
            .filter_map(|a| {
                a.attributes.iter().find_map(|attr| match attr {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })
            })
            .collect())
    }
}
