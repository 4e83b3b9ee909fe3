//! Abstraction over the kernel route table operations the route manager
//! needs. Grounded on the teacher's `routing/netlink_ops.rs`, generalized
//! from IPv4-only `RouteSpec` to the dual-stack `cidr::IpCidr` the data
//! model requires.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use cidr::IpCidr;
use futures::TryStreamExt;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub dst: IpCidr,
    pub gateway: Option<IpAddr>,
    pub link_index: u32,
}

#[async_trait]
pub trait RouteOps: Send + Sync {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Every IPv4 and IPv6 route currently in the main table.
    async fn route_list(&self) -> Result<Vec<RouteSpec>, Error>;
    /// Egress interface index the kernel would use to reach `gateway`.
    async fn resolve_egress(&self, gateway: IpAddr) -> Result<Option<u32>, Error>;
}

#[derive(Clone)]
pub struct RealRouteOps {
    handle: rtnetlink::Handle,
}

impl RealRouteOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn build_v4(dst: cidr::Ipv4Cidr, gateway: Option<Ipv4Addr>, if_index: u32) -> rtnetlink::packet_route::route::RouteMessage {
        let mut b = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(dst.first_address(), dst.network_length())
            .output_interface(if_index);
        if let Some(gw) = gateway {
            b = b.gateway(gw);
        }
        b.build()
    }

    fn build_v6(dst: cidr::Ipv6Cidr, gateway: Option<Ipv6Addr>, if_index: u32) -> rtnetlink::packet_route::route::RouteMessage {
        let mut b = rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default()
            .destination_prefix(dst.first_address(), dst.network_length())
            .output_interface(if_index);
        if let Some(gw) = gateway {
            b = b.gateway(gw);
        }
        b.build()
    }

    fn build_message(spec: &RouteSpec) -> rtnetlink::packet_route::route::RouteMessage {
        match spec.dst {
            IpCidr::V4(dst) => {
                let gw = spec.gateway.and_then(|g| match g {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                });
                Self::build_v4(dst, gw, spec.link_index)
            }
            IpCidr::V6(dst) => {
                let gw = spec.gateway.and_then(|g| match g {
                    IpAddr::V6(v6) => Some(v6),
                    IpAddr::V4(_) => None,
                });
                Self::build_v6(dst, gw, spec.link_index)
            }
        }
    }

    fn message_to_spec(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<RouteSpec> {
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;

        let dest = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        })?;

        let prefix_len = msg.header.destination_prefix_length;
        let dst = IpCidr::new(dest, prefix_len).ok()?;

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });

        Some(RouteSpec {
            dst,
            gateway,
            link_index: if_index,
        })
    }
}

#[async_trait]
impl RouteOps for RealRouteOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_message(route);
        self.handle.route().add(msg).execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let msg = Self::build_message(route);
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, Error> {
        let v4: Vec<_> = self
            .handle
            .route()
            .get(rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default().build())
            .execute()
            .try_collect()
            .await?;
        let v6: Vec<_> = self
            .handle
            .route()
            .get(rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default().build())
            .execute()
            .try_collect()
            .await?;

        Ok(v4.iter().chain(v6.iter()).filter_map(Self::message_to_spec).collect())
    }

    async fn resolve_egress(&self, gateway: IpAddr) -> Result<Option<u32>, Error> {
        let routes = match gateway {
            IpAddr::V4(_) => {
                self.handle
                    .route()
                    .get(rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default().build())
                    .execute()
                    .try_collect::<Vec<_>>()
                    .await?
            }
            IpAddr::V6(_) => {
                self.handle
                    .route()
                    .get(rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default().build())
                    .execute()
                    .try_collect::<Vec<_>>()
                    .await?
            }
        };

        let best = routes
            .iter()
            .filter_map(|r| {
                let dest = r.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                    RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                    _ => None,
                });
                let prefix_len = r.header.destination_prefix_length;
                let matches = match dest {
                    Some(network) => contains(network, prefix_len, gateway),
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
}

fn contains(network: IpAddr, prefix_len: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
            (u32::from(n) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - prefix_len) };
            (u128::from(n) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}
