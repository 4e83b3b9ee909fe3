//! Stateful mock of [`NetlinkOps`] for interface-manager tests.

#![cfg(test)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::netlink::{Error, LinkSnapshot, NetlinkOps};

#[derive(Default)]
struct State {
    links: Vec<LinkSnapshot>,
    egress: HashMap<Ipv4Addr, u32>,
    addresses: HashMap<u32, Vec<IpAddr>>,
}

#[derive(Clone, Default)]
pub struct MockNetlinkOps {
    state: Arc<Mutex<State>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_links(&self, links: Vec<LinkSnapshot>) {
        self.state.lock().unwrap().links = links;
    }

    pub fn set_egress(&self, dst: Ipv4Addr, index: Option<u32>) {
        let mut s = self.state.lock().unwrap();
        match index {
            Some(i) => {
                s.egress.insert(dst, i);
            }
            None => {
                s.egress.remove(&dst);
            }
        }
    }

    pub fn set_addresses(&self, link_index: u32, addrs: Vec<IpAddr>) {
        self.state.lock().unwrap().addresses.insert(link_index, addrs);
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkSnapshot>, Error> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn resolve_egress(&self, dst: Ipv4Addr) -> Result<Option<u32>, Error> {
        Ok(self.state.lock().unwrap().egress.get(&dst).copied())
    }

    async fn addresses(&self, link_index: u32) -> Result<Vec<IpAddr>, Error> {
        Ok(self.state.lock().unwrap().addresses.get(&link_index).cloned().unwrap_or_default())
    }
}
