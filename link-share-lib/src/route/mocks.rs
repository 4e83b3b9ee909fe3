//! Stateful mocks of [`RouteOps`] and [`NfTablesOps`] for route-manager
//! tests, grounded on the teacher's `routing/mocks.rs` pattern: assert on
//! resulting state, not call sequences.

#![cfg(test)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::netlink_ops::{Error as NetError, RouteOps, RouteSpec};
use super::nftables_ops::{Error as NfError, NfTablesOps};

#[derive(Default)]
pub struct RouteOpsState {
    pub routes: Vec<RouteSpec>,
    pub egress: HashMap<IpAddr, u32>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockRouteOps {
    pub state: Arc<Mutex<RouteOpsState>>,
}

impl MockRouteOps {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteOps for MockRouteOps {
    async fn route_add(&self, route: &RouteSpec) -> Result<(), NetError> {
        let mut s = self.state.lock().unwrap();
        s.routes.retain(|r| r.dst != route.dst);
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), NetError> {
        let mut s = self.state.lock().unwrap();
        s.routes.retain(|r| r.dst != route.dst);
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, NetError> {
        Ok(self.state.lock().unwrap().routes.clone())
    }

    async fn resolve_egress(&self, gateway: IpAddr) -> Result<Option<u32>, NetError> {
        Ok(self.state.lock().unwrap().egress.get(&gateway).copied())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NfTablesState {
    pub enabled: bool,
    pub default_link: Option<String>,
    pub enable_calls: u32,
    pub disable_calls: u32,
}

#[derive(Clone, Default)]
pub struct MockNfTablesOps {
    pub state: Arc<Mutex<NfTablesState>>,
}

impl MockNfTablesOps {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NfTablesOps for MockNfTablesOps {
    fn enable(&self, default_link: &str) -> Result<(), NfError> {
        let mut s = self.state.lock().unwrap();
        s.enabled = true;
        s.default_link = Some(default_link.to_string());
        s.enable_calls += 1;
        Ok(())
    }

    fn disable(&self) -> Result<(), NfError> {
        let mut s = self.state.lock().unwrap();
        s.enabled = false;
        s.default_link = None;
        s.disable_calls += 1;
        Ok(())
    }
}
