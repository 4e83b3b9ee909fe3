//! C6 — wire codec.
//!
//! Two frame variants inside a tagged JSON envelope. Opcodes on the wire
//! route entries follow the kernel's netlink route-message numbering
//! (`RTM_NEWROUTE` / `RTM_DELROUTE`), so a capture can be cross-referenced
//! against `ip monitor route` without a translation table.

use std::net::IpAddr;
use std::str::FromStr;

use cidr::IpCidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `RTM_NEWROUTE`, per `rtnetlink`'s message numbering.
const RTM_NEWROUTE: i32 = 24;
/// `RTM_DELROUTE`.
const RTM_DELROUTE: i32 = 25;

#[derive(Debug, Error)]
pub enum Error {
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid route operation code: {0}")]
    InvalidOp(i32),
    #[error("invalid CIDR destination {0:?}: {1}")]
    InvalidDest(String, String),
    #[error("invalid address {0:?}: {1}")]
    InvalidAddr(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    None,
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Helo {
    #[serde(rename = "IpAddr")]
    pub ip_addr: String,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Request")]
    pub request: Request,
}

impl Helo {
    pub fn source(&self) -> Result<IpAddr, Error> {
        IpAddr::from_str(&self.ip_addr).map_err(|e| Error::InvalidAddr(self.ip_addr.clone(), e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "Op")]
    pub op: i32,
    #[serde(rename = "Dest")]
    pub dest: String,
}

impl Route {
    pub fn new(op: crate::route::RouteOp, dest: IpCidr) -> Self {
        let op = match op {
            crate::route::RouteOp::New => RTM_NEWROUTE,
            crate::route::RouteOp::Del => RTM_DELROUTE,
        };
        Route { op, dest: dest.to_string() }
    }

    pub fn decode(&self) -> Result<(crate::route::RouteOp, IpCidr), Error> {
        let op = match self.op {
            RTM_NEWROUTE => crate::route::RouteOp::New,
            RTM_DELROUTE => crate::route::RouteOp::Del,
            other => return Err(Error::InvalidOp(other)),
        };
        let dest =
            IpCidr::from_str(&self.dest).map_err(|e| Error::InvalidDest(self.dest.clone(), e.to_string()))?;
        Ok((op, dest))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    #[serde(rename = "LinkState")]
    pub link_state: LinkState,
    #[serde(rename = "Gateway")]
    pub gateway: String,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Nameservers")]
    pub nameservers: String,
    #[serde(rename = "SearchDomains")]
    pub search_domains: String,
    #[serde(rename = "Routes")]
    pub routes: Vec<Route>,
}

impl Announce {
    pub fn gateway_addr(&self) -> Result<IpAddr, Error> {
        IpAddr::from_str(&self.gateway).map_err(|e| Error::InvalidAddr(self.gateway.clone(), e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    Helo(Helo),
    Announce(Announce),
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, Error> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    #[test]
    fn route_roundtrips_through_netlink_opcodes() {
        let dest = IpCidr::from_str("10.8.0.0/24").unwrap();
        let route = Route::new(crate::route::RouteOp::New, dest);
        assert_eq!(route.op, RTM_NEWROUTE);
        let (op, decoded) = route.decode().unwrap();
        assert_eq!(op, crate::route::RouteOp::New);
        assert_eq!(decoded, dest);
    }

    #[test]
    fn helo_envelope_roundtrips() {
        let envelope = Envelope::Helo(Helo { ip_addr: "fe80::1".into(), domain: "x".into(), request: Request::Init });
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            Envelope::Helo(h) => {
                assert_eq!(h.ip_addr, "fe80::1");
                assert_eq!(h.request, Request::Init);
            }
            _ => panic!("expected Helo"),
        }
    }

    #[test]
    fn announce_envelope_roundtrips_with_routes() {
        let dest = IpCidr::from_str("10.8.0.0/24").unwrap();
        let envelope = Envelope::Announce(Announce {
            link_state: LinkState::Up,
            gateway: "192.168.1.5".into(),
            domain: "corp.example".into(),
            nameservers: "10.8.0.2".into(),
            search_domains: "corp.example".into(),
            routes: vec![Route::new(crate::route::RouteOp::New, dest)],
        });
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            Envelope::Announce(a) => {
                assert_eq!(a.routes.len(), 1);
                assert_eq!(a.gateway_addr().unwrap(), IpAddr::from_str("192.168.1.5").unwrap());
            }
            _ => panic!("expected Announce"),
        }
    }

    #[test]
    fn invalid_op_code_is_rejected() {
        let route = Route { op: 99, dest: "10.8.0.0/24".into() };
        assert!(matches!(route.decode(), Err(Error::InvalidOp(99))));
    }
}
