//! Forwarding/NAT toggling via native nftables, grounded on the teacher's
//! `routing/nftables_ops.rs` (same `nftnl` + `mnl` batch-and-ACK pattern),
//! generalized from a single fwmark table to the two dual-stack tables
//! (`inet nat`, `inet filter`) the route manager installs while forwarding
//! is enabled.

use std::ffi::CString;

use nftnl::expr::{self, Nat, NatType};
use nftnl::{Batch, Chain, ChainType, Hook, MsgType, Policy, ProtoFamily, Rule, Table};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("nftables error: {0}")]
    NfTables(String),
}

const NAT_TABLE: &std::ffi::CStr = c"nat";
const FILTER_TABLE: &std::ffi::CStr = c"filter";
const PREROUTING: &std::ffi::CStr = c"prerouting";
const POSTROUTING: &std::ffi::CStr = c"postrouting";
const INPUT: &std::ffi::CStr = c"input";
const FORWARD: &std::ffi::CStr = c"forward";
const OUTPUT: &std::ffi::CStr = c"output";

const PRIO_FILTER: i32 = 0;
const PRIO_NAT_SRC: i32 = 100;

pub trait NfTablesOps: Send + Sync {
    /// Install `inet nat` (prerouting/postrouting with masquerade rules for
    /// `default_link`) and `inet filter` (input/forward/output, policy
    /// accept). Idempotent.
    fn enable(&self, default_link: &str) -> Result<(), Error>;
    /// Remove both tables. Idempotent.
    fn disable(&self) -> Result<(), Error>;
}

pub struct RealNfTablesOps;

impl RealNfTablesOps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealNfTablesOps {
    fn default() -> Self {
        Self::new()
    }
}

fn send_batch(batch: &nftnl::FinalizedBatch) -> Result<(), Error> {
    let socket = mnl::Socket::new(mnl::Bus::Netfilter).map_err(|e| Error::NfTables(format!("open socket: {e}")))?;
    let portid = socket.portid();
    socket.send_all(batch).map_err(|e| Error::NfTables(format!("send batch: {e}")))?;

    let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
    let mut expected_seqs = batch.sequence_numbers();
    while !expected_seqs.is_empty() {
        let messages = socket.recv(&mut buffer[..]).map_err(|e| Error::NfTables(format!("recv: {e}")))?;
        for message in messages {
            let message = message.map_err(|e| Error::NfTables(format!("message: {e}")))?;
            let expected_seq = expected_seqs
                .next()
                .ok_or_else(|| Error::NfTables("unexpected ACK".into()))?;
            mnl::cb_run(message, expected_seq, portid).map_err(|e| Error::NfTables(format!("ack: {e}")))?;
        }
    }
    Ok(())
}

fn delete_table(name: &std::ffi::CStr, ignore_enoent: bool) -> Result<(), Error> {
    let table = Table::new(name, ProtoFamily::Inet);
    let mut batch = Batch::new();
    batch.add(&table, MsgType::Del);
    match send_batch(&batch.finalize()) {
        Ok(()) => Ok(()),
        Err(e) if ignore_enoent => {
            let msg = e.to_string();
            if msg.contains("No such file or directory") || msg.contains("ENOENT") {
                Ok(())
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

fn masquerade_rule(chain: &Chain, match_oif: bool, link: &std::ffi::CStr) -> Rule {
    let mut rule = Rule::new(chain);
    if match_oif {
        rule.add_expr(&nft_expr_meta_oifname());
    } else {
        rule.add_expr(&nft_expr_meta_iifname());
    }
    rule.add_expr(&nftnl::expr::Cmp::new(
        nftnl::expr::CmpOp::Eq,
        expr::InterfaceName::Exact(link.to_owned()),
    ));
    rule.add_expr(&Nat {
        nat_type: NatType::Masquerade,
        family: ProtoFamily::Inet,
        ip_register: None,
        port_register: None,
    });
    rule
}

fn nft_expr_meta_oifname() -> expr::Meta {
    expr::Meta::new(expr::MetaType::OifName)
}

fn nft_expr_meta_iifname() -> expr::Meta {
    expr::Meta::new(expr::MetaType::IifName)
}

impl NfTablesOps for RealNfTablesOps {
    fn enable(&self, default_link: &str) -> Result<(), Error> {
        let _ = delete_table(NAT_TABLE, true);
        let _ = delete_table(FILTER_TABLE, true);

        let link_cstr =
            CString::new(default_link).map_err(|e| Error::NfTables(format!("invalid link name: {e}")))?;

        let mut batch = Batch::new();

        let nat_table = Table::new(NAT_TABLE, ProtoFamily::Inet);
        batch.add(&nat_table, MsgType::Add);

        let mut pre = Chain::new(PREROUTING, &nat_table);
        pre.set_hook(Hook::PreRouting, PRIO_FILTER);
        pre.set_type(ChainType::Nat);
        batch.add(&pre, MsgType::Add);

        let mut post = Chain::new(POSTROUTING, &nat_table);
        post.set_hook(Hook::PostRouting, PRIO_NAT_SRC);
        post.set_type(ChainType::Nat);
        batch.add(&post, MsgType::Add);

        let oif_rule = masquerade_rule(&post, true, &link_cstr);
        batch.add(&oif_rule, MsgType::Add);
        let iif_rule = masquerade_rule(&post, false, &link_cstr);
        batch.add(&iif_rule, MsgType::Add);

        let filter_table = Table::new(FILTER_TABLE, ProtoFamily::Inet);
        batch.add(&filter_table, MsgType::Add);

        for (name, hook) in [(INPUT, Hook::In), (FORWARD, Hook::Forward), (OUTPUT, Hook::Out)] {
            let mut chain = Chain::new(name, &filter_table);
            chain.set_hook(hook, PRIO_FILTER);
            chain.set_type(ChainType::Filter);
            chain.set_policy(Policy::Accept);
            batch.add(&chain, MsgType::Add);
        }

        send_batch(&batch.finalize())?;
        tracing::info!(default_link, "enabled forwarding nftables tables");
        Ok(())
    }

    fn disable(&self) -> Result<(), Error> {
        delete_table(NAT_TABLE, true)?;
        delete_table(FILTER_TABLE, true)?;
        tracing::info!("disabled forwarding nftables tables");
        Ok(())
    }
}
