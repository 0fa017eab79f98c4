//! Backend writer interface and built-in backends
//!
//! A [`Backend`] hands out sessions; the purge writer opens one session per
//! purge, optionally creates the destination table, pushes every entry with
//! [`BackendSession::op`] and closes the session.

pub mod jsonl;
pub mod memory;
pub mod print;

pub use jsonl::JsonlBackend;
pub use memory::MemoryBackend;
pub use print::PrintBackend;

use crate::cache::CacheEntry;
use crate::error::Result;
use async_trait::async_trait;
use flowacct_common::{family, Aggregation};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Per-purge information passed along with every entry.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    pub table: String,
    pub what_to_count: Aggregation,
    pub basetime: i64,
    pub timeslot: i64,
    pub new_basetime: bool,
    /// Writing to the backup or draining on exit.
    pub recover: bool,
    pub now: i64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, host: &str) -> Result<Box<dyn BackendSession>>;
}

#[async_trait]
pub trait BackendSession: Send {
    async fn create_table_if_needed(&mut self, schema: &str, basetime: i64) -> Result<()>;

    async fn op(&mut self, entry: &CacheEntry, ctx: &WriteContext) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Built-in backend selector used by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Print,
    Jsonl,
}

impl BackendKind {
    pub fn build(self) -> Arc<dyn Backend> {
        match self {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Print => Arc::new(PrintBackend::new()),
            BackendKind::Jsonl => Arc::new(JsonlBackend::new()),
        }
    }

    /// Workers of this kind want a wakeup on every published batch.
    pub fn wants_request_mode(self) -> bool {
        self == BackendKind::Memory
    }
}

/// An entry rendered with the columns its aggregation selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tos: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<u32>,
    pub packets: u64,
    pub bytes: u64,
    pub flows: u64,
    pub stamp_inserted: i64,
    pub stamp_updated: i64,
}

impl FlowRow {
    pub fn new(e: &CacheEntry, ctx: &WriteContext) -> Self {
        let agg = ctx.what_to_count;
        let p = &e.primitives;
        let pick = |bits: u32| agg.contains(bits);

        Self {
            src_mac: pick(Aggregation::SRC_MAC | Aggregation::SUM_MAC)
                .then(|| format_mac(&p.eth_shost)),
            dst_mac: pick(Aggregation::DST_MAC).then(|| format_mac(&p.eth_dhost)),
            vlan: pick(Aggregation::VLAN).then_some(p.vlan_id),
            src_host: pick(Aggregation::SRC_HOST | Aggregation::SUM_HOST)
                .then(|| format_addr(p.ip_family, &p.src_ip)),
            dst_host: pick(Aggregation::DST_HOST).then(|| format_addr(p.ip_family, &p.dst_ip)),
            src_port: pick(Aggregation::SRC_PORT | Aggregation::SUM_PORT).then_some(p.src_port),
            dst_port: pick(Aggregation::DST_PORT).then_some(p.dst_port),
            tos: pick(Aggregation::IP_TOS).then_some(p.tos),
            proto: pick(Aggregation::IP_PROTO).then(|| format_protocol(p.proto)),
            tag: pick(Aggregation::ID).then_some(p.agent_id),
            class: pick(Aggregation::CLASS).then_some(p.class_id),
            packets: e.packet_counter,
            bytes: e.bytes_counter,
            flows: e.flows_counter,
            stamp_inserted: e.basetime,
            stamp_updated: ctx.now,
        }
    }
}

/// Dotted/colon notation for the address stored in a key.
pub fn format_addr(ip_family: u8, raw: &[u8; 16]) -> String {
    match ip_family {
        family::INET6 => Ipv6Addr::from(*raw).to_string(),
        _ => Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string(),
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

pub fn format_protocol(proto: u8) -> String {
    match proto {
        1 => "icmp".to_string(),
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        n => n.to_string(),
    }
}
