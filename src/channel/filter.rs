//! Per-channel packet filters
//!
//! The filter runs first in the distribution pipeline, before tag filtering
//! and sampling.

use super::input::DecodedFlow;
use serde::{Deserialize, Serialize};

pub trait PacketFilter: Send + Sync {
    fn matches(&self, flow: &DecodedFlow) -> bool;
}

/// Channel without a filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PacketFilter for AcceptAll {
    fn matches(&self, _flow: &DecodedFlow) -> bool {
        true
    }
}

/// Match on protocol and port lists.
///
/// Empty lists match anything. A port list matches when either the source
/// or the destination port is listed. `exclude` inverts the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchFilter {
    pub protocols: Vec<u8>,
    pub ports: Vec<u16>,
    pub exclude: bool,
}

impl MatchFilter {
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.ports.is_empty()
    }
}

impl PacketFilter for MatchFilter {
    fn matches(&self, flow: &DecodedFlow) -> bool {
        let proto_ok = self.protocols.is_empty() || self.protocols.contains(&flow.proto);
        let port_ok = self.ports.is_empty()
            || self.ports.contains(&flow.src_port)
            || self.ports.contains(&flow.dst_port);
        (proto_ok && port_ok) != self.exclude
    }
}
