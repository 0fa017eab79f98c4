//! Record construction
//!
//! Each channel builds its on-wire [`FlowRecord`] through a chain of field
//! handlers chosen from its aggregation mask. Key fields outside the mask
//! stay zero so they never split cache entries; counters, timestamp, tag and
//! classification accumulators are always copied.

use super::input::DecodedFlow;
use flowacct_common::{family, Aggregation, FlowRecord};
use std::net::IpAddr;

pub type Handler = fn(&DecodedFlow, &mut FlowRecord);

#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Handler>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn write_addr(addr: Option<IpAddr>, out: &mut [u8; 16], fam: &mut u8) {
    match addr {
        Some(IpAddr::V4(v4)) => {
            out[..4].copy_from_slice(&v4.octets());
            *fam = family::INET;
        }
        Some(IpAddr::V6(v6)) => {
            *out = v6.octets();
            *fam = family::INET6;
        }
        None => {}
    }
}

fn src_host_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    let p = &mut rec.primitives;
    write_addr(flow.src_ip, &mut p.src_ip, &mut p.ip_family);
}

fn dst_host_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    let p = &mut rec.primitives;
    write_addr(flow.dst_ip, &mut p.dst_ip, &mut p.ip_family);
}

fn src_mac_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    if let Some(mac) = flow.src_mac {
        rec.primitives.eth_shost = mac.0;
    }
}

fn dst_mac_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    if let Some(mac) = flow.dst_mac {
        rec.primitives.eth_dhost = mac.0;
    }
}

fn vlan_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.vlan_id = flow.vlan;
}

fn src_port_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.src_port = flow.src_port;
}

fn dst_port_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.dst_port = flow.dst_port;
}

fn tos_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.tos = flow.tos;
}

fn proto_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.proto = flow.proto;
}

fn id_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.agent_id = flow.tag;
}

fn class_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.primitives.class_id = flow.class_id;
}

fn counters_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    rec.pkt_len = flow.bytes;
    rec.pkt_num = flow.packets;
    rec.flo_num = flow.flows;
    rec.pkt_time = flow.timestamp.unwrap_or(0);
    rec.tag = u32::from(flow.tag);
}

fn cst_handler(flow: &DecodedFlow, rec: &mut FlowRecord) {
    if let Some(c) = flow.class_counters {
        rec.cst = c.into();
    }
}

impl HandlerChain {
    pub fn for_aggregation(agg: Aggregation) -> Self {
        let mut handlers: Vec<Handler> = Vec::new();
        let wants = |bits: u32| agg.contains(bits);

        if wants(Aggregation::SRC_MAC | Aggregation::SUM_MAC) {
            handlers.push(src_mac_handler);
        }
        if wants(Aggregation::DST_MAC | Aggregation::SUM_MAC) {
            handlers.push(dst_mac_handler);
        }
        if wants(Aggregation::VLAN) {
            handlers.push(vlan_handler);
        }
        if wants(Aggregation::SRC_HOST | Aggregation::SUM_HOST) {
            handlers.push(src_host_handler);
        }
        if wants(Aggregation::DST_HOST | Aggregation::SUM_HOST) {
            handlers.push(dst_host_handler);
        }
        if wants(Aggregation::SRC_PORT | Aggregation::SUM_PORT) {
            handlers.push(src_port_handler);
        }
        if wants(Aggregation::DST_PORT | Aggregation::SUM_PORT) {
            handlers.push(dst_port_handler);
        }
        if wants(Aggregation::IP_TOS) {
            handlers.push(tos_handler);
        }
        if wants(Aggregation::IP_PROTO) {
            handlers.push(proto_handler);
        }
        if wants(Aggregation::ID) {
            handlers.push(id_handler);
        }
        if wants(Aggregation::CLASS) {
            handlers.push(class_handler);
        }
        handlers.push(counters_handler);
        handlers.push(cst_handler);

        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build a zeroed record and run every handler over it.
    pub fn build(&self, flow: &DecodedFlow) -> FlowRecord {
        let mut rec = FlowRecord::default();
        for handler in &self.handlers {
            handler(flow, &mut rec);
        }
        rec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DecodedFlow {
        DecodedFlow {
            src_ip: Some("192.0.2.1".parse().unwrap()),
            dst_ip: Some("192.0.2.2".parse().unwrap()),
            src_port: 40000,
            dst_port: 443,
            proto: 6,
            tag: 9,
            bytes: 1500,
            packets: 1,
            timestamp: Some(1_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_highest_tag_keeps_its_id() {
        let chain = HandlerChain::for_aggregation(Aggregation::parse("tag").unwrap());
        let flow = DecodedFlow {
            tag: u16::MAX,
            ..sample()
        };
        let rec = chain.build(&flow);
        assert_eq!(rec.primitives.agent_id, u16::MAX);
        assert_eq!(rec.tag, u32::from(u16::MAX));
    }

    #[test]
    fn test_unselected_fields_stay_zero() {
        let chain = HandlerChain::for_aggregation(Aggregation::parse("dst_port").unwrap());
        let rec = chain.build(&sample());
        assert_eq!(rec.primitives.dst_port, 443);
        assert_eq!(rec.primitives.src_port, 0);
        assert_eq!(rec.primitives.src_ip, [0u8; 16]);
        assert_eq!(rec.primitives.ip_family, family::UNSPEC);
        // always carried
        assert_eq!(rec.pkt_len, 1500);
        assert_eq!(rec.tag, 9);
        assert_eq!(rec.pkt_time, 1_000);
    }

    #[test]
    fn test_hosts_set_family() {
        let chain =
            HandlerChain::for_aggregation(Aggregation::parse("src_host,dst_host").unwrap());
        let rec = chain.build(&sample());
        assert_eq!(rec.primitives.ip_family, family::INET);
        assert_eq!(&rec.primitives.src_ip[..4], &[192, 0, 2, 1]);
        assert_eq!(&rec.primitives.dst_ip[..4], &[192, 0, 2, 2]);

        let v6 = DecodedFlow {
            src_ip: Some("2001:db8::1".parse().unwrap()),
            ..sample()
        };
        let rec = chain.build(&v6);
        assert_eq!(rec.primitives.ip_family, family::INET6);
    }

    #[test]
    fn test_summary_masks_fill_both_directions() {
        let chain = HandlerChain::for_aggregation(Aggregation::parse("sum_port").unwrap());
        let rec = chain.build(&sample());
        assert_eq!(rec.primitives.src_port, 40000);
        assert_eq!(rec.primitives.dst_port, 443);
    }
}
