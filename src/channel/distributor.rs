//! Fan-out of decoded flows to every channel
//!
//! For each flow the channels are visited in registry order. A channel gets
//! the flow only if its packet filter matches, its tag filter accepts the
//! flow's tag and its sampler accepts the record, in that order.

use super::input::DecodedFlow;
use super::registry::{ChannelId, ChannelRegistry};
use crate::transport::WriteStatus;
use flowacct_common::FlowRecord;
use tracing::trace;

/// What happened to one flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub written: usize,
    pub filtered: usize,
    pub dropped: usize,
}

pub struct Distributor {
    registry: ChannelRegistry,
}

impl Distributor {
    /// Takes a registry whose channels are all inserted; sorts it.
    pub fn new(mut registry: ChannelRegistry) -> Self {
        registry.sort();
        Self { registry }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Stop feeding a channel whose worker went away.
    pub fn remove_channel(&mut self, id: ChannelId) -> crate::Result<()> {
        self.registry.remove(id).map(|_| ())
    }

    pub fn exec(&mut self, flow: &DecodedFlow) -> Dispatch {
        let mut dispatch = Dispatch::default();
        // record built for the previous channel in this pass, if any
        let mut previous: Option<FlowRecord> = None;

        for channel in self.registry.channels_mut() {
            let built = previous.take();

            if !channel.filter.matches(flow)
                || !channel.tag_filter.accepts(flow.tag)
                || !channel.sampling.accept()
            {
                channel.counters.records_filtered.inc();
                dispatch.filtered += 1;
                continue;
            }

            let base = match built {
                Some(rec) if channel.grouped => rec,
                _ => channel.handlers.build(flow),
            };
            let mut record = base;
            if let Some(tag) = channel.post_tag {
                record.primitives.agent_id = tag;
            }

            match channel.writer.write(&record) {
                WriteStatus::Buffered => {
                    channel.counters.records_written.inc();
                    dispatch.written += 1;
                }
                WriteStatus::Published => {
                    channel.counters.records_written.inc();
                    channel.counters.batches_published.inc();
                    dispatch.written += 1;
                }
                WriteStatus::Dropped(n) => {
                    channel.counters.records_dropped.inc_by(u64::from(n));
                    dispatch.dropped += 1;
                }
            }
            trace!(channel = %channel.name, "record dispatched");
            previous = Some(base);
        }
        dispatch
    }

    /// Publish every partially filled batch and wake the workers.
    pub fn flush_all(&mut self) {
        self.registry.flush_all();
    }

    /// Flush and close every channel; workers drain and exit.
    pub fn shutdown(&mut self) {
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::registry::tests::{template, Capture};
    use crate::channel::filter::MatchFilter;
    use crate::channel::tags::TagFilter;
    use crate::metrics::ChannelMetrics;
    use flowacct_common::protocol;
    use std::sync::Arc;

    fn flow(tag: u16, bytes: u64) -> DecodedFlow {
        DecodedFlow {
            src_port: 1000,
            dst_port: 80,
            proto: protocol::TCP,
            tag,
            bytes,
            packets: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_tag_filter_selects_records() {
        let capture = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        let mut t = template("tagged", "dst_port");
        t.tag_filter = TagFilter::new([7, 9]);
        reg.insert_with_writer(t, Box::new(capture.clone())).unwrap();

        let mut dist = Distributor::new(reg);
        for tag in [7, 8, 9, 10] {
            dist.exec(&flow(tag, 100));
        }
        let tags: Vec<u32> = capture.records.lock().unwrap().iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![7, 9]);
    }

    #[test]
    fn test_filter_runs_per_channel() {
        let tcp = Capture::default();
        let udp = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());

        let mut t = template("tcp", "dst_port");
        t.filter = Arc::new(MatchFilter {
            protocols: vec![protocol::TCP],
            ..Default::default()
        });
        reg.insert_with_writer(t, Box::new(tcp.clone())).unwrap();

        let mut t = template("udp", "dst_port");
        t.filter = Arc::new(MatchFilter {
            protocols: vec![protocol::UDP],
            ..Default::default()
        });
        reg.insert_with_writer(t, Box::new(udp.clone())).unwrap();

        let mut dist = Distributor::new(reg);
        let d = dist.exec(&flow(0, 10));
        assert_eq!(d, Dispatch { written: 1, filtered: 1, dropped: 0 });
        assert_eq!(tcp.records.lock().unwrap().len(), 1);
        assert!(udp.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_grouped_channels_share_record_but_not_post_tag() {
        let a = Capture::default();
        let b = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        reg.insert_with_writer(template("a", "dst_port,tag"), Box::new(a.clone()))
            .unwrap();
        let mut t = template("b", "dst_port,tag");
        t.post_tag = Some(42);
        reg.insert_with_writer(t, Box::new(b.clone())).unwrap();

        let mut dist = Distributor::new(reg);
        assert!(dist.registry().channels()[1].is_grouped());
        dist.exec(&flow(5, 10));

        let ra = a.records.lock().unwrap()[0];
        let rb = b.records.lock().unwrap()[0];
        assert_eq!(ra.primitives.agent_id, 5);
        assert_eq!(rb.primitives.agent_id, 42);
        assert_eq!(ra.primitives.dst_port, rb.primitives.dst_port);
        assert_eq!(ra.pkt_len, rb.pkt_len);
    }

    #[test]
    fn test_grouped_channel_builds_when_head_rejected() {
        let a = Capture::default();
        let b = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        let mut t = template("a", "dst_port");
        t.tag_filter = TagFilter::new([1]);
        reg.insert_with_writer(t, Box::new(a.clone())).unwrap();
        reg.insert_with_writer(template("b", "dst_port"), Box::new(b.clone()))
            .unwrap();

        let mut dist = Distributor::new(reg);
        dist.exec(&flow(2, 10));
        assert!(a.records.lock().unwrap().is_empty());
        assert_eq!(b.records.lock().unwrap()[0].primitives.dst_port, 80);
    }

    #[test]
    fn test_sampling_thins_channel() {
        let capture = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        let mut t = template("sampled", "dst_port");
        t.sampling_rate = 10;
        reg.insert_with_writer(t, Box::new(capture.clone())).unwrap();

        let mut dist = Distributor::new(reg);
        for _ in 0..100_000 {
            dist.exec(&flow(0, 1));
        }
        let n = capture.records.lock().unwrap().len();
        assert!((9_000..11_000).contains(&n), "accepted {}", n);
    }
}
