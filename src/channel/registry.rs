//! Channel registry
//!
//! Dense, ordered list of channels, one per aggregation worker. Channels
//! sharing an aggregation mask are kept adjacent and every member after the
//! first is marked `grouped`, so the distributor builds their record once.

use super::filter::PacketFilter;
use super::handlers::HandlerChain;
use super::sampling::SamplingEvaluator;
use super::tags::TagFilter;
use crate::error::{FlowAcctError, Result};
use crate::metrics::{ChannelCounters, ChannelMetrics};
use crate::transport::{self, ChannelReader, RingWriter, TransportSpec};
use flowacct_common::Aggregation;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Upper bound on configured workers.
pub const MAX_N_PLUGINS: usize = 32;

pub type ChannelId = u16;

/// Everything needed to set up a channel.
#[derive(Clone)]
pub struct ChannelTemplate {
    pub name: String,
    pub aggregation: Aggregation,
    pub filter: Arc<dyn PacketFilter>,
    pub tag_filter: TagFilter,
    pub sampling_rate: u32,
    /// Replaces the tag used as `agent_id` in records for this channel.
    pub post_tag: Option<u16>,
    pub transport: TransportSpec,
}

pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) name: String,
    pub(crate) aggregation: Aggregation,
    pub(crate) filter: Arc<dyn PacketFilter>,
    pub(crate) tag_filter: TagFilter,
    pub(crate) sampling: SamplingEvaluator,
    pub(crate) post_tag: Option<u16>,
    pub(crate) handlers: HandlerChain,
    pub(crate) grouped: bool,
    pub(crate) writer: Box<dyn RingWriter>,
    pub(crate) counters: ChannelCounters,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Same aggregation as the previous channel in the registry.
    pub fn is_grouped(&self) -> bool {
        self.grouped
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("aggregation", &self.aggregation.to_string())
            .field("grouped", &self.grouped)
            .finish()
    }
}

pub struct ChannelRegistry {
    channels: Vec<Channel>,
    next_id: ChannelId,
    metrics: ChannelMetrics,
}

impl ChannelRegistry {
    pub fn new(metrics: ChannelMetrics) -> Self {
        Self {
            channels: Vec::with_capacity(MAX_N_PLUGINS),
            next_id: 1,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub(crate) fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Open the channel transport and register the writer half.
    ///
    /// Returns the channel id and the reader half for the worker.
    pub fn insert(&mut self, template: ChannelTemplate) -> Result<(ChannelId, ChannelReader)> {
        self.check_capacity(&template.name)?;
        let (writer, reader) = transport::open(&template.name, &template.transport).map_err(|e| {
            error!(channel = %template.name, error = %e, "unable to set up channel");
            e
        })?;
        let id = self.insert_with_writer(template, writer)?;
        Ok((id, reader))
    }

    /// Register a channel over an already opened writer.
    pub fn insert_with_writer(
        &mut self,
        template: ChannelTemplate,
        writer: Box<dyn RingWriter>,
    ) -> Result<ChannelId> {
        self.check_capacity(&template.name)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let counters = self.metrics.for_channel(&template.name);
        info!(
            channel = %template.name,
            id,
            aggregate = %template.aggregation,
            sampling_rate = template.sampling_rate,
            tags = template.tag_filter.len(),
            "channel registered"
        );
        self.channels.push(Channel {
            id,
            name: template.name,
            aggregation: template.aggregation,
            filter: template.filter,
            tag_filter: template.tag_filter,
            sampling: SamplingEvaluator::new(template.sampling_rate),
            post_tag: template.post_tag,
            handlers: HandlerChain::for_aggregation(template.aggregation),
            grouped: false,
            writer,
            counters,
        });
        Ok(id)
    }

    fn check_capacity(&self, name: &str) -> Result<()> {
        if self.channels.len() >= MAX_N_PLUGINS {
            error!(channel = %name, max = MAX_N_PLUGINS, "maximum number of channels reached");
            return Err(FlowAcctError::ChannelCapacity { max: MAX_N_PLUGINS });
        }
        Ok(())
    }

    /// Remove a channel, keeping the others in order.
    ///
    /// When the removed channel heads a group, the next member becomes the
    /// new head so its records are built again.
    pub fn remove(&mut self, id: ChannelId) -> Result<Channel> {
        let index = self
            .channels
            .iter()
            .position(|c| c.id == id)
            .ok_or(FlowAcctError::ChannelNotFound(id))?;

        if !self.channels[index].grouped {
            if let Some(next) = self.channels.get_mut(index + 1) {
                next.grouped = false;
            }
        }
        let mut channel = self.channels.remove(index);
        channel.writer.close();
        info!(channel = %channel.name, id, "channel removed");
        Ok(channel)
    }

    /// Make channels with the same aggregation adjacent and mark every
    /// member after the first as grouped. Runs once, after all inserts.
    pub fn sort(&mut self) {
        let len = self.channels.len();
        let mut x = 0;
        while x < len {
            let mut y = x + 1;
            while y < len {
                if self.channels[x].aggregation == self.channels[y].aggregation {
                    self.channels[y].grouped = true;
                    if y != x + 1 {
                        self.channels.swap(x + 1, y);
                    }
                    x += 1;
                }
                y += 1;
            }
            x += 1;
        }
        debug!(
            order = ?self.channels.iter().map(|c| (c.name.as_str(), c.grouped)).collect::<Vec<_>>(),
            "channels sorted"
        );
    }

    /// Publish every partially filled batch.
    pub fn flush_all(&mut self) {
        for channel in &mut self.channels {
            if channel.writer.flush_and_wake() == transport::WriteStatus::Published {
                channel.counters.batches_published.inc();
            }
        }
    }

    /// Flush and close every channel.
    pub fn close_all(&mut self) {
        for channel in &mut self.channels {
            channel.writer.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::filter::AcceptAll;
    use crate::transport::{TransportKind, WriteStatus};
    use flowacct_common::FlowRecord;
    use std::sync::Mutex;

    /// Writer recording everything it receives.
    #[derive(Clone, Default)]
    pub(crate) struct Capture {
        pub records: Arc<Mutex<Vec<FlowRecord>>>,
        pub closed: Arc<Mutex<bool>>,
    }

    impl RingWriter for Capture {
        fn write(&mut self, record: &FlowRecord) -> WriteStatus {
            self.records.lock().unwrap().push(*record);
            WriteStatus::Buffered
        }

        fn flush_and_wake(&mut self) -> WriteStatus {
            WriteStatus::Buffered
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    pub(crate) fn template(name: &str, aggregate: &str) -> ChannelTemplate {
        ChannelTemplate {
            name: name.to_string(),
            aggregation: Aggregation::parse(aggregate).unwrap(),
            filter: Arc::new(AcceptAll),
            tag_filter: TagFilter::default(),
            sampling_rate: 0,
            post_tag: None,
            transport: TransportSpec {
                kind: TransportKind::Shared,
                buffer_size: 0,
                pipe_size: None,
                request: false,
            },
        }
    }

    fn registry_of(specs: &[(&str, &str)]) -> ChannelRegistry {
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        for (name, agg) in specs {
            reg.insert_with_writer(template(name, agg), Box::new(Capture::default()))
                .unwrap();
        }
        reg
    }

    fn layout(reg: &ChannelRegistry) -> Vec<(&str, bool)> {
        reg.channels()
            .iter()
            .map(|c| (c.name(), c.is_grouped()))
            .collect()
    }

    #[test]
    fn test_sort_groups_identical_aggregations() {
        let mut reg = registry_of(&[
            ("a", "src_host"),
            ("b", "dst_host"),
            ("c", "src_host"),
            ("d", "dst_host"),
        ]);
        reg.sort();
        assert_eq!(
            layout(&reg),
            vec![("a", false), ("c", true), ("b", false), ("d", true)]
        );
    }

    #[test]
    fn test_sort_keeps_adjacent_groups() {
        let mut reg = registry_of(&[("a", "proto"), ("b", "proto"), ("c", "vlan")]);
        reg.sort();
        assert_eq!(layout(&reg), vec![("a", false), ("b", true), ("c", false)]);
    }

    #[test]
    fn test_remove_group_head_promotes_next_member() {
        let mut reg = registry_of(&[("a", "proto"), ("b", "proto"), ("c", "vlan")]);
        reg.sort();
        let head = reg.channels()[0].id();
        let removed = reg.remove(head).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(layout(&reg), vec![("b", false), ("c", false)]);
    }

    #[test]
    fn test_remove_grouped_member_keeps_head() {
        let mut reg = registry_of(&[("a", "proto"), ("b", "proto"), ("c", "proto")]);
        reg.sort();
        let second = reg.channels()[1].id();
        reg.remove(second).unwrap();
        assert_eq!(layout(&reg), vec![("a", false), ("c", true)]);
    }

    #[test]
    fn test_remove_closes_writer_and_unknown_id_fails() {
        let capture = Capture::default();
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        let id = reg
            .insert_with_writer(template("a", "proto"), Box::new(capture.clone()))
            .unwrap();
        reg.remove(id).unwrap();
        assert!(*capture.closed.lock().unwrap());
        assert!(reg.is_empty());
        assert!(matches!(
            reg.remove(id),
            Err(FlowAcctError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_capacity_is_fixed() {
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        for i in 0..MAX_N_PLUGINS {
            reg.insert_with_writer(template(&format!("c{}", i), "proto"), Box::new(Capture::default()))
                .unwrap();
        }
        let err = reg
            .insert_with_writer(template("extra", "proto"), Box::new(Capture::default()))
            .unwrap_err();
        assert!(matches!(err, FlowAcctError::ChannelCapacity { max: MAX_N_PLUGINS }));
    }

    #[tokio::test]
    async fn test_insert_opens_transport() {
        let mut reg = ChannelRegistry::new(ChannelMetrics::unregistered().unwrap());
        let mut t = template("a", "proto");
        t.transport.pipe_size = Some(16 * 1024);
        let (id, _reader) = reg.insert(t).unwrap();
        assert_eq!(reg.get(id).unwrap().name(), "a");
    }
}
