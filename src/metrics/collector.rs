use crate::Result;
use flowacct_worker::metrics::WorkerMetrics;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Per-channel counters on the distribution side, labeled by channel name.
#[derive(Clone)]
pub struct ChannelMetrics {
    records_written: IntCounterVec,
    records_dropped: IntCounterVec,
    records_filtered: IntCounterVec,
    batches_published: IntCounterVec,
}

fn channel_vec(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), &["channel"])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl ChannelMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            records_written: channel_vec(
                registry,
                "flowacct_channel_records_written_total",
                "Records appended to a channel batch",
            )?,
            records_dropped: channel_vec(
                registry,
                "flowacct_channel_records_dropped_total",
                "Records lost because a batch could not be delivered",
            )?,
            records_filtered: channel_vec(
                registry,
                "flowacct_channel_records_filtered_total",
                "Records rejected by the packet filter, tag filter or sampling",
            )?,
            batches_published: channel_vec(
                registry,
                "flowacct_channel_batches_published_total",
                "Batches handed to the worker",
            )?,
        })
    }

    pub fn unregistered() -> prometheus::Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn for_channel(&self, channel: &str) -> ChannelCounters {
        let l = &[channel];
        ChannelCounters {
            records_written: self.records_written.with_label_values(l),
            records_dropped: self.records_dropped.with_label_values(l),
            records_filtered: self.records_filtered.with_label_values(l),
            batches_published: self.batches_published.with_label_values(l),
        }
    }
}

#[derive(Clone)]
pub struct ChannelCounters {
    pub records_written: IntCounter,
    pub records_dropped: IntCounter,
    pub records_filtered: IntCounter,
    pub batches_published: IntCounter,
}

/// Owns the registry every collector component registers into.
pub struct MetricsCollector {
    registry: Registry,
    channels: ChannelMetrics,
    workers: WorkerMetrics,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let channels = ChannelMetrics::new(&registry)?;
        let workers = WorkerMetrics::new(&registry)?;
        Ok(Self {
            registry,
            channels,
            workers,
        })
    }

    pub fn channels(&self) -> &ChannelMetrics {
        &self.channels
    }

    pub fn workers(&self) -> &WorkerMetrics {
        &self.workers
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything registered.
    pub fn gather_text(&self) -> Result<String> {
        encode(&self.registry)
    }
}

pub(crate) fn encode(registry: &Registry) -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| crate::FlowAcctError::MetricsError(e.to_string()))
}
