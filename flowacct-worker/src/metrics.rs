//! Prometheus counters for aggregation workers
//!
//! One set of counter vectors is shared by every worker; series are labeled
//! by worker name.

use crate::cache::CacheStats;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct WorkerMetrics {
    records_received: IntCounterVec,
    cache_inserts: IntCounterVec,
    cache_updates: IntCounterVec,
    safe_actions: IntCounterVec,
    entries_purged: IntCounterVec,
    recovery_log_entries: IntCounterVec,
    backend_failures: IntCounterVec,
    entries_lost: IntCounterVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), &["worker"])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl WorkerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            records_received: counter_vec(
                registry,
                "flowacct_worker_records_received_total",
                "Records drained from the channel",
            )?,
            cache_inserts: counter_vec(
                registry,
                "flowacct_worker_cache_inserts_total",
                "New cache entries created",
            )?,
            cache_updates: counter_vec(
                registry,
                "flowacct_worker_cache_updates_total",
                "Records folded into an existing cache entry",
            )?,
            safe_actions: counter_vec(
                registry,
                "flowacct_worker_safe_actions_total",
                "Emergency purges forced by cache or queue exhaustion",
            )?,
            entries_purged: counter_vec(
                registry,
                "flowacct_worker_entries_purged_total",
                "Entries accepted by a backend",
            )?,
            recovery_log_entries: counter_vec(
                registry,
                "flowacct_worker_recovery_log_entries_total",
                "Entries written to the recovery log",
            )?,
            backend_failures: counter_vec(
                registry,
                "flowacct_worker_backend_failures_total",
                "Backend connection or write failures",
            )?,
            entries_lost: counter_vec(
                registry,
                "flowacct_worker_entries_lost_total",
                "Entries no backend or recovery log accepted",
            )?,
        })
    }

    /// Metrics bound to a private registry, for tests and one-shot tools.
    pub fn unregistered() -> prometheus::Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn for_worker(&self, worker: &str) -> WorkerCounters {
        let l = &[worker];
        WorkerCounters {
            records_received: self.records_received.with_label_values(l),
            cache_inserts: self.cache_inserts.with_label_values(l),
            cache_updates: self.cache_updates.with_label_values(l),
            safe_actions: self.safe_actions.with_label_values(l),
            entries_purged: self.entries_purged.with_label_values(l),
            recovery_log_entries: self.recovery_log_entries.with_label_values(l),
            backend_failures: self.backend_failures.with_label_values(l),
            entries_lost: self.entries_lost.with_label_values(l),
        }
    }
}

/// Counters of a single worker.
#[derive(Clone)]
pub struct WorkerCounters {
    pub records_received: IntCounter,
    pub cache_inserts: IntCounter,
    pub cache_updates: IntCounter,
    pub safe_actions: IntCounter,
    pub entries_purged: IntCounter,
    pub recovery_log_entries: IntCounter,
    pub backend_failures: IntCounter,
    pub entries_lost: IntCounter,
}

impl WorkerCounters {
    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_inserts.inc_by(stats.inserts);
        self.cache_updates.inc_by(stats.updates);
        self.safe_actions.inc_by(stats.safe_actions);
    }
}
