//! Worker run loop
//!
//! Drains record batches from a [`BatchSource`], folds them into the
//! aggregation cache and purges the cache at every refresh deadline. Purges
//! run on spawned tasks so the loop keeps draining while a backend is slow.

use crate::cache::{AggregationCache, CacheConfig, OverflowHandler, PurgeBatch};
use crate::error::Result;
use crate::history::{refresh_deadline, trigger_deadline, Bucket, History, Step};
use crate::metrics::WorkerCounters;
use crate::writer::PurgeWriter;
use async_trait::async_trait;
use chrono::Utc;
use flowacct_common::FlowRecord;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Where a worker gets its records from.
#[async_trait]
pub trait BatchSource: Send {
    /// Next batch of records, `None` once the producer is gone.
    async fn next_batch(&mut self) -> Result<Option<Vec<FlowRecord>>>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub cache: CacheConfig,
    pub history_roundoff: String,
    pub startup_delay: i64,
    pub trigger_exec: Option<PathBuf>,
    pub trigger_time: Option<History>,
    /// Drain the queue with the recover flag set on exit.
    pub recover_on_exit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub records: u64,
    pub purges: u64,
    pub safe_actions: u64,
}

/// Hands emergency purges to a writer task.
struct EmergencyPurger {
    writer: PurgeWriter,
    tracker: TaskTracker,
}

impl OverflowHandler for EmergencyPurger {
    fn emergency_purge(&mut self, batch: PurgeBatch) {
        warn!(
            worker = %self.writer.config().worker,
            entries = batch.entries.len(),
            "cache full, emergency purge"
        );
        let writer = self.writer.clone();
        self.tracker.spawn(async move {
            writer.purge(batch).await;
        });
    }
}

pub struct Worker {
    settings: WorkerSettings,
    writer: PurgeWriter,
    counters: WorkerCounters,
}

fn unix_now() -> (i64, i64) {
    let now = Utc::now();
    (now.timestamp(), i64::from(now.timestamp_subsec_micros()))
}

impl Worker {
    pub fn new(settings: WorkerSettings, writer: PurgeWriter, counters: WorkerCounters) -> Self {
        Self {
            settings,
            writer,
            counters,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Run until the source closes or `cancel` fires, then drain the cache.
    pub async fn run<S: BatchSource>(
        self,
        mut source: S,
        cancel: CancellationToken,
    ) -> Result<WorkerSummary> {
        let name = self.settings.name.clone();
        let tracker = TaskTracker::new();
        let history = self.settings.cache.history;
        let roundoff = self.settings.history_roundoff.clone();
        let refresh = self.settings.cache.refresh_time.max(1);

        let mut cache = AggregationCache::new(self.settings.cache.clone()).with_overflow_handler(
            Box::new(EmergencyPurger {
                writer: self.writer.clone(),
                tracker: tracker.clone(),
            }),
        );

        let (now, _) = unix_now();
        let mut bucket = history.map(|h| Bucket::initial(&h, now, &roundoff));
        if let Some(b) = bucket {
            cache.set_bucket(b, true);
        }

        let mut refresh_at = refresh_deadline(now, refresh, &roundoff, self.settings.startup_delay);
        let mut trigger = self.settings.trigger_exec.as_ref().map(|_| {
            trigger_deadline(now, self.settings.trigger_time.as_ref(), refresh, &roundoff)
        });
        let mut summary = WorkerSummary::default();

        info!(
            worker = %name,
            refresh_at,
            history = ?history.map(|h| h.to_string()),
            "worker started"
        );

        loop {
            let (now, _) = unix_now();
            let mut next_wake = refresh_at;
            if let Some((at, _)) = trigger {
                next_wake = next_wake.min(at);
            }
            let wait = Duration::from_secs((next_wake - now).max(0) as u64);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %name, "shutdown requested");
                    break;
                }
                batch = source.next_batch() => match batch {
                    Ok(Some(records)) => {
                        let (now, _) = unix_now();
                        self.roll_bucket(&mut cache, &mut bucket, now);
                        for record in &records {
                            cache.insert_record(record, now);
                        }
                        summary.records += records.len() as u64;
                        self.counters.records_received.inc_by(records.len() as u64);
                    }
                    Ok(None) => {
                        info!(worker = %name, "channel closed");
                        break;
                    }
                    Err(e) => {
                        error!(worker = %name, error = %e, "channel read failed");
                        break;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            let (now, usec) = unix_now();
            self.roll_bucket(&mut cache, &mut bucket, now);

            if now >= refresh_at {
                self.regular_purge(&mut cache, &tracker, now, usec);
                summary.purges += 1;
                while refresh_at <= now {
                    refresh_at += refresh;
                }
            }

            if let Some((at, slot)) = trigger.as_mut() {
                if now >= *at {
                    self.run_trigger();
                    while *at <= now {
                        *at += *slot;
                        if let Some(h) = self.settings.trigger_time.filter(|h| h.is_monthly()) {
                            *slot = h.timeslot(*at, Step::Add);
                        }
                    }
                }
            }

            let stats = cache.take_stats();
            summary.safe_actions += stats.safe_actions;
            self.counters.observe_cache(&stats);
        }

        let (now, _) = unix_now();
        cache.set_recover(self.settings.recover_on_exit);
        let batch = cache.purge_batch(now);
        cache.flush();
        let stats = cache.take_stats();
        summary.safe_actions += stats.safe_actions;
        self.counters.observe_cache(&stats);

        if !batch.entries.is_empty() {
            self.writer.purge(batch).await;
            summary.purges += 1;
        }

        tracker.close();
        tracker.wait().await;

        info!(
            worker = %name,
            records = summary.records,
            purges = summary.purges,
            safe_actions = summary.safe_actions,
            "worker stopped"
        );
        Ok(summary)
    }

    fn roll_bucket(&self, cache: &mut AggregationCache, bucket: &mut Option<Bucket>, now: i64) {
        let (Some(h), Some(b)) = (self.settings.cache.history, bucket.as_mut()) else {
            return;
        };
        if now >= b.end() {
            *b = b.resolve(&h, now);
            cache.set_bucket(*b, true);
            debug!(worker = %self.settings.name, basetime = b.basetime, "new history bucket");
        }
    }

    fn regular_purge(
        &self,
        cache: &mut AggregationCache,
        tracker: &TaskTracker,
        now: i64,
        usec: i64,
    ) {
        if cache.config().classification {
            cache.invalidate_empty_shadows();
        }
        let batch = cache.purge_batch(now);
        cache.flush();
        cache.mark_flushed(now, usec);

        if batch.entries.is_empty() {
            debug!(worker = %self.settings.name, "nothing to purge");
            return;
        }
        let writer = self.writer.clone();
        tracker.spawn(async move {
            writer.purge(batch).await;
        });
    }

    fn run_trigger(&self) {
        let Some(path) = self.settings.trigger_exec.as_ref() else {
            return;
        };
        match tokio::process::Command::new(path).spawn() {
            Ok(mut child) => {
                let worker = self.settings.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!(worker = %worker, error = %e, "trigger program wait failed");
                    }
                });
            }
            Err(e) => warn!(
                worker = %self.settings.name,
                path = %path.display(),
                error = %e,
                "unable to run trigger program"
            ),
        }
    }
}
