//! Purge writer
//!
//! Pushes a [`PurgeBatch`] to the primary backend. Entries the primary
//! rejects go to the backup backend, connected lazily, and whatever the
//! backup rejects is appended to the recovery log. A level that fails once is
//! skipped for the rest of the purge.

use crate::backend::{Backend, BackendSession, WriteContext};
use crate::cache::{CacheEntry, PurgeBatch};
use crate::error::Result;
use crate::metrics::WorkerCounters;
use crate::recovery::{LogfileHeader, RecoveryLog, Template};
use chrono::{DateTime, Utc};
use flowacct_common::Aggregation;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where entries no backend accepted are spilled.
#[derive(Debug, Clone)]
pub struct RecoveryTarget {
    pub path: PathBuf,
    pub header: LogfileHeader,
    pub max_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub worker: String,
    pub host: String,
    pub backup_host: Option<String>,
    /// Table name; may contain strftime escapes expanded against the basetime.
    pub table: String,
    /// File holding the table creation statement.
    pub table_schema: Option<PathBuf>,
    pub what_to_count: Aggregation,
    pub recovery: Option<RecoveryTarget>,
}

/// Where the entries of one purge ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub primary: usize,
    pub backup: usize,
    pub recovered: usize,
    pub lost: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.primary + self.backup + self.recovered + self.lost
    }
}

#[derive(Clone)]
pub struct PurgeWriter {
    backend: Arc<dyn Backend>,
    config: Arc<WriterConfig>,
    counters: WorkerCounters,
}

/// Expand strftime escapes in `template` for unix time `t` (UTC).
///
/// Templates without `%` and templates chrono cannot format are returned
/// unchanged.
pub fn expand_time_escapes(template: &str, t: i64) -> String {
    if !template.contains('%') {
        return template.to_string();
    }
    let Some(dt) = DateTime::<Utc>::from_timestamp(t, 0) else {
        return template.to_string();
    };
    let mut out = String::new();
    match write!(out, "{}", dt.format(template)) {
        Ok(()) => out,
        Err(_) => {
            warn!(template, "invalid time escape, using name verbatim");
            template.to_string()
        }
    }
}

struct Level {
    host: String,
    session: Option<Box<dyn BackendSession>>,
    failed: bool,
}

impl Level {
    fn new(host: String) -> Self {
        Self {
            host,
            session: None,
            failed: false,
        }
    }
}

impl PurgeWriter {
    pub fn new(backend: Arc<dyn Backend>, config: WriterConfig, counters: WorkerCounters) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            counters,
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    async fn load_schema(&self, basetime: i64) -> Option<String> {
        let path = self.config.table_schema.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Some(expand_time_escapes(&text, basetime)),
            Err(e) => {
                error!(
                    worker = %self.config.worker,
                    path = %path.display(),
                    error = %e,
                    "unable to read table schema"
                );
                None
            }
        }
    }

    /// Connect a level if it is not connected yet and has not failed.
    async fn ensure_connected(&self, level: &mut Level, schema: Option<&str>, basetime: i64) {
        if level.session.is_some() || level.failed {
            return;
        }
        match self.backend.connect(&level.host).await {
            Ok(mut session) => {
                if let Some(schema) = schema {
                    if let Err(e) = session.create_table_if_needed(schema, basetime).await {
                        warn!(
                            worker = %self.config.worker,
                            host = %level.host,
                            error = %e,
                            "table creation failed"
                        );
                    }
                }
                level.session = Some(session);
            }
            Err(e) => {
                error!(
                    worker = %self.config.worker,
                    host = %level.host,
                    error = %e,
                    "backend connection failed"
                );
                self.counters.backend_failures.inc();
                level.failed = true;
            }
        }
    }

    /// Try one entry on a level; on failure the level is closed and marked failed.
    async fn write_one(&self, level: &mut Level, entry: &CacheEntry, ctx: &WriteContext) -> bool {
        let Some(session) = level.session.as_mut() else {
            return false;
        };
        match session.op(entry, ctx).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    worker = %self.config.worker,
                    host = %level.host,
                    error = %e,
                    "backend write failed"
                );
                self.counters.backend_failures.inc();
                if let Some(mut s) = level.session.take() {
                    let _ = s.close().await;
                }
                level.failed = true;
                false
            }
        }
    }

    pub async fn purge(&self, batch: PurgeBatch) -> PurgeReport {
        let start = Instant::now();
        let worker = &self.config.worker;
        info!(worker = %worker, entries = batch.entries.len(), "purging cache: start");

        let ctx = WriteContext {
            table: expand_time_escapes(&self.config.table, batch.basetime),
            what_to_count: self.config.what_to_count,
            basetime: batch.basetime,
            timeslot: batch.timeslot,
            new_basetime: batch.new_basetime,
            recover: batch.recover,
            now: batch.now,
        };
        let backup_ctx = WriteContext {
            recover: true,
            ..ctx.clone()
        };

        let schema = if batch.new_basetime {
            self.load_schema(batch.basetime).await
        } else {
            None
        };

        let mut report = PurgeReport::default();
        let mut primary = Level::new(self.config.host.clone());
        let mut backup = self.config.backup_host.clone().map(Level::new);
        let mut spill = Vec::new();

        self.ensure_connected(&mut primary, schema.as_deref(), batch.basetime)
            .await;

        for entry in batch.entries.iter().filter(|e| e.valid) {
            if self.write_one(&mut primary, entry, &ctx).await {
                report.primary += 1;
                continue;
            }
            if let Some(level) = backup.as_mut() {
                self.ensure_connected(level, schema.as_deref(), batch.basetime)
                    .await;
                if self.write_one(level, entry, &backup_ctx).await {
                    report.backup += 1;
                    continue;
                }
            }
            spill.push(entry.clone());
        }

        for level in std::iter::once(&mut primary).chain(backup.as_mut()) {
            if let Some(mut s) = level.session.take() {
                if let Err(e) = s.close().await {
                    debug!(worker = %worker, host = %level.host, error = %e, "close failed");
                }
            }
        }

        if !spill.is_empty() {
            match self.spill(spill.clone(), batch.basetime).await {
                Ok(n) => {
                    report.recovered = n;
                    report.lost = spill.len() - n;
                }
                Err(e) => {
                    error!(
                        worker = %worker,
                        entries = spill.len(),
                        error = %e,
                        "entries lost: no backend and no usable recovery log"
                    );
                    report.lost = spill.len();
                }
            }
        }

        self.counters
            .entries_purged
            .inc_by((report.primary + report.backup) as u64);
        self.counters
            .recovery_log_entries
            .inc_by(report.recovered as u64);
        self.counters.entries_lost.inc_by(report.lost as u64);

        info!(
            worker = %worker,
            qn = report.total(),
            primary = report.primary,
            backup = report.backup,
            recovered = report.recovered,
            lost = report.lost,
            et_ms = start.elapsed().as_millis() as u64,
            "purging cache: end"
        );
        report
    }

    async fn spill(&self, entries: Vec<CacheEntry>, basetime: i64) -> Result<usize> {
        let Some(mut target) = self.config.recovery.clone() else {
            return Err(crate::error::WorkerError::ConfigError(
                "no recovery log configured".to_string(),
            ));
        };
        let template = Template::for_aggregation(self.config.what_to_count);
        // header names the table this batch was bound for
        target.header.table = expand_time_escapes(&target.header.table, basetime);

        tokio::task::spawn_blocking(move || {
            let mut log =
                RecoveryLog::open(&target.path, &target.header, &template, target.max_size)?;
            log.append(&entries)
        })
        .await
        .map_err(|e| crate::error::WorkerError::IoError(std::io::Error::other(e)))?
    }
}
