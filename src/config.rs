//! YAML configuration
//!
//! ```yaml
//! core:
//!   metrics_addr: 127.0.0.1:9102
//! plugins:
//!   - name: acct
//!     kind: memory
//!     aggregate: src_host,dst_host,proto
//!     pre_tag_filter: [7, 9]
//!     sampling_rate: 10
//!     transport: shared
//!     buffer_size: 10240
//!     pipe_size: 4096000
//!     sql:
//!       table: acct_%Y%m%d
//!       refresh_time: 60
//!       history: 1h
//! ```

use crate::channel::{AcceptAll, ChannelTemplate, MatchFilter, PacketFilter, TagFilter, MAX_N_PLUGINS};
use crate::transport::{TransportKind, TransportSpec};
use anyhow::{bail, Context, Result};
use flowacct_common::Aggregation;
use flowacct_worker::backend::BackendKind;
use flowacct_worker::cache::{CacheConfig, InsertMode, CACHE_THRESHOLD, DEFAULT_CACHE_ENTRIES};
use flowacct_worker::history::History;
use flowacct_worker::recovery::LogfileHeader;
use flowacct_worker::writer::{RecoveryTarget, WriterConfig};
use flowacct_worker::WorkerSettings;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,

    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreConfig {
    /// Address of the Prometheus endpoint; disabled when absent.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

/// One aggregation worker and its channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    pub kind: BackendKind,

    /// Comma separated primitive names.
    pub aggregate: String,

    #[serde(default)]
    pub pre_tag_filter: Vec<u16>,

    /// 0 disables sampling.
    #[serde(default)]
    pub sampling_rate: u32,

    #[serde(default)]
    pub filter: Option<MatchFilter>,

    #[serde(default)]
    pub transport: TransportKind,

    /// Batch size in bytes; raised to one record when smaller.
    #[serde(default)]
    pub buffer_size: usize,

    /// Socket buffer (duplex) or region size (shared).
    #[serde(default)]
    pub pipe_size: Option<usize>,

    #[serde(default)]
    pub post_tag: Option<u16>,

    #[serde(default)]
    pub sql: SqlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub host: String,
    pub backup_host: Option<String>,
    pub db: String,
    pub table: String,
    pub user: String,
    pub table_version: u32,
    pub table_schema: Option<PathBuf>,
    /// Seconds between regular purges.
    pub refresh_time: i64,
    pub cache_entries: usize,
    pub max_chained_entries: Option<usize>,
    pub history: Option<String>,
    pub history_roundoff: String,
    pub startup_delay: i64,
    pub optimize_clauses: bool,
    pub aggressive_classification: bool,
    pub recovery_logfile: Option<PathBuf>,
    pub recovery_max_size: Option<u64>,
    pub trigger_exec: Option<PathBuf>,
    pub trigger_time: Option<String>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            backup_host: None,
            db: "flowacct".to_string(),
            table: "acct".to_string(),
            user: "flowacct".to_string(),
            table_version: 1,
            table_schema: None,
            refresh_time: 60,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            max_chained_entries: None,
            history: None,
            history_roundoff: String::new(),
            startup_delay: 0,
            optimize_clauses: false,
            aggressive_classification: false,
            recovery_logfile: None,
            recovery_max_size: None,
            trigger_exec: None,
            trigger_time: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugins.is_empty() {
            bail!("at least one plugin is required");
        }
        if self.plugins.len() > MAX_N_PLUGINS {
            bail!(
                "{} plugins configured, at most {} are supported",
                self.plugins.len(),
                MAX_N_PLUGINS
            );
        }

        let mut names = HashSet::new();
        for plugin in &self.plugins {
            if !names.insert(plugin.name.as_str()) {
                bail!("plugin name appears more than once: {}", plugin.name);
            }
            plugin
                .validate()
                .with_context(|| format!("plugin {}", plugin.name))?;
        }
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

impl PluginConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("name is required");
        }
        let agg = self.aggregation()?;
        if agg.bits() == 0 {
            bail!("aggregate must name at least one primitive");
        }
        if agg.contains(Aggregation::CLASS) && self.sql.recovery_logfile.is_some() {
            bail!("recovery_logfile can not be used together with class accounting");
        }
        self.history()?;
        self.trigger_time()?;
        if let Some(c) = self
            .sql
            .history_roundoff
            .chars()
            .find(|c| !"mhdwM".contains(*c))
        {
            bail!("history_roundoff: unknown letter '{}'", c);
        }
        if self.sql.refresh_time <= 0 {
            bail!("sql.refresh_time must be positive");
        }
        if self.sql.cache_entries == 0 {
            bail!("sql.cache_entries must be positive");
        }
        if self.sql.startup_delay < 0 {
            bail!("sql.startup_delay can not be negative");
        }
        Ok(())
    }

    pub fn aggregation(&self) -> Result<Aggregation> {
        Aggregation::parse(&self.aggregate)
            .map_err(|name| anyhow::anyhow!("unknown primitive in aggregate: {}", name))
    }

    pub fn history(&self) -> Result<Option<History>> {
        parse_history(self.sql.history.as_deref()).context("sql.history")
    }

    pub fn trigger_time(&self) -> Result<Option<History>> {
        parse_history(self.sql.trigger_time.as_deref()).context("sql.trigger_time")
    }

    pub fn cache_config(&self) -> Result<CacheConfig> {
        let agg = self.aggregation()?;
        Ok(CacheConfig {
            entries: self.sql.cache_entries,
            max_chained: self
                .sql
                .max_chained_entries
                .unwrap_or(self.sql.cache_entries * 4),
            refresh_time: self.sql.refresh_time,
            history: self.history()?,
            insert_mode: InsertMode::for_aggregation(agg),
            classification: agg.contains(Aggregation::CLASS),
            aggressive_classification: self.sql.aggressive_classification,
            queue_size: None,
            counter_threshold: CACHE_THRESHOLD,
        })
    }

    pub fn logfile_header(&self) -> Result<LogfileHeader> {
        Ok(LogfileHeader {
            db: self.sql.db.clone(),
            table: self.sql.table.clone(),
            user: self.sql.user.clone(),
            host: self.sql.host.clone(),
            table_version: self.sql.table_version,
            optimize_clauses: self.sql.optimize_clauses,
            history: self.history()?,
            what_to_count: self.aggregation()?,
        })
    }

    pub fn writer_config(&self) -> Result<WriterConfig> {
        let recovery = match &self.sql.recovery_logfile {
            Some(path) => Some(RecoveryTarget {
                path: path.clone(),
                header: self.logfile_header()?,
                max_size: self.sql.recovery_max_size,
            }),
            None => None,
        };
        Ok(WriterConfig {
            worker: self.name.clone(),
            host: self.sql.host.clone(),
            backup_host: self.sql.backup_host.clone(),
            table: self.sql.table.clone(),
            table_schema: self.sql.table_schema.clone(),
            what_to_count: self.aggregation()?,
            recovery,
        })
    }

    pub fn worker_settings(&self) -> Result<WorkerSettings> {
        Ok(WorkerSettings {
            name: self.name.clone(),
            cache: self.cache_config()?,
            history_roundoff: self.sql.history_roundoff.clone(),
            startup_delay: self.sql.startup_delay,
            trigger_exec: self.sql.trigger_exec.clone(),
            trigger_time: self.trigger_time()?,
            recover_on_exit: self.sql.backup_host.is_some() || self.sql.recovery_logfile.is_some(),
        })
    }

    pub fn transport_spec(&self) -> TransportSpec {
        TransportSpec {
            kind: self.transport,
            buffer_size: self.buffer_size,
            pipe_size: self.pipe_size,
            request: self.kind.wants_request_mode(),
        }
    }

    pub fn channel_template(&self) -> Result<ChannelTemplate> {
        let filter: Arc<dyn PacketFilter> = match &self.filter {
            Some(f) if !f.is_empty() => Arc::new(f.clone()),
            _ => Arc::new(AcceptAll),
        };
        Ok(ChannelTemplate {
            name: self.name.clone(),
            aggregation: self.aggregation()?,
            filter,
            tag_filter: TagFilter::new(self.pre_tag_filter.iter().copied()),
            sampling_rate: self.sampling_rate,
            post_tag: self.post_tag,
            transport: self.transport_spec(),
        })
    }
}

fn parse_history(s: Option<&str>) -> Result<Option<History>> {
    match s {
        None => Ok(None),
        Some(s) => s
            .parse::<History>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
plugins:
  - name: acct
    kind: memory
    aggregate: src_host,dst_host
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = Config::from_yaml(MINIMAL).unwrap();
        assert!(cfg.core.metrics_addr.is_none());

        let p = &cfg.plugins[0];
        assert_eq!(p.transport, TransportKind::Shared);
        assert_eq!(p.sql.refresh_time, 60);
        assert!(p.transport_spec().request);

        let cache = p.cache_config().unwrap();
        assert_eq!(cache.entries, DEFAULT_CACHE_ENTRIES);
        assert_eq!(cache.max_chained, DEFAULT_CACHE_ENTRIES * 4);
        assert!(!cache.classification);
        assert!(p.writer_config().unwrap().recovery.is_none());
        assert!(!p.worker_settings().unwrap().recover_on_exit);
    }

    #[test]
    fn test_full_plugin() {
        let cfg = Config::from_yaml(
            r#"
core:
  metrics_addr: 127.0.0.1:9102
plugins:
  - name: sql
    kind: jsonl
    aggregate: sum_port
    pre_tag_filter: [7, 9]
    sampling_rate: 10
    filter: { protocols: [6], ports: [80, 443] }
    transport: duplex
    buffer_size: 4096
    post_tag: 3
    sql:
      host: /tmp/out.jsonl
      backup_host: /tmp/backup.jsonl
      table: acct_%Y%m%d
      history: 5m
      history_roundoff: h
      recovery_logfile: /tmp/acct.log
      trigger_time: 1h
"#,
        )
        .unwrap();
        let p = cfg.plugin("sql").unwrap();
        assert_eq!(p.kind, BackendKind::Jsonl);
        assert!(!p.transport_spec().request);
        assert_eq!(p.cache_config().unwrap().insert_mode, InsertMode::SumPort);

        let t = p.channel_template().unwrap();
        assert!(t.tag_filter.accepts(9));
        assert!(!t.tag_filter.accepts(8));
        assert_eq!(t.post_tag, Some(3));

        let w = p.writer_config().unwrap();
        let recovery = w.recovery.unwrap();
        assert_eq!(recovery.header.table, "acct_%Y%m%d");
        assert_eq!(recovery.header.history.unwrap().to_string(), "5m");
        assert!(p.worker_settings().unwrap().recover_on_exit);
    }

    fn rejects(yaml: &str, needle: &str) {
        let err = format!("{:#}", Config::from_yaml(yaml).unwrap_err());
        assert!(err.contains(needle), "{}", err);
    }

    #[test]
    fn test_validation_errors() {
        rejects("plugins: []", "at least one plugin");
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: bogus}",
            "unknown primitive in aggregate: bogus",
        );
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: ''}",
            "at least one primitive",
        );
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: class, sql: {recovery_logfile: /tmp/x}}",
            "class accounting",
        );
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: proto, sql: {history: 5x}}",
            "sql.history",
        );
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: proto}\n  - {name: a, kind: print, aggregate: proto}",
            "more than once",
        );
        rejects(
            "plugins:\n  - {name: a, kind: memory, aggregate: proto, sql: {history_roundoff: mx}}",
            "unknown letter 'x'",
        );
    }

    #[test]
    fn test_too_many_plugins() {
        let mut yaml = String::from("plugins:\n");
        for i in 0..=MAX_N_PLUGINS {
            yaml.push_str(&format!("  - {{name: p{}, kind: memory, aggregate: proto}}\n", i));
        }
        rejects(&yaml, "at most");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowacct.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(Config::load(&path).unwrap().plugins.len(), 1);
        assert!(Config::load(&dir.path().join("missing.yaml")).is_err());
    }
}
