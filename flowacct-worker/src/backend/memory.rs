//! In-memory backend
//!
//! Keeps every written row in a shared table store. Clones share the store,
//! so a caller can keep a handle and inspect what workers wrote. Failures can
//! be injected per host to exercise the failover path.

use super::{Backend, BackendSession, FlowRow, WriteContext};
use crate::cache::CacheEntry;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Vec<FlowRow>>,
    created: Vec<String>,
    down: HashSet<String>,
    closed_sessions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connects and writes to `host` fail until [`Self::set_up`].
    pub async fn set_down(&self, host: &str) {
        self.store.lock().await.down.insert(host.to_string());
    }

    pub async fn set_up(&self, host: &str) {
        self.store.lock().await.down.remove(host);
    }

    /// Rows written to `table` on `host`, in write order.
    pub async fn rows(&self, host: &str, table: &str) -> Vec<FlowRow> {
        self.store
            .lock()
            .await
            .tables
            .get(&table_key(host, table))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn total_rows(&self) -> usize {
        self.store.lock().await.tables.values().map(Vec::len).sum()
    }

    /// Schemas passed to `create_table_if_needed`, in call order.
    pub async fn created_tables(&self) -> Vec<String> {
        self.store.lock().await.created.clone()
    }

    pub async fn closed_sessions(&self) -> usize {
        self.store.lock().await.closed_sessions
    }
}

fn table_key(host: &str, table: &str) -> String {
    format!("{}/{}", host, table)
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, host: &str) -> Result<Box<dyn BackendSession>> {
        if self.store.lock().await.down.contains(host) {
            return Err(WorkerError::backend("memory", format!("{} unreachable", host)));
        }
        Ok(Box::new(MemorySession {
            host: host.to_string(),
            store: self.store.clone(),
        }))
    }
}

struct MemorySession {
    host: String,
    store: Arc<Mutex<Store>>,
}

#[async_trait]
impl BackendSession for MemorySession {
    async fn create_table_if_needed(&mut self, schema: &str, _basetime: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.down.contains(&self.host) {
            return Err(WorkerError::backend("memory", "create table failed"));
        }
        store.created.push(schema.to_string());
        Ok(())
    }

    async fn op(&mut self, entry: &CacheEntry, ctx: &WriteContext) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.down.contains(&self.host) {
            return Err(WorkerError::backend("memory", format!("{} went away", self.host)));
        }
        store
            .tables
            .entry(table_key(&self.host, &ctx.table))
            .or_default()
            .push(FlowRow::new(entry, ctx));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.store.lock().await.closed_sessions += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowacct_common::{Aggregation, Primitives};

    #[tokio::test]
    async fn test_rows_are_kept_per_host_and_table() {
        let backend = MemoryBackend::new();
        let ctx = WriteContext {
            table: "acct".to_string(),
            what_to_count: Aggregation(Aggregation::SRC_PORT),
            ..Default::default()
        };
        let p = Primitives {
            src_port: 80,
            ..Default::default()
        };

        let mut session = backend.connect("primary").await.unwrap();
        session
            .op(&CacheEntry::with_counters(p, 1, 10, 0, 0), &ctx)
            .await
            .unwrap();
        session.close().await.unwrap();

        let rows = backend.rows("primary", "acct").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].src_port, Some(80));
        assert!(backend.rows("backup", "acct").await.is_empty());
        assert_eq!(backend.closed_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_down_host_rejects_connect() {
        let backend = MemoryBackend::new();
        backend.set_down("primary").await;
        assert!(backend.connect("primary").await.is_err());
        backend.set_up("primary").await;
        assert!(backend.connect("primary").await.is_ok());
    }
}
