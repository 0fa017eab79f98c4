//! JSON lines backend
//!
//! The connect host is a file path; each entry becomes one JSON object per
//! line, tagged with the destination table.

use super::{Backend, BackendSession, FlowRow, WriteContext};
use crate::cache::CacheEntry;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct JsonlBackend;

impl JsonlBackend {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Serialize)]
struct Line<'a> {
    table: &'a str,
    #[serde(flatten)]
    row: FlowRow,
}

#[async_trait]
impl Backend for JsonlBackend {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn connect(&self, host: &str) -> Result<Box<dyn BackendSession>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(host)
            .await?;
        Ok(Box::new(JsonlSession {
            out: BufWriter::new(file),
        }))
    }
}

struct JsonlSession {
    out: BufWriter<File>,
}

#[async_trait]
impl BackendSession for JsonlSession {
    async fn create_table_if_needed(&mut self, schema: &str, basetime: i64) -> Result<()> {
        debug!(basetime, schema_len = schema.len(), "jsonl backend has no tables to create");
        Ok(())
    }

    async fn op(&mut self, entry: &CacheEntry, ctx: &WriteContext) -> Result<()> {
        let line = Line {
            table: &ctx.table,
            row: FlowRow::new(entry, ctx),
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        self.out.write_all(&bytes).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}
