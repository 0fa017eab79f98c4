//! Print backend: one text line per entry on stdout

use super::{Backend, BackendSession, FlowRow, WriteContext};
use crate::cache::CacheEntry;
use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};

#[derive(Debug, Clone, Default)]
pub struct PrintBackend;

impl PrintBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for PrintBackend {
    fn name(&self) -> &'static str {
        "print"
    }

    async fn connect(&self, _host: &str) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(PrintSession {
            out: tokio::io::stdout(),
            header_written: false,
        }))
    }
}

struct PrintSession {
    out: Stdout,
    header_written: bool,
}

#[async_trait]
impl BackendSession for PrintSession {
    async fn create_table_if_needed(&mut self, _schema: &str, _basetime: i64) -> Result<()> {
        Ok(())
    }

    async fn op(&mut self, entry: &CacheEntry, ctx: &WriteContext) -> Result<()> {
        let row = FlowRow::new(entry, ctx);
        let mut text = String::new();
        if !self.header_written {
            text.push_str(&header_line(&row));
            text.push('\n');
            self.header_written = true;
        }
        text.push_str(&row_line(&row));
        text.push('\n');
        self.out.write_all(text.as_bytes()).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}

fn columns(row: &FlowRow) -> Vec<(&'static str, String)> {
    let mut cols = Vec::new();
    let mut push = |name: &'static str, v: Option<String>| {
        if let Some(v) = v {
            cols.push((name, v));
        }
    };
    push("SRC_MAC", row.src_mac.clone());
    push("DST_MAC", row.dst_mac.clone());
    push("VLAN", row.vlan.map(|v| v.to_string()));
    push("SRC_IP", row.src_host.clone());
    push("DST_IP", row.dst_host.clone());
    push("SRC_PORT", row.src_port.map(|v| v.to_string()));
    push("DST_PORT", row.dst_port.map(|v| v.to_string()));
    push("TOS", row.tos.map(|v| v.to_string()));
    push("PROTOCOL", row.proto.clone());
    push("TAG", row.tag.map(|v| v.to_string()));
    push("CLASS", row.class.map(|v| v.to_string()));
    push("PACKETS", Some(row.packets.to_string()));
    push("FLOWS", Some(row.flows.to_string()));
    push("BYTES", Some(row.bytes.to_string()));
    cols
}

fn header_line(row: &FlowRow) -> String {
    columns(row)
        .iter()
        .map(|(name, _)| format!("{:<18}", name))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}

fn row_line(row: &FlowRow) -> String {
    columns(row)
        .iter()
        .map(|(_, v)| format!("{:<18}", v))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowacct_common::{Aggregation, Primitives};

    #[test]
    fn test_lines_follow_selected_columns() {
        let ctx = WriteContext {
            what_to_count: Aggregation::parse("dst_port,proto").unwrap(),
            ..Default::default()
        };
        let p = Primitives {
            dst_port: 443,
            proto: 6,
            ..Default::default()
        };
        let row = FlowRow::new(&CacheEntry::with_counters(p, 3, 1500, 1, 0), &ctx);

        let header = header_line(&row);
        assert!(header.starts_with("DST_PORT"));
        assert!(header.ends_with("BYTES"));
        assert!(!header.contains("SRC_IP"));

        let line = row_line(&row);
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields, vec!["443", "tcp", "3", "1", "1500"]);
    }
}
