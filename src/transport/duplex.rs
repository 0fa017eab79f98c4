//! Duplex socket transport
//!
//! The writer fills a private batch buffer and sends it as one datagram once
//! the next record would not fit. A full socket drops the whole batch.

use super::sizing::{self, DEFAULT_PIPE_SIZE};
use super::{send_end_of_stream, LazyDatagram, RingWriter, SocketPair, TransportSpec, WriteStatus};
use crate::error::{FlowAcctError, Result};
use bytes::{BufMut, BytesMut};
use flowacct_common::{BatchHeader, FlowRecord, HEADER_SIZE, MAX_SEQNUM, RECORD_SIZE};
use std::io;
use std::os::unix::net::UnixDatagram as StdDatagram;
use tracing::{debug, error, info};

pub struct DuplexWriter {
    channel: String,
    sock: StdDatagram,
    buf: BytesMut,
    buffer_size: usize,
    num: u32,
    seq: u32,
    closed: bool,
}

pub struct DuplexReader {
    channel: String,
    sock: LazyDatagram,
    buf: Vec<u8>,
}

pub fn open(channel: &str, spec: &TransportSpec) -> Result<(DuplexWriter, DuplexReader)> {
    let pair = SocketPair::new().map_err(|e| FlowAcctError::transport(channel, e))?;
    let wanted = sizing::clamp_pipe(spec.pipe_size).unwrap_or(DEFAULT_PIPE_SIZE);
    pair.set_size(wanted)
        .map_err(|e| FlowAcctError::transport(channel, e))?;
    let socklen = pair.size().map_err(|e| FlowAcctError::transport(channel, e))?;
    if socklen < wanted {
        info!(channel, obtained = socklen, wanted, "pipe size obtained");
    }

    let buffer_size = sizing::duplex_buffer(spec.buffer_size, socklen);
    debug!(channel, buffer_size, socklen, "duplex channel sized");

    let writer = DuplexWriter {
        channel: channel.to_string(),
        sock: pair.writer,
        buf: BytesMut::with_capacity(buffer_size),
        buffer_size,
        num: 0,
        seq: 0,
        closed: false,
    };
    let reader = DuplexReader {
        channel: channel.to_string(),
        sock: LazyDatagram::new(pair.reader),
        buf: vec![0u8; buffer_size],
    };
    Ok((writer, reader))
}

impl DuplexWriter {
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn send_batch(&mut self) -> WriteStatus {
        let num = self.num;
        self.seq = (self.seq + 1) % MAX_SEQNUM;
        let header = BatchHeader { seq: self.seq, num };
        self.buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        let status = match self.sock.send(&self.buf) {
            Ok(_) => WriteStatus::Published,
            Err(e) if is_full(&e) => {
                error!(
                    channel = %self.channel,
                    records = num,
                    "pipe full; raise pipe_size or buffer_size. We are missing data"
                );
                WriteStatus::Dropped(num)
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, records = num, "unable to send batch");
                WriteStatus::Dropped(num)
            }
        };

        self.buf.clear();
        self.num = 0;
        status
    }
}

fn is_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

impl RingWriter for DuplexWriter {
    fn write(&mut self, record: &FlowRecord) -> WriteStatus {
        if self.closed {
            return WriteStatus::Dropped(1);
        }
        if self.buf.is_empty() {
            // header is filled in when the batch is sent
            self.buf.put_bytes(0, HEADER_SIZE);
        }
        self.buf.extend_from_slice(record.as_bytes());
        self.num += 1;

        if self.buf.len() + RECORD_SIZE > self.buffer_size {
            self.send_batch()
        } else {
            WriteStatus::Buffered
        }
    }

    fn flush_and_wake(&mut self) -> WriteStatus {
        if self.closed || self.num == 0 {
            return WriteStatus::Buffered;
        }
        self.send_batch()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush_and_wake();
        self.closed = true;
        if let Err(e) = send_end_of_stream(&self.sock) {
            debug!(channel = %self.channel, error = %e, "end of stream not delivered");
        }
    }
}

impl Drop for DuplexWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl DuplexReader {
    pub async fn next_batch(&mut self) -> flowacct_worker::Result<Option<Vec<FlowRecord>>> {
        loop {
            let n = self.sock.get()?.recv(&mut self.buf).await?;
            if n == 0 {
                debug!(channel = %self.channel, "duplex channel closed by writer");
                return Ok(None);
            }
            let Some(header) = BatchHeader::read_from(&self.buf[..n]) else {
                debug!(channel = %self.channel, len = n, "runt datagram ignored");
                continue;
            };
            let records: Vec<FlowRecord> = self.buf[HEADER_SIZE..n]
                .chunks_exact(RECORD_SIZE)
                .take(header.num as usize)
                .filter_map(FlowRecord::read_from)
                .collect();
            if !records.is_empty() {
                return Ok(Some(records));
            }
        }
    }
}
