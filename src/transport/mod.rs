//! Core to worker channel transports
//!
//! Records travel in batches framed by a [`BatchHeader`]. Two policies:
//! - duplex: batches are sent as datagrams over a socket pair
//! - shared: batches are written into slots of a shared region and only a
//!   slot offset is sent, and only when the worker asked to be woken

pub mod duplex;
pub mod shared;
pub mod sizing;

use crate::error::Result;
use async_trait::async_trait;
use flowacct_common::FlowRecord;
use flowacct_worker::BatchSource;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram as StdDatagram;
use std::time::Duration;

pub use duplex::{DuplexReader, DuplexWriter};
pub use shared::{SharedReader, SharedRegion, SharedWriter, StatusRegion};

/// How long `close` waits for the end-of-stream datagram to be queued.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Duplex,
    #[default]
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSpec {
    pub kind: TransportKind,
    pub buffer_size: usize,
    pub pipe_size: Option<usize>,
    /// Keep waking the worker on every batch instead of on demand.
    pub request: bool,
}

/// Result of appending one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Added to the current batch.
    Buffered,
    /// Added, and the batch it completed was handed to the worker.
    Published,
    /// The batch holding this record could not be delivered; it carried
    /// this many records.
    Dropped(u32),
}

impl WriteStatus {
    pub fn is_written(self) -> bool {
        !matches!(self, Self::Dropped(_))
    }
}

/// Writer half of a channel, owned by the distributor.
pub trait RingWriter: Send {
    fn write(&mut self, record: &FlowRecord) -> WriteStatus;

    /// Publish a partially filled batch, if any.
    fn flush_and_wake(&mut self) -> WriteStatus;

    /// Flush and tell the worker no more batches will follow.
    fn close(&mut self);
}

/// Reader half of a channel, handed to the worker.
pub enum ChannelReader {
    Duplex(DuplexReader),
    Shared(SharedReader),
}

#[async_trait]
impl BatchSource for ChannelReader {
    async fn next_batch(&mut self) -> flowacct_worker::Result<Option<Vec<FlowRecord>>> {
        match self {
            Self::Duplex(r) => r.next_batch().await,
            Self::Shared(r) => r.next_batch().await,
        }
    }
}

/// Open both halves of a channel.
pub fn open(channel: &str, spec: &TransportSpec) -> Result<(Box<dyn RingWriter>, ChannelReader)> {
    match spec.kind {
        TransportKind::Duplex => {
            let (writer, reader) = duplex::open(channel, spec)?;
            Ok((Box::new(writer), ChannelReader::Duplex(reader)))
        }
        TransportKind::Shared => {
            let (writer, reader) = shared::open(channel, spec)?;
            Ok((Box::new(writer), ChannelReader::Shared(reader)))
        }
    }
}

/// Socket pair between the distributor (`writer`) and a worker (`reader`).
pub(crate) struct SocketPair {
    pub writer: StdDatagram,
    pub reader: StdDatagram,
}

impl SocketPair {
    pub fn new() -> io::Result<Self> {
        let (writer, reader) = StdDatagram::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok(Self { writer, reader })
    }

    pub fn set_size(&self, size: usize) -> io::Result<()> {
        set_sockopt(&self.reader, libc::SO_RCVBUF, size)?;
        set_sockopt(&self.writer, libc::SO_SNDBUF, size)
    }

    /// Smaller of the receive and send buffers actually granted.
    pub fn size(&self) -> io::Result<usize> {
        let rcv = get_sockopt(&self.reader, libc::SO_RCVBUF)?;
        let snd = get_sockopt(&self.writer, libc::SO_SNDBUF)?;
        Ok(rcv.min(snd))
    }
}

fn set_sockopt(sock: &StdDatagram, opt: libc::c_int, size: usize) -> io::Result<()> {
    let val = size.min(libc::c_int::MAX as usize) as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn get_sockopt(sock: &StdDatagram, opt: libc::c_int) -> io::Result<usize> {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(val.max(0) as usize)
}

/// Queue the zero-length end-of-stream datagram, waiting briefly for room.
pub(crate) fn send_end_of_stream(sock: &StdDatagram) -> io::Result<()> {
    sock.set_nonblocking(false)?;
    sock.set_write_timeout(Some(CLOSE_TIMEOUT))?;
    sock.send(&[]).map(|_| ())
}

/// Reader socket, registered with the tokio reactor on first use.
///
/// Channels are opened before a runtime may be running; registration is
/// deferred to the worker task.
pub(crate) struct LazyDatagram {
    std: Option<StdDatagram>,
    tokio: Option<tokio::net::UnixDatagram>,
}

impl LazyDatagram {
    pub fn new(sock: StdDatagram) -> Self {
        Self {
            std: Some(sock),
            tokio: None,
        }
    }

    pub fn get(&mut self) -> io::Result<&tokio::net::UnixDatagram> {
        if self.tokio.is_none() {
            let sock = self
                .std
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket lost"))?;
            self.tokio = Some(tokio::net::UnixDatagram::from_std(sock)?);
        }
        self.tokio
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket lost"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_pair_reports_granted_size() {
        let pair = SocketPair::new().unwrap();
        pair.set_size(sizing::DEFAULT_PIPE_SIZE).unwrap();
        assert!(pair.size().unwrap() >= sizing::DEFAULT_PIPE_SIZE);
    }

    #[test]
    fn test_write_status() {
        assert!(WriteStatus::Buffered.is_written());
        assert!(WriteStatus::Published.is_written());
        assert!(!WriteStatus::Dropped(3).is_written());
    }
}
