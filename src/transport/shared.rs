//! Shared region transport
//!
//! The region is split into fixed slots of `buffer_size` bytes, each
//! starting with a [`BatchHeader`]. The distributor fills the current slot,
//! then publishes it by storing `num` and finally `seq`. A worker that is
//! about to sleep sets the wakeup flag in the status region; the distributor
//! only sends a notification (the slot offset) while that flag is set, and
//! resets it to the channel's request value when it does.
//!
//! The writer never waits for the reader. A reader that falls a whole lap
//! behind finds newer sequence numbers than it expects, reports the loss and
//! resynchronises.

use super::sizing::{self, RegionSizing, DEFAULT_PIPE_SIZE, REGION_MARGIN, WARNING_PIPE_SIZE};
use super::{send_end_of_stream, LazyDatagram, RingWriter, SocketPair, TransportSpec, WriteStatus};
use crate::error::{FlowAcctError, Result};
use flowacct_common::{FlowRecord, HEADER_SIZE, MAX_SEQNUM, RECORD_SIZE};
use memmap2::{MmapOptions, MmapRaw};
use std::os::unix::net::UnixDatagram as StdDatagram;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATUS_SIZE: usize = 64;

/// Bulk region holding the batch slots.
pub struct SharedRegion {
    map: MmapRaw,
    size: usize,
    slot_size: usize,
}

impl SharedRegion {
    /// Map `size` bytes plus the safety margin.
    pub fn allocate(size: usize, slot_size: usize) -> Result<Self> {
        let len = size + REGION_MARGIN;
        let map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|e| FlowAcctError::RegionAlloc {
                size: len,
                reason: e.to_string(),
            })?;
        Ok(Self {
            map: MmapRaw::from(map),
            size,
            slot_size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slots(&self) -> usize {
        self.size / self.slot_size
    }

    /// Offset of the slot after `offset`, wrapping to the base when the next
    /// slot would cross the end of the region.
    pub fn next_slot(&self, offset: usize) -> usize {
        let next = offset + self.slot_size;
        if next + self.slot_size > self.size {
            0
        } else {
            next
        }
    }

    fn slot_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset + self.slot_size <= self.size);
        // SAFETY: offset is a slot start inside the mapping.
        unsafe { self.map.as_mut_ptr().add(offset) }
    }

    /// Sequence number published in the slot at `offset`.
    pub fn seq(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: slot starts are 8-byte aligned (page-aligned base, slot
        // size a multiple of 8) and the mapping outlives &self.
        unsafe { &*(self.slot_ptr(offset) as *const AtomicU32) }
    }

    /// Record count published in the slot at `offset`.
    pub fn num(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: see `seq`; `num` follows it in the header.
        unsafe { &*(self.slot_ptr(offset).add(4) as *const AtomicU32) }
    }

    /// Records stored in the slot at `offset`.
    pub fn read_records(&self, offset: usize, num: usize) -> Vec<FlowRecord> {
        let max = (self.slot_size - HEADER_SIZE) / RECORD_SIZE;
        let len = num.min(max) * RECORD_SIZE;
        let mut bytes = vec![0u8; len];
        // SAFETY: the payload lies inside the slot; the copy may race with a
        // lapping writer, which callers detect by re-reading `seq`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(offset).add(HEADER_SIZE), bytes.as_mut_ptr(), len);
        }
        bytes
            .chunks_exact(RECORD_SIZE)
            .filter_map(FlowRecord::read_from)
            .collect()
    }

    fn write_record(&self, offset: usize, pos: usize, record: &FlowRecord) {
        debug_assert!(HEADER_SIZE + pos + RECORD_SIZE <= self.slot_size);
        // SAFETY: the slot has room for the record (checked by the writer
        // cursor) and only the writer touches slot payloads.
        unsafe {
            std::ptr::copy_nonoverlapping(
                record.as_bytes().as_ptr(),
                self.slot_ptr(offset).add(HEADER_SIZE + pos),
                RECORD_SIZE,
            );
        }
    }
}

/// Small region holding the wakeup and request flags.
pub struct StatusRegion {
    map: MmapRaw,
}

impl StatusRegion {
    pub fn allocate() -> Result<Self> {
        let map = MmapOptions::new()
            .len(STATUS_SIZE)
            .map_anon()
            .map_err(|e| FlowAcctError::RegionAlloc {
                size: STATUS_SIZE,
                reason: e.to_string(),
            })?;
        Ok(Self {
            map: MmapRaw::from(map),
        })
    }

    /// Non-zero while the worker wants to be notified.
    pub fn wakeup(&self) -> &AtomicU32 {
        // SAFETY: page-aligned mapping of STATUS_SIZE bytes.
        unsafe { &*(self.map.as_mut_ptr() as *const AtomicU32) }
    }

    /// Value the writer leaves in `wakeup` after notifying.
    pub fn request(&self) -> &AtomicU32 {
        // SAFETY: as above, second word.
        unsafe { &*(self.map.as_mut_ptr().add(4) as *const AtomicU32) }
    }
}

pub struct SharedWriter {
    channel: String,
    region: Arc<SharedRegion>,
    status: Arc<StatusRegion>,
    notify: StdDatagram,
    ptr: usize,
    bufptr: usize,
    bufend: usize,
    seq: u32,
    num: u32,
    closed: bool,
}

pub struct SharedReader {
    channel: String,
    region: Arc<SharedRegion>,
    status: Arc<StatusRegion>,
    notify: LazyDatagram,
    cursor: usize,
    expected: u32,
    closed: bool,
}

pub fn open(channel: &str, spec: &TransportSpec) -> Result<(SharedWriter, SharedReader)> {
    let pair = SocketPair::new().map_err(|e| FlowAcctError::transport(channel, e))?;
    if spec.pipe_size.is_none() {
        pair.set_size(DEFAULT_PIPE_SIZE)
            .map_err(|e| FlowAcctError::transport(channel, e))?;
    }
    let socklen = pair.size().map_err(|e| FlowAcctError::transport(channel, e))?;
    let sizing = sizing::shared_region(spec.buffer_size, spec.pipe_size, socklen);
    log_sizing(channel, &sizing, socklen);

    if let Some(wanted) = sizing.socket_size {
        pair.set_size(wanted)
            .map_err(|e| FlowAcctError::transport(channel, e))?;
        let obtained = pair.size().map_err(|e| FlowAcctError::transport(channel, e))?;
        if obtained < wanted {
            info!(channel, obtained, wanted, "pipe size obtained");
        }
    }

    let region = Arc::new(SharedRegion::allocate(sizing.pipe_size, sizing.buffer_size)?);
    let status = Arc::new(StatusRegion::allocate()?);
    status.request().store(u32::from(spec.request), Ordering::Relaxed);

    Ok(from_parts(channel, region, status, pair.writer, pair.reader))
}

fn log_sizing(channel: &str, sizing: &RegionSizing, socklen: usize) {
    if let Some(requested) = sizing.clamped_from {
        warn!(
            channel,
            requested,
            pipe_size = sizing.pipe_size,
            slots = sizing.slots(),
            "shared region capped to the sequence window"
        );
    }
    if sizing.socket_size.is_none() && sizing.pipe_size > WARNING_PIPE_SIZE {
        info!(
            channel,
            socklen,
            buffer_size = sizing.buffer_size,
            pipe_size = sizing.pipe_size,
            "large shared region derived from socket size"
        );
    } else {
        debug!(
            channel,
            buffer_size = sizing.buffer_size,
            pipe_size = sizing.pipe_size,
            slots = sizing.slots(),
            "shared channel sized"
        );
    }
}

/// Assemble both halves over an existing region.
pub fn from_parts(
    channel: &str,
    region: Arc<SharedRegion>,
    status: Arc<StatusRegion>,
    writer: StdDatagram,
    reader: StdDatagram,
) -> (SharedWriter, SharedReader) {
    let bufend = region.slot_size() - HEADER_SIZE;
    (
        SharedWriter {
            channel: channel.to_string(),
            region: region.clone(),
            status: status.clone(),
            notify: writer,
            ptr: 0,
            bufptr: 0,
            bufend,
            seq: 0,
            num: 0,
            closed: false,
        },
        SharedReader {
            channel: channel.to_string(),
            region,
            status,
            notify: LazyDatagram::new(reader),
            cursor: 0,
            expected: 1,
            closed: false,
        },
    )
}

impl SharedWriter {
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Offset of the slot currently being filled.
    pub fn cursor(&self) -> usize {
        self.ptr
    }

    /// Last published sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    fn publish(&mut self) {
        self.seq = (self.seq + 1) % MAX_SEQNUM;
        self.region.num(self.ptr).store(self.num, Ordering::Relaxed);
        self.region.seq(self.ptr).store(self.seq, Ordering::SeqCst);

        if self.status.wakeup().load(Ordering::SeqCst) != 0 {
            let request = self.status.request().load(Ordering::Relaxed);
            self.status.wakeup().store(request, Ordering::SeqCst);
            let cookie = (self.ptr as u64).to_ne_bytes();
            if let Err(e) = self.notify.send(&cookie) {
                debug!(channel = %self.channel, error = %e, "wakeup not sent");
            }
        }

        self.ptr = self.region.next_slot(self.ptr);
        self.bufptr = 0;
        self.num = 0;
    }
}

impl RingWriter for SharedWriter {
    fn write(&mut self, record: &FlowRecord) -> WriteStatus {
        if self.closed {
            return WriteStatus::Dropped(1);
        }
        self.region.write_record(self.ptr, self.bufptr, record);
        self.num += 1;
        self.bufptr += RECORD_SIZE;

        if self.bufptr + RECORD_SIZE > self.bufend {
            self.publish();
            WriteStatus::Published
        } else {
            WriteStatus::Buffered
        }
    }

    fn flush_and_wake(&mut self) -> WriteStatus {
        if self.closed || self.num == 0 {
            return WriteStatus::Buffered;
        }
        self.publish();
        WriteStatus::Published
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush_and_wake();
        self.closed = true;
        if let Err(e) = send_end_of_stream(&self.notify) {
            debug!(channel = %self.channel, error = %e, "end of stream not delivered");
        }
    }
}

impl Drop for SharedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl SharedReader {
    /// Consume the slot under the cursor if it carries the expected sequence
    /// number. A newer sequence means the writer lapped this reader.
    pub fn try_consume(&mut self) -> Option<Vec<FlowRecord>> {
        loop {
            let seq = self.region.seq(self.cursor).load(Ordering::SeqCst);
            let ahead = seq.wrapping_sub(self.expected) % MAX_SEQNUM;
            if ahead >= MAX_SEQNUM / 2 {
                return None;
            }
            if ahead != 0 {
                warn!(
                    channel = %self.channel,
                    expected = self.expected,
                    found = seq,
                    "reader lapped by writer; we are missing data"
                );
                self.expected = seq;
            }

            let num = self.region.num(self.cursor).load(Ordering::Relaxed) as usize;
            let records = self.region.read_records(self.cursor, num);
            if self.region.seq(self.cursor).load(Ordering::SeqCst) != seq {
                // overwritten while copying; resync on the next pass
                continue;
            }

            self.cursor = self.region.next_slot(self.cursor);
            self.expected = (self.expected + 1) % MAX_SEQNUM;
            return Some(records);
        }
    }

    pub async fn next_batch(&mut self) -> flowacct_worker::Result<Option<Vec<FlowRecord>>> {
        loop {
            if let Some(records) = self.try_consume() {
                return Ok(Some(records));
            }
            if self.closed {
                return Ok(None);
            }

            // Arm, then look again so a batch published in between is not
            // left waiting for a notification that will never come.
            self.status.wakeup().store(1, Ordering::SeqCst);
            if let Some(records) = self.try_consume() {
                return Ok(Some(records));
            }

            let mut cookie = [0u8; 8];
            let n = self.notify.get()?.recv(&mut cookie).await?;
            if n == 0 {
                debug!(channel = %self.channel, "shared channel closed by writer");
                self.closed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use crate::transport::sizing::MAX_REGION_SLOTS;
    use flowacct_common::MIN_BATCH_SIZE;

    fn record(bytes: u64) -> FlowRecord {
        FlowRecord {
            pkt_len: bytes,
            pkt_num: 1,
            ..Default::default()
        }
    }

    fn two_slot_channel() -> (SharedWriter, SharedReader) {
        open(
            "s",
            &TransportSpec {
                kind: TransportKind::Shared,
                buffer_size: MIN_BATCH_SIZE,
                pipe_size: Some(2 * MIN_BATCH_SIZE),
                request: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_wraparound_overwrites_first_slot() {
        let (mut writer, _reader) = two_slot_channel();
        assert_eq!(writer.region().slots(), 2);

        writer.write(&record(1));
        assert_eq!(writer.cursor(), MIN_BATCH_SIZE);
        writer.write(&record(2));
        assert_eq!(writer.cursor(), 0);
        writer.write(&record(3));

        let region = writer.region();
        assert_eq!(writer.seq(), 3);
        assert_eq!(region.seq(0).load(Ordering::SeqCst), 3);
        assert_eq!(region.read_records(0, 1)[0].pkt_len, 3);
        assert_eq!(region.seq(MIN_BATCH_SIZE).load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reader_follows_sequence() {
        let (mut writer, mut reader) = two_slot_channel();
        assert!(reader.try_consume().is_none());

        writer.write(&record(1));
        writer.write(&record(2));
        assert_eq!(reader.try_consume().unwrap()[0].pkt_len, 1);
        assert_eq!(reader.try_consume().unwrap()[0].pkt_len, 2);
        assert!(reader.try_consume().is_none());
    }

    #[test]
    fn test_lapped_reader_resyncs() {
        let (mut writer, mut reader) = two_slot_channel();
        for i in 1..=3 {
            writer.write(&record(i));
        }
        // slot 0 now holds seq 3 while the reader expects 1
        assert_eq!(reader.try_consume().unwrap()[0].pkt_len, 3);
        // slot 1 holds seq 2, older than the expected 4
        assert!(reader.try_consume().is_none());

        writer.write(&record(4));
        assert_eq!(reader.try_consume().unwrap()[0].pkt_len, 4);
    }

    #[test]
    fn test_notification_only_when_armed() {
        let (mut writer, reader) = two_slot_channel();
        let status = reader.status.clone();

        writer.write(&record(1));
        assert_eq!(status.wakeup().load(Ordering::SeqCst), 0);

        status.wakeup().store(1, Ordering::SeqCst);
        writer.write(&record(2));
        // request mode off: the flag is cleared by the writer
        assert_eq!(status.wakeup().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_caught_up_reader_on_largest_region_sees_nothing_new() {
        let (mut writer, mut reader) = open(
            "s",
            &TransportSpec {
                kind: TransportKind::Shared,
                buffer_size: MIN_BATCH_SIZE,
                pipe_size: Some(40_000 * MIN_BATCH_SIZE),
                request: false,
            },
        )
        .unwrap();
        let slots = writer.region().slots();
        assert_eq!(slots, MAX_REGION_SLOTS);

        // two full laps, each slot consumed right after it is published
        for i in 1..=(2 * slots as u64) {
            writer.write(&record(i));
            assert_eq!(reader.try_consume().unwrap()[0].pkt_len, i);
        }
        assert!(reader.try_consume().is_none());
        writer.closed = true;
    }

    #[tokio::test]
    async fn test_worker_wakes_and_drains_until_close() {
        let (mut writer, mut reader) = open(
            "s",
            &TransportSpec {
                kind: TransportKind::Shared,
                buffer_size: MIN_BATCH_SIZE + RECORD_SIZE,
                pipe_size: Some(64 * (MIN_BATCH_SIZE + RECORD_SIZE)),
                request: true,
            },
        )
        .unwrap();

        let consumer = tokio::spawn(async move {
            let mut total = 0u64;
            while let Some(batch) = reader.next_batch().await.unwrap() {
                total += batch.iter().map(|r| r.pkt_len).sum::<u64>();
            }
            total
        });

        for i in 1..=9u64 {
            writer.write(&record(i));
            tokio::task::yield_now().await;
        }
        writer.close();

        assert_eq!(consumer.await.unwrap(), 45);
    }
}
