//! Buffer and region sizing between the distributor and its workers
//!
//! `buffer_size` is the size of one batch (header plus records); `pipe_size`
//! is the socket buffer for duplex channels and the region size for shared
//! channels.

use flowacct_common::{MAX_SEQNUM, MIN_BATCH_SIZE};

/// Socket buffer requested when no pipe size is configured.
pub const DEFAULT_PIPE_SIZE: usize = 65535;

/// Derived regions above this size are logged.
pub const WARNING_PIPE_SIZE: usize = 16_384_000;

/// Slack mapped past the end of a shared region, sized for the largest
/// single protocol message.
pub const REGION_MARGIN: usize = 1550;

/// Most slots a shared region may hold. A reader tells a lapped slot from a
/// stale one by sequence distance, which is only unambiguous below half the
/// sequence modulus.
pub const MAX_REGION_SLOTS: usize = (MAX_SEQNUM / 2) as usize;

const PTR_WIDTH: usize = std::mem::size_of::<usize>();

/// Clamp a batch size to hold at least one record and keep slot headers
/// 8-byte aligned.
pub fn clamp_batch(size: usize) -> usize {
    size.max(MIN_BATCH_SIZE) & !7
}

/// Pipe size as configured, raised to one batch when too small.
pub fn clamp_pipe(pipe_size: Option<usize>) -> Option<usize> {
    pipe_size.map(|p| p.max(MIN_BATCH_SIZE))
}

/// A duplex batch must fit the socket buffer in one datagram.
pub fn duplex_buffer(buffer_size: usize, socklen: usize) -> usize {
    clamp_batch(clamp_batch(buffer_size).min(socklen))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSizing {
    pub buffer_size: usize,
    pub pipe_size: usize,
    /// Socket buffer to request so that every slot can be notified without
    /// blocking.
    pub socket_size: Option<usize>,
    /// Region size asked for before the slot count was capped.
    pub clamped_from: Option<usize>,
}

impl RegionSizing {
    pub fn slots(&self) -> usize {
        self.pipe_size / self.buffer_size
    }
}

/// Size a shared region.
///
/// Without a configured pipe size the region holds one slot per pointer the
/// notification socket can queue. With one, the socket is grown to queue a
/// notification for every slot.
pub fn shared_region(buffer_size: usize, pipe_size: Option<usize>, socklen: usize) -> RegionSizing {
    let buffer = clamp_batch(buffer_size);
    let sizing = match clamp_pipe(pipe_size) {
        None => RegionSizing {
            buffer_size: buffer,
            pipe_size: (socklen / PTR_WIDTH).max(1) * buffer,
            socket_size: None,
            clamped_from: None,
        },
        Some(pipe) => RegionSizing {
            buffer_size: clamp_batch(buffer.min(pipe)),
            pipe_size: pipe,
            socket_size: None,
            clamped_from: None,
        },
    };
    let sizing = cap_slots(sizing);

    if pipe_size.is_none() {
        return sizing;
    }
    let wanted = sizing.slots() * PTR_WIDTH;
    RegionSizing {
        pipe_size: sizing.pipe_size.max(sizing.buffer_size),
        socket_size: (wanted > socklen).then_some(wanted),
        ..sizing
    }
}

fn cap_slots(sizing: RegionSizing) -> RegionSizing {
    if sizing.slots() <= MAX_REGION_SLOTS {
        return sizing;
    }
    RegionSizing {
        pipe_size: MAX_REGION_SLOTS * sizing.buffer_size,
        clamped_from: Some(sizing.pipe_size),
        ..sizing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_holds_at_least_one_record() {
        assert_eq!(clamp_batch(0), MIN_BATCH_SIZE);
        assert_eq!(clamp_batch(10240), 10240);
        assert_eq!(clamp_batch(10245), 10240);
    }

    #[test]
    fn test_duplex_buffer_limited_by_socket() {
        assert_eq!(duplex_buffer(1 << 20, 4096), 4096);
        assert_eq!(duplex_buffer(1024, 65536), 1024);
        assert_eq!(duplex_buffer(1024, 16), MIN_BATCH_SIZE);
    }

    #[test]
    fn test_region_derived_from_socket() {
        let s = shared_region(1024, None, 8 * PTR_WIDTH);
        assert_eq!(s.pipe_size, 8 * 1024);
        assert_eq!(s.slots(), 8);
        assert_eq!(s.socket_size, None);
    }

    #[test]
    fn test_configured_region_grows_socket() {
        let s = shared_region(1024, Some(1024 * 1000), 64);
        assert_eq!(s.slots(), 1000);
        assert_eq!(s.socket_size, Some(1000 * PTR_WIDTH));

        let s = shared_region(1024, Some(4096), 1 << 20);
        assert_eq!(s.socket_size, None);
    }

    #[test]
    fn test_slot_count_capped_below_half_sequence_space() {
        let s = shared_region(MIN_BATCH_SIZE, Some(40_000 * MIN_BATCH_SIZE), 64);
        assert_eq!(s.slots(), MAX_REGION_SLOTS);
        assert_eq!(s.pipe_size, MAX_REGION_SLOTS * s.buffer_size);
        assert_eq!(s.clamped_from, Some(40_000 * MIN_BATCH_SIZE));
        assert_eq!(s.socket_size, Some(MAX_REGION_SLOTS * PTR_WIDTH));

        let s = shared_region(MIN_BATCH_SIZE, None, 1 << 30);
        assert_eq!(s.slots(), MAX_REGION_SLOTS);
        assert!(s.clamped_from.is_some());

        let s = shared_region(1024, Some(1024 * 1000), 64);
        assert_eq!(s.clamped_from, None);
    }

    #[test]
    fn test_buffer_never_exceeds_region() {
        let s = shared_region(1 << 20, Some(4096), 1 << 20);
        assert_eq!(s.buffer_size, 4096);
        assert_eq!(s.slots(), 1);
    }
}
