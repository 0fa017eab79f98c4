//! Shared types between the core (distributor) and aggregation workers
//!
//! This crate defines the record structures that cross the core <-> worker
//! channel. They must be:
//! - `#[repr(C)]` for stable memory layout inside shared regions
//! - plain integers only, so any byte pattern read back from a ring slot is a
//!   valid value (a lapped slot may hold half-overwritten data)
//! - free of implicit padding, so the bytes of a key are fully determined

pub mod aggregate;

pub use aggregate::Aggregation;

/// Sequence numbers published in slot headers wrap at this modulus.
pub const MAX_SEQNUM: u32 = 65536;

/// Address family markers stored in [`Primitives::ip_family`].
pub mod family {
    pub const UNSPEC: u8 = 0;
    pub const INET: u8 = 4;
    pub const INET6: u8 = 6;
}

/// IP protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// Flow primitives: the aggregation key of a record
///
/// Layout (64 bytes total, 4-byte aligned, no implicit padding):
/// - src_ip/dst_ip: IPv4 in the first 4 bytes, or a full IPv6 address
/// - eth_shost/eth_dhost: MAC addresses
/// - ip_family: see [`family`]
/// - vlan_id, src_port, dst_port: host byte order
/// - agent_id: tag assigned by the pre-tagging stage
/// - class_id: classification id (0 = unclassified)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Primitives {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub eth_shost: [u8; 6],
    pub eth_dhost: [u8; 6],
    pub ip_family: u8,
    pub proto: u8,
    pub tos: u8,
    pub _pad: u8,
    pub vlan_id: u16,
    pub src_port: u16,
    pub dst_port: u16,
    pub agent_id: u16,
    pub class_id: u32,
    pub _reserved: u32,
}

impl Primitives {
    /// Raw bytes of the key, used for hashing and byte-exact comparison.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: Primitives is repr(C), contains only integer fields and
        // explicit padding fields (asserted below), so every byte is
        // initialized.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// Classification accumulators carried by a record
///
/// `ba`/`pa`/`fa` are bytes/packets/flows observed before the flow was
/// classified; `stamp_*` is when the classifier produced them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassAccumulators {
    pub ba: u64,
    pub pa: u64,
    pub fa: u64,
    pub stamp_sec: i64,
    pub stamp_usec: i64,
}

impl ClassAccumulators {
    pub fn is_empty(&self) -> bool {
        self.ba == 0 && self.pa == 0 && self.fa == 0
    }

    /// Timestamp as (seconds, microseconds), comparable lexicographically.
    pub fn stamp(&self) -> (i64, i64) {
        (self.stamp_sec, self.stamp_usec)
    }
}

/// Normalized flow record as written into a channel slot
///
/// Layout (144 bytes total, 8-byte aligned):
/// - primitives: aggregation key
/// - pkt_len: byte counter
/// - pkt_num: packet counter
/// - flo_num: flow counter
/// - pkt_time: record timestamp (unix seconds, 0 = unknown)
/// - tag: pre-tag attached by the decoder
/// - cst: classification accumulators
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowRecord {
    pub primitives: Primitives,
    pub pkt_len: u64,
    pub pkt_num: u64,
    pub flo_num: u64,
    pub pkt_time: i64,
    pub tag: u32,
    pub _pad: u32,
    pub cst: ClassAccumulators,
}

impl FlowRecord {
    /// Wire bytes of the record, as copied into a batch.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: FlowRecord is repr(C) with integer fields and explicit
        // padding only (sizes asserted below).
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, RECORD_SIZE)
        }
    }

    /// Decode a record from the start of `buf`.
    ///
    /// Returns `None` when fewer than [`RECORD_SIZE`] bytes are available.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_SIZE {
            return None;
        }
        // SAFETY: length checked above; every bit pattern is a valid
        // FlowRecord and read_unaligned tolerates any alignment.
        Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const FlowRecord) })
    }
}

/// Header at the start of every batch (socket datagram or ring slot)
///
/// `seq` is published last by the writer; a reader must not trust `num`
/// before it has observed the matching `seq`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchHeader {
    pub seq: u32,
    pub num: u32,
}

impl BatchHeader {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.seq.to_ne_bytes());
        out[4..].copy_from_slice(&self.num.to_ne_bytes());
        out
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let seq = u32::from_ne_bytes(buf.get(..4)?.try_into().ok()?);
        let num = u32::from_ne_bytes(buf.get(4..HEADER_SIZE)?.try_into().ok()?);
        Some(Self { seq, num })
    }
}

/// Size of one record on the wire.
pub const RECORD_SIZE: usize = core::mem::size_of::<FlowRecord>();

/// Size of a batch header on the wire.
pub const HEADER_SIZE: usize = core::mem::size_of::<BatchHeader>();

/// Smallest usable batch: a header plus a single record.
pub const MIN_BATCH_SIZE: usize = HEADER_SIZE + RECORD_SIZE;

const _: () = {
    assert!(
        core::mem::size_of::<Primitives>() == 64,
        "Primitives must be exactly 64 bytes"
    );
    assert!(
        core::mem::size_of::<ClassAccumulators>() == 40,
        "ClassAccumulators must be exactly 40 bytes"
    );
    assert!(
        core::mem::size_of::<FlowRecord>() == 144,
        "FlowRecord must be exactly 144 bytes"
    );
    assert!(
        core::mem::align_of::<FlowRecord>() == 8,
        "FlowRecord must be 8-byte aligned"
    );
    assert!(
        core::mem::size_of::<BatchHeader>() == 8,
        "BatchHeader must be exactly 8 bytes"
    );
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_bytes_cover_whole_key() {
        let mut p = Primitives::default();
        assert!(p.as_bytes().iter().all(|b| *b == 0));

        p.class_id = 0x0102_0304;
        assert_eq!(p.as_bytes().len(), 64);
        assert!(p.as_bytes()[56..60].contains(&0x04));
    }

    #[test]
    fn test_record_bytes_decode_back() {
        let rec = FlowRecord {
            pkt_len: 1500,
            pkt_num: 3,
            tag: 7,
            ..Default::default()
        };
        let mut buf = vec![0u8; 1];
        buf.extend_from_slice(rec.as_bytes());

        // Unaligned on purpose
        assert_eq!(FlowRecord::read_from(&buf[1..]), Some(rec));
        assert_eq!(FlowRecord::read_from(&buf[1..RECORD_SIZE]), None);
    }

    #[test]
    fn test_batch_header_bytes() {
        let hdr = BatchHeader { seq: 65535, num: 12 };
        assert_eq!(BatchHeader::read_from(&hdr.to_bytes()), Some(hdr));
        assert_eq!(BatchHeader::read_from(&[0u8; 4]), None);
    }

    #[test]
    fn test_accumulator_stamp_ordering() {
        let a = ClassAccumulators {
            stamp_sec: 10,
            stamp_usec: 5,
            ..Default::default()
        };
        let b = ClassAccumulators {
            stamp_sec: 10,
            stamp_usec: 6,
            ..Default::default()
        };
        assert!(a.stamp() < b.stamp());
        assert!(a.is_empty());
    }
}
