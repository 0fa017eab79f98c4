//! Aggregation key masks
//!
//! A worker groups records by the subset of [`crate::Primitives`] fields
//! selected in its mask. Bit values are stable: they are stored in recovery
//! log headers.

use core::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Aggregation(pub u32);

impl Aggregation {
    pub const SRC_HOST: u32 = 0x0000_0001;
    pub const DST_HOST: u32 = 0x0000_0002;
    pub const SUM_HOST: u32 = 0x0000_0004;
    pub const SRC_PORT: u32 = 0x0000_0008;
    pub const DST_PORT: u32 = 0x0000_0010;
    pub const IP_PROTO: u32 = 0x0000_0020;
    pub const SRC_MAC: u32 = 0x0000_0040;
    pub const DST_MAC: u32 = 0x0000_0080;
    pub const ID: u32 = 0x0000_0400;
    pub const VLAN: u32 = 0x0000_0800;
    pub const IP_TOS: u32 = 0x0000_1000;
    pub const NONE: u32 = 0x0000_2000;
    pub const SUM_PORT: u32 = 0x0004_0000;
    pub const SUM_MAC: u32 = 0x0020_0000;
    pub const CLASS: u32 = 0x0040_0000;

    /// Name/bit table, in the order fields appear in tables and templates.
    pub const NAMES: &'static [(&'static str, u32)] = &[
        ("src_mac", Self::SRC_MAC),
        ("dst_mac", Self::DST_MAC),
        ("sum_mac", Self::SUM_MAC),
        ("vlan", Self::VLAN),
        ("src_host", Self::SRC_HOST),
        ("dst_host", Self::DST_HOST),
        ("sum_host", Self::SUM_HOST),
        ("src_port", Self::SRC_PORT),
        ("dst_port", Self::DST_PORT),
        ("sum_port", Self::SUM_PORT),
        ("tos", Self::IP_TOS),
        ("proto", Self::IP_PROTO),
        ("tag", Self::ID),
        ("class", Self::CLASS),
        ("none", Self::NONE),
    ];

    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Parse a comma separated list such as `"src_host,dst_host,proto"`.
    ///
    /// Returns the offending name on failure.
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut bits = 0u32;
        for raw in list.split(',') {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            match Self::NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, bit)) => bits |= bit,
                None => return Err(name.to_string()),
            }
        }
        Ok(Self(bits))
    }

    /// Summary modes fold both directions into one key and need a dedicated
    /// insert path on the worker side.
    pub const fn is_summary(self) -> bool {
        self.contains(Self::SUM_HOST | Self::SUM_PORT | Self::SUM_MAC)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, bit) in Self::NAMES {
            if self.contains(*bit) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
