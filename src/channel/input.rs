//! Decoded flow records, as handed over by the telemetry decoder
//!
//! The decoder itself lives outside this crate. It feeds the distributor one
//! [`DecodedFlow`] per sampled packet or flow; the CLI reads them as JSON
//! lines.

use crate::error::Result;
use flowacct_common::ClassAccumulators;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Ethernet address in `aa:bb:cc:dd:ee:ff` notation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address '{}' is too short", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{}'", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address '{}' is too long", s));
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Classification bookkeeping attached by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClassCounters {
    pub bytes: u64,
    pub packets: u64,
    pub flows: u64,
    pub stamp_sec: i64,
    pub stamp_usec: i64,
}

impl From<ClassCounters> for ClassAccumulators {
    fn from(c: ClassCounters) -> Self {
        Self {
            ba: c.bytes,
            pa: c.packets,
            fa: c.flows,
            stamp_sec: c.stamp_sec,
            stamp_usec: c.stamp_usec,
        }
    }
}

fn one() -> u64 {
    1
}

/// One normalized record from the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DecodedFlow {
    #[serde(default)]
    pub src_ip: Option<IpAddr>,
    #[serde(default)]
    pub dst_ip: Option<IpAddr>,
    #[serde(default)]
    pub src_mac: Option<MacAddr>,
    #[serde(default)]
    pub dst_mac: Option<MacAddr>,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub proto: u8,
    #[serde(default)]
    pub tos: u8,
    #[serde(default)]
    pub vlan: u16,
    /// Pre-tag assigned by the decoder's tagging stage. Tags share the
    /// 16-bit id primitive, so wider values fail to parse.
    #[serde(default)]
    pub tag: u16,
    #[serde(default)]
    pub class_id: u32,
    pub bytes: u64,
    #[serde(default = "one")]
    pub packets: u64,
    #[serde(default)]
    pub flows: u64,
    /// Unix seconds; `None` lets the worker stamp it on arrival.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub class_counters: Option<ClassCounters>,
}

impl DecodedFlow {
    /// Parse one JSON line.
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_line() {
        let flow = DecodedFlow::from_json(r#"{"bytes": 1500}"#).unwrap();
        assert_eq!(flow.bytes, 1500);
        assert_eq!(flow.packets, 1);
        assert_eq!(flow.src_ip, None);
    }

    #[test]
    fn test_parse_full_line() {
        let flow = DecodedFlow::from_json(
            r#"{"src_ip":"10.0.0.1","dst_ip":"2001:db8::1","src_mac":"00:11:22:aa:bb:cc",
                "src_port":1234,"dst_port":53,"proto":17,"tag":7,"bytes":80,"packets":2,
                "timestamp":1710496800}"#,
        )
        .unwrap();
        assert_eq!(flow.src_ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(flow.src_mac.unwrap().to_string(), "00:11:22:aa:bb:cc");
        assert_eq!(flow.tag, 7);
        assert_eq!(flow.timestamp, Some(1_710_496_800));
    }

    #[test]
    fn test_tag_wider_than_id_is_rejected() {
        assert!(DecodedFlow::from_json(r#"{"tag":65543,"bytes":1}"#).is_err());
        let flow = DecodedFlow::from_json(r#"{"tag":65535,"bytes":1}"#).unwrap();
        assert_eq!(flow.tag, u16::MAX);
    }

    #[test]
    fn test_bad_mac_is_rejected() {
        assert!("00:11:22".parse::<MacAddr>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<MacAddr>().is_err());
        assert!(DecodedFlow::from_json(r#"{"bytes":1,"src_mac":"zz"}"#).is_err());
    }
}
