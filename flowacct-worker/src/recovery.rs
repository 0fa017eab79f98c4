//! Recovery log
//!
//! Append-only binary file used when no backend accepted a purge. Layout,
//! all integers big-endian:
//!
//! ```text
//! LogfileHeader | TemplateHeader | TemplateEntry * num | record * N
//! ```
//!
//! Records follow the template: one field per entry, in template order.
//! The template is derived from the aggregation mask, so a file can only be
//! appended to by a worker with the same mask.

use crate::cache::CacheEntry;
use crate::error::{Result, WorkerError};
use crate::history::History;
use bytes::{Buf, BufMut, BytesMut};
use flowacct_common::{Aggregation, Primitives};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const LOGFILE_MAGIC: u32 = 0x4641_434c;

/// Size limit applied when none is configured.
pub const DEFAULT_MAX_LOGFILE_SIZE: u64 = 2_048_000_000;

/// Highest archive suffix tried when rotating.
pub const MAX_LOGFILE_ROTATIONS: u32 = 1000;

const NAME_LEN: usize = 32;
const HISTORY_LEN: usize = 8;

/// Encoded size of [`LogfileHeader`].
pub const LOGFILE_HEADER_SIZE: usize = 4 + 4 * NAME_LEN + 4 + 4 + HISTORY_LEN + 4;

const TEMPLATE_HEADER_SIZE: usize = 4;
const TEMPLATE_ENTRY_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogfileHeader {
    pub db: String,
    pub table: String,
    pub user: String,
    pub host: String,
    pub table_version: u32,
    pub optimize_clauses: bool,
    pub history: Option<History>,
    pub what_to_count: Aggregation,
}

impl LogfileHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(LOGFILE_MAGIC);
        for s in [&self.db, &self.table, &self.user, &self.host] {
            put_fixed(buf, s, NAME_LEN);
        }
        buf.put_u32(self.table_version);
        buf.put_u32(u32::from(self.optimize_clauses));
        let history = self.history.map(|h| h.to_string()).unwrap_or_default();
        put_fixed(buf, &history, HISTORY_LEN);
        buf.put_u32(self.what_to_count.bits());
    }

    fn decode(mut buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < LOGFILE_HEADER_SIZE {
            return Err(WorkerError::Truncated(path.to_path_buf()));
        }
        if buf.get_u32() != LOGFILE_MAGIC {
            return Err(WorkerError::InvalidMagic(path.to_path_buf()));
        }
        let db = get_fixed(&mut buf, NAME_LEN);
        let table = get_fixed(&mut buf, NAME_LEN);
        let user = get_fixed(&mut buf, NAME_LEN);
        let host = get_fixed(&mut buf, NAME_LEN);
        let table_version = buf.get_u32();
        let optimize_clauses = buf.get_u32() != 0;
        let history = get_fixed(&mut buf, HISTORY_LEN);
        let what_to_count = Aggregation(buf.get_u32());

        Ok(Self {
            db,
            table,
            user,
            host,
            table_version,
            optimize_clauses,
            history: history.parse().ok(),
            what_to_count,
        })
    }
}

fn put_fixed(buf: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

fn get_fixed(buf: &mut &[u8], len: usize) -> String {
    let raw = &buf[..len];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(len);
    let s = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(len);
    s
}

/// One column of a logged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateField {
    SrcMac,
    DstMac,
    Vlan,
    IpFamily,
    SrcHost,
    DstHost,
    SrcPort,
    DstPort,
    Tos,
    Proto,
    Tag,
    Class,
    Packets,
    Bytes,
    Flows,
    Basetime,
}

impl TemplateField {
    const ALL: [TemplateField; 16] = [
        Self::SrcMac,
        Self::DstMac,
        Self::Vlan,
        Self::IpFamily,
        Self::SrcHost,
        Self::DstHost,
        Self::SrcPort,
        Self::DstPort,
        Self::Tos,
        Self::Proto,
        Self::Tag,
        Self::Class,
        Self::Packets,
        Self::Bytes,
        Self::Flows,
        Self::Basetime,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::SrcMac => Aggregation::SRC_MAC,
            Self::DstMac => Aggregation::DST_MAC,
            Self::Vlan => Aggregation::VLAN,
            Self::IpFamily => 0x8000_0000,
            Self::SrcHost => Aggregation::SRC_HOST,
            Self::DstHost => Aggregation::DST_HOST,
            Self::SrcPort => Aggregation::SRC_PORT,
            Self::DstPort => Aggregation::DST_PORT,
            Self::Tos => Aggregation::IP_TOS,
            Self::Proto => Aggregation::IP_PROTO,
            Self::Tag => Aggregation::ID,
            Self::Class => Aggregation::CLASS,
            Self::Packets => 0x8000_0001,
            Self::Bytes => 0x8000_0002,
            Self::Flows => 0x8000_0003,
            Self::Basetime => 0x8000_0004,
        }
    }

    pub fn size(self) -> u16 {
        match self {
            Self::SrcMac | Self::DstMac => 6,
            Self::SrcHost | Self::DstHost => 16,
            Self::Vlan | Self::SrcPort | Self::DstPort | Self::Tag => 2,
            Self::IpFamily | Self::Tos | Self::Proto => 1,
            Self::Class => 4,
            Self::Packets | Self::Bytes | Self::Flows | Self::Basetime => 8,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    fn put(self, buf: &mut BytesMut, e: &RecoveredEntry) {
        let p = &e.primitives;
        match self {
            Self::SrcMac => buf.put_slice(&p.eth_shost),
            Self::DstMac => buf.put_slice(&p.eth_dhost),
            Self::Vlan => buf.put_u16(p.vlan_id),
            Self::IpFamily => buf.put_u8(p.ip_family),
            Self::SrcHost => buf.put_slice(&p.src_ip),
            Self::DstHost => buf.put_slice(&p.dst_ip),
            Self::SrcPort => buf.put_u16(p.src_port),
            Self::DstPort => buf.put_u16(p.dst_port),
            Self::Tos => buf.put_u8(p.tos),
            Self::Proto => buf.put_u8(p.proto),
            Self::Tag => buf.put_u16(p.agent_id),
            Self::Class => buf.put_u32(p.class_id),
            Self::Packets => buf.put_u64(e.packets),
            Self::Bytes => buf.put_u64(e.bytes),
            Self::Flows => buf.put_u64(e.flows),
            Self::Basetime => buf.put_i64(e.basetime),
        }
    }

    fn get(self, buf: &mut &[u8], e: &mut RecoveredEntry) {
        let p = &mut e.primitives;
        match self {
            Self::SrcMac => buf.copy_to_slice(&mut p.eth_shost),
            Self::DstMac => buf.copy_to_slice(&mut p.eth_dhost),
            Self::Vlan => p.vlan_id = buf.get_u16(),
            Self::IpFamily => p.ip_family = buf.get_u8(),
            Self::SrcHost => buf.copy_to_slice(&mut p.src_ip),
            Self::DstHost => buf.copy_to_slice(&mut p.dst_ip),
            Self::SrcPort => p.src_port = buf.get_u16(),
            Self::DstPort => p.dst_port = buf.get_u16(),
            Self::Tos => p.tos = buf.get_u8(),
            Self::Proto => p.proto = buf.get_u8(),
            Self::Tag => p.agent_id = buf.get_u16(),
            Self::Class => p.class_id = buf.get_u32(),
            Self::Packets => e.packets = buf.get_u64(),
            Self::Bytes => e.bytes = buf.get_u64(),
            Self::Flows => e.flows = buf.get_u64(),
            Self::Basetime => e.basetime = buf.get_i64(),
        }
    }
}

/// Record layout of a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub fields: Vec<TemplateField>,
}

impl Template {
    /// Fields selected by `agg` plus the counters, which are always logged.
    pub fn for_aggregation(agg: Aggregation) -> Self {
        let wants = |bits: u32| agg.contains(bits);
        let mut fields = Vec::new();

        if wants(Aggregation::SRC_MAC | Aggregation::SUM_MAC) {
            fields.push(TemplateField::SrcMac);
        }
        if wants(Aggregation::DST_MAC) {
            fields.push(TemplateField::DstMac);
        }
        if wants(Aggregation::VLAN) {
            fields.push(TemplateField::Vlan);
        }
        if wants(Aggregation::SRC_HOST | Aggregation::DST_HOST | Aggregation::SUM_HOST) {
            fields.push(TemplateField::IpFamily);
        }
        if wants(Aggregation::SRC_HOST | Aggregation::SUM_HOST) {
            fields.push(TemplateField::SrcHost);
        }
        if wants(Aggregation::DST_HOST) {
            fields.push(TemplateField::DstHost);
        }
        if wants(Aggregation::SRC_PORT | Aggregation::SUM_PORT) {
            fields.push(TemplateField::SrcPort);
        }
        if wants(Aggregation::DST_PORT) {
            fields.push(TemplateField::DstPort);
        }
        if wants(Aggregation::IP_TOS) {
            fields.push(TemplateField::Tos);
        }
        if wants(Aggregation::IP_PROTO) {
            fields.push(TemplateField::Proto);
        }
        if wants(Aggregation::ID) {
            fields.push(TemplateField::Tag);
        }
        if wants(Aggregation::CLASS) {
            fields.push(TemplateField::Class);
        }
        fields.extend([
            TemplateField::Packets,
            TemplateField::Bytes,
            TemplateField::Flows,
            TemplateField::Basetime,
        ]);

        Self { fields }
    }

    /// Encoded size of one record.
    pub fn record_size(&self) -> usize {
        self.fields.iter().map(|f| f.size() as usize).sum()
    }

    fn encoded_len(&self) -> usize {
        TEMPLATE_HEADER_SIZE + self.fields.len() * TEMPLATE_ENTRY_SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.fields.len() as u16);
        buf.put_u16(self.record_size() as u16);
        for f in &self.fields {
            buf.put_u32(f.code());
            buf.put_u16(f.size());
        }
    }

    fn decode(buf: &mut &[u8], path: &Path) -> Result<Self> {
        if buf.len() < TEMPLATE_HEADER_SIZE {
            return Err(WorkerError::Truncated(path.to_path_buf()));
        }
        let num = buf.get_u16() as usize;
        let sz = buf.get_u16() as usize;
        if buf.len() < num * TEMPLATE_ENTRY_SIZE {
            return Err(WorkerError::Truncated(path.to_path_buf()));
        }

        let mut fields = Vec::with_capacity(num);
        for _ in 0..num {
            let code = buf.get_u32();
            let size = buf.get_u16();
            match TemplateField::from_code(code) {
                Some(f) if f.size() == size => fields.push(f),
                _ => return Err(WorkerError::InvalidTemplate(path.to_path_buf())),
            }
        }

        let template = Self { fields };
        if template.record_size() != sz {
            return Err(WorkerError::InvalidTemplate(path.to_path_buf()));
        }
        Ok(template)
    }
}

/// A record read back from a log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveredEntry {
    pub primitives: Primitives,
    pub packets: u64,
    pub bytes: u64,
    pub flows: u64,
    pub basetime: i64,
}

impl From<&CacheEntry> for RecoveredEntry {
    fn from(e: &CacheEntry) -> Self {
        Self {
            primitives: e.primitives,
            packets: e.packet_counter,
            bytes: e.bytes_counter,
            flows: e.flows_counter,
            basetime: e.basetime,
        }
    }
}

impl From<RecoveredEntry> for CacheEntry {
    fn from(r: RecoveredEntry) -> Self {
        CacheEntry::with_counters(r.primitives, r.packets, r.bytes, r.flows, r.basetime)
    }
}

/// An open, locked recovery log positioned for appending.
pub struct RecoveryLog {
    file: File,
    path: PathBuf,
    header: LogfileHeader,
    template: Template,
    max_size: u64,
    size: u64,
}

impl RecoveryLog {
    /// Open `path` for appending, creating it with a fresh header when empty.
    ///
    /// An existing file must carry the same magic and template shape; it is
    /// validated before anything else happens to it. A file that has already
    /// reached `max_size` is archived. `None` means
    /// [`DEFAULT_MAX_LOGFILE_SIZE`].
    pub fn open(
        path: &Path,
        header: &LogfileHeader,
        template: &Template,
        max_size: Option<u64>,
    ) -> Result<Self> {
        let file = Self::open_locked(path)?;
        let size = file.metadata()?.len();
        let mut log = Self {
            file,
            path: path.to_path_buf(),
            header: header.clone(),
            template: template.clone(),
            max_size: max_size.filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_LOGFILE_SIZE),
            size,
        };

        if size == 0 {
            log.write_preamble()?;
            info!(path = %path.display(), "created recovery log");
        } else {
            log.validate()?;
            if log.size >= log.max_size && log.has_records() {
                log.rotate()?;
            }
        }
        Ok(log)
    }

    fn open_locked(path: &Path) -> Result<File> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)?;

            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(WorkerError::LockFailed(path.to_path_buf()));
            }

            // another writer may have archived the file while we waited
            let locked = file.metadata()?;
            match std::fs::metadata(path) {
                Ok(current) if current.dev() == locked.dev() && current.ino() == locked.ino() => {
                    return Ok(file)
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        let (_, existing) = read_preamble(&mut self.file, &self.path)?;
        if existing.fields.len() != self.template.fields.len()
            || existing.record_size() != self.template.record_size()
        {
            error!(path = %self.path.display(), "recovery log template mismatch");
            return Err(WorkerError::InvalidTemplate(self.path.clone()));
        }
        Ok(())
    }

    fn preamble_len(&self) -> u64 {
        (LOGFILE_HEADER_SIZE + self.template.encoded_len()) as u64
    }

    fn has_records(&self) -> bool {
        self.size > self.preamble_len()
    }

    fn write_preamble(&mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(self.preamble_len() as usize);
        self.header.encode(&mut buf);
        self.template.encode(&mut buf);
        self.file.write_all(&buf)?;
        self.size = buf.len() as u64;
        Ok(())
    }

    /// Archive the current file and continue in a fresh one at the same path.
    fn rotate(&mut self) -> Result<()> {
        info!(path = %self.path.display(), size = self.size, "no more space in recovery log");
        archive(&self.path)?;
        let fresh = Self::open_locked(&self.path)?;
        let full = std::mem::replace(&mut self.file, fresh);
        unlock(&full);
        self.size = self.file.metadata()?.len();
        if self.size == 0 {
            self.write_preamble()?;
        } else {
            self.validate()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append every valid entry; returns how many were written.
    ///
    /// Records never push a file past the size limit: the file is rotated
    /// first, and a batch larger than one file spans several.
    pub fn append(&mut self, entries: &[CacheEntry]) -> Result<usize> {
        let record_size = self.template.record_size().max(1) as u64;
        let valid: Vec<RecoveredEntry> = entries
            .iter()
            .filter(|e| e.valid)
            .map(RecoveredEntry::from)
            .collect();

        let mut rest = valid.as_slice();
        while !rest.is_empty() {
            let mut room = (self.max_size.saturating_sub(self.size) / record_size) as usize;
            if room == 0 && self.has_records() {
                self.rotate()?;
                room = (self.max_size.saturating_sub(self.size) / record_size) as usize;
            }
            if room == 0 {
                warn!(
                    path = %self.path.display(),
                    max_size = self.max_size,
                    "recovery log size limit below one record"
                );
                room = rest.len();
            }

            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            let mut buf = BytesMut::with_capacity(chunk.len() * record_size as usize);
            for rec in chunk {
                for f in &self.template.fields {
                    f.put(&mut buf, rec);
                }
            }
            self.file.write_all(&buf)?;
            self.size += buf.len() as u64;
            rest = tail;
        }
        self.file.flush()?;
        Ok(valid.len())
    }
}

fn unlock(file: &File) {
    // SAFETY: the descriptor is still owned by `file`.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

impl Drop for RecoveryLog {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Move `path` to the first free `path.N`.
fn archive(path: &Path) -> Result<PathBuf> {
    for n in 1..=MAX_LOGFILE_ROTATIONS {
        let target = PathBuf::from(format!("{}.{}", path.display(), n));
        if !target.exists() {
            std::fs::rename(path, &target)?;
            info!(from = %path.display(), to = %target.display(), "recovery log rotated");
            return Ok(target);
        }
    }
    warn!(path = %path.display(), "no free rotation slot for recovery log");
    Err(WorkerError::IoError(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("unable to rotate {}", path.display()),
    )))
}

fn read_preamble(file: &mut File, path: &Path) -> Result<(LogfileHeader, Template)> {
    let mut head = vec![0u8; LOGFILE_HEADER_SIZE + TEMPLATE_HEADER_SIZE];
    read_exact_at_start(file, &mut head, path)?;
    let header = LogfileHeader::decode(&head, path)?;

    let mut th = &head[LOGFILE_HEADER_SIZE..];
    let num = th.get_u16() as usize;
    let mut full = vec![0u8; head.len() + num * TEMPLATE_ENTRY_SIZE];
    read_exact_at_start(file, &mut full, path)?;
    let mut rest = &full[LOGFILE_HEADER_SIZE..];
    let template = Template::decode(&mut rest, path)?;
    Ok((header, template))
}

fn read_exact_at_start(file: &mut File, buf: &mut [u8], path: &Path) -> Result<()> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => WorkerError::Truncated(path.to_path_buf()),
        _ => WorkerError::IoError(e),
    })
}

/// Contents of a recovery log file.
#[derive(Debug, Clone)]
pub struct RecoveryContents {
    pub header: LogfileHeader,
    pub template: Template,
    pub entries: Vec<RecoveredEntry>,
    /// Bytes after the last complete record.
    pub trailing: usize,
}

/// Read and validate a whole log file.
pub fn read_log(path: &Path) -> Result<RecoveryContents> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let header = LogfileHeader::decode(&data, path)?;
    let mut buf = &data[LOGFILE_HEADER_SIZE..];
    let template = Template::decode(&mut buf, path)?;

    let size = template.record_size();
    let mut entries = Vec::with_capacity(buf.len() / size.max(1));
    while size > 0 && buf.len() >= size {
        let mut e = RecoveredEntry::default();
        for f in &template.fields {
            f.get(&mut buf, &mut e);
        }
        entries.push(e);
    }

    if !buf.is_empty() {
        warn!(path = %path.display(), bytes = buf.len(), "recovery log ends with a partial record");
    }

    Ok(RecoveryContents {
        header,
        template,
        entries,
        trailing: buf.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header(agg: Aggregation) -> LogfileHeader {
        LogfileHeader {
            db: "pmacct".to_string(),
            table: "acct".to_string(),
            user: "flowacct".to_string(),
            host: "127.0.0.1".to_string(),
            table_version: 1,
            optimize_clauses: false,
            history: "5m".parse().ok(),
            what_to_count: agg,
        }
    }

    fn entry(port: u16, bytes: u64) -> CacheEntry {
        let primitives = Primitives {
            src_ip: [10, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            ip_family: flowacct_common::family::INET,
            src_port: port,
            ..Default::default()
        };
        CacheEntry::with_counters(primitives, 1, bytes, 0, 1_710_498_000)
    }

    #[test]
    fn test_header_encoding_size() {
        let mut buf = BytesMut::new();
        header(Aggregation(Aggregation::SRC_HOST)).encode(&mut buf);
        assert_eq!(buf.len(), LOGFILE_HEADER_SIZE);
        assert_eq!(&buf[..4], &LOGFILE_MAGIC.to_be_bytes());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.log");
        let agg = Aggregation(Aggregation::SRC_HOST | Aggregation::SRC_PORT);
        let template = Template::for_aggregation(agg);

        {
            let mut log = RecoveryLog::open(&path, &header(agg), &template, None).unwrap();
            let mut invalid = entry(3, 3);
            invalid.valid = false;
            let n = log.append(&[entry(1, 100), entry(2, 200), invalid]).unwrap();
            assert_eq!(n, 2);
        }
        {
            // reopening appends after the existing records
            let mut log = RecoveryLog::open(&path, &header(agg), &template, None).unwrap();
            log.append(&[entry(4, 400)]).unwrap();
        }

        let contents = read_log(&path).unwrap();
        assert_eq!(contents.header, header(agg));
        assert_eq!(contents.template, template);
        assert_eq!(contents.trailing, 0);
        let got: Vec<(u16, u64)> = contents
            .entries
            .iter()
            .map(|e| (e.primitives.src_port, e.bytes))
            .collect();
        assert_eq!(got, vec![(1, 100), (2, 200), (4, 400)]);
        assert_eq!(contents.entries[0].primitives.src_ip[..4], [10, 0, 0, 1]);
        assert_eq!(contents.entries[0].basetime, 1_710_498_000);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.log");
        std::fs::write(&path, vec![0xAB; LOGFILE_HEADER_SIZE + 16]).unwrap();

        let agg = Aggregation(Aggregation::SRC_HOST);
        let err = RecoveryLog::open(&path, &header(agg), &Template::for_aggregation(agg), None);
        assert!(matches!(err, Err(WorkerError::InvalidMagic(_))));
        assert!(matches!(read_log(&path), Err(WorkerError::InvalidMagic(_))));
    }

    #[test]
    fn test_rejects_template_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.log");
        let agg = Aggregation(Aggregation::SRC_HOST);
        RecoveryLog::open(&path, &header(agg), &Template::for_aggregation(agg), None).unwrap();

        let other = Aggregation(Aggregation::SRC_HOST | Aggregation::DST_PORT);
        let err = RecoveryLog::open(&path, &header(other), &Template::for_aggregation(other), None);
        assert!(matches!(err, Err(WorkerError::InvalidTemplate(_))));
    }

    #[test]
    fn test_rotates_when_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.log");
        let agg = Aggregation(Aggregation::SRC_PORT);
        let template = Template::for_aggregation(agg);

        {
            let mut log = RecoveryLog::open(&path, &header(agg), &template, Some(64)).unwrap();
            log.append(&[entry(1, 1), entry(2, 2)]).unwrap();
        }
        let log = RecoveryLog::open(&path, &header(agg), &template, Some(64)).unwrap();
        drop(log);

        let archived = dir.path().join("recovery.log.1");
        assert!(archived.exists());
        assert_eq!(read_log(&archived).unwrap().entries.len(), 2);
        assert!(read_log(&path).unwrap().entries.is_empty());
    }

    #[test]
    fn test_append_rotates_before_exceeding_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.log");
        let agg = Aggregation(Aggregation::SRC_HOST | Aggregation::SRC_PORT);
        let template = Template::for_aggregation(agg);
        let batch: Vec<CacheEntry> = (1..=200).map(|p| entry(p, u64::from(p))).collect();

        {
            let mut log = RecoveryLog::open(&path, &header(agg), &template, Some(1024)).unwrap();
            assert_eq!(log.append(&batch).unwrap(), 200);
        }
        {
            // 16 records fit under 1024 bytes; the tail file holds 8 and
            // takes 8 more before rotating for the last one
            let mut log = RecoveryLog::open(&path, &header(agg), &template, Some(1024)).unwrap();
            log.append(&batch[..9]).unwrap();
        }

        let mut files = vec![path.clone()];
        files.extend(
            (1..=MAX_LOGFILE_ROTATIONS)
                .map(|n| dir.path().join(format!("recovery.log.{}", n)))
                .take_while(|p| p.exists()),
        );
        assert_eq!(files.len(), 14);
        assert_eq!(read_log(&path).unwrap().entries.len(), 1);

        let mut ports = Vec::new();
        for f in &files {
            assert!(std::fs::metadata(f).unwrap().len() <= 1024, "{}", f.display());
            let contents = read_log(f).unwrap();
            assert_eq!(contents.trailing, 0);
            assert!(!contents.entries.is_empty());
            ports.extend(contents.entries.iter().map(|e| e.primitives.src_port));
        }
        ports.sort();
        let mut expected: Vec<u16> = (1..=200).chain(1..=9).collect();
        expected.sort();
        assert_eq!(ports, expected);
    }

    #[test]
    fn test_garbage_log_is_not_archived() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.log");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let agg = Aggregation(Aggregation::SRC_HOST);
        let err = RecoveryLog::open(&path, &header(agg), &Template::for_aggregation(agg), Some(1024));
        assert!(matches!(err, Err(WorkerError::InvalidMagic(_))));
        assert!(!dir.path().join("garbage.log.1").exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_unset_limit_uses_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.log");
        let agg = Aggregation(Aggregation::SRC_PORT);
        let log = RecoveryLog::open(&path, &header(agg), &Template::for_aggregation(agg), None).unwrap();
        assert_eq!(log.max_size, DEFAULT_MAX_LOGFILE_SIZE);
    }
}
