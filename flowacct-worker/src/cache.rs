//! Aggregation cache
//!
//! A fixed array of bucket heads, each owning a collision chain of
//! dynamically allocated nodes. Nodes live in one arena (`Vec<CacheEntry>`)
//! and link to each other by index. Dynamically allocated nodes are also
//! threaded on an LRU list so idle ones can be recycled or retired.
//!
//! Every entry that carries unflushed counters is referenced from the query
//! queue. Flushing invalidates the queued entries without freeing them; the
//! slots are overwritten by later inserts.

use crate::history::{Bucket, History};
use flowacct_common::{Aggregation, ClassAccumulators, FlowRecord, Primitives};
use tracing::{debug, error, warn};

/// Default number of bucket heads.
pub const DEFAULT_CACHE_ENTRIES: usize = 32771;

/// Idle nodes older than this many refresh intervals may be recycled.
pub const STALE_MULTIPLIER: i64 = 3;

/// Idle nodes older than this many refresh intervals are retired.
pub const RETIRE_MULTIPLIER: i64 = STALE_MULTIPLIER * STALE_MULTIPLIER;

/// Extra queue room per second of refresh interval.
pub const REASONABLE_NUMBER: usize = 100;

/// Byte counter value past which an entry stops accumulating.
pub const CACHE_THRESHOLD: u64 = 4_290_000_000;

/// How a record is folded into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Regular,
    /// One insert keyed by the source host, one by the destination host.
    SumHost,
    SumPort,
    SumMac,
}

impl InsertMode {
    pub fn for_aggregation(agg: Aggregation) -> Self {
        if agg.contains(Aggregation::SUM_HOST) {
            InsertMode::SumHost
        } else if agg.contains(Aggregation::SUM_PORT) {
            InsertMode::SumPort
        } else if agg.contains(Aggregation::SUM_MAC) {
            InsertMode::SumMac
        } else {
            InsertMode::Regular
        }
    }
}

/// Sizing and behaviour of one worker's cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of fixed bucket heads.
    pub entries: usize,
    /// Upper bound on dynamically allocated chain nodes.
    pub max_chained: usize,
    /// Purge interval in seconds.
    pub refresh_time: i64,
    pub history: Option<History>,
    pub insert_mode: InsertMode,
    /// Classification accounting (`class` in the aggregation key).
    pub classification: bool,
    pub aggressive_classification: bool,
    /// Query queue capacity; defaults to `entries + refresh_time * REASONABLE_NUMBER`.
    pub queue_size: Option<usize>,
    pub counter_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entries: DEFAULT_CACHE_ENTRIES,
            max_chained: DEFAULT_CACHE_ENTRIES * 4,
            refresh_time: 60,
            history: None,
            insert_mode: InsertMode::Regular,
            classification: false,
            aggressive_classification: false,
            queue_size: None,
            counter_threshold: CACHE_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn queue_capacity(&self) -> usize {
        self.queue_size.unwrap_or_else(|| {
            self.entries + (self.refresh_time.max(0) as usize) * REASONABLE_NUMBER
        })
    }
}

/// One accumulated flow.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub primitives: Primitives,
    pub bytes_counter: u64,
    pub packet_counter: u64,
    pub flows_counter: u64,
    /// Classification accumulators not yet merged into the counters.
    pub pending: ClassAccumulators,
    pub valid: bool,
    pub signature: u32,
    pub basetime: i64,
    pub lru_tag: i64,
    /// Dynamically allocated node (never a bucket head).
    pub chained: bool,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    pub(crate) lru_prev: Option<usize>,
    pub(crate) lru_next: Option<usize>,
    pub(crate) in_lru: bool,
}

impl CacheEntry {
    /// A detached, valid entry carrying the given counters.
    pub fn with_counters(
        primitives: Primitives,
        packets: u64,
        bytes: u64,
        flows: u64,
        basetime: i64,
    ) -> Self {
        Self {
            primitives,
            packet_counter: packets,
            bytes_counter: bytes,
            flows_counter: flows,
            basetime,
            valid: true,
            ..Default::default()
        }
    }

    /// Entries created only to hold classification bookkeeping.
    pub fn is_shadow(&self) -> bool {
        self.bytes_counter == 0 && self.packet_counter == 0 && self.flows_counter == 0
    }

    fn clear_payload(&mut self) {
        self.primitives = Primitives::default();
        self.bytes_counter = 0;
        self.packet_counter = 0;
        self.flows_counter = 0;
        self.pending = ClassAccumulators::default();
        self.valid = false;
        self.signature = 0;
        self.basetime = 0;
        self.lru_tag = 0;
    }
}

/// Transient per-insert state.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertContext {
    pub hash: u32,
    pub modulo: usize,
    pub now: i64,
    pub basetime: i64,
    pub timeslot: i64,
    pub pending_accumulators: bool,
}

/// Snapshot of the queue handed to a backend writer.
#[derive(Debug, Clone, Default)]
pub struct PurgeBatch {
    pub entries: Vec<CacheEntry>,
    pub basetime: i64,
    pub timeslot: i64,
    pub new_basetime: bool,
    pub recover: bool,
    pub now: i64,
}

/// Receives the queue snapshot taken when the cache cannot place a record.
pub trait OverflowHandler: Send {
    fn emergency_purge(&mut self, batch: PurgeBatch);
}

/// What a single insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    Dropped,
}

/// Counters accumulated since the last [`AggregationCache::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub inserts: u64,
    pub updates: u64,
    pub safe_actions: u64,
    pub reused: u64,
    pub retired: u64,
    pub dropped: u64,
}

enum Target {
    InPlace(usize),
    Extend(usize),
}

pub struct AggregationCache {
    config: CacheConfig,
    slots: Vec<CacheEntry>,
    free: Vec<usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    queue: Vec<usize>,
    queue_capacity: usize,
    bucket: Option<Bucket>,
    new_basetime: bool,
    recover: bool,
    flushtime: (i64, i64),
    overflow: Option<Box<dyn OverflowHandler>>,
    stats: CacheStats,
}

impl AggregationCache {
    /// Allocate the fixed part of the table once.
    pub fn new(config: CacheConfig) -> Self {
        let entries = config.entries.max(1);
        let queue_capacity = config.queue_capacity().max(1);
        let mut slots = Vec::with_capacity(entries);
        slots.resize_with(entries, CacheEntry::default);

        Self {
            config: CacheConfig { entries, ..config },
            slots,
            free: Vec::new(),
            lru_head: None,
            lru_tail: None,
            queue: Vec::with_capacity(queue_capacity),
            queue_capacity,
            bucket: None,
            new_basetime: false,
            recover: false,
            flushtime: (0, 0),
            overflow: None,
            stats: CacheStats::default(),
        }
    }

    pub fn with_overflow_handler(mut self, handler: Box<dyn OverflowHandler>) -> Self {
        self.overflow = Some(handler);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Set the worker's active history bucket.
    pub fn set_bucket(&mut self, bucket: Bucket, new_basetime: bool) {
        self.bucket = Some(bucket);
        self.new_basetime = new_basetime;
    }

    pub fn bucket(&self) -> Option<Bucket> {
        self.bucket
    }

    pub fn set_recover(&mut self, recover: bool) {
        self.recover = recover;
    }

    /// Record the time of the last completed flush, as (seconds, microseconds).
    pub fn mark_flushed(&mut self, sec: i64, usec: i64) {
        self.flushtime = (sec, usec);
        self.new_basetime = false;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn take_stats(&mut self) -> CacheStats {
        std::mem::take(&mut self.stats)
    }

    fn hash(primitives: &Primitives) -> u32 {
        crc32fast::hash(primitives.as_bytes())
    }

    fn context(&self, primitives: &Primitives, bucket: Option<Bucket>, now: i64) -> InsertContext {
        let hash = Self::hash(primitives);
        InsertContext {
            hash,
            modulo: hash as usize % self.config.entries,
            now,
            basetime: bucket.map_or(0, |b| b.basetime),
            timeslot: bucket.map_or(0, |b| b.timeslot),
            pending_accumulators: false,
        }
    }

    /// Find a valid entry for `key` not older than `basetime`.
    pub fn lookup(&self, key: &Primitives, basetime: i64) -> Option<&CacheEntry> {
        self.lookup_index(key, basetime).map(|i| &self.slots[i])
    }

    fn lookup_index(&self, key: &Primitives, basetime: i64) -> Option<usize> {
        let hash = Self::hash(key);
        let mut cur = hash as usize % self.config.entries;

        loop {
            let e = &self.slots[cur];
            // flushed nodes may sit ahead of live ones in a chain
            if e.valid
                && e.signature == hash
                && e.primitives == *key
                && !(self.config.history.is_some() && e.basetime < basetime)
            {
                return Some(cur);
            }
            cur = e.next?;
        }
    }

    /// Fold a record into the cache according to the configured insert mode.
    pub fn insert_record(&mut self, record: &FlowRecord, now: i64) -> InsertOutcome {
        let mut rec = *record;
        match self.config.insert_mode {
            InsertMode::Regular => self.insert_or_accumulate(&rec, now),
            InsertMode::SumHost => {
                let dst = rec.primitives.dst_ip;
                rec.primitives.dst_ip = [0; 16];
                self.insert_or_accumulate(&rec, now);
                rec.primitives.src_ip = dst;
                self.insert_or_accumulate(&rec, now)
            }
            InsertMode::SumPort => {
                let dst = rec.primitives.dst_port;
                rec.primitives.dst_port = 0;
                self.insert_or_accumulate(&rec, now);
                rec.primitives.src_port = dst;
                self.insert_or_accumulate(&rec, now)
            }
            InsertMode::SumMac => {
                let dst = rec.primitives.eth_dhost;
                rec.primitives.eth_dhost = [0; 6];
                self.insert_or_accumulate(&rec, now);
                rec.primitives.eth_shost = dst;
                self.insert_or_accumulate(&rec, now)
            }
        }
    }

    /// Insert a new entry for the record's key or add to the existing one.
    pub fn insert_or_accumulate(&mut self, record: &FlowRecord, now: i64) -> InsertOutcome {
        let mut rec = *record;

        let mut bucket = self.bucket;
        if let (Some(history), Some(b)) = (self.config.history, self.bucket) {
            if rec.pkt_time != 0 {
                bucket = Some(b.resolve(&history, rec.pkt_time));
            }
        }

        let mut ctx = self.context(&rec.primitives, bucket, now);

        if self.config.classification && rec.cst.ba != 0 && rec.primitives.class_id != 0 {
            self.reconcile_class(&mut rec, &mut ctx);
        }

        self.housekeeping(now);

        let mut retried = false;
        let mut cur = ctx.modulo;
        let mut stale: Option<usize> = None;
        let mut free_slot: Option<usize> = None;

        let target = loop {
            let e = &self.slots[cur];
            if !e.valid {
                // keep walking: a live entry for this key may follow
                free_slot.get_or_insert(cur);
            } else if e.signature == ctx.hash && e.primitives == rec.primitives {
                let rolled = self.config.history.is_some() && e.basetime < ctx.basetime;
                if rolled || e.bytes_counter > self.config.counter_threshold {
                    if stale.is_none() && e.chained {
                        stale = Some(cur);
                    }
                } else {
                    self.update(cur, &rec, &ctx);
                    return InsertOutcome::Updated;
                }
            }

            if let Some(next) = e.next {
                cur = next;
                continue;
            }

            if let Some(slot) = free_slot {
                break Target::InPlace(slot);
            }
            if let Some(node) = self.stale_lru_candidate(now) {
                self.rebuild_chain(cur, node);
                self.stats.reused += 1;
                break Target::Extend(node);
            }
            if let Some(node) = self.alloc_node() {
                self.build_chain(cur, node);
                break Target::Extend(node);
            }

            if retried {
                error!(
                    hash = ctx.hash,
                    "cache exhausted after safe action, dropping record"
                );
                self.stats.dropped += 1;
                return InsertOutcome::Dropped;
            }
            self.safe_action(&ctx, "no free cache node");
            retried = true;
            cur = ctx.modulo;
            stale = None;
            free_slot = None;
        };

        let idx = match target {
            Target::InPlace(i) | Target::Extend(i) => i,
        };

        let queued = self.queue.len() < self.queue_capacity;
        if queued {
            self.queue.push(idx);
        }

        self.write_entry(idx, &rec, &ctx);
        self.stats.inserts += 1;

        if !queued {
            self.safe_action(&ctx, "query queue full");
            self.queue.push(idx);
            return InsertOutcome::Inserted;
        }

        if let Some(s) = stale {
            if s != idx {
                self.swap_chain_positions(idx, s);
            }
        }
        InsertOutcome::Inserted
    }

    /// Move classified bytes out of the unclassified (class 0) entry.
    fn reconcile_class(&mut self, rec: &mut FlowRecord, ctx: &mut InsertContext) {
        let mut zero = rec.primitives;
        zero.class_id = 0;

        let target = self
            .lookup_index(&zero, ctx.basetime)
            .filter(|_| rec.cst.stamp() >= self.flushtime);

        match target {
            Some(i) => {
                let e = &mut self.slots[i];
                e.bytes_counter = e.bytes_counter.saturating_sub(rec.cst.ba);
                e.packet_counter = e.packet_counter.saturating_sub(rec.cst.pa);
                e.flows_counter = e.flows_counter.saturating_sub(rec.cst.fa);
                ctx.pending_accumulators = false;
            }
            None if self.config.aggressive_classification => ctx.pending_accumulators = true,
            None => rec.cst = ClassAccumulators::default(),
        }
    }

    fn write_entry(&mut self, idx: usize, rec: &FlowRecord, ctx: &InsertContext) {
        let classification = self.config.classification;
        let e = &mut self.slots[idx];
        e.primitives = rec.primitives;
        e.packet_counter = rec.pkt_num;
        e.flows_counter = rec.flo_num;
        e.bytes_counter = rec.pkt_len;
        e.pending = ClassAccumulators::default();
        if classification {
            if ctx.pending_accumulators {
                e.pending = rec.cst;
            } else {
                e.bytes_counter += rec.cst.ba;
                e.packet_counter += rec.cst.pa;
                e.flows_counter += rec.cst.fa;
            }
        }
        e.valid = true;
        e.basetime = ctx.basetime;
        e.lru_tag = ctx.now;
        e.signature = ctx.hash;
        let chained = e.chained;

        if chained {
            self.add_to_lru_tail(idx);
        }
    }

    fn update(&mut self, idx: usize, rec: &FlowRecord, ctx: &InsertContext) {
        let classification = self.config.classification;
        let e = &mut self.slots[idx];
        e.packet_counter += rec.pkt_num;
        e.flows_counter += rec.flo_num;
        e.bytes_counter += rec.pkt_len;
        if classification {
            if ctx.pending_accumulators {
                e.pending.ba += rec.cst.ba;
                e.pending.pa += rec.cst.pa;
                e.pending.fa += rec.cst.fa;
            } else {
                e.bytes_counter += rec.cst.ba;
                e.packet_counter += rec.cst.pa;
                e.flows_counter += rec.cst.fa;
            }
        }
        self.stats.updates += 1;
    }

    /// Retire at most one long idle node per call.
    fn housekeeping(&mut self, now: i64) {
        let Some(head) = self.lru_head else {
            return;
        };
        let e = &self.slots[head];
        if !e.valid && now - e.lru_tag > RETIRE_MULTIPLIER * self.config.refresh_time {
            self.retire(head);
        }
    }

    /// Longest idle node, if it has been idle long enough and holds no
    /// unflushed counters.
    fn stale_lru_candidate(&self, now: i64) -> Option<usize> {
        let head = self.lru_head?;
        let e = &self.slots[head];
        (!e.valid && now - e.lru_tag > STALE_MULTIPLIER * self.config.refresh_time).then_some(head)
    }

    fn alloc_node(&mut self) -> Option<usize> {
        if let Some(idx) = self.free.pop() {
            return Some(idx);
        }
        if self.slots.len() < self.config.entries + self.config.max_chained {
            self.slots.push(CacheEntry::default());
            return Some(self.slots.len() - 1);
        }
        None
    }

    fn build_chain(&mut self, cursor: usize, node: usize) {
        self.slots[node].clear_payload();
        self.slots[cursor].next = Some(node);
        let n = &mut self.slots[node];
        n.prev = Some(cursor);
        n.next = None;
        n.chained = true;
    }

    fn rebuild_chain(&mut self, cursor: usize, node: usize) {
        self.unlink_chain(node);
        self.remove_from_lru(node);
        self.build_chain(cursor, node);
    }

    fn retire(&mut self, node: usize) {
        debug!(node, "retiring idle cache node");
        self.unlink_chain(node);
        self.remove_from_lru(node);
        let e = &mut self.slots[node];
        e.clear_payload();
        e.prev = None;
        e.next = None;
        self.free.push(node);
        self.stats.retired += 1;
    }

    fn unlink_chain(&mut self, node: usize) {
        let (prev, next) = (self.slots[node].prev, self.slots[node].next);
        if let Some(p) = prev {
            self.slots[p].next = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        self.slots[node].prev = None;
        self.slots[node].next = None;
    }

    fn link(&mut self, a: Option<usize>, b: Option<usize>) {
        if let Some(a) = a {
            self.slots[a].next = b;
        }
        if let Some(b) = b {
            self.slots[b].prev = a;
        }
    }

    /// Exchange the chain positions of two chained nodes of the same bucket.
    fn swap_chain_positions(&mut self, a: usize, b: usize) {
        if !self.slots[a].chained || !self.slots[b].chained {
            return;
        }
        let (ap, an) = (self.slots[a].prev, self.slots[a].next);
        let (bp, bn) = (self.slots[b].prev, self.slots[b].next);

        if an == Some(b) {
            self.link(ap, Some(b));
            self.link(Some(b), Some(a));
            self.link(Some(a), bn);
        } else if bn == Some(a) {
            self.link(bp, Some(a));
            self.link(Some(a), Some(b));
            self.link(Some(b), an);
        } else {
            self.link(ap, Some(b));
            self.link(Some(b), an);
            self.link(bp, Some(a));
            self.link(Some(a), bn);
        }
    }

    fn add_to_lru_tail(&mut self, node: usize) {
        if self.slots[node].in_lru {
            if self.lru_tail == Some(node) {
                return;
            }
            self.remove_from_lru(node);
        }
        let tail = self.lru_tail;
        {
            let e = &mut self.slots[node];
            e.lru_prev = tail;
            e.lru_next = None;
            e.in_lru = true;
        }
        match tail {
            Some(t) => self.slots[t].lru_next = Some(node),
            None => self.lru_head = Some(node),
        }
        self.lru_tail = Some(node);
    }

    fn remove_from_lru(&mut self, node: usize) {
        if !self.slots[node].in_lru {
            return;
        }
        let (prev, next) = (self.slots[node].lru_prev, self.slots[node].lru_next);
        match prev {
            Some(p) => self.slots[p].lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.slots[n].lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let e = &mut self.slots[node];
        e.lru_prev = None;
        e.lru_next = None;
        e.in_lru = false;
    }

    fn safe_action(&mut self, ctx: &InsertContext, cause: &str) {
        debug!(cause, "purging process (CAUSE: safe action)");
        self.stats.safe_actions += 1;

        let batch = self.purge_batch(ctx.now);
        self.flush();

        match self.overflow.as_mut() {
            Some(handler) => handler.emergency_purge(batch),
            None => warn!(
                entries = batch.entries.len(),
                "no emergency writer installed, queued entries discarded"
            ),
        }
    }

    /// Snapshot of the valid queued entries, ready for a backend writer.
    pub fn purge_batch(&self, now: i64) -> PurgeBatch {
        let entries = self
            .queue
            .iter()
            .map(|&i| &self.slots[i])
            .filter(|e| e.valid)
            .cloned()
            .collect();
        let bucket = self.bucket.unwrap_or(Bucket {
            basetime: 0,
            timeslot: 0,
        });

        PurgeBatch {
            entries,
            basetime: bucket.basetime,
            timeslot: bucket.timeslot,
            new_basetime: self.new_basetime,
            recover: self.recover,
            now,
        }
    }

    /// Invalidate every queued entry and reset the queue.
    pub fn flush(&mut self) -> usize {
        let n = self.queue.len();
        for &i in &self.queue {
            self.slots[i].valid = false;
        }
        self.queue.clear();
        n
    }

    /// Invalidate queued entries whose counters are all zero.
    pub fn invalidate_empty_shadows(&mut self) -> usize {
        let mut n = 0;
        for &i in &self.queue {
            let e = &mut self.slots[i];
            if e.valid && e.is_shadow() {
                e.valid = false;
                n += 1;
            }
        }
        n
    }
}
