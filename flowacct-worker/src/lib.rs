//! Aggregation worker for flowacct
//!
//! Responsibilities:
//! - Drain record batches from a channel (`worker::BatchSource`)
//! - Accumulate them in a hashed, chained, time-bucketed cache
//! - Purge the cache to a backend at every refresh deadline
//! - Fail over to a backup backend, then to the recovery log

pub mod backend;
pub mod cache;
pub mod error;
pub mod history;
pub mod metrics;
pub mod recovery;
pub mod worker;
pub mod writer;

pub use cache::{AggregationCache, CacheConfig, CacheEntry, InsertMode, PurgeBatch};
pub use error::{Result, WorkerError};
pub use worker::{BatchSource, Worker, WorkerSettings, WorkerSummary};
