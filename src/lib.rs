pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod transport;

pub use error::{FlowAcctError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
