//! Distribution side of the core to worker channels

pub mod distributor;
pub mod filter;
pub mod handlers;
pub mod input;
pub mod registry;
pub mod sampling;
pub mod tags;

pub use distributor::{Dispatch, Distributor};
pub use filter::{AcceptAll, MatchFilter, PacketFilter};
pub use input::DecodedFlow;
pub use registry::{Channel, ChannelId, ChannelRegistry, ChannelTemplate, MAX_N_PLUGINS};
pub use sampling::SamplingEvaluator;
pub use tags::TagFilter;
