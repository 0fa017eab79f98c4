pub mod collector;
pub mod exporter;

pub use collector::{ChannelCounters, ChannelMetrics, MetricsCollector};
pub use exporter::PrometheusExporter;
