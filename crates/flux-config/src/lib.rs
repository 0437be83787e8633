pub mod broker;
pub mod loader;
pub mod node;

pub use broker::{AuthConfig, BrokerConfig, MetricsConfig, ServerConfig, TrackingConfig};
pub use flux_logging::{LogFormat, LoggingConfig};
pub use loader::ConfigLoader;
pub use node::{BufferConfig, LinkSettings, NodeConfig, NodeSection, ReidConfig, SourceConfig};
