// Core Module - Foundational types, config, logging, events

pub mod types;
pub mod config;
pub mod logger;
pub mod events;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    FeedConfig, DisplayConfig, MonitoringConfig, ConfigManager, ConfigSummary, ConfigError,
};
pub use logger::setup_logging;
pub use events::{FeedEvent, SessionEvent, FeedCommand, now_ms};
