// Book Feed - streaming order book mirror
// Layer 1 owns the transport, Layer 2 decodes and reconciles, core holds shared types/config/logging

pub mod core;
pub mod layer1;
pub mod layer2;

pub use crate::core::{BookSide, ConfigManager, ConnectionStatus, Precision};
pub use crate::layer2::{BookView, FeedHandle, FeedPipeline, ViewEntry};
