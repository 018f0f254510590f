// Layer 2 - Book processing
// Decoding, reconciliation, resubscription and the published view

pub mod parser;
pub mod orderbook;
pub mod resubscriber;
pub mod view;
pub mod pipeline;
pub mod metrics;

// Re-export commonly used items
pub use parser::{decode_frame, MessageParser, ParseError, ParsedMessage, ParserStats};
pub use orderbook::{BookStats, DeltaOutcome, OrderBook, PriceLevel};
pub use resubscriber::{PrecisionCoordinator, ResubscribeState, ResubscribeStats};
pub use view::{BookView, ViewEntry, ViewPublisher};
pub use pipeline::{FeedError, FeedHandle, FeedPipeline, PipelineStats};
pub use metrics::{FeedMetrics, ViewSummary};
