// Feed Metrics - one snapshot of every component's counters
// Refreshed by the pipeline after each command/event, read through FeedHandle

use serde::Serialize;
use std::fmt;
use tracing::info;

use crate::core::{ConnectionStatus, Precision};
use crate::layer1::websocket::ConnectionStats;
use crate::layer2::orderbook::BookStats;
use crate::layer2::parser::ParserStats;
use crate::layer2::pipeline::PipelineStats;
use crate::layer2::resubscriber::ResubscribeStats;
use crate::layer2::view::BookView;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewSummary {
    pub version: u64,
    pub status: Option<ConnectionStatus>,
    pub precision: Precision,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub has_error: bool,
}

impl From<&BookView> for ViewSummary {
    fn from(view: &BookView) -> Self {
        Self {
            version: view.version,
            status: Some(view.status),
            precision: view.precision,
            best_bid: view.best_bid().map(|e| e.price),
            best_ask: view.best_ask().map(|e| e.price),
            has_error: view.last_error.is_some(),
        }
    }
}

/// Unified metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct FeedMetrics {
    pub connection: ConnectionStats,
    pub parser: ParserStats,
    pub book: BookStats,
    pub resubscribe: ResubscribeStats,
    pub pipeline: PipelineStats,
    pub view: ViewSummary,
}

impl FeedMetrics {
    pub fn collect(
        connection: ConnectionStats,
        parser: ParserStats,
        book: BookStats,
        resubscribe: ResubscribeStats,
        pipeline: PipelineStats,
        view: &BookView,
    ) -> Self {
        Self {
            connection,
            parser,
            book,
            resubscribe,
            pipeline,
            view: ViewSummary::from(view),
        }
    }

    /// Parse failures, transport errors and server error events
    pub fn total_errors(&self) -> u64 {
        self.parser.parse_errors + self.connection.errors + self.parser.protocol_error_count
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.view.best_ask? - self.view.best_bid?)
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== FEED METRICS ===");
        info!("  Connection:  {}", self.connection);
        info!("  Parser:      parsed={} errs={} snap={} delta={} hb={} acks={} srv_errs={} ignored={}",
            self.parser.messages_parsed, self.parser.parse_errors, self.parser.snapshot_count,
            self.parser.delta_count, self.parser.heartbeat_count, self.parser.ack_count,
            self.parser.protocol_error_count, self.parser.ignored_count);
        info!("  Book:        {}", self.book);
        info!("  Resubscribe: {}", self.resubscribe);
        info!("  Pipeline:    {}", self.pipeline);
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self, elapsed_secs: u64) {
        let status = self.view.status.unwrap_or(self.connection.status);
        let bid = self.view.best_bid.unwrap_or(0.0);
        let ask = self.view.best_ask.unwrap_or(0.0);
        let spread = self.spread().unwrap_or(0.0);

        info!("[{:>3}s] {} {} | bid={:.2} ask={:.2} sprd={:.2} | v={} lvls={}/{} | frames={} snap={} delta={} | resub={} errs={}",
            elapsed_secs, status, self.view.precision,
            bid, ask, spread,
            self.view.version, self.book.bid_levels, self.book.ask_levels,
            self.connection.frames_received, self.parser.snapshot_count, self.parser.delta_count,
            self.resubscribe.cycles_completed, self.total_errors());
    }
}

impl fmt::Display for FeedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedMetrics(frames={}, parsed={}, v={}, errors={})",
            self.connection.frames_received, self.parser.messages_parsed,
            self.view.version, self.total_errors())
    }
}
