// Published View - read-only, versioned projection of the book
// Consumers hold Arc<BookView> snapshots; only the pipeline publishes

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::core::{clamp_scale, now_ms, ConnectionStatus, Precision};
use crate::layer2::orderbook::OrderBook;

/// One rendered row: a price level plus the running depth from the best price
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ViewEntry {
    pub price: f64,
    pub quantity: f64,
    pub cumulative_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookView {
    pub symbol: String,
    /// Best (highest) first
    pub bids: Vec<ViewEntry>,
    /// Best (lowest) first
    pub asks: Vec<ViewEntry>,
    /// Bumped by book mutations only
    pub version: u64,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub precision: Precision,
    /// Rendering multiplier, passed through untouched
    pub scale: f64,
    pub channel_id: Option<i64>,
    pub last_updated_ms: u64,
}

impl BookView {
    pub fn empty(symbol: &str, precision: Precision, scale: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            version: 0,
            status: ConnectionStatus::Idle,
            last_error: None,
            precision,
            scale: clamp_scale(scale),
            channel_id: None,
            last_updated_ms: 0,
        }
    }

    pub fn best_bid(&self) -> Option<&ViewEntry> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&ViewEntry> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_ask()?.price + self.best_bid()?.price) / 2.0)
    }

    /// Largest cumulative total among the first `rows` rows of either side.
    /// Depth bars are drawn relative to this.
    pub fn max_total(&self, rows: usize) -> f64 {
        self.bids
            .iter()
            .take(rows)
            .chain(self.asks.iter().take(rows))
            .map(|e| e.cumulative_total)
            .fold(0.0, f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl fmt::Display for BookView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BookView({} {} v={} status={} bids={} asks={}",
            self.symbol, self.precision, self.version, self.status,
            self.bids.len(), self.asks.len()
        )?;
        if let Some(spread) = self.spread() {
            write!(f, " spread={:.4}", spread)?;
        }
        write!(f, ")")
    }
}

/// Single writer side of the published view
pub struct ViewPublisher {
    current: BookView,
    tx: watch::Sender<Arc<BookView>>,
}

impl ViewPublisher {
    pub fn new(initial: BookView) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial.clone()));
        Self { current: initial, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BookView>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> &BookView {
        &self.current
    }

    /// Copy the book's levels and version into the view
    pub fn publish_book(&mut self, book: &OrderBook) {
        self.current.bids = book.bid_entries();
        self.current.asks = book.ask_entries();
        self.current.version = book.version();
        self.current.last_updated_ms = now_ms();
        self.publish();
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        if self.current.status != status {
            self.current.status = status;
            self.publish();
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.current.last_error = Some(message.into());
        self.publish();
    }

    pub fn clear_error(&mut self) {
        if self.current.last_error.take().is_some() {
            self.publish();
        }
    }

    pub fn set_precision(&mut self, precision: Precision) {
        if self.current.precision != precision {
            self.current.precision = precision;
            self.publish();
        }
    }

    pub fn set_scale(&mut self, scale: f64) {
        let scale = clamp_scale(scale);
        if self.current.scale != scale {
            self.current.scale = scale;
            self.publish();
        }
    }

    pub fn set_channel(&mut self, channel_id: Option<i64>) {
        if self.current.channel_id != channel_id {
            self.current.channel_id = channel_id;
            self.publish();
        }
    }

    fn publish(&self) {
        // send_replace stores the value even when nobody is subscribed
        self.tx.send_replace(Arc::new(self.current.clone()));
    }
}
