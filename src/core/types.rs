// Core Type Definitions for Book Feed
// Shared by the transport, decoder, reconciler and published view

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of the single streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Subscribed,
    Disconnected,
    Errored,
}

impl ConnectionStatus {
    /// True while a session exists and has not closed
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Subscribed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// Side encoded in the sign of a feed amount.
    ///
    /// Positive amounts are bids and negative amounts are asks. For deletes
    /// (count == 0) the feed sends a normalized flag of +1 or -1 in place of a
    /// quantity, so the same rule picks the side. Zero and NaN carry no side.
    pub fn from_amount(amount: f64) -> Option<Self> {
        if amount > 0.0 {
            Some(BookSide::Bid)
        } else if amount < 0.0 {
            Some(BookSide::Ask)
        } else {
            None
        }
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => write!(f, "BID"),
            BookSide::Ask => write!(f, "ASK"),
        }
    }
}

// ============================================================================
// Precision
// ============================================================================

/// Server-side price aggregation level, always within 0..=4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "u8")]
pub struct Precision(u8);

impl Precision {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 4;

    /// Clamp any requested level into range. Out-of-range input is never an error.
    pub fn clamped(level: i64) -> Self {
        Self(level.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    /// Wire code used in the subscribe frame ("P0".."P4")
    pub fn code(&self) -> String {
        format!("P{}", self.0)
    }
}

impl From<i64> for Precision {
    fn from(level: i64) -> Self {
        Self::clamped(level)
    }
}

impl From<Precision> for u8 {
    fn from(p: Precision) -> Self {
        p.0
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ============================================================================
// BookEntry
// ============================================================================

/// One raw `[price, count, amount]` triple from the book channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub price: f64,
    pub count: i64,
    pub amount: f64,
}

impl BookEntry {
    pub fn new(price: f64, count: i64, amount: f64) -> Self {
        Self { price, count, amount }
    }

    pub fn side(&self) -> Option<BookSide> {
        BookSide::from_amount(self.amount)
    }
}

impl fmt::Display for BookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BookEntry(price={}, count={}, amount={})", self.price, self.count, self.amount)
    }
}

// ============================================================================
// Display scale
// ============================================================================

pub const MIN_SCALE: f64 = 0.5;
pub const MAX_SCALE: f64 = 2.0;

/// Clamp a rendering scale multiplier. Has no effect on reconciliation.
pub fn clamp_scale(scale: f64) -> f64 {
    if scale.is_nan() {
        return 1.0;
    }
    scale.clamp(MIN_SCALE, MAX_SCALE)
}
