// Message Parser - Bitfinex v2 book channel
// Raw text frame -> exactly one typed message, or a ParseError

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::types::BookEntry;

// ============================================================================
// Parsed Message Types
// ============================================================================

/// Every shape the book channel can produce
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    /// `pong` event reply or channel-level `[chanId, "hb"]`
    Heartbeat,
    SubscriptionAck {
        channel_id: i64,
        symbol: String,
    },
    ProtocolError {
        message: String,
        code: Option<i64>,
    },
    Snapshot {
        channel_id: i64,
        entries: Vec<BookEntry>,
    },
    Delta {
        channel_id: i64,
        entry: BookEntry,
    },
    /// `info` and unknown events; logged and counted, never applied
    Ignored {
        event: String,
    },
}

impl ParsedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedMessage::Heartbeat => "heartbeat",
            ParsedMessage::SubscriptionAck { .. } => "subscribed",
            ParsedMessage::ProtocolError { .. } => "error",
            ParsedMessage::Snapshot { .. } => "snapshot",
            ParsedMessage::Delta { .. } => "delta",
            ParsedMessage::Ignored { .. } => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Unexpected frame shape: {0}")]
    UnexpectedShape(String),
    #[error("Invalid book entry: {0}")]
    InvalidEntry(String),
}

// ============================================================================
// Serde Structures (Raw Bitfinex JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEventFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(rename = "chanId", default)]
    chan_id: Option<i64>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    code: Option<i64>,
}

/// `[price, count, amount]`
#[derive(Debug, Deserialize)]
struct RawEntry(f64, i64, f64);

impl From<RawEntry> for BookEntry {
    fn from(raw: RawEntry) -> Self {
        BookEntry::new(raw.0, raw.1, raw.2)
    }
}

fn parse_entry(value: &Value) -> Result<BookEntry, ParseError> {
    RawEntry::deserialize(value)
        .map(BookEntry::from)
        .map_err(|e| ParseError::InvalidEntry(format!("{} in {}", e, value)))
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Stateless decoding
// ============================================================================

/// Decode one frame without touching any statistics
pub fn decode_frame(raw: &str) -> Result<ParsedMessage, ParseError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    match value {
        Value::Object(_) => decode_event(value),
        Value::Array(items) => decode_channel_frame(&items),
        other => Err(ParseError::UnexpectedShape(format!(
            "expected object or array, got {}",
            shape_name(&other)
        ))),
    }
}

fn decode_event(value: Value) -> Result<ParsedMessage, ParseError> {
    if value.get("event").is_none() {
        return Err(ParseError::UnexpectedShape("object frame without 'event'".into()));
    }

    let raw: RawEventFrame = serde_json::from_value(value)
        .map_err(|e| ParseError::UnexpectedShape(e.to_string()))?;

    match raw.event.as_str() {
        "info" => {
            info!(code = ?raw.code, msg = ?raw.msg, "Feed info event");
            Ok(ParsedMessage::Ignored { event: raw.event })
        }
        "subscribed" => {
            if let Some(channel) = raw.channel.as_deref() {
                if channel != "book" {
                    debug!(channel = channel, "Ack for non-book channel ignored");
                    return Ok(ParsedMessage::Ignored { event: raw.event });
                }
            }
            let channel_id = raw.chan_id.ok_or_else(|| {
                ParseError::UnexpectedShape("subscribed event without 'chanId'".into())
            })?;
            Ok(ParsedMessage::SubscriptionAck {
                channel_id,
                symbol: raw.symbol.unwrap_or_default(),
            })
        }
        "error" => Ok(ParsedMessage::ProtocolError {
            message: raw.msg.unwrap_or_else(|| "Unknown error".to_string()),
            code: raw.code,
        }),
        "pong" => Ok(ParsedMessage::Heartbeat),
        other => {
            debug!(event = other, "Unhandled feed event ignored");
            Ok(ParsedMessage::Ignored { event: raw.event })
        }
    }
}

fn decode_channel_frame(items: &[Value]) -> Result<ParsedMessage, ParseError> {
    if items.len() < 2 {
        return Err(ParseError::UnexpectedShape(format!(
            "channel frame needs [chanId, payload], got {} element(s)",
            items.len()
        )));
    }

    let channel_id = items[0].as_i64().ok_or_else(|| {
        ParseError::UnexpectedShape(format!("channel id must be an integer, got {}", shape_name(&items[0])))
    })?;

    match &items[1] {
        Value::String(tag) if tag == "hb" => Ok(ParsedMessage::Heartbeat),
        // Other tagged frames (e.g. checksums) are not part of the book contract
        Value::String(tag) => Ok(ParsedMessage::Ignored { event: tag.clone() }),
        Value::Array(payload) => {
            match payload.first() {
                // Empty book
                None => Ok(ParsedMessage::Snapshot { channel_id, entries: Vec::new() }),
                Some(Value::Array(_)) => {
                    let entries = payload
                        .iter()
                        .map(parse_entry)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(ParsedMessage::Snapshot { channel_id, entries })
                }
                Some(_) if payload.len() == 3 => {
                    let entry = parse_entry(&items[1])?;
                    Ok(ParsedMessage::Delta { channel_id, entry })
                }
                Some(_) => Err(ParseError::UnexpectedShape(format!(
                    "flat payload must have 3 elements, got {}",
                    payload.len()
                ))),
            }
        }
        other => Err(ParseError::UnexpectedShape(format!(
            "channel payload must be an array, got {}",
            shape_name(other)
        ))),
    }
}

// ============================================================================
// MessageParser - decoding plus statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub snapshot_count: u64,
    pub delta_count: u64,
    pub heartbeat_count: u64,
    pub ack_count: u64,
    pub protocol_error_count: u64,
    pub ignored_count: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageParser {
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame and record the outcome
    pub fn parse(&mut self, raw: &str) -> Result<ParsedMessage, ParseError> {
        let result = decode_frame(raw);

        match &result {
            Ok(message) => {
                self.stats.messages_parsed += 1;
                match message {
                    ParsedMessage::Heartbeat => self.stats.heartbeat_count += 1,
                    ParsedMessage::SubscriptionAck { .. } => self.stats.ack_count += 1,
                    ParsedMessage::ProtocolError { .. } => self.stats.protocol_error_count += 1,
                    ParsedMessage::Snapshot { .. } => self.stats.snapshot_count += 1,
                    ParsedMessage::Delta { .. } => self.stats.delta_count += 1,
                    ParsedMessage::Ignored { .. } => self.stats.ignored_count += 1,
                }
            }
            Err(_) => self.stats.parse_errors += 1,
        }

        result
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }
}
