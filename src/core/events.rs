// Event and command types that flow between the session task, the pipeline and the application
// Session -> pipeline: one ordered stream of FeedEvent per session
// Application -> pipeline: FeedCommand queue

use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use uuid::Uuid;

// ============================================================================
// Session events
// ============================================================================

/// What a session task can report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    Connected,
    Disconnected(String),
    Error(String),
    Message(String),
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Connected => "connected",
            SessionEvent::Disconnected(_) => "disconnected",
            SessionEvent::Error(_) => "error",
            SessionEvent::Message(_) => "message",
        }
    }

    /// Terminal events end the session; nothing follows them on the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Disconnected(_) | SessionEvent::Error(_))
    }
}

/// Event tagged with the session that produced it
#[derive(Debug, Clone, Serialize)]
pub struct FeedEvent {
    pub session_id: Uuid,
    pub timestamp: u64,
    pub event: SessionEvent,
}

impl FeedEvent {
    pub fn new(session_id: Uuid, event: SessionEvent) -> Self {
        Self {
            session_id,
            timestamp: now_ms(),
            event,
        }
    }
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.session_id.to_string();
        write!(f, "FeedEvent(kind={}, session={}, ts={})", self.event.kind(), &id[..8], self.timestamp)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Intents accepted by the pipeline. Sending one never blocks.
#[derive(Debug)]
pub enum FeedCommand {
    Connect,
    Disconnect,
    ChangePrecision(i64),
    SetScale(f64),
    SetError(String),
    ClearError,
    Shutdown(oneshot::Sender<()>),
}

impl fmt::Display for FeedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedCommand::Connect => write!(f, "Connect"),
            FeedCommand::Disconnect => write!(f, "Disconnect"),
            FeedCommand::ChangePrecision(level) => write!(f, "ChangePrecision({})", level),
            FeedCommand::SetScale(scale) => write!(f, "SetScale({})", scale),
            FeedCommand::SetError(msg) => write!(f, "SetError({})", msg),
            FeedCommand::ClearError => write!(f, "ClearError"),
            FeedCommand::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(SessionEvent::Disconnected("closed".into()).is_terminal());
        assert!(SessionEvent::Error("boom".into()).is_terminal());
        assert!(!SessionEvent::Connected.is_terminal());
        assert!(!SessionEvent::Message("[1,\"hb\"]".into()).is_terminal());
    }

    #[test]
    fn test_feed_event_display() {
        let event = FeedEvent::new(Uuid::new_v4(), SessionEvent::Connected);
        let s = format!("{}", event);
        assert!(s.contains("kind=connected"));
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(format!("{}", FeedCommand::ChangePrecision(3)), "ChangePrecision(3)");
        assert_eq!(format!("{}", FeedCommand::ClearError), "ClearError");
    }
}
