// Connection Manager - Bitfinex v2 public websocket
// One session at a time: connect, subscribe, heartbeat, close. Never reconnects.

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{ConnectionStatus, FeedConfig, FeedEvent, Precision, SessionEvent};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Session {0} is already active")]
    AlreadyActive(Uuid),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
}

/// What the coordinator needs from a session owner
#[allow(async_fn_in_trait)]
pub trait SessionControl {
    /// Open a session subscribed at `precision`
    fn start(&mut self, precision: Precision) -> Result<Uuid, ConnectionError>;
    /// Close the active session and wait for its task. No-op when idle.
    async fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub frames_received: u64,
    pub heartbeats_sent: u64,
    pub errors: u64,
    pub sessions_started: u64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            frames_received: 0,
            heartbeats_sent: 0,
            errors: 0,
            sessions_started: 0,
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionStats(status={}, frames={}, heartbeats={}, errors={}, sessions={})",
               self.status, self.frames_received, self.heartbeats_sent, self.errors, self.sessions_started)
    }
}

struct ActiveSession {
    id: Uuid,
    precision: Precision,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Owns at most one streaming session and its ordered event stream
pub struct ConnectionManager {
    config: FeedConfig,
    stats: Arc<RwLock<ConnectionStats>>,
    session: Option<ActiveSession>,
}

impl ConnectionManager {
    pub fn new(config: FeedConfig) -> Self {
        info!(url = %config.ws_url, symbol = %config.symbol, "Connection manager created");
        Self {
            config,
            stats: Arc::new(RwLock::new(ConnectionStats::default())),
            session: None,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn session_precision(&self) -> Option<Precision> {
        self.session.as_ref().map(|s| s.precision)
    }

    /// Next event of the active session.
    ///
    /// Pends forever while no session exists, so it can sit in a `select!`
    /// next to other branches. Returns `None` once the session task has
    /// ended and every event it produced has been drained.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        match self.session.as_mut() {
            Some(session) => session.events.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }
}

impl SessionControl for ConnectionManager {
    fn start(&mut self, precision: Precision) -> Result<Uuid, ConnectionError> {
        if let Some(session) = &self.session {
            return Err(ConnectionError::AlreadyActive(session.id));
        }

        let id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        {
            let mut stats = self.stats.write();
            stats.status = ConnectionStatus::Connecting;
            stats.sessions_started += 1;
        }

        let ctx = SessionContext {
            id,
            url: self.config.ws_url.clone(),
            subscribe_frame: create_subscribe_message(
                &self.config.symbol,
                precision,
                &self.config.frequency,
                &self.config.depth,
            ),
            heartbeat_interval: self.config.heartbeat_interval(),
            connect_timeout: self.config.connect_timeout(),
            close_timeout: self.config.close_timeout(),
            events: event_tx,
            stats: self.stats.clone(),
        };

        info!(session = %id, url = %ctx.url, precision = %precision, "Starting session");
        let handle = tokio::spawn(run_session(ctx, shutdown_rx));

        self.session = Some(ActiveSession {
            id,
            precision,
            shutdown: Some(shutdown_tx),
            handle,
            events: event_rx,
        });

        Ok(id)
    }

    async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(tx) = session.shutdown.take() {
            // Err means the task already finished on its own
            let _ = tx.send(());
        }

        if let Err(e) = session.handle.await {
            error!(session = %session.id, error = %e, "Session task failed");
        }

        // Receiver dropped here: nothing from this session can be read anymore
        drop(session.events);

        self.stats.write().status = ConnectionStatus::Idle;
        info!(session = %session.id, "Session stopped");
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // Dropping the shutdown sender wakes the task, which closes the socket
            drop(session.shutdown);
            debug!(session = %session.id, "Connection manager dropped with live session");
        }
    }
}

// ============================================================================
// Session task
// ============================================================================

struct SessionContext {
    id: Uuid,
    url: String,
    subscribe_frame: String,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    close_timeout: Duration,
    events: mpsc::UnboundedSender<FeedEvent>,
    stats: Arc<RwLock<ConnectionStats>>,
}

impl SessionContext {
    fn emit(&self, event: SessionEvent) {
        // Err means the owner already stopped this session
        let _ = self.events.send(FeedEvent::new(self.id, event));
    }
}

enum SessionEnd {
    /// Shutdown requested by the owner
    Local,
    /// Server closed or the stream ended
    Remote(String),
}

async fn run_session(ctx: SessionContext, shutdown: oneshot::Receiver<()>) {
    match drive_session(&ctx, shutdown).await {
        Ok(SessionEnd::Local) => {
            debug!(session = %ctx.id, "Session closed by owner");
        }
        Ok(SessionEnd::Remote(reason)) => {
            info!(session = %ctx.id, reason = %reason, "Session disconnected");
            ctx.stats.write().status = ConnectionStatus::Disconnected;
            ctx.emit(SessionEvent::Disconnected(reason));
        }
        Err(e) => {
            error!(session = %ctx.id, error = %e, "Session failed");
            {
                let mut stats = ctx.stats.write();
                stats.errors += 1;
                stats.status = ConnectionStatus::Errored;
            }
            ctx.emit(SessionEvent::Error(e.to_string()));
        }
    }
}

async fn drive_session(
    ctx: &SessionContext,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<SessionEnd, ConnectionError> {
    debug!(session = %ctx.id, url = %ctx.url, "Connecting");

    let connect = tokio::time::timeout(ctx.connect_timeout, connect_async(ctx.url.as_str()));
    let ws_stream = tokio::select! {
        biased;
        _ = &mut shutdown => return Ok(SessionEnd::Local),
        result = connect => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            Err(_) => return Err(ConnectionError::Timeout(ctx.connect_timeout)),
        },
    };

    info!(session = %ctx.id, "WebSocket connected");
    ctx.emit(SessionEvent::Connected);

    let (mut write, mut read) = ws_stream.split();

    let result: Result<SessionEnd, ConnectionError> = async {
        if let Err(e) = write.send(Message::Text(ctx.subscribe_frame.clone())).await {
            return Err(ConnectionError::Transport(e.to_string()));
        }
        ctx.stats.write().status = ConnectionStatus::Subscribed;
        debug!(session = %ctx.id, frame = %ctx.subscribe_frame, "Subscribe sent");

        // First probe one full interval after connect
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + ctx.heartbeat_interval,
            ctx.heartbeat_interval,
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => return Ok(SessionEnd::Local),

                // Polled before reads, pings go out on time under a busy stream
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Text(create_ping_message())).await {
                        return Err(ConnectionError::Transport(e.to_string()));
                    }
                    ctx.stats.write().heartbeats_sent += 1;
                    debug!(session = %ctx.id, "Heartbeat sent");
                }

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        ctx.stats.write().frames_received += 1;
                        ctx.emit(SessionEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        ctx.stats.write().errors += 1;
                        warn!(session = %ctx.id, bytes = data.len(), "Unexpected binary frame ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return Err(ConnectionError::Transport(e.to_string()));
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "Closed by server".to_string());
                        return Ok(SessionEnd::Remote(reason));
                    }
                    Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
                    None => return Ok(SessionEnd::Remote("Stream ended".to_string())),
                },
            }
        }
    }
    .await;

    // Heartbeat interval is already dropped with the block above
    match tokio::time::timeout(ctx.close_timeout, write.close()).await {
        Ok(Ok(())) => debug!(session = %ctx.id, "Transport closed"),
        Ok(Err(e)) => debug!(session = %ctx.id, error = %e, "Close on broken transport"),
        Err(_) => warn!(session = %ctx.id, timeout = ?ctx.close_timeout, "Close timed out"),
    }

    result
}

// ============================================================================
// Outgoing frames
// ============================================================================

/// Book channel subscribe request
pub fn create_subscribe_message(symbol: &str, precision: Precision, frequency: &str, depth: &str) -> String {
    serde_json::json!({
        "event": "subscribe",
        "channel": "book",
        "symbol": symbol,
        "prec": precision.code(),
        "freq": frequency,
        "len": depth,
    })
    .to_string()
}

/// Application-level heartbeat probe
pub fn create_ping_message() -> String {
    serde_json::json!({ "event": "ping" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn closed_port_config() -> FeedConfig {
        // Bind then drop to get a local port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        FeedConfig {
            ws_url: format!("ws://{}", addr),
            connect_timeout_ms: 2_000,
            ..FeedConfig::default()
        }
    }

    #[test]
    fn test_subscribe_message() {
        let msg = create_subscribe_message("tBTCUSD", Precision::clamped(2), "F0", "25");
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["event"], "subscribe");
        assert_eq!(v["channel"], "book");
        assert_eq!(v["symbol"], "tBTCUSD");
        assert_eq!(v["prec"], "P2");
        assert_eq!(v["freq"], "F0");
        assert_eq!(v["len"], "25");
    }

    #[test]
    fn test_ping_message() {
        let v: Value = serde_json::from_str(&create_ping_message()).unwrap();
        assert_eq!(v, serde_json::json!({"event": "ping"}));
    }

    #[test]
    fn test_manager_creation() {
        let manager = ConnectionManager::new(FeedConfig::default());
        assert!(!manager.is_active());
        assert!(manager.session_id().is_none());
        let stats = manager.stats();
        assert_eq!(stats.status, ConnectionStatus::Idle);
        assert_eq!(stats.sessions_started, 0);
    }

    #[tokio::test]
    async fn test_start_while_active_rejected() {
        let mut manager = ConnectionManager::new(closed_port_config());
        let id = manager.start(Precision::default()).unwrap();
        assert!(manager.is_active());

        match manager.start(Precision::clamped(1)) {
            Err(ConnectionError::AlreadyActive(active)) => assert_eq!(active, id),
            other => panic!("expected AlreadyActive, got {:?}", other),
        }

        manager.stop().await;
        assert!(!manager.is_active());
        // Idempotent
        manager.stop().await;
        assert_eq!(manager.stats().status, ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_refused_connect_surfaces_error() {
        let mut manager = ConnectionManager::new(closed_port_config());
        let id = manager.start(Precision::default()).unwrap();

        let event = manager.next_event().await.expect("session should report");
        assert_eq!(event.session_id, id);
        assert!(matches!(event.event, SessionEvent::Error(_)));
        assert_eq!(manager.stats().errors, 1);

        // Task ended: stream drains to None
        assert!(manager.next_event().await.is_none());
        manager.stop().await;
        assert!(!manager.is_active());
    }
}
