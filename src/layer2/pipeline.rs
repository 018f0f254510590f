// Feed Pipeline - single consumer task
// Session events -> Parser -> OrderBook -> Published View, commands serialized in between

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{ConfigManager, ConnectionStatus, FeedCommand, FeedEvent, SessionEvent};
use crate::layer1::websocket::{ConnectionError, ConnectionManager, SessionControl};
use crate::layer2::metrics::FeedMetrics;
use crate::layer2::orderbook::OrderBook;
use crate::layer2::parser::{MessageParser, ParsedMessage};
use crate::layer2::resubscriber::PrecisionCoordinator;
use crate::layer2::view::{BookView, ViewPublisher};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Feed pipeline has stopped")]
    ConsumerClosed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub commands_processed: u64,
    pub events_processed: u64,
    /// Book frames for a channel other than the acknowledged one
    pub frames_dropped: u64,
    pub sessions_ended: u64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipelineStats(commands={}, events={}, dropped={}, sessions_ended={})",
            self.commands_processed, self.events_processed, self.frames_dropped, self.sessions_ended
        )
    }
}

// ============================================================================
// FeedHandle - application side
// ============================================================================

/// Cloneable handle to a running pipeline.
///
/// Commands return as soon as they are queued; their effects show up in the view.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    view: watch::Receiver<Arc<BookView>>,
    metrics: Arc<RwLock<FeedMetrics>>,
}

impl FeedHandle {
    fn send(&self, command: FeedCommand) -> Result<(), FeedError> {
        self.commands.send(command).map_err(|_| FeedError::ConsumerClosed)
    }

    pub fn connect(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::Disconnect)
    }

    /// Out-of-range levels are clamped to 0..=4
    pub fn change_precision(&self, level: i64) -> Result<(), FeedError> {
        self.send(FeedCommand::ChangePrecision(level))
    }

    pub fn set_scale(&self, scale: f64) -> Result<(), FeedError> {
        self.send(FeedCommand::SetScale(scale))
    }

    pub fn set_error(&self, message: impl Into<String>) -> Result<(), FeedError> {
        self.send(FeedCommand::SetError(message.into()))
    }

    pub fn clear_error(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::ClearError)
    }

    /// Latest published view
    pub fn view(&self) -> Arc<BookView> {
        self.view.borrow().clone()
    }

    /// Receiver notified on every publish
    pub fn subscribe(&self) -> watch::Receiver<Arc<BookView>> {
        self.view.clone()
    }

    pub fn metrics(&self) -> FeedMetrics {
        self.metrics.read().clone()
    }

    /// Stop the session and end the pipeline task. Resolves once both are done.
    pub async fn shutdown(&self) -> Result<(), FeedError> {
        let (tx, rx) = oneshot::channel();
        self.send(FeedCommand::Shutdown(tx))?;
        rx.await.map_err(|_| FeedError::ConsumerClosed)
    }
}

// ============================================================================
// FeedPipeline - consumer task
// ============================================================================

pub struct FeedPipeline {
    parser: MessageParser,
    book: OrderBook,
    coordinator: PrecisionCoordinator<ConnectionManager>,
    view: ViewPublisher,
    /// Channel id from the current session's ack
    channel_id: Option<i64>,
    stats: PipelineStats,
    metrics: Arc<RwLock<FeedMetrics>>,
}

impl FeedPipeline {
    /// Build the pipeline and spawn its task on the current runtime
    pub fn spawn(config: &ConfigManager) -> FeedHandle {
        let feed = config.feed().clone();
        let display_cfg = config.display();
        let precision = display_cfg.precision;

        info!(symbol = %feed.symbol, precision = %precision, "Creating feed pipeline");

        let view = ViewPublisher::new(BookView::empty(&feed.symbol, precision, display_cfg.scale));
        let view_rx = view.subscribe();
        let settle_delay = feed.settle_delay();
        let coordinator = PrecisionCoordinator::new(ConnectionManager::new(feed), precision, settle_delay);

        let metrics = Arc::new(RwLock::new(FeedMetrics::default()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let pipeline = Self {
            parser: MessageParser::new(),
            book: OrderBook::new(),
            coordinator,
            view,
            channel_id: None,
            stats: PipelineStats::default(),
            metrics: metrics.clone(),
        };
        pipeline.refresh_metrics();

        tokio::spawn(pipeline.run(command_rx));

        FeedHandle {
            commands: command_tx,
            view: view_rx,
            metrics,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        info!("Feed pipeline started");
        let mut shutdown_ack = None;

        loop {
            let deadline = self.coordinator.deadline();

            // Queued session events first, so a command sees the session's real state
            tokio::select! {
                biased;

                event = self.coordinator.session_mut().next_event() => match event {
                    Some(event) => {
                        self.stats.events_processed += 1;
                        self.handle_event(event).await;
                    }
                    None => self.end_session().await,
                },

                command = commands.recv() => match command {
                    Some(FeedCommand::Shutdown(done)) => {
                        self.coordinator.disconnect().await;
                        self.view.set_status(ConnectionStatus::Disconnected);
                        shutdown_ack = Some(done);
                        break;
                    }
                    Some(command) => {
                        self.stats.commands_processed += 1;
                        self.handle_command(command).await;
                    }
                    None => {
                        debug!("All feed handles dropped");
                        self.coordinator.disconnect().await;
                        break;
                    }
                },

                _ = settle_timer(deadline) => self.handle_settle(),
            }

            self.refresh_metrics();
        }

        // Later commands fail with ConsumerClosed from here on
        drop(commands);
        self.refresh_metrics();
        info!("Feed pipeline stopped");

        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: FeedCommand) {
        debug!(command = %command, "Handling command");

        match command {
            FeedCommand::Connect => self.connect(),
            FeedCommand::Disconnect => {
                let had_session = self.coordinator.session().is_active() || self.coordinator.is_pending();
                self.coordinator.disconnect().await;
                self.forget_channel();
                if had_session {
                    self.view.set_status(ConnectionStatus::Disconnected);
                }
            }
            FeedCommand::ChangePrecision(level) => {
                let precision = self.coordinator.request_precision(level).await;
                self.view.set_precision(precision);
                if self.coordinator.is_pending() {
                    // Book stays on display until the new snapshot replaces it
                    self.forget_channel();
                    self.view.set_status(ConnectionStatus::Connecting);
                }
            }
            FeedCommand::SetScale(scale) => self.view.set_scale(scale),
            FeedCommand::SetError(message) => self.view.set_error(message),
            FeedCommand::ClearError => self.view.clear_error(),
            // Handled by the run loop
            FeedCommand::Shutdown(_) => {}
        }
    }

    fn connect(&mut self) {
        if self.coordinator.session().is_active() {
            debug!("Connect ignored, session already active");
            return;
        }

        match self.coordinator.connect() {
            Ok(Some(session)) => {
                debug!(session = %session, "Session requested");
                self.forget_channel();
                self.view.clear_error();
                self.view.set_status(ConnectionStatus::Connecting);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.view.set_error(e.to_string());
                self.view.set_status(ConnectionStatus::Errored);
            }
        }
    }

    fn handle_settle(&mut self) {
        let Some(result) = self.coordinator.on_settle_elapsed() else {
            return;
        };

        match result {
            Ok(session) => {
                debug!(session = %session, "Resubscribe session started");
                self.view.set_status(ConnectionStatus::Connecting);
            }
            Err(e) => {
                warn!(error = %e, "Resubscribe failed");
                self.view.set_error(e.to_string());
                self.view.set_status(ConnectionStatus::Errored);
            }
        }
    }

    async fn handle_event(&mut self, event: FeedEvent) {
        match event.event {
            SessionEvent::Connected => {
                info!(session = %event.session_id, "Session connected, awaiting subscription ack");
            }
            SessionEvent::Message(raw) => self.handle_message(&raw),
            SessionEvent::Disconnected(reason) => {
                info!(session = %event.session_id, reason = %reason, "Session disconnected, book kept");
                self.end_session().await;
                self.view.set_status(ConnectionStatus::Disconnected);
            }
            SessionEvent::Error(reason) => {
                warn!(session = %event.session_id, error = %reason, "Session error");
                self.end_session().await;
                self.view.set_error(reason);
                self.view.set_status(ConnectionStatus::Errored);
            }
        }
    }

    fn handle_message(&mut self, raw: &str) {
        let message = match self.parser.parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "Dropping malformed frame");
                return;
            }
        };

        match message {
            ParsedMessage::Heartbeat => {}
            ParsedMessage::SubscriptionAck { channel_id, symbol } => {
                info!(channel_id = channel_id, symbol = %symbol, "Subscribed to book channel");
                self.channel_id = Some(channel_id);
                self.view.set_status(ConnectionStatus::Subscribed);
                self.view.set_channel(Some(channel_id));
            }
            ParsedMessage::ProtocolError { message, code } => {
                warn!(code = ?code, msg = %message, "Server reported error");
                self.view.set_error(message);
            }
            ParsedMessage::Snapshot { channel_id, entries } => {
                if self.accepts(channel_id) {
                    self.book.apply_snapshot(&entries);
                    self.view.publish_book(&self.book);
                }
            }
            ParsedMessage::Delta { channel_id, entry } => {
                if self.accepts(channel_id) && self.book.apply_delta(entry).is_mutation() {
                    self.view.publish_book(&self.book);
                }
            }
            ParsedMessage::Ignored { event } => {
                debug!(event = %event, "Frame ignored");
            }
        }
    }

    fn accepts(&mut self, channel_id: i64) -> bool {
        match self.channel_id {
            Some(expected) if expected != channel_id => {
                self.stats.frames_dropped += 1;
                debug!(expected = expected, got = channel_id, "Frame for foreign channel dropped");
                false
            }
            _ => true,
        }
    }

    /// Reap a session that ended on its own
    async fn end_session(&mut self) {
        self.coordinator.session_mut().stop().await;
        self.forget_channel();
        self.stats.sessions_ended += 1;
    }

    fn forget_channel(&mut self) {
        self.channel_id = None;
        self.view.set_channel(None);
    }

    fn refresh_metrics(&self) {
        let metrics = FeedMetrics::collect(
            self.coordinator.session().stats(),
            self.parser.stats.clone(),
            self.book.get_stats(),
            self.coordinator.stats(),
            self.stats.clone(),
            self.view.current(),
        );
        *self.metrics.write() = metrics;
    }
}

async fn settle_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
