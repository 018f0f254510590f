// Precision Resubscription Coordinator
// Stop -> settle delay -> Start(level), last request wins

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::Precision;
use crate::layer1::websocket::{ConnectionError, SessionControl};

/// Resubscription state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResubscribeState {
    Stable,
    /// Old session stopped; `level` starts once `deadline` passes
    PendingResubscribe { level: Precision, deadline: Instant },
}

impl fmt::Display for ResubscribeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResubscribeState::Stable => write!(f, "Stable"),
            ResubscribeState::PendingResubscribe { level, .. } => write!(f, "PendingResubscribe({})", level),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResubscribeStats {
    pub requests: u64,
    /// Stop/Start cycles that ran to completion
    pub cycles_completed: u64,
    /// Requests that replaced a pending level
    pub superseded: u64,
    /// Pending cycles dropped by a disconnect
    pub cancelled: u64,
}

impl fmt::Display for ResubscribeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResubscribeStats(requests={}, cycles={}, superseded={}, cancelled={})",
            self.requests, self.cycles_completed, self.superseded, self.cancelled
        )
    }
}

/// Drives the session through teardown/rebuild when the precision changes.
///
/// The coordinator never sleeps itself. The owner waits until
/// [`deadline`](Self::deadline) and then calls
/// [`on_settle_elapsed`](Self::on_settle_elapsed), so commands keep flowing
/// during the settle delay.
pub struct PrecisionCoordinator<S: SessionControl> {
    session: S,
    precision: Precision,
    state: ResubscribeState,
    settle_delay: Duration,
    stats: ResubscribeStats,
}

impl<S: SessionControl> PrecisionCoordinator<S> {
    pub fn new(session: S, initial: Precision, settle_delay: Duration) -> Self {
        info!(precision = %initial, settle_ms = settle_delay.as_millis() as u64, "Precision coordinator created");
        Self {
            session,
            precision: initial,
            state: ResubscribeState::Stable,
            settle_delay,
            stats: ResubscribeStats::default(),
        }
    }

    /// Precision for the current or next session
    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn state(&self) -> ResubscribeState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ResubscribeState::PendingResubscribe { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ResubscribeState::PendingResubscribe { deadline, .. } => Some(deadline),
            ResubscribeState::Stable => None,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn stats(&self) -> ResubscribeStats {
        self.stats.clone()
    }

    /// Handle a precision change request. Out-of-range levels are clamped.
    pub async fn request_precision(&mut self, level: i64) -> Precision {
        let precision = Precision::clamped(level);
        self.stats.requests += 1;

        match self.state {
            ResubscribeState::PendingResubscribe { level: previous, .. } => {
                // Session already stopped; restart the settle timer for the newest level
                self.stats.superseded += 1;
                self.precision = precision;
                self.state = self.pending(precision);
                debug!(previous = %previous, precision = %precision, "Pending resubscribe superseded");
            }
            ResubscribeState::Stable if !self.session.is_active() => {
                self.precision = precision;
                info!(precision = %precision, "Precision stored for next connect");
            }
            ResubscribeState::Stable if precision == self.precision => {
                debug!(precision = %precision, "Already subscribed at requested precision");
            }
            ResubscribeState::Stable => {
                info!(from = %self.precision, to = %precision, "Resubscribing at new precision");
                self.session.stop().await;
                self.precision = precision;
                self.state = self.pending(precision);
            }
        }

        precision
    }

    fn pending(&self, level: Precision) -> ResubscribeState {
        ResubscribeState::PendingResubscribe {
            level,
            deadline: Instant::now() + self.settle_delay,
        }
    }

    /// Start a session at the stored precision.
    ///
    /// Returns `Ok(None)` while a resubscribe is pending; the pending cycle
    /// will start the session itself.
    pub fn connect(&mut self) -> Result<Option<Uuid>, ConnectionError> {
        if self.is_pending() {
            debug!("Connect deferred to pending resubscribe");
            return Ok(None);
        }
        self.session.start(self.precision).map(Some)
    }

    /// Stop the session and drop any pending cycle
    pub async fn disconnect(&mut self) {
        if self.is_pending() {
            self.stats.cancelled += 1;
            debug!("Pending resubscribe cancelled");
        }
        self.state = ResubscribeState::Stable;
        self.session.stop().await;
    }

    /// Run the pending Start once its deadline has passed.
    ///
    /// Returns `None` when nothing is pending or the deadline is still ahead.
    pub fn on_settle_elapsed(&mut self) -> Option<Result<Uuid, ConnectionError>> {
        let ResubscribeState::PendingResubscribe { level, deadline } = self.state else {
            return None;
        };
        if Instant::now() < deadline {
            return None;
        }

        self.state = ResubscribeState::Stable;
        self.stats.cycles_completed += 1;
        info!(precision = %level, "Settle delay elapsed, resubscribing");
        Some(self.session.start(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockSession {
        active: Option<Uuid>,
        starts: Vec<Precision>,
        stops: usize,
    }

    impl SessionControl for MockSession {
        fn start(&mut self, precision: Precision) -> Result<Uuid, ConnectionError> {
            if let Some(id) = self.active {
                return Err(ConnectionError::AlreadyActive(id));
            }
            let id = Uuid::new_v4();
            self.active = Some(id);
            self.starts.push(precision);
            Ok(id)
        }

        async fn stop(&mut self) {
            if self.active.take().is_some() {
                self.stops += 1;
            }
        }

        fn is_active(&self) -> bool {
            self.active.is_some()
        }
    }

    fn coordinator() -> PrecisionCoordinator<MockSession> {
        PrecisionCoordinator::new(MockSession::default(), Precision::default(), Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_request_only_stores() {
        let mut c = coordinator();
        assert_eq!(c.request_precision(3).await.level(), 3);
        assert!(!c.is_pending());
        assert_eq!(c.session().stops, 0);

        c.connect().unwrap();
        assert_eq!(c.session().starts, vec![Precision::clamped(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_cycle() {
        let mut c = coordinator();
        c.connect().unwrap();

        c.request_precision(2).await;
        assert!(c.is_pending());
        assert_eq!(c.session().stops, 1);
        assert!(!c.session().is_active());

        // Not yet
        assert!(c.on_settle_elapsed().is_none());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(c.on_settle_elapsed().unwrap().is_ok());
        assert_eq!(c.state(), ResubscribeState::Stable);
        assert_eq!(c.session().starts, vec![Precision::clamped(0), Precision::clamped(2)]);
        assert_eq!(c.stats().cycles_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_runs_one_cycle_with_last_level() {
        let mut c = coordinator();
        c.connect().unwrap();

        c.request_precision(1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        c.request_precision(3).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        c.request_precision(42).await;

        assert_eq!(c.session().stops, 1);
        let deadline = c.deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        assert!(c.on_settle_elapsed().unwrap().is_ok());

        assert_eq!(c.session().starts, vec![Precision::clamped(0), Precision::clamped(4)]);
        let stats = c.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.superseded, 2);
        assert_eq!(stats.cycles_completed, 1);
        assert!(c.on_settle_elapsed().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseding_restarts_timer() {
        let mut c = coordinator();
        c.connect().unwrap();

        c.request_precision(1).await;
        let first = c.deadline().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        c.request_precision(2).await;
        let second = c.deadline().unwrap();
        assert!(second > first);

        tokio::time::sleep_until(first).await;
        assert!(c.on_settle_elapsed().is_none());
        tokio::time::sleep_until(second).await;
        assert!(c.on_settle_elapsed().is_some());
        assert_eq!(c.session().starts.last(), Some(&Precision::clamped(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_precision_while_connected_is_noop() {
        let mut c = coordinator();
        c.connect().unwrap();
        c.request_precision(-5).await;
        assert!(!c.is_pending());
        assert_eq!(c.session().stops, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_pending_is_deferred() {
        let mut c = coordinator();
        c.connect().unwrap();
        c.request_precision(2).await;

        assert!(c.connect().unwrap().is_none());
        assert_eq!(c.session().starts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending() {
        let mut c = coordinator();
        c.connect().unwrap();
        c.request_precision(2).await;

        c.disconnect().await;
        assert_eq!(c.state(), ResubscribeState::Stable);
        assert_eq!(c.stats().cancelled, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(c.on_settle_elapsed().is_none());
        assert_eq!(c.session().starts.len(), 1);
        // Stored precision survives for the next connect
        assert_eq!(c.precision().level(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_active_rejected() {
        let mut c = coordinator();
        c.connect().unwrap();
        assert!(matches!(c.connect(), Err(ConnectionError::AlreadyActive(_))));
    }
}
