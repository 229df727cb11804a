//! Collaborator-facing group session.
//!
//! [`GroupSession`] is what a UI (or the CLI) holds. It owns at most one
//! active role at a time and routes each operation to it:
//!
//! ```text
//!                 ┌──────────── GroupSession ────────────┐
//! request_play ──►│ Coordinator: broadcast_play directly │
//! loop finished ─►│ Member:      PLAY_COMMAND / LOOP_END │──► SessionEvent rx
//! disconnect ────►│ None:        idle                    │    (PlayScheduled, ...)
//!                 └──────────────────────────────────────┘
//! ```
//!
//! Every notification leaves through one [`SessionEvent`] channel obtained
//! once with [`GroupSession::take_event_rx`]. The channel is bounded and
//! never waited on: once it is full, further events are dropped with a
//! warning, so a collaborator that stops draining it loses notifications
//! but never stalls the network tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::{OffsetEstimator, WallClock};
use crate::coordinator::{BroadcastReport, CoordinatorConfig, CoordinatorSession};
use crate::member::{MemberConfig, MemberSession};
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Buffered notifications before further events are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications delivered to the local collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// This member completed its handshake.
    Joined { coordinator: SocketAddr },
    /// A member completed its handshake with this coordinator.
    MemberJoined { member_id: Uuid, addr: SocketAddr },
    MemberLeft { member_id: Uuid, addr: SocketAddr },
    /// A time-sync exchange updated the clock offset.
    TimeSynced { offset_ms: i64 },
    /// Start playback after `delay`. `target_epoch_ms` is `None` when the
    /// command carried no usable target.
    PlayScheduled {
        target_epoch_ms: Option<i64>,
        delay: Duration,
    },
    /// The connection to the coordinator is gone.
    Disconnected,
}

pub fn event_channel() -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Deliver `event` without waiting. Returns false if it was dropped.
pub(crate) fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event channel full, dropping {event:?}");
            false
        }
        // Nobody listening.
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("Not connected")]
    NotConnected,
    #[error("Session already active")]
    AlreadyActive,
    #[error("Timed out waiting for time sync reply")]
    SyncTimeout,
    #[error("Time sync superseded by a newer exchange")]
    SyncSuperseded,
    #[error("Peer outbox full")]
    OutboxFull,
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Failed to bind listener: {0}")]
    Bind(std::io::Error),
    #[error("Not supported in this role: {0}")]
    Unsupported(&'static str),
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => SessionError::Connection(io),
            other => SessionError::Protocol(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Member,
}

enum ActiveSession {
    Coordinator(CoordinatorSession),
    Member(MemberSession),
}

/// One device's participation in a playback group.
pub struct GroupSession {
    estimator: Arc<OffsetEstimator>,
    clock: Arc<dyn WallClock>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    active: Option<ActiveSession>,
}

impl GroupSession {
    /// Session on the system clock.
    pub fn new(estimator: Arc<OffsetEstimator>) -> Self {
        Self::with_clock(estimator, Arc::new(crate::clock::SystemClock))
    }

    /// Session whose coordinator role reads `clock`. A member role always
    /// goes through the estimator's own clock.
    pub fn with_clock(estimator: Arc<OffsetEstimator>, clock: Arc<dyn WallClock>) -> Self {
        let (events_tx, events_rx) = event_channel();
        Self {
            estimator,
            clock,
            events_tx,
            events_rx: Some(events_rx),
            active: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.take()
    }

    pub fn estimator(&self) -> &Arc<OffsetEstimator> {
        &self.estimator
    }

    pub fn role(&self) -> Option<Role> {
        match self.active {
            Some(ActiveSession::Coordinator(_)) => Some(Role::Coordinator),
            Some(ActiveSession::Member(_)) => Some(Role::Member),
            None => None,
        }
    }

    /// Become the coordinator. Returns the bound listening address.
    pub async fn start_as_coordinator(
        &mut self,
        config: CoordinatorConfig,
    ) -> Result<SocketAddr, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let mut coordinator =
            CoordinatorSession::new(config, self.clock.clone(), self.events_tx.clone());
        let addr = coordinator.start().await?;
        self.active = Some(ActiveSession::Coordinator(coordinator));
        Ok(addr)
    }

    /// Join a coordinator. On failure the session stays idle.
    pub async fn start_as_member(&mut self, config: MemberConfig) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let mut member = MemberSession::new(config, self.estimator.clone(), self.events_tx.clone());
        member.join().await?;
        self.active = Some(ActiveSession::Member(member));
        Ok(())
    }

    /// Ask for a synchronized start. The coordinator broadcasts immediately;
    /// a member forwards the request upstream.
    pub async fn request_play(&self) -> Result<(), SessionError> {
        match &self.active {
            Some(ActiveSession::Coordinator(c)) => c.broadcast_play().await.map(|_| ()),
            Some(ActiveSession::Member(m)) => m.request_play().await,
            None => Err(SessionError::NotConnected),
        }
    }

    /// Report that the local playback finished one cycle.
    pub async fn notify_loop_finished(&self) -> Result<(), SessionError> {
        match &self.active {
            Some(ActiveSession::Coordinator(c)) => c.broadcast_play().await.map(|_| ()),
            Some(ActiveSession::Member(m)) => m.notify_loop_finished().await,
            None => Err(SessionError::NotConnected),
        }
    }

    /// Coordinator-only: broadcast and return delivery counts.
    pub async fn broadcast_play(&self) -> Result<BroadcastReport, SessionError> {
        match &self.active {
            Some(ActiveSession::Coordinator(c)) => c.broadcast_play().await,
            Some(ActiveSession::Member(_)) => {
                Err(SessionError::Unsupported("broadcast_play on a member"))
            }
            None => Err(SessionError::NotConnected),
        }
    }

    /// Member-only: run one time-sync exchange now.
    pub async fn sync_time(&self) -> Result<i64, SessionError> {
        match &self.active {
            Some(ActiveSession::Member(m)) => m.sync_time().await,
            Some(ActiveSession::Coordinator(_)) => {
                Err(SessionError::Unsupported("sync_time on the coordinator"))
            }
            None => Err(SessionError::NotConnected),
        }
    }

    /// Devices in the group as seen from here.
    pub async fn connected_count(&self) -> usize {
        match &self.active {
            Some(ActiveSession::Coordinator(c)) => c.connected_count().await,
            Some(ActiveSession::Member(m)) => m.connected_count().await,
            None => 0,
        }
    }

    /// Tear down the active role. The session can be started again afterwards.
    pub async fn disconnect(&mut self) {
        match self.active.take() {
            Some(ActiveSession::Coordinator(mut c)) => c.stop().await,
            Some(ActiveSession::Member(mut m)) => m.leave().await,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn session_at(now: i64) -> GroupSession {
        let clock = Arc::new(ManualClock::new(now));
        let estimator = Arc::new(OffsetEstimator::with_clock(clock.clone()));
        GroupSession::with_clock(estimator, clock)
    }

    #[test]
    fn test_protocol_io_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            SessionError::from(ProtocolError::Io(io)),
            SessionError::Connection(_)
        ));
        assert!(matches!(
            SessionError::from(ProtocolError::MissingType),
            SessionError::Protocol(ProtocolError::MissingType)
        ));
    }

    #[tokio::test]
    async fn test_idle_session() {
        let mut session = session_at(0);
        assert_eq!(session.role(), None);
        assert_eq!(session.connected_count().await, 0);
        assert!(matches!(
            session.request_play().await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            session.notify_loop_finished().await,
            Err(SessionError::NotConnected)
        ));
        // No-op when nothing is running.
        session.disconnect().await;
        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_coordinator_role_plays_locally() {
        let mut session = session_at(123_456);
        let mut events = session.take_event_rx().unwrap();

        session
            .start_as_coordinator(CoordinatorConfig::for_testing())
            .await
            .unwrap();
        assert_eq!(session.role(), Some(Role::Coordinator));
        assert_eq!(session.connected_count().await, 1);
        assert!(matches!(
            session
                .start_as_coordinator(CoordinatorConfig::for_testing())
                .await,
            Err(SessionError::AlreadyActive)
        ));
        assert!(matches!(
            session.sync_time().await,
            Err(SessionError::Unsupported(_))
        ));

        session.notify_loop_finished().await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::PlayScheduled {
                target_epoch_ms: Some(130_000),
                delay: Duration::from_millis(6_544),
            })
        );

        session.disconnect().await;
        assert_eq!(session.role(), None);
        assert_eq!(session.connected_count().await, 0);

        // Rebuildable after teardown.
        session
            .start_as_coordinator(CoordinatorConfig::for_testing())
            .await
            .unwrap();
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_untaken_event_receiver_never_blocks() {
        let mut session = session_at(123_456);
        session
            .start_as_coordinator(CoordinatorConfig::for_testing())
            .await
            .unwrap();

        // Far more local plays than the channel holds, nobody draining.
        let plays = async {
            for _ in 0..(EVENT_CHANNEL_CAPACITY * 2) {
                session.request_play().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), plays)
            .await
            .expect("request_play stalled on a full event channel");

        tokio::time::timeout(Duration::from_secs(5), session.disconnect())
            .await
            .expect("disconnect stalled");
    }

    #[test]
    fn test_emit_reports_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(emit(&tx, SessionEvent::Disconnected));
        assert!(!emit(&tx, SessionEvent::TimeSynced { offset_ms: 1 }));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Disconnected);
        drop(rx);
        assert!(!emit(&tx, SessionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_failed_join_stays_idle() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut session = session_at(0);
        let result = session.start_as_member(MemberConfig::new(addr.to_string())).await;
        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert_eq!(session.role(), None);
        assert_eq!(session.connected_count().await, 0);
    }
}
