//! Coordinator side of a playback group: accepts members and fans out starts.
//!
//! Architecture:
//! ```text
//! Member A ──┐                              ┌──► A outbox ──► writer task ──► A socket
//!            ├── accept loop ── handler ────┤
//! Member B ──┘   (one task)    (per member) ├──► B outbox ──► writer task ──► B socket
//!                                  │        │
//!                                  ▼        └──► local collaborator (SessionEvent)
//!                           MemberRegistry
//! ```
//!
//! Lifecycle: `Idle → Listening → Running → Stopped`. `Listening` covers the
//! window between bind and the first completed handshake.
//!
//! A handler expects `CONNECT` as the first line. Anything else, a timeout or
//! an early close drops the socket without registering it. After the
//! handshake:
//! - `SYNC_TIME` is answered with the coordinator wall clock,
//! - `PLAY_COMMAND` and `LOOP_END` both trigger [`CoordinatorSession::broadcast_play`],
//! - a protocol error or end of stream removes the member.
//!
//! `stop` flips a watch channel that every pending read, dispatch and accept
//! selects against, then aborts the accept task together with the handlers it
//! owns. A `SYNC_TIME` reply is queued with `try_send`; a member whose outbox
//! is full is dropped rather than waited on.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use uuid::Uuid;

use crate::broadcast::{
    compute_target, pump_outbox, BroadcastStats, MemberRecord, MemberRegistry, OutboundLine,
    MIN_MARGIN_MS,
};
use crate::clock::{SystemClock, WallClock};
use crate::protocol::{Message, MessageReader, DEFAULT_PORT};
use crate::session::{emit, SessionError, SessionEvent};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Lines buffered per member before broadcasts start skipping it
    pub outbox_capacity: usize,
    /// How long a new connection may take to send CONNECT
    pub handshake_timeout: Duration,
    /// Minimum lead between a broadcast and its target instant
    pub min_margin_ms: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            outbox_capacity: 64,
            handshake_timeout: Duration::from_secs(5),
            min_margin_ms: MIN_MARGIN_MS,
        }
    }
}

impl CoordinatorConfig {
    /// Loopback on an OS-assigned port, for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            handshake_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Listening,
    Running,
    Stopped,
}

/// Outcome of one synchronized play broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub target_epoch_ms: i64,
    pub delivered: usize,
    pub failed: usize,
}

/// State shared by the accept loop and every connection handler.
struct Shared {
    config: CoordinatorConfig,
    registry: MemberRegistry,
    state: RwLock<CoordinatorState>,
    events: mpsc::Sender<SessionEvent>,
    clock: Arc<dyn WallClock>,
}

impl Shared {
    async fn broadcast_play(&self) -> Result<BroadcastReport, SessionError> {
        let now = self.clock.now_millis();
        let target = compute_target(now, self.config.min_margin_ms);

        let fan_out = self.registry.broadcast(&Message::play_at(target)).await?;

        // The coordinator plays too, against the same target.
        let delay_ms = target.saturating_sub(self.clock.now_millis()).max(0) as u64;
        emit(
            &self.events,
            SessionEvent::PlayScheduled {
                target_epoch_ms: Some(target),
                delay: Duration::from_millis(delay_ms),
            },
        );

        log::info!(
            "Play broadcast: target {target} (in {delay_ms} ms), {} members reached, {} skipped",
            fan_out.delivered,
            fan_out.failed
        );
        Ok(BroadcastReport {
            target_epoch_ms: target,
            delivered: fan_out.delivered,
            failed: fan_out.failed,
        })
    }

    async fn mark_running(&self) {
        let mut state = self.state.write().await;
        if *state == CoordinatorState::Listening {
            *state = CoordinatorState::Running;
        }
    }

    async fn dispatch(
        &self,
        member_id: Uuid,
        addr: SocketAddr,
        message: Message,
        outbox: &mpsc::Sender<OutboundLine>,
    ) -> Result<(), SessionError> {
        match message {
            Message::SyncTimeRequest => {
                let reply = Message::SyncTimeReply {
                    server_now: self.clock.now_millis(),
                };
                // A member that never reads must not park its handler.
                match outbox.try_send(Arc::new(reply.encode()?)) {
                    Ok(()) => log::debug!("Answered SYNC_TIME from {addr}"),
                    Err(mpsc::error::TrySendError::Full(_)) => return Err(SessionError::OutboxFull),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(SessionError::NotConnected)
                    }
                }
            }
            Message::PlayCommand { .. } => {
                log::info!("Play requested by member {member_id} ({addr})");
                self.broadcast_play().await?;
            }
            Message::LoopEnd => {
                log::info!("Loop end from member {member_id} ({addr}), scheduling next loop");
                self.broadcast_play().await?;
            }
            Message::Error { message } => {
                log::warn!(
                    "Member {addr} reported an error: {}",
                    message.as_deref().unwrap_or("(no detail)")
                );
            }
            Message::Connect | Message::Connected | Message::SyncTimeReply { .. } => {
                log::debug!("Ignoring unexpected {} from {addr}", message.kind());
            }
        }
        Ok(())
    }
}

/// The coordinator session.
pub struct CoordinatorSession {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl CoordinatorSession {
    /// Create an idle coordinator. Play notifications for the local
    /// collaborator are delivered on `events`.
    pub fn new(
        config: CoordinatorConfig,
        clock: Arc<dyn WallClock>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: MemberRegistry::new(),
                state: RwLock::new(CoordinatorState::Idle),
                events,
                clock,
            }),
            shutdown_tx,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Coordinator on the system clock.
    pub fn with_system_clock(config: CoordinatorConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self::new(config, Arc::new(SystemClock), events)
    }

    /// Bind the listening endpoint and start accepting members.
    ///
    /// Returns the bound address (useful when port 0 was requested).
    pub async fn start(&mut self) -> Result<SocketAddr, SessionError> {
        {
            let state = self.shared.state.read().await;
            if *state != CoordinatorState::Idle {
                return Err(SessionError::AlreadyActive);
            }
        }

        let listener = TcpListener::bind(&self.shared.config.bind_addr)
            .await
            .map_err(SessionError::Bind)?;
        let addr = listener.local_addr().map_err(SessionError::Bind)?;

        *self.shared.state.write().await = CoordinatorState::Listening;
        self.local_addr = Some(addr);

        let shared = self.shared.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, shared, shutdown)));

        log::info!("Coordinator listening on {addr}");
        Ok(addr)
    }

    /// Compute one target and send it to every member and the local collaborator.
    pub async fn broadcast_play(&self) -> Result<BroadcastReport, SessionError> {
        match *self.shared.state.read().await {
            CoordinatorState::Listening | CoordinatorState::Running => {}
            _ => return Err(SessionError::NotConnected),
        }
        self.shared.broadcast_play().await
    }

    /// Live members plus the coordinator itself.
    pub async fn connected_count(&self) -> usize {
        self.shared.registry.live_count().await + 1
    }

    pub async fn state(&self) -> CoordinatorState {
        *self.shared.state.read().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn member_addrs(&self) -> Vec<SocketAddr> {
        self.shared.registry.addrs().await
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.shared.registry.stats().await
    }

    /// Close the listener and every member socket. Idempotent.
    pub async fn stop(&mut self) {
        {
            let mut state = self.shared.state.write().await;
            if *state == CoordinatorState::Stopped {
                return;
            }
            *state = CoordinatorState::Stopped;
        }

        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        let closed = self.shared.registry.clear().await;
        log::info!("Coordinator stopped, closed {closed} member connections");
    }
}

impl Drop for CoordinatorSession {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Accepts members until shutdown. Handlers live in a `JoinSet` owned by
/// this task, so aborting the accept task aborts every handler with it and
/// their sockets close whether or not they are parked.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut handlers = JoinSet::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    handlers.spawn(handle_connection(stream, addr, shared.clone(), shutdown.clone()));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    handlers.abort_all();
    while handlers.join_next().await.is_some() {}
    log::debug!("Accept loop exited");
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(read_half));

    let first = tokio::select! {
        _ = shutdown.changed() => return,
        first = timeout(shared.config.handshake_timeout, reader.next_message()) => first,
    };
    match first {
        Ok(Ok(Some(Message::Connect))) => {}
        Ok(Ok(Some(other))) => {
            log::debug!("Dropping {addr}: expected CONNECT, got {}", other.kind());
            return;
        }
        Ok(Ok(None)) => {
            log::debug!("Dropping {addr}: closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            log::debug!("Dropping {addr}: bad handshake: {e}");
            return;
        }
        Err(_) => {
            log::debug!("Dropping {addr}: handshake timed out");
            return;
        }
    }

    // CONNECTED is queued ahead of anything a broadcast can enqueue, and the
    // member is registered before the acknowledgement can reach it.
    let ack = match Message::Connected.encode() {
        Ok(line) => Arc::new(line),
        Err(e) => {
            log::error!("Failed to encode CONNECTED: {e}");
            return;
        }
    };
    let (outbox_tx, outbox_rx) = mpsc::channel(shared.config.outbox_capacity.max(1));
    if outbox_tx.try_send(ack).is_err() {
        return;
    }

    let record = MemberRecord::new(addr, outbox_tx.clone());
    let member_id = record.id();
    let live = record.live_flag();
    shared.registry.add(record).await;
    shared.mark_running().await;

    // The writer may be blocked on a peer that stopped reading; it goes
    // down with this handler however the handler ends.
    let _writer = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = pump_outbox(write_half, outbox_rx).await {
            log::warn!("Write to member {addr} failed: {e}");
        }
        live.store(false, Ordering::Release);
    }));

    log::info!("Member {member_id} joined from {addr}");
    emit(&shared.events, SessionEvent::MemberJoined { member_id, addr });

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = reader.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                let handled = tokio::select! {
                    _ = shutdown.changed() => break,
                    handled = shared.dispatch(member_id, addr, message, &outbox_tx) => handled,
                };
                if let Err(e) = handled {
                    log::warn!("Dropping member {addr}: {e}");
                    break;
                }
            }
            Ok(None) => {
                log::info!("Member {member_id} ({addr}) disconnected");
                break;
            }
            Err(e) => {
                log::warn!("Dropping member {addr}: {e}");
                break;
            }
        }
    }

    if shared.registry.remove(&member_id).await.is_some() {
        emit(&shared.events, SessionEvent::MemberLeft { member_id, addr });
    }
}
