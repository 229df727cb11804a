//! Member side of a playback group.
//!
//! ```text
//! join():  connect ─► CONNECT ─► wait CONNECTED ─► Joined ─► SYNC_TIME
//!
//!              ┌──────────── receive task ────────────┐
//! socket ────► │ SYNC_TIME{server_now} → estimator    │ ──► TimeSynced
//!              │ PLAY_COMMAND{target}  → local delay  │ ──► PlayScheduled
//!              │ EOF / error           → Stopped      │ ──► Disconnected
//!              └──────────────────────────────────────┘
//! request_play / notify_loop_finished / sync_time ──► outbox ──► writer task ──► socket
//! ```
//!
//! The coordinator answers `SYNC_TIME` requests in the order it reads them,
//! so the k-th reply belongs to the k-th request. Requests are numbered as
//! they enter the outbox and replies as they arrive; only the reply whose
//! number matches the pending exchange is used. A reply to an exchange that
//! timed out or was superseded by a newer `sync_time` call is discarded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::addr::with_default_port;
use crate::broadcast::{pump_outbox, OutboundLine};
use crate::clock::OffsetEstimator;
use crate::protocol::{write_message, Message, MessageReader, DEFAULT_PORT};
use crate::session::{emit, SessionError, SessionEvent};

/// Member configuration.
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// `host:port` of the coordinator
    pub coordinator_addr: String,
    pub connect_timeout: Duration,
    /// How long to wait for CONNECTED after sending CONNECT
    pub handshake_timeout: Duration,
    /// How long one SYNC_TIME exchange may take
    pub sync_timeout: Duration,
    /// Re-run time sync periodically while joined (off when `None`)
    pub resync_interval: Option<Duration>,
    pub outbox_capacity: usize,
}

impl MemberConfig {
    pub fn new(coordinator_addr: impl Into<String>) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            resync_interval: None,
            outbox_capacity: 64,
        }
    }

    /// Target `host` on the well-known port unless it already names one.
    pub fn for_host(host: &str) -> Self {
        Self::new(with_default_port(host, DEFAULT_PORT))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Idle,
    Connecting,
    Joined,
    Stopped,
}

/// Socket halves of a connection that completed the handshake.
type Handshaken = (MessageReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf);

struct PendingSync {
    seq: u64,
    sent_at: Instant,
    reply: oneshot::Sender<i64>,
}

/// State shared between the session handle and its tasks.
struct Inner {
    config: MemberConfig,
    estimator: Arc<OffsetEstimator>,
    events: mpsc::Sender<SessionEvent>,
    state: RwLock<MemberState>,
    outbox: RwLock<Option<mpsc::Sender<OutboundLine>>>,
    pending: Mutex<Option<PendingSync>>,
    /// SYNC_TIME requests queued on the current connection
    requests_sent: AtomicU64,
    /// SYNC_TIME replies read on the current connection
    replies_seen: AtomicU64,
}

impl Inner {
    async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let outbox = self
            .outbox
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)?;
        outbox
            .send(Arc::new(message.encode()?))
            .await
            .map_err(|_| SessionError::NotConnected)
    }

    async fn sync_time(&self) -> Result<i64, SessionError> {
        let (seq, reply_rx) = {
            // Held across the enqueue so request numbers follow outbox order.
            let mut pending = self.pending.lock().await;
            let seq = self.requests_sent.load(Ordering::Acquire);
            self.send(&Message::SyncTimeRequest).await?;
            self.requests_sent.store(seq + 1, Ordering::Release);

            let (reply_tx, reply_rx) = oneshot::channel();
            if let Some(older) = pending.replace(PendingSync {
                seq,
                sent_at: Instant::now(),
                reply: reply_tx,
            }) {
                log::debug!("SYNC_TIME #{} superseded by #{seq}", older.seq);
            }
            (seq, reply_rx)
        };

        match timeout(self.config.sync_timeout, reply_rx).await {
            Ok(Ok(offset)) => Ok(offset),
            // Slot dropped: replaced by a newer exchange, or disconnected.
            Ok(Err(_)) => match *self.state.read().await {
                MemberState::Joined => Err(SessionError::SyncSuperseded),
                _ => Err(SessionError::NotConnected),
            },
            Err(_) => {
                self.clear_pending(seq).await;
                log::warn!(
                    "No SYNC_TIME reply within {:?}, keeping offset {} ms",
                    self.config.sync_timeout,
                    self.estimator.offset_ms()
                );
                Err(SessionError::SyncTimeout)
            }
        }
    }

    async fn clear_pending(&self, seq: u64) {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().is_some_and(|p| p.seq == seq) {
            *pending = None;
        }
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::SyncTimeReply { server_now } => {
                let received_at = Instant::now();
                let mut slot = self.pending.lock().await;
                let index = self.replies_seen.fetch_add(1, Ordering::AcqRel);
                if server_now <= 0 {
                    log::debug!("Ignoring SYNC_TIME reply #{index} with server_now {server_now}");
                    return;
                }
                let pending = match slot.take() {
                    Some(p) if p.seq == index => p,
                    other => {
                        *slot = other;
                        log::debug!("Discarding stale SYNC_TIME reply #{index}");
                        return;
                    }
                };
                drop(slot);
                let offset = self
                    .estimator
                    .record_round_trip(pending.sent_at, received_at, server_now);
                log::info!(
                    "Time synced: offset {offset} ms (rtt {} ms)",
                    received_at.duration_since(pending.sent_at).as_millis()
                );
                emit(&self.events, SessionEvent::TimeSynced { offset_ms: offset });
                let _ = pending.reply.send(offset);
            }
            Message::PlayCommand { target_epoch_ms } => {
                let target = target_epoch_ms.filter(|t| *t > 0);
                let delay = match target {
                    Some(t) => self.estimator.delay_until(t),
                    None => Duration::ZERO,
                };
                if target.is_some() && !self.estimator.has_sample() {
                    log::warn!("Play command before any time sync, starting immediately");
                }
                log::info!("Play scheduled: target {target:?}, local delay {} ms", delay.as_millis());
                emit(
                    &self.events,
                    SessionEvent::PlayScheduled {
                        target_epoch_ms: target,
                        delay,
                    },
                );
            }
            Message::Error { message } => {
                log::warn!(
                    "Coordinator reported an error: {}",
                    message.as_deref().unwrap_or("(no detail)")
                );
            }
            other => log::debug!("Ignoring unexpected {} from coordinator", other.kind()),
        }
    }

    /// Move to `Stopped` and notify once; later calls do nothing.
    async fn mark_stopped(&self) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, MemberState::Stopped | MemberState::Idle) {
                return;
            }
            *state = MemberState::Stopped;
        }
        self.outbox.write().await.take();
        self.pending.lock().await.take();
        emit(&self.events, SessionEvent::Disconnected);
    }
}

/// A member's connection to its coordinator.
pub struct MemberSession {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    coordinator: Option<SocketAddr>,
}

impl MemberSession {
    pub fn new(
        config: MemberConfig,
        estimator: Arc<OffsetEstimator>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                estimator,
                events,
                state: RwLock::new(MemberState::Idle),
                outbox: RwLock::new(None),
                pending: Mutex::new(None),
                requests_sent: AtomicU64::new(0),
                replies_seen: AtomicU64::new(0),
            }),
            shutdown_tx,
            tasks: Vec::new(),
            coordinator: None,
        }
    }

    /// Connect and handshake. On any failure the session returns to `Idle`.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.write().await;
            if *state != MemberState::Idle {
                return Err(SessionError::AlreadyActive);
            }
            *state = MemberState::Connecting;
        }

        match self.connect().await {
            Ok((halves, addr)) => {
                self.start_tasks(halves, addr).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to join {}: {e}", self.inner.config.coordinator_addr);
                *self.inner.state.write().await = MemberState::Idle;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(Handshaken, SocketAddr), SessionError> {
        let config = &self.inner.config;
        let stream = match timeout(
            config.connect_timeout,
            TcpStream::connect(config.coordinator_addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SessionError::Connection(e)),
            Err(_) => {
                return Err(SessionError::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        let addr = stream.peer_addr().map_err(SessionError::Connection)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = MessageReader::new(BufReader::new(read_half));
        write_message(&mut write_half, &Message::Connect).await?;

        match timeout(config.handshake_timeout, reader.next_message()).await {
            Ok(Ok(Some(Message::Connected))) => Ok(((reader, write_half), addr)),
            Ok(Ok(Some(other))) => Err(SessionError::Handshake(format!(
                "expected CONNECTED, got {}",
                other.kind()
            ))),
            Ok(Ok(None)) => Err(SessionError::Handshake(
                "coordinator closed the connection".to_string(),
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SessionError::Handshake("timed out waiting for CONNECTED".to_string())),
        }
    }

    async fn start_tasks(
        &mut self,
        (reader, write_half): Handshaken,
        addr: SocketAddr,
    ) {
        let (outbox_tx, outbox_rx) = mpsc::channel(self.inner.config.outbox_capacity);
        self.inner.requests_sent.store(0, Ordering::Release);
        self.inner.replies_seen.store(0, Ordering::Release);
        *self.inner.outbox.write().await = Some(outbox_tx);
        *self.inner.state.write().await = MemberState::Joined;
        self.coordinator = Some(addr);

        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = pump_outbox(write_half, outbox_rx).await {
                log::warn!("Write to coordinator failed: {e}");
            }
        }));

        log::info!("Joined coordinator at {addr}");
        emit(&self.inner.events, SessionEvent::Joined { coordinator: addr });

        self.tasks.push(tokio::spawn(receive_loop(
            reader,
            self.inner.clone(),
            self.shutdown_tx.subscribe(),
        )));

        let inner = self.inner.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = inner.sync_time().await {
                log::warn!("Initial time sync failed: {e}");
            }
        }));

        if let Some(period) = self.inner.config.resync_interval {
            self.tasks.push(tokio::spawn(resync_loop(
                self.inner.clone(),
                period,
                self.shutdown_tx.subscribe(),
            )));
        }
    }

    /// One SYNC_TIME exchange. Returns the updated offset.
    pub async fn sync_time(&self) -> Result<i64, SessionError> {
        self.inner.sync_time().await
    }

    /// Ask the coordinator to schedule a synchronized start.
    pub async fn request_play(&self) -> Result<(), SessionError> {
        self.inner.send(&Message::play_request()).await
    }

    /// Tell the coordinator this device finished one playback cycle.
    pub async fn notify_loop_finished(&self) -> Result<(), SessionError> {
        self.inner.send(&Message::LoopEnd).await
    }

    /// 1 while joined (this device), 0 otherwise.
    pub async fn connected_count(&self) -> usize {
        match *self.inner.state.read().await {
            MemberState::Joined => 1,
            _ => 0,
        }
    }

    pub async fn state(&self) -> MemberState {
        *self.inner.state.read().await
    }

    pub fn coordinator_addr(&self) -> Option<SocketAddr> {
        self.coordinator
    }

    pub fn estimator(&self) -> &Arc<OffsetEstimator> {
        &self.inner.estimator
    }

    /// Close the connection. Idempotent.
    pub async fn leave(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.inner.mark_stopped().await;
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for MemberSession {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn receive_loop(
    mut reader: MessageReader<BufReader<OwnedReadHalf>>,
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = reader.next_message() => next,
        };
        match next {
            Ok(Some(message)) => inner.dispatch(message).await,
            Ok(None) => {
                log::info!("Coordinator closed the connection");
                break;
            }
            Err(e) => {
                log::warn!("Dropping coordinator connection: {e}");
                break;
            }
        }
    }
    inner.mark_stopped().await;
}

async fn resync_loop(inner: Arc<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    // First tick is immediate; join already ran the initial sync.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if *inner.state.read().await != MemberState::Joined {
                    break;
                }
                if let Err(e) = inner.sync_time().await {
                    log::debug!("Periodic time sync failed: {e}");
                }
            }
        }
    }
}
