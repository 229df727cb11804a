//! Synchronized fan-out of play commands to the member set.
//!
//! Every node starts playback against one absolute coordinator timestamp
//! rather than a relative "play in N ms", so delivery jitter between members
//! does not turn into playback skew:
//!
//! ```text
//! now      = coordinator wall clock
//! nearest  = now rounded to the nearest 10 s tick
//! target   = nearest            if nearest > now + margin
//!          = nearest + 10 s     otherwise
//! ```
//!
//! Each member owns an outbox (bounded mpsc) drained by a writer task that
//! holds the socket's write half. Broadcasting enumerates the registry under
//! its read lock and hands pre-encoded bytes to every outbox with `try_send`,
//! so the pass is atomic with respect to joins and leaves but never waits on
//! a socket. A member whose outbox is full or closed is skipped and counted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError};

/// Spacing of the wall-clock ticks play targets snap to.
pub const BOUNDARY_MS: i64 = 10_000;

/// Minimum lead every device gets between the command and the target.
pub const MIN_MARGIN_MS: i64 = 3_000;

/// Encoded line queued for one connection.
pub type OutboundLine = Arc<Vec<u8>>;

/// Pick the shared start instant for a play request issued at `now_ms`.
///
/// The result is always a multiple of [`BOUNDARY_MS`] and strictly later than
/// `now_ms`; a tick closer than `min_margin_ms` is skipped.
pub fn compute_target(now_ms: i64, min_margin_ms: i64) -> i64 {
    let nearest = (now_ms + BOUNDARY_MS / 2).div_euclid(BOUNDARY_MS) * BOUNDARY_MS;
    if nearest > now_ms + min_margin_ms {
        nearest
    } else {
        nearest + BOUNDARY_MS
    }
}

/// Drain `outbox` into `writer` until every sender is dropped or a write fails.
pub async fn pump_outbox<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbox: mpsc::Receiver<OutboundLine>,
) -> std::io::Result<()> {
    while let Some(line) = outbox.recv().await {
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

/// One accepted, handshaken member connection.
#[derive(Debug)]
pub struct MemberRecord {
    id: Uuid,
    addr: SocketAddr,
    outbox: mpsc::Sender<OutboundLine>,
    live: Arc<AtomicBool>,
}

impl MemberRecord {
    pub fn new(addr: SocketAddr, outbox: mpsc::Sender<OutboundLine>) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            outbox,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared flag the connection's writer clears when its socket fails.
    pub fn live_flag(&self) -> Arc<AtomicBool> {
        self.live.clone()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.outbox.is_closed()
    }

    /// Non-blocking enqueue. False if the outbox is full or closed.
    fn offer(&self, line: &OutboundLine) -> bool {
        self.is_live() && self.outbox.try_send(line.clone()).is_ok()
    }
}

/// Per-pass delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    broadcasts: AtomicU64,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The coordinator's membership set.
///
/// Joins, leaves and broadcast enumeration all go through one `RwLock`, so a
/// broadcast sees a consistent snapshot: a member is either in the pass
/// exactly once or not at all.
#[derive(Default)]
pub struct MemberRegistry {
    members: RwLock<HashMap<Uuid, MemberRecord>>,
    stats: AtomicBroadcastStats,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, record: MemberRecord) {
        let mut members = self.members.write().await;
        members.insert(record.id, record);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<MemberRecord> {
        let mut members = self.members.write().await;
        members.remove(id)
    }

    /// Drop every record (closing their outboxes). Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut members = self.members.write().await;
        let removed = members.len();
        members.clear();
        removed
    }

    /// Members whose sockets are still usable.
    pub async fn live_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.is_live())
            .count()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.members.read().await.contains_key(id)
    }

    pub async fn addrs(&self) -> Vec<SocketAddr> {
        self.members.read().await.values().map(|m| m.addr).collect()
    }

    /// Encode once and offer the line to every member in a single pass.
    pub async fn broadcast(&self, message: &Message) -> Result<FanOut, ProtocolError> {
        let line: OutboundLine = Arc::new(message.encode()?);
        let mut fan_out = FanOut::default();

        let members = self.members.read().await;
        for member in members.values() {
            if member.offer(&line) {
                fan_out.delivered += 1;
            } else {
                fan_out.failed += 1;
                log::warn!(
                    "Skipping member {} ({}): outbox full or closed",
                    member.id,
                    member.addr
                );
            }
        }
        drop(members);

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .messages_sent
            .fetch_add(fan_out.delivered as u64, Ordering::Relaxed);
        self.stats
            .messages_dropped
            .fetch_add(fan_out.failed as u64, Ordering::Relaxed);
        Ok(fan_out)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.live_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_target_skips_tick_inside_margin() {
        // nearest tick 120_000 is behind now + margin
        assert_eq!(compute_target(123_456, MIN_MARGIN_MS), 130_000);
    }

    #[test]
    fn test_target_uses_nearest_tick_when_far_enough() {
        // 115_000 rounds up to 120_000, 5 s ahead
        assert_eq!(compute_target(115_000, MIN_MARGIN_MS), 120_000);
        // 116_999 -> 120_000 is 3_001 ahead
        assert_eq!(compute_target(116_999, MIN_MARGIN_MS), 120_000);
        // 117_000 -> exactly at the margin, skipped
        assert_eq!(compute_target(117_000, MIN_MARGIN_MS), 130_000);
    }

    #[test]
    fn test_target_on_exact_tick() {
        assert_eq!(compute_target(120_000, MIN_MARGIN_MS), 130_000);
    }

    #[test]
    fn test_target_invariants_sweep() {
        let base = 1_700_000_000_000;
        for step in 0..2_000 {
            let now = base + step * 37;
            let target = compute_target(now, MIN_MARGIN_MS);
            assert!(target > now + MIN_MARGIN_MS, "now={now} target={target}");
            assert!(target <= now + MIN_MARGIN_MS + BOUNDARY_MS);
            assert_eq!(target % BOUNDARY_MS, 0);
        }
    }

    #[tokio::test]
    async fn test_registry_add_remove() {
        let registry = MemberRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let record = MemberRecord::new(addr(1000), tx);
        let id = record.id();

        registry.add(record).await;
        assert_eq!(registry.live_count().await, 1);
        assert!(registry.contains(&id).await);

        assert!(registry.remove(&id).await.is_some());
        assert_eq!(registry.live_count().await, 0);
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let registry = MemberRegistry::new();
        let mut receivers = Vec::new();
        for port in 0..3 {
            let (tx, rx) = mpsc::channel(4);
            registry.add(MemberRecord::new(addr(2000 + port), tx)).await;
            receivers.push(rx);
        }

        let fan_out = registry.broadcast(&Message::play_at(130_000)).await.unwrap();
        assert_eq!(fan_out, FanOut { delivered: 3, failed: 0 });

        let expected = Message::play_at(130_000).encode().unwrap();
        for rx in &mut receivers {
            let line = rx.recv().await.unwrap();
            assert_eq!(*line, expected);
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_and_closed_outboxes() {
        let registry = MemberRegistry::new();

        let (healthy_tx, mut healthy_rx) = mpsc::channel(4);
        registry.add(MemberRecord::new(addr(3000), healthy_tx)).await;

        let (full_tx, _full_rx) = mpsc::channel(1);
        full_tx.try_send(Arc::new(vec![0])).unwrap();
        registry.add(MemberRecord::new(addr(3001), full_tx)).await;

        let (closed_tx, closed_rx) = mpsc::channel(4);
        drop(closed_rx);
        registry.add(MemberRecord::new(addr(3002), closed_tx)).await;

        let fan_out = registry.broadcast(&Message::LoopEnd).await.unwrap();
        assert_eq!(fan_out, FanOut { delivered: 1, failed: 2 });
        assert!(healthy_rx.recv().await.is_some());

        let stats = registry.stats().await;
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 2);
        // closed outbox no longer counts as live
        assert_eq!(stats.active_members, 2);
    }

    #[tokio::test]
    async fn test_dead_writer_not_counted() {
        let registry = MemberRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let record = MemberRecord::new(addr(4000), tx);
        let live = record.live_flag();
        registry.add(record).await;

        live.store(false, Ordering::Release);
        assert_eq!(registry.live_count().await, 0);
        let fan_out = registry.broadcast(&Message::LoopEnd).await.unwrap();
        assert_eq!(fan_out.failed, 1);
    }

    #[tokio::test]
    async fn test_clear_closes_outboxes() {
        let registry = MemberRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.add(MemberRecord::new(addr(5000), tx)).await;

        assert_eq!(registry.clear().await, 1);
        assert!(rx.recv().await.is_none(), "sender dropped with the record");
    }

    #[tokio::test]
    async fn test_pump_outbox_writes_in_order() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Arc::new(Message::Connected.encode().unwrap())).await.unwrap();
        tx.send(Arc::new(Message::LoopEnd.encode().unwrap())).await.unwrap();
        drop(tx);

        let mut sink = Vec::new();
        pump_outbox(&mut sink, rx).await.unwrap();
        assert_eq!(
            String::from_utf8(sink).unwrap(),
            "{\"type\":\"CONNECTED\"}\n{\"type\":\"LOOP_END\"}\n"
        );
    }
}
