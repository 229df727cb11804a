//! Clock-offset estimation between a member and its coordinator.
//!
//! Members cannot assume their wall clock agrees with the coordinator's
//! (phones drift by seconds), so each member keeps a smoothed estimate of
//! `offset = coordinator_wall - local_wall` built from SYNC_TIME round trips:
//!
//! ```text
//! member                          coordinator
//!   t_send (monotonic) ── SYNC_TIME ──►
//!                      ◄── SYNC_TIME{server_now} ──
//!   t_recv (monotonic)
//!
//! rtt            = max(0, t_recv - t_send)
//! client_mid     = wall_now - rtt / 2
//! sample_offset  = server_now - client_mid
//! offset         = sample_offset                          (first sample)
//!                = round(prev * (1 - α) + sample * α)     (α = 0.25)
//! ```
//!
//! Round-trip time is measured on the monotonic clock only; the wall clock
//! may jump. Every update is persisted through an [`OffsetStore`] before it
//! is published to readers.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::storage::{MemoryOffsetStore, OffsetRecord, OffsetStore, StoreError};

/// Weight of a new sample in the exponential moving average.
pub const SMOOTHING_ALPHA: f64 = 0.25;

/// Source of wall-clock epoch milliseconds.
pub trait WallClock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The host's real-time clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(before_epoch) => -(before_epoch.duration().as_millis() as i64),
        }
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Offset implied by a single round trip, assuming symmetric latency.
pub fn sample_offset(t_send_ms: i64, t_recv_ms: i64, server_now: i64, wall_now: i64) -> i64 {
    let rtt = t_recv_ms.saturating_sub(t_send_ms).max(0);
    let client_midpoint = wall_now.saturating_sub(rtt / 2);
    server_now.saturating_sub(client_midpoint)
}

/// One step of the exponential moving average, rounding halves upward.
pub fn smooth(previous: i64, sample: i64) -> i64 {
    let blended = previous as f64 * (1.0 - SMOOTHING_ALPHA) + sample as f64 * SMOOTHING_ALPHA;
    (blended + 0.5).floor() as i64
}

/// Smoothed coordinator-minus-local clock offset, shared across tasks.
///
/// Constructed once by the process composition root and handed to every
/// member session as `Arc<OffsetEstimator>`. Reads are lock-free; updates
/// serialize on an internal mutex so each read-modify-write-persist cycle
/// is atomic with respect to other updates.
pub struct OffsetEstimator {
    offset_ms: AtomicI64,
    has_sample: AtomicBool,
    update_lock: Mutex<()>,
    store: Arc<dyn OffsetStore>,
    clock: Arc<dyn WallClock>,
}

impl OffsetEstimator {
    /// Restore from `store`. A missing record starts at offset 0 with no sample.
    pub fn load(
        store: Arc<dyn OffsetStore>,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, StoreError> {
        let record = store.load()?.unwrap_or_default();
        if record.has_sample {
            log::info!("Restored clock offset {} ms from storage", record.offset_ms);
        }
        Ok(Self {
            offset_ms: AtomicI64::new(if record.has_sample { record.offset_ms } else { 0 }),
            has_sample: AtomicBool::new(record.has_sample),
            update_lock: Mutex::new(()),
            store,
            clock,
        })
    }

    /// Non-durable estimator on the system clock.
    pub fn in_memory() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Non-durable estimator on the given clock.
    pub fn with_clock(clock: Arc<dyn WallClock>) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            has_sample: AtomicBool::new(false),
            update_lock: Mutex::new(()),
            store: Arc::new(MemoryOffsetStore::new()),
            clock,
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample.load(Ordering::Acquire)
    }

    pub fn record(&self) -> OffsetRecord {
        OffsetRecord {
            offset_ms: self.offset_ms(),
            has_sample: self.has_sample(),
        }
    }

    /// Local wall time translated into coordinator time.
    pub fn to_server_time(&self, local_wall_ms: i64) -> i64 {
        local_wall_ms.saturating_add(self.offset_ms())
    }

    /// Current coordinator time as seen from this device.
    pub fn now_server(&self) -> i64 {
        self.to_server_time(self.clock.now_millis())
    }

    /// Time left until `target_epoch_ms` (coordinator time). Zero when the
    /// target has passed or no sample exists yet.
    pub fn delay_until(&self, target_epoch_ms: i64) -> Duration {
        if !self.has_sample() {
            return Duration::ZERO;
        }
        let remaining = target_epoch_ms.saturating_sub(self.now_server());
        Duration::from_millis(remaining.max(0) as u64)
    }

    /// Fold in a round trip measured with [`Instant`]s; wall time is read now.
    pub fn record_round_trip(&self, sent_at: Instant, received_at: Instant, server_now: i64) -> i64 {
        let rtt_ms = received_at.saturating_duration_since(sent_at).as_millis() as i64;
        self.update_offset_sample(0, rtt_ms, server_now, self.clock.now_millis())
    }

    /// Fold in one sample and persist the result. Returns the new offset.
    ///
    /// `t_send_ms`/`t_recv_ms` are monotonic readings; `wall_now` is the local
    /// wall clock at receipt.
    pub fn update_offset_sample(
        &self,
        t_send_ms: i64,
        t_recv_ms: i64,
        server_now: i64,
        wall_now: i64,
    ) -> i64 {
        let sample = sample_offset(t_send_ms, t_recv_ms, server_now, wall_now);

        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        let updated = if self.has_sample() {
            smooth(self.offset_ms(), sample)
        } else {
            sample
        };

        let record = OffsetRecord {
            offset_ms: updated,
            has_sample: true,
        };
        if let Err(e) = self.store.save(&record) {
            log::warn!("Failed to persist clock offset {updated} ms: {e}");
        }

        self.offset_ms.store(updated, Ordering::Release);
        self.has_sample.store(true, Ordering::Release);
        log::debug!(
            "Clock offset sample {sample} ms (rtt {} ms) -> offset {updated} ms",
            t_recv_ms.saturating_sub(t_send_ms).max(0)
        );
        updated
    }

    /// Explicit reinitialization: forget every sample.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.store.save(&OffsetRecord::default())?;
        self.has_sample.store(false, Ordering::Release);
        self.offset_ms.store(0, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for OffsetEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetEstimator")
            .field("offset_ms", &self.offset_ms())
            .field("has_sample", &self.has_sample())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator_at(now: i64) -> (OffsetEstimator, Arc<ManualClock>, Arc<MemoryOffsetStore>) {
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryOffsetStore::new());
        let estimator = OffsetEstimator::load(store.clone(), clock.clone()).unwrap();
        (estimator, clock, store)
    }

    #[test]
    fn test_first_sample_taken_verbatim() {
        let (estimator, _clock, store) = estimator_at(100_500);
        assert!(!estimator.has_sample());

        let offset = estimator.update_offset_sample(1000, 1400, 5_000_000, 100_500);

        // rtt 400, midpoint 100_300
        assert_eq!(offset, 4_899_700);
        assert_eq!(estimator.offset_ms(), 4_899_700);
        assert!(estimator.has_sample());
        assert_eq!(
            store.load().unwrap(),
            Some(OffsetRecord {
                offset_ms: 4_899_700,
                has_sample: true
            })
        );
    }

    #[test]
    fn test_smoothing_weights_new_sample_by_quarter() {
        assert_eq!(smooth(1000, 2000), 1250);
        assert_eq!(smooth(0, 3), 1); // 0.75 rounds up
        assert_eq!(smooth(-1000, -2000), -1250);

        let (estimator, _clock, _store) = estimator_at(0);
        // Zero rtt and wall time 0 make sample == server_now.
        estimator.update_offset_sample(0, 0, 1000, 0);
        let offset = estimator.update_offset_sample(0, 0, 2000, 0);
        assert_eq!(offset, 1250);
    }

    #[test]
    fn test_negative_rtt_clamped() {
        assert_eq!(sample_offset(500, 100, 10_000, 4_000), 6_000);
    }

    #[test]
    fn test_no_sample_means_zero_delay() {
        let (estimator, _clock, _store) = estimator_at(1_000);
        assert_eq!(estimator.delay_until(1_000_000), Duration::ZERO);
        assert_eq!(estimator.now_server(), 1_000);
    }

    #[test]
    fn test_delay_uses_offset() {
        let (estimator, clock, _store) = estimator_at(20_000);
        estimator.update_offset_sample(0, 0, 120_000, 20_000);
        assert_eq!(estimator.offset_ms(), 100_000);
        assert_eq!(estimator.now_server(), 120_000);
        assert_eq!(estimator.to_server_time(25_000), 125_000);

        assert_eq!(estimator.delay_until(130_000), Duration::from_millis(10_000));
        clock.advance(12_000);
        assert_eq!(estimator.delay_until(130_000), Duration::ZERO);
    }

    #[test]
    fn test_extreme_wire_values_saturate() {
        assert_eq!(sample_offset(i64::MIN, i64::MAX, i64::MAX, 0), i64::MAX);
        assert_eq!(sample_offset(0, 0, i64::MIN, 1_000), i64::MIN);

        let (estimator, clock, _store) = estimator_at(0);
        estimator.update_offset_sample(0, 0, i64::MAX, 0);
        assert_eq!(estimator.offset_ms(), i64::MAX);
        clock.advance(5_000);
        assert_eq!(estimator.now_server(), i64::MAX);
        assert_eq!(estimator.delay_until(i64::MIN), Duration::ZERO);

        estimator.reset().unwrap();
        estimator.update_offset_sample(0, 0, i64::MIN, 5_000);
        assert_eq!(estimator.now_server(), i64::MIN + 5_000);
        assert_eq!(estimator.delay_until(i64::MAX), Duration::from_millis(i64::MAX as u64));
    }

    #[test]
    fn test_restores_persisted_record() {
        let store = Arc::new(MemoryOffsetStore::with_record(OffsetRecord {
            offset_ms: -42,
            has_sample: true,
        }));
        let estimator = OffsetEstimator::load(store, Arc::new(ManualClock::new(0))).unwrap();
        assert!(estimator.has_sample());
        assert_eq!(estimator.offset_ms(), -42);

        // Second sample is smoothed against the restored value.
        let offset = estimator.update_offset_sample(0, 0, 958, 0);
        assert_eq!(offset, smooth(-42, 958));
    }

    #[test]
    fn test_record_without_sample_ignores_stale_offset() {
        let store = Arc::new(MemoryOffsetStore::with_record(OffsetRecord {
            offset_ms: 777,
            has_sample: false,
        }));
        let estimator = OffsetEstimator::load(store, Arc::new(ManualClock::new(0))).unwrap();
        assert_eq!(estimator.offset_ms(), 0);
        assert!(!estimator.has_sample());
    }

    #[test]
    fn test_reset_forgets_samples() {
        let (estimator, _clock, store) = estimator_at(0);
        estimator.update_offset_sample(0, 0, 500, 0);
        estimator.reset().unwrap();
        assert!(!estimator.has_sample());
        assert_eq!(estimator.offset_ms(), 0);
        assert_eq!(store.load().unwrap(), Some(OffsetRecord::default()));
    }

    #[test]
    fn test_round_trip_with_instants() {
        let (estimator, _clock, _store) = estimator_at(50_000);
        let sent = Instant::now();
        let offset = estimator.record_round_trip(sent, sent, 80_000);
        assert_eq!(offset, 30_000);
    }

    #[test]
    fn test_concurrent_updates_all_land() {
        let (estimator, _clock, _store) = estimator_at(0);
        let estimator = Arc::new(estimator);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let est = estimator.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        est.update_offset_sample(0, 0, 4_000, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Every sample equals 4000, so the average converges there exactly.
        assert_eq!(estimator.offset_ms(), 4_000);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
