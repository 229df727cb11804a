//! Headless stand-in for the media player.
//!
//! A scheduled start sleeps for its local delay, logs the start instant and,
//! when a loop length is configured, reports the end of the cycle so the
//! session can schedule the next synchronized start. A new schedule replaces
//! whatever was pending or playing.

use std::time::Duration;

use moviesync_core::SystemClock;
use moviesync_core::WallClock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Player {
    loop_length: Option<Duration>,
    finished_tx: mpsc::Sender<()>,
    current: Option<JoinHandle<()>>,
    starts: u64,
}

impl Player {
    /// Returns the player and the receiver of end-of-cycle notifications.
    pub fn new(loop_length: Option<Duration>) -> (Self, mpsc::Receiver<()>) {
        let (finished_tx, finished_rx) = mpsc::channel(8);
        (
            Self {
                loop_length,
                finished_tx,
                current: None,
                starts: 0,
            },
            finished_rx,
        )
    }

    /// Start playback after `delay`, replacing any pending or running cycle.
    pub fn schedule(&mut self, target_epoch_ms: Option<i64>, delay: Duration) {
        self.stop();
        self.starts += 1;
        let cycle = self.starts;
        let loop_length = self.loop_length;
        let finished_tx = self.finished_tx.clone();

        self.current = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match target_epoch_ms {
                Some(target) => log::info!(
                    "▶ Playback #{cycle} started at local {} (target {target})",
                    SystemClock.now_millis()
                ),
                None => log::info!("▶ Playback #{cycle} started (no target, immediate)"),
            }
            if let Some(length) = loop_length {
                tokio::time::sleep(length).await;
                log::info!("■ Playback #{cycle} reached the end of the loop");
                let _ = finished_tx.send(()).await;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.current.take() {
            task.abort();
        }
    }

    pub fn starts(&self) -> u64 {
        self.starts
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_loop_reports_finish() {
        let (mut player, mut finished) = Player::new(Some(Duration::from_millis(20)));
        player.schedule(Some(130_000), Duration::from_millis(10));
        assert_eq!(player.starts(), 1);
        timeout(Duration::from_secs(2), finished.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_cancels_previous_cycle() {
        let (mut player, mut finished) = Player::new(Some(Duration::from_millis(10)));
        player.schedule(None, Duration::from_secs(60));
        player.schedule(None, Duration::ZERO);
        assert_eq!(player.starts(), 2);

        timeout(Duration::from_secs(2), finished.recv())
            .await
            .unwrap()
            .unwrap();
        // Only the second cycle ever finishes.
        assert!(timeout(Duration::from_millis(100), finished.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_no_loop_length_never_finishes() {
        let (mut player, mut finished) = Player::new(None);
        player.schedule(Some(1), Duration::ZERO);
        assert!(timeout(Duration::from_millis(100), finished.recv()).await.is_err());
    }
}
