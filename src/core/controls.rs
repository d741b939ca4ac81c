//! Runtime-mutable traffic controls
//!
//! One instance is shared by every connection of a forwarder. Pause and
//! throttle settings are consumed by the copy loops at read time; the
//! elapsed-time reference feeds the throttle rate math.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::hooks::Direction;

/// Bounded re-check interval of the throttle wait loop, so pause and abort
/// stay responsive while a long delay elapses.
const THROTTLE_RECHECK_MS: u64 = 200;

/// Pause state for one direction.
///
/// Setting the pause is a plain flag flip. Clearing it must drain the waiter
/// list under the same lock that guards registration: a connection that
/// checks the flag while a clear is in progress either sees the cleared flag
/// and never registers, or registers before the drain and is woken by it.
struct PauseControl {
    paused: AtomicBool,
    waiters: Mutex<Vec<Arc<Notify>>>,
}

impl PauseControl {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        self.paused.store(false, Ordering::SeqCst);
        for waiter in waiters.drain(..) {
            waiter.notify_one();
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn wait_if_paused(&self, waiter: &Arc<Notify>, cancel: &CancellationToken) {
        let registered = {
            let mut waiters = self.waiters.lock().unwrap();
            if self.paused.load(Ordering::SeqCst) {
                waiters.push(Arc::clone(waiter));
                true
            } else {
                false
            }
        };

        if registered {
            // notify_one stores a permit, so a wakeup issued between
            // registration and this await is not lost.
            tokio::select! {
                _ = waiter.notified() => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// Shared pause/throttle state and elapsed-time reference
pub struct TrafficControls {
    pause: [PauseControl; 2],
    throttle_enabled: [AtomicBool; 2],
    throttle_rate: [AtomicU64; 2],
    started_at: Instant,
}

impl TrafficControls {
    pub fn new() -> Self {
        Self {
            pause: [PauseControl::new(), PauseControl::new()],
            throttle_enabled: [AtomicBool::new(false), AtomicBool::new(false)],
            throttle_rate: [AtomicU64::new(0), AtomicU64::new(0)],
            started_at: Instant::now(),
        }
    }

    /// Pause or resume one direction. Resuming releases every waiting
    /// connection exactly once.
    pub fn set_paused(&self, direction: Direction, paused: bool) {
        let control = &self.pause[direction.index()];
        if paused {
            control.pause();
        } else {
            control.resume();
        }
    }

    pub fn is_paused(&self, direction: Direction) -> bool {
        self.pause[direction.index()].is_paused()
    }

    pub(crate) async fn wait_if_paused(
        &self,
        direction: Direction,
        waiter: &Arc<Notify>,
        cancel: &CancellationToken,
    ) {
        self.pause[direction.index()]
            .wait_if_paused(waiter, cancel)
            .await;
    }

    /// Enable or disable throttling for one direction. `bytes_per_second`
    /// takes effect on the next read of that direction.
    pub fn set_throttle(&self, direction: Direction, enabled: bool, bytes_per_second: u64) {
        let index = direction.index();
        self.throttle_rate[index].store(bytes_per_second, Ordering::SeqCst);
        self.throttle_enabled[index].store(enabled, Ordering::SeqCst);
    }

    /// The active throttle rate for a direction, if any
    pub fn throttle_rate(&self, direction: Direction) -> Option<u64> {
        let index = direction.index();
        if !self.throttle_enabled[index].load(Ordering::SeqCst) {
            return None;
        }
        match self.throttle_rate[index].load(Ordering::SeqCst) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Milliseconds since this forwarder started; the reference all
    /// throttle computations share
    pub fn elapsed_millis(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Delay after reading `bytes` so the direction stays within its
    /// configured rate. Sleeps in bounded increments and gives up early when
    /// the connection is cancelled.
    pub(crate) async fn throttle_delay(
        &self,
        direction: Direction,
        bytes: usize,
        cancel: &CancellationToken,
    ) {
        let Some(rate) = self.throttle_rate(direction) else {
            return;
        };

        let delay_ms = (bytes as u64).saturating_mul(1000) / rate;
        let start = self.elapsed_millis();

        loop {
            let elapsed = self.elapsed_millis().saturating_sub(start);
            let remaining = delay_ms.saturating_sub(elapsed);
            if remaining == 0 {
                break;
            }
            let wait = remaining.min(THROTTLE_RECHECK_MS);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}

impl Default for TrafficControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_not_paused_returns_immediately() {
        let controls = TrafficControls::new();
        let waiter = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        timeout(
            Duration::from_millis(50),
            controls.wait_if_paused(Direction::ClientToRemote, &waiter, &cancel),
        )
        .await
        .expect("must not block when not paused");
    }

    #[tokio::test]
    async fn test_pause_blocks_and_resume_releases() {
        let controls = Arc::new(TrafficControls::new());
        controls.set_paused(Direction::ClientToRemote, true);
        assert!(controls.is_paused(Direction::ClientToRemote));

        let waiter = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let controls_clone = Arc::clone(&controls);
        let waiter_clone = Arc::clone(&waiter);
        let cancel_clone = cancel.clone();
        let blocked = tokio::spawn(async move {
            controls_clone
                .wait_if_paused(Direction::ClientToRemote, &waiter_clone, &cancel_clone)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        controls.set_paused(Direction::ClientToRemote, false);
        timeout(Duration::from_millis(200), blocked)
            .await
            .expect("resume must release the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_before_wait_is_not_lost() {
        // A waiter registered while paused must be woken even when the
        // notify fires before it reaches the await point.
        let controls = Arc::new(TrafficControls::new());
        controls.set_paused(Direction::RemoteToClient, true);

        let waiter = Arc::new(Notify::new());
        {
            let mut waiters = controls.pause[Direction::RemoteToClient.index()]
                .waiters
                .lock()
                .unwrap();
            waiters.push(Arc::clone(&waiter));
        }
        controls.set_paused(Direction::RemoteToClient, false);

        // The permit stored by notify_one completes this immediately.
        timeout(Duration::from_millis(100), waiter.notified())
            .await
            .expect("stored permit must complete the wait");
    }

    #[tokio::test]
    async fn test_pause_directions_independent() {
        let controls = TrafficControls::new();
        controls.set_paused(Direction::ClientToRemote, true);
        assert!(controls.is_paused(Direction::ClientToRemote));
        assert!(!controls.is_paused(Direction::RemoteToClient));
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_waiter() {
        let controls = Arc::new(TrafficControls::new());
        controls.set_paused(Direction::ClientToRemote, true);

        let waiter = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        timeout(
            Duration::from_millis(100),
            controls.wait_if_paused(Direction::ClientToRemote, &waiter, &cancel),
        )
        .await
        .expect("cancelled connection must not stay parked");
    }

    #[test]
    fn test_throttle_rate_gating() {
        let controls = TrafficControls::new();
        assert_eq!(controls.throttle_rate(Direction::ClientToRemote), None);

        controls.set_throttle(Direction::ClientToRemote, true, 1024);
        assert_eq!(controls.throttle_rate(Direction::ClientToRemote), Some(1024));
        assert_eq!(controls.throttle_rate(Direction::RemoteToClient), None);

        controls.set_throttle(Direction::ClientToRemote, false, 1024);
        assert_eq!(controls.throttle_rate(Direction::ClientToRemote), None);

        // Enabled with a zero rate behaves as disabled
        controls.set_throttle(Direction::ClientToRemote, true, 0);
        assert_eq!(controls.throttle_rate(Direction::ClientToRemote), None);
    }

    #[tokio::test]
    async fn test_throttle_delay_disabled_is_instant() {
        let controls = TrafficControls::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        controls
            .throttle_delay(Direction::ClientToRemote, 1024 * 1024, &cancel)
            .await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_throttle_delay_approximates_rate() {
        let controls = TrafficControls::new();
        let cancel = CancellationToken::new();
        // 4 KiB at 8 KiB/s should take roughly 500 ms.
        controls.set_throttle(Direction::ClientToRemote, true, 8 * 1024);

        let start = Instant::now();
        controls
            .throttle_delay(Direction::ClientToRemote, 4 * 1024, &cancel)
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_throttle_delay_cancelled_early() {
        let controls = TrafficControls::new();
        let cancel = CancellationToken::new();
        controls.set_throttle(Direction::ClientToRemote, true, 1);

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        // 1 MiB at 1 B/s would otherwise wait for days.
        controls
            .throttle_delay(Direction::ClientToRemote, 1024 * 1024, &cancel)
            .await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_elapsed_millis_monotonic() {
        let controls = TrafficControls::new();
        let a = controls.elapsed_millis();
        let b = controls.elapsed_millis();
        assert!(b >= a);
    }
}
