//! Idle-timeout enforcement for asynchronous socket operations
//!
//! Asynchronous reads and writes have no native per-operation timeout, and a
//! cancelled read does not unblock the peer. Each guard runs a persistent
//! watchdog task: when an operation starts, the watchdog races the timeout
//! window against "the operation finished", "restart the window (activity
//! was observed elsewhere)" and "the guard is shutting down". On expiry it
//! invokes the abort callback, which is expected to cancel the connection so
//! the in-flight operation unwinds.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::supervised;

/// Callback invoked when the timeout elapses. Must be cheap and non-blocking;
/// it typically flags the connection as aborted and cancels its token.
pub type AbortCallback = Box<dyn Fn(io::Error) + Send + Sync>;

enum Signal {
    /// The guarded operation completed (successfully or not)
    Finished,
    /// Restart the timeout window without treating it as elapsed
    Reset,
    /// Stop the watchdog task
    Quit,
}

struct Inner {
    timeout: Duration,
    start_tx: mpsc::UnboundedSender<()>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    watchdog: JoinHandle<()>,
}

/// Wraps one logical asynchronous operation at a time with an idle timeout.
///
/// A guard with no timeout configured executes operations directly and keeps
/// no watchdog task.
pub struct TimeoutGuard {
    inner: Option<Inner>,
}

impl TimeoutGuard {
    /// Create a guard. `operation` names the guarded socket operation
    /// ("read" or "write") for the timeout error message.
    pub fn new(
        timeout: Option<Duration>,
        operation: &'static str,
        on_timeout: AbortCallback,
    ) -> Self {
        let Some(timeout) = timeout else {
            return Self { inner: None };
        };

        let (start_tx, mut start_rx) = mpsc::unbounded_channel::<()>();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<Signal>();

        let watchdog = supervised::spawn(async move {
            loop {
                // Idle: wait for the next operation to start.
                if start_rx.recv().await.is_none() {
                    return;
                }

                // Armed: race the window against finish/reset/quit.
                'armed: loop {
                    tokio::select! {
                        sig = signal_rx.recv() => match sig {
                            Some(Signal::Finished) | None => break 'armed,
                            Some(Signal::Reset) => continue 'armed,
                            Some(Signal::Quit) => return,
                        },
                        _ = tokio::time::sleep(timeout) => {
                            on_timeout(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!(
                                    "the socket {} operation exceeded the timeout of {} ms",
                                    operation,
                                    timeout.as_millis()
                                ),
                            ));

                            // The abort is forcibly cancelling the operation;
                            // wait for it to actually unwind before re-arming.
                            match signal_rx.recv().await {
                                Some(Signal::Finished) | None => break 'armed,
                                Some(Signal::Reset) => continue 'armed,
                                Some(Signal::Quit) => return,
                            }
                        }
                    }
                }
            }
        });

        Self {
            inner: Some(Inner {
                timeout,
                start_tx,
                signal_tx,
                watchdog,
            }),
        }
    }

    /// The configured timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.as_ref().map(|i| i.timeout)
    }

    /// Execute one operation under the timeout.
    ///
    /// The finished signal is sent even if the returned future is dropped
    /// mid-poll, so the watchdog always disarms.
    pub async fn run<T, F>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let Some(inner) = &self.inner else {
            return op.await;
        };

        let _ = inner.start_tx.send(());
        let signal_tx = inner.signal_tx.clone();
        let _finished = scopeguard::guard((), move |_| {
            let _ = signal_tx.send(Signal::Finished);
        });
        op.await
    }

    /// Restart the timeout window of an in-flight operation.
    ///
    /// Called when activity elsewhere proves the guarded peer is still alive.
    pub fn reset(&self) {
        if let Some(inner) = &self.inner {
            let _ = inner.signal_tx.send(Signal::Reset);
        }
    }

    /// Stop the watchdog and wait for it to exit.
    ///
    /// The quit signal is queued before the start channel is poked so a
    /// watchdog parked on the start channel wakes straight into it; the
    /// channels are only torn down after the task has fully exited.
    pub async fn shutdown(self) {
        let Some(inner) = self.inner else {
            return;
        };
        let _ = inner.signal_tx.send(Signal::Quit);
        let _ = inner.start_tx.send(());
        let _ = inner.watchdog.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    fn counting_guard(timeout: Option<Duration>) -> (TimeoutGuard, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let guard = TimeoutGuard::new(
            timeout,
            "read",
            Box::new(move |err| {
                assert_eq!(err.kind(), io::ErrorKind::TimedOut);
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (guard, fired)
    }

    #[tokio::test]
    async fn test_fast_operation_does_not_time_out() {
        let (guard, fired) = counting_guard(Some(Duration::from_millis(500)));
        let value = guard.run(async { 42 }).await;
        assert_eq!(value, 42);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_operation_times_out_once() {
        let (guard, fired) = counting_guard(Some(Duration::from_millis(100)));
        guard.run(sleep(Duration::from_millis(350))).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_consecutive_operations_rearm() {
        let (guard, fired) = counting_guard(Some(Duration::from_millis(200)));
        for _ in 0..3 {
            guard.run(sleep(Duration::from_millis(20))).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        guard.run(sleep(Duration::from_millis(350))).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_defers_expiry() {
        let (guard, fired) = counting_guard(Some(Duration::from_millis(300)));

        let op = guard.run(sleep(Duration::from_millis(450)));
        let resetter = async {
            sleep(Duration::from_millis(250)).await;
            guard.reset();
        };
        tokio::join!(op, resetter);

        // Window restarted at 250 ms, so expiry would be at 550 ms; the
        // operation finished at 450 ms.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_guard_passes_through() {
        let (guard, fired) = counting_guard(None);
        assert_eq!(guard.timeout(), None);
        let start = Instant::now();
        let value = guard.run(async { "ok" }).await;
        assert_eq!(value, "ok");
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_operation_disarms_watchdog() {
        let (guard, fired) = counting_guard(Some(Duration::from_millis(150)));

        // Drop the guarded future mid-flight, as a cancelled relay leg does.
        tokio::select! {
            _ = guard.run(std::future::pending::<()>()) => unreachable!(),
            _ = sleep(Duration::from_millis(30)) => {}
        }

        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        guard.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_is_deterministic() {
        let (guard, _fired) = counting_guard(Some(Duration::from_millis(100)));
        guard.shutdown().await;
    }
}
