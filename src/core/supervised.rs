//! Supervised fire-and-forget tasks
//!
//! Detached tasks (connections, watchdogs) must not die silently: a panic in
//! one of them is a bug, and swallowing it would hide the bug while the
//! process keeps running in an unknown state. `spawn` wraps the task so a
//! panic terminates the process. Expected failures (I/O errors, timeouts,
//! TLS failures) are handled inside the tasks themselves and never reach
//! this layer.

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::RwLock;
use tokio::task::JoinHandle;

use crate::logger::log;

type FailureHandler = Box<dyn Fn(&str) + Send + Sync>;

static FAILURE_HANDLER: RwLock<Option<FailureHandler>> = RwLock::new(None);

/// Replace the process-terminating failure handler.
///
/// Intended for tests that need to observe the fail-fast path without
/// killing the test harness.
pub fn set_failure_handler(handler: impl Fn(&str) + Send + Sync + 'static) {
    *FAILURE_HANDLER.write().unwrap() = Some(Box::new(handler));
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn handle_failure(message: &str) {
    if let Some(handler) = FAILURE_HANDLER.read().unwrap().as_ref() {
        handler(message);
        return;
    }
    log::error!(error = %message, "Unhandled panic in supervised task, terminating");
    std::process::abort();
}

/// Spawn a detached task that fail-fasts on panic.
///
/// Use this instead of `tokio::spawn` for any long-running task whose
/// JoinHandle is not awaited.
pub fn spawn<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            handle_failure(&panic_message(panic));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_supervised_panic_invokes_failure_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        set_failure_handler(move |msg| {
            assert!(msg.contains("boom"));
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handle = spawn(async {
            panic!("boom");
        });
        handle.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_supervised_normal_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let handle = spawn(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42u32)), "unknown panic payload");
    }
}
