//! Helpers for driving a client call from the test task.
//!
//! Client operations block until the server replies, so the test cannot
//! issue the call and service the request from one task. [`go`] schedules
//! the call on a background task and hands back a [`GoHandle`]; the test
//! services requests, then [`GoHandle::wait`]s for the call's outcome.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future` on a background task.
pub fn go<F>(future: F) -> GoHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    GoHandle {
        handle: Some(tokio::spawn(future)),
    }
}

/// Synonym for [`go`]. The scoped guarantee is the handle's own: dropping a
/// [`GoHandle`] unawaited cancels the background task at scope exit.
pub fn going<F>(future: F) -> GoHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    go(future)
}

/// Outcome of a [`go`] call: join it with [`wait`](Self::wait), which
/// returns the result or re-raises the task's panic.
pub struct GoHandle<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> GoHandle<T> {
    /// Join the background task, waiting up to 10 seconds.
    pub async fn wait(self) -> T {
        self.wait_timeout(JOIN_TIMEOUT).await
    }

    pub async fn wait_timeout(mut self, timeout: Duration) -> T {
        let handle = self.handle.take().expect("go handle already waited");
        match tokio::time::timeout(timeout, handle).await {
            Err(_) => panic!("timed out waiting for background task"),
            Ok(Ok(value)) => value,
            Ok(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Ok(Err(_)) => panic!("background task was cancelled"),
        }
    }
}

impl<T> Drop for GoHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Poll `predicate` every 10 ms until it holds, failing after 10 seconds.
pub async fn wait_until(predicate: impl FnMut() -> bool, description: &str) {
    wait_until_timeout(predicate, description, Duration::from_secs(10)).await;
}

pub async fn wait_until_timeout(
    mut predicate: impl FnMut() -> bool,
    description: &str,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {description}");
}
