//! The request inbox: an unbounded FIFO with one producer per connection and
//! a single consumer (the test task). The consumer side is a timed blocking
//! receive; closing the inbox wakes a pending consumer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecvError {
    TimedOut,
    Closed,
}

pub(crate) struct Inbox<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Inbox<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item. Items pushed after close are dropped.
    pub(crate) fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().expect("inbox lock");
            if inner.closed {
                return;
            }
            inner.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Pop the next item, waiting up to `timeout`.
    pub(crate) async fn recv(&self, timeout: Duration) -> Result<T, RecvError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for notification before checking the queue, so a push
            // or close between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("inbox lock");
                if let Some(item) = inner.queue.pop_front() {
                    return Ok(item);
                }
                if inner.closed {
                    return Err(RecvError::Closed);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RecvError::TimedOut);
            }
        }
    }

    /// Pop the head item if `f` produces a value for it. Used when a newly
    /// registered autoresponder should absorb an already-queued request.
    pub(crate) fn pop_head_map<R>(&self, f: impl FnOnce(&T) -> Option<R>) -> Option<(T, R)> {
        let mut inner = self.inner.lock().expect("inbox lock");
        let result = f(inner.queue.front()?)?;
        let head = inner.queue.pop_front()?;
        Some((head, result))
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("inbox lock").queue.len()
    }

    /// Close the inbox; pending and future receives observe closure.
    pub(crate) fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("inbox lock");
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let inbox = Inbox::new();
        inbox.push(1);
        inbox.push(2);
        inbox.push(3);
        assert_eq!(inbox.recv(Duration::from_secs(1)).await, Ok(1));
        assert_eq!(inbox.recv(Duration::from_secs(1)).await, Ok(2));
        assert_eq!(inbox.recv(Duration::from_secs(1)).await, Ok(3));
    }

    #[tokio::test]
    async fn recv_times_out_when_empty() {
        let inbox: Inbox<i32> = Inbox::new();
        assert_eq!(
            inbox.recv(Duration::from_millis(20)).await,
            Err(RecvError::TimedOut)
        );
    }

    #[tokio::test]
    async fn push_wakes_pending_recv() {
        let inbox = Arc::new(Inbox::new());
        let consumer = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.push(7);
        assert_eq!(consumer.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn close_wakes_pending_recv() {
        let inbox: Arc<Inbox<i32>> = Arc::new(Inbox::new());
        let consumer = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.recv(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.close();
        assert_eq!(consumer.await.unwrap(), Err(RecvError::Closed));
    }

    #[tokio::test]
    async fn queued_items_drain_before_closure_reported() {
        let inbox = Inbox::new();
        inbox.push(1);
        inbox.close();
        assert_eq!(inbox.recv(Duration::from_millis(20)).await, Ok(1));
        assert_eq!(
            inbox.recv(Duration::from_millis(20)).await,
            Err(RecvError::Closed)
        );
    }

    #[tokio::test]
    async fn pop_head_map_only_inspects_the_head() {
        let inbox = Inbox::new();
        inbox.push(1);
        inbox.push(2);
        assert_eq!(inbox.pop_head_map(|&n| (n == 2).then_some("two")), None);
        assert_eq!(
            inbox.pop_head_map(|&n| (n == 1).then_some("one")),
            Some((1, "one"))
        );
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let inbox = Inbox::new();
        inbox.close();
        inbox.push(1);
        assert_eq!(inbox.len(), 0);
    }
}
