//! Bounded FIFO feeding an SSE writer.
//!
//! Outgoing server messages ride one of two channel flavors:
//!
//! * [`FullPolicy::Wait`] — the sender suspends until the reader drains a
//!   slot. Used for POST-scoped response channels.
//! * [`FullPolicy::DropOldest`] — the sender evicts the oldest queued item
//!   and never suspends. Used for the per-session unsolicited channel, so a
//!   missing GET listener can never block the dispatcher.
//!
//! Senders are multi-writer; receivers are competing consumers over the same
//! queue. [`Sender::close`] (or dropping the last sender, or dropping the
//! last receiver) closes the channel: receivers drain what is queued and
//! then observe end-of-stream, senders fail fast.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPolicy {
    /// Suspend the sender until capacity frees up.
    Wait,
    /// Evict the oldest queued item and enqueue without suspending.
    DropOldest,
}

/// Returned by [`Sender::send`] when the channel is closed; carries the
/// undelivered value back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    senders: usize,
    receivers: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: FullPolicy,
    readable: Notify,
    writable: Notify,
}

impl<T> Shared<T> {
    fn close(&self) {
        let mut state = self.state.lock().expect("channel lock poisoned");
        state.closed = true;
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

pub struct Sender<T>(Arc<Shared<T>>);

pub struct Receiver<T>(Arc<Shared<T>>);

/// Create a bounded channel with the given capacity and full-queue policy.
pub fn channel<T>(capacity: usize, policy: FullPolicy) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be non-zero");
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            closed: false,
            senders: 1,
            receivers: 1,
        }),
        capacity,
        policy,
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (Sender(shared.clone()), Receiver(shared))
}

impl<T> Sender<T> {
    /// Enqueue a value. With [`FullPolicy::DropOldest`] this never suspends;
    /// with [`FullPolicy::Wait`] it suspends until a slot frees up.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        loop {
            // Register interest before inspecting state so a concurrent
            // notify between the check and the await cannot be lost.
            let writable = self.0.writable.notified();
            {
                let mut state = self.0.state.lock().expect("channel lock poisoned");
                if state.closed {
                    return Err(SendError(value));
                }
                if state.queue.len() < self.0.capacity {
                    state.queue.push_back(value);
                    drop(state);
                    self.0.readable.notify_waiters();
                    return Ok(());
                }
                if self.0.policy == FullPolicy::DropOldest {
                    state.queue.pop_front();
                    state.queue.push_back(value);
                    drop(state);
                    self.0.readable.notify_waiters();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Close the channel. Receivers drain queued values, then see `None`.
    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().expect("channel lock poisoned").closed
    }
}

impl<T> Receiver<T> {
    /// Receive the next value, or `None` once the channel is closed and
    /// drained. Cloned receivers compete for values.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let readable = self.0.readable.notified();
            {
                let mut state = self.0.state.lock().expect("channel lock poisoned");
                if let Some(value) = state.queue.pop_front() {
                    drop(state);
                    self.0.writable.notify_waiters();
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0
            .state
            .lock()
            .expect("channel lock poisoned")
            .senders += 1;
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.0.state.lock().expect("channel lock poisoned");
            state.senders -= 1;
            state.senders == 0
        };
        if last {
            self.0.close();
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0
            .state
            .lock()
            .expect("channel lock poisoned")
            .receivers += 1;
        Receiver(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.0.state.lock().expect("channel lock poisoned");
            state.receivers -= 1;
            state.receivers == 0
        };
        if last {
            // No reader will ever drain the queue; fail pending sends so
            // wait-mode writers do not hang on an aborted stream.
            self.0.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let (tx, rx) = channel(1, FullPolicy::DropOldest);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_wait_policy_suspends_until_drained() {
        let (tx, rx) = channel(1, FullPolicy::Wait);
        tx.send(1).await.unwrap();

        let pending = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(2).await }
        });
        // The second send cannot complete while the queue is full.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(1));
        timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, rx) = channel(4, FullPolicy::Wait);
        tx.send("a").await.unwrap();
        tx.send("b").await.unwrap();
        tx.close();
        assert_eq!(tx.send("c").await, Err(SendError("c")));
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_last_sender_drop_closes() {
        let (tx, rx) = channel::<u8>(1, FullPolicy::Wait);
        let tx2 = tx.clone();
        drop(tx);
        drop(tx2);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_receiver_drop_fails_blocked_sender() {
        let (tx, rx) = channel(1, FullPolicy::Wait);
        tx.send(1).await.unwrap();
        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(2).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);
        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert_eq!(result, Err(SendError(2)));
    }
}
