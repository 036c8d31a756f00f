//! Bounded stream queues between pipeline stages
//!
//! Each queue holds one item type, never reorders, and applies an overflow
//! policy fixed at construction:
//!
//! - inbound audio drops the oldest buffered chunk
//! - generated text blocks the producer
//! - outbound audio blocks the producer up to a stall timeout

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

/// What happens when a producer pushes into a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered item to make room
    DropOldest,
    /// Wait until a consumer makes room
    Block,
    /// Wait up to the given duration, then fail with [`QueueError::Stalled`]
    BlockFor(Duration),
}

/// Queue operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue was closed
    #[error("queue closed")]
    Closed,

    /// Non-blocking push into a full blocking queue
    #[error("queue full")]
    Full,

    /// Producer waited longer than the stall timeout
    #[error("queue stalled for {0:?}")]
    Stalled(Duration),
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded, ordered, multi-producer queue
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    emptied: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue; a zero capacity is raised to one
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            emptied: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Push an item, applying the overflow policy
    ///
    /// Returns `false` when an older item was evicted to make room.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue is closed, or
    /// [`QueueError::Stalled`] if a bounded wait expires
    pub async fn push(&self, item: T) -> Result<bool, QueueError> {
        match self.policy {
            OverflowPolicy::DropOldest => self.push_evicting(item),
            OverflowPolicy::Block => self.push_waiting(item).await,
            OverflowPolicy::BlockFor(limit) => {
                tokio::time::timeout(limit, self.push_waiting(item))
                    .await
                    .map_err(|_| QueueError::Stalled(limit))?
            }
        }
    }

    /// Push without waiting
    ///
    /// Drop-oldest queues always accept; blocking queues fail when full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] or [`QueueError::Full`]
    pub fn try_push(&self, item: T) -> Result<bool, QueueError> {
        if self.policy == OverflowPolicy::DropOldest {
            return self.push_evicting(item);
        }

        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.items.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(true)
    }

    fn push_evicting(&self, item: T) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let mut kept = true;
        while inner.items.len() >= self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
            kept = false;
        }
        inner.items.push_back(item);
        drop(inner);

        self.not_empty.notify_one();
        Ok(kept)
    }

    async fn push_waiting(&self, item: T) -> Result<bool, QueueError> {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                if inner.items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        inner.items.push_back(item);
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(true);
                }
            }

            notified.await;
        }
    }

    /// Pop the oldest item, waiting while the queue is empty
    ///
    /// Items buffered before [`close`](Self::close) stay poppable.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue is closed and empty
    pub async fn pop(&self) -> Result<T, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    let now_empty = inner.items.is_empty();
                    drop(inner);
                    self.not_full.notify_one();
                    if now_empty {
                        self.emptied.notify_waiters();
                    }
                    return Ok(item);
                }
                if inner.closed {
                    return Err(QueueError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        let item = inner.items.pop_front();
        let now_empty = inner.items.is_empty();
        drop(inner);

        if item.is_some() {
            self.not_full.notify_one();
            if now_empty {
                self.emptied.notify_waiters();
            }
        }
        item
    }

    /// Remove and return everything buffered
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_waiters();
            self.emptied.notify_waiters();
        }
        items
    }

    /// Wait until consumers have taken every buffered item or the queue closes
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                if inner.items.is_empty() || inner.closed {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Close the queue and wake every waiter; idempotent
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        self.emptied.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items evicted under [`OverflowPolicy::DropOldest`] so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn drop_oldest_evicts_exactly_one() {
        let q = BoundedQueue::new(3, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert!(q.push(i).await.unwrap());
        }
        assert!(!q.push(3).await.unwrap());

        assert_eq!(q.dropped(), 1);
        assert_eq!(q.drain(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(BoundedQueue::new(2, OverflowPolicy::Block));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.push("a").await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), "a");
    }

    #[tokio::test]
    async fn blocking_push_resumes_after_pop() {
        let q = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        q.push(1).await.unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(2).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(q.pop().await.unwrap(), 1);
        assert!(producer.await.unwrap().unwrap());
        assert_eq!(q.pop().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_reports_stall() {
        let limit = Duration::from_millis(200);
        let q = BoundedQueue::new(1, OverflowPolicy::BlockFor(limit));
        q.push(1).await.unwrap();

        assert_eq!(q.push(2).await, Err(QueueError::Stalled(limit)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let q: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::task::yield_now().await;
        q.close();
        q.close();
        assert_eq!(consumer.await.unwrap(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let q = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        q.push(1).await.unwrap();
        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(2).await })
        };
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(producer.await.unwrap(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn buffered_items_survive_close() {
        let q = BoundedQueue::new(4, OverflowPolicy::Block);
        q.push(1).await.unwrap();
        q.close();

        assert_eq!(q.push(2).await, Err(QueueError::Closed));
        assert_eq!(q.pop().await, Ok(1));
        assert_eq!(q.pop().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn wait_empty_returns_once_consumed() {
        let q = Arc::new(BoundedQueue::new(4, OverflowPolicy::Block));
        q.wait_empty().await;

        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_empty().await })
        };
        tokio::task::yield_now().await;

        assert_eq!(q.pop().await, Ok(1));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert_eq!(q.pop().await, Ok(2));
        waiter.await.unwrap();
    }

    #[test]
    fn try_push_on_full_blocking_queue() {
        let q = BoundedQueue::new(1, OverflowPolicy::Block);
        assert_eq!(q.try_push(1), Ok(true));
        assert_eq!(q.try_push(2), Err(QueueError::Full));
        assert_eq!(q.try_pop(), Some(1));
        assert!(q.is_empty());
    }

    #[test]
    fn zero_capacity_is_raised() {
        let q: BoundedQueue<u8> = BoundedQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(q.capacity(), 1);
    }
}
