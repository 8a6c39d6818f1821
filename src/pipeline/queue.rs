use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer queue feeding the enrichment workers.
///
/// A full or closed queue hands the item back to the caller instead of
/// dropping it.
pub struct EnrichmentQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> EnrichmentQueue<T> {
    pub fn new(capacity: usize) -> Self {
        EnrichmentQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue if there is room
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed || state.items.len() >= self.capacity {
                return Err(item);
            }
            state.items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, evicting the oldest item when full.
    ///
    /// Returns the evicted item, or `Err(item)` when the queue is closed.
    pub fn push_evicting(&self, item: T) -> Result<Option<T>, T> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };
        self.not_empty.notify_one();
        Ok(evicted)
    }

    /// Enqueue, waiting up to `timeout` for room
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut item = item;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) if self.is_closed() => return Err(rejected),
                Err(rejected) => item = rejected,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(item);
            }
        }
    }

    /// Wait for the next item; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.state.lock();
                match state.items.pop_front() {
                    None if state.closed => return None,
                    popped => popped,
                }
            };

            if let Some(item) = popped {
                self.not_full.notify_one();
                return Some(item);
            }
            notified.await;
        }
    }

    /// Stop accepting items and wake every waiter
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove everything still queued
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_waiters();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[test]
    fn test_try_push_full() {
        let queue = EnrichmentQueue::new(2);
        assert_ok!(queue.try_push(1));
        assert_ok!(queue.try_push(2));
        assert_eq!(queue.try_push(3), Err(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_push_evicting_returns_oldest() {
        let queue = EnrichmentQueue::new(2);
        assert_eq!(queue.push_evicting(1), Ok(None));
        assert_eq!(queue.push_evicting(2), Ok(None));
        assert_eq!(queue.push_evicting(3), Ok(Some(1)));
        assert_eq!(queue.drain(), vec![2, 3]);

        queue.close();
        assert_eq!(queue.push_evicting(4), Err(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_gives_item_back() {
        let queue = EnrichmentQueue::new(1);
        queue.try_push(1).unwrap();

        let started = Instant::now();
        assert_eq!(queue.push_timeout(2, Duration::from_millis(250)).await, Err(2));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_succeeds_when_room_frees() {
        let queue = Arc::new(EnrichmentQueue::new(1));
        queue.try_push(1).unwrap();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                queue.pop().await
            })
        };

        assert_ok!(queue.push_timeout(2, Duration::from_secs(1)).await);
        assert_eq!(consumer.await.unwrap(), Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_wakes_consumers() {
        let queue = Arc::new(EnrichmentQueue::<u32>::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_queue_still_drains() {
        let queue = EnrichmentQueue::new(4);
        queue.try_push(7).unwrap();
        queue.close();
        assert_eq!(queue.try_push(8), Err(8));
        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
    }
}
