use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Bounded FIFO shared between producers on bridging tasks and one draining task.
///
/// Producers never wait: [`BoundedQueue::put`] hands the item back when the queue is full.
/// The consumer waits for a batch with [`BoundedQueue::mget`].
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pushes items back at the head of the queue, keeping their order.
    ///
    /// Used to requeue a batch whose persistence failed. Returns how many items did not fit.
    pub fn mput(&self, batch: Vec<T>) -> usize {
        let mut dropped = 0;
        {
            let mut items = self.items();
            for item in batch.into_iter().rev() {
                if items.len() >= self.capacity {
                    dropped += 1;
                    continue;
                }
                items.push_front(item);
            }
        }
        self.notify.notify_one();
        dropped
    }

    /// Waits up to `wait` for at least one item, then returns at most `size` of them.
    ///
    /// An empty vector means nothing arrived in time.
    pub async fn mget(&self, size: usize, wait: Duration) -> Vec<T> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut items = self.items();
                if !items.is_empty() {
                    let take = size.min(items.len());
                    return items.drain(..take).collect();
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_and_mget() {
        let queue = BoundedQueue::new(3);
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        queue.put(3).unwrap();
        assert_eq!(queue.put(4), Err(4));

        let batch = queue.mget(2, Duration::from_millis(10)).await;
        assert_eq!(batch, vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_mget_times_out_empty() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(3);
        let batch = queue.mget(5, Duration::from_millis(20)).await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_mget_wakes_on_put() {
        let queue = Arc::new(BoundedQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.mget(10, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put("a").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake up")
            .unwrap();
        assert_eq!(batch, vec!["a"]);
    }

    #[tokio::test]
    async fn test_mput_requeues_at_front() {
        let queue = BoundedQueue::new(3);
        queue.put(3).unwrap();
        assert_eq!(queue.mput(vec![1, 2]), 0);
        assert_eq!(queue.mget(3, Duration::from_millis(10)).await, vec![1, 2, 3]);

        queue.put(9).unwrap();
        queue.put(9).unwrap();
        assert_eq!(queue.mput(vec![7, 8]), 1);
        assert_eq!(queue.len(), 3);
    }
}
