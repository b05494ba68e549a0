//! Work queues connecting producers, worker pools and consumers
//!
//! A [`WorkQueue`] is a multi-producer, multi-consumer FIFO. It carries
//! [`QueueItem::Task`] payloads and the reserved [`QueueItem::EndOfStream`]
//! marker that tells exactly one worker to exit.
//!
//! Completion is tracked separately from consumption: every `get()` must be
//! followed by exactly one `mark_done()`, and `join()` resolves once every
//! item that was put has been marked done.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::error;

use crate::error::QueueError;

/// An entry of a [`WorkQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem<T> {
    /// A unit of work
    Task(T),
    /// Tells the worker that receives it to exit
    EndOfStream,
}

impl<T> QueueItem<T> {
    /// Whether this is the end-of-stream marker
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// The payload, if this is a task
    pub fn into_task(self) -> Option<T> {
        match self {
            Self::Task(task) => Some(task),
            Self::EndOfStream => None,
        }
    }
}

/// Bounded or unbounded FIFO queue with completion tracking
///
/// `put` suspends while a bounded queue is full. Producers are admitted in
/// the order they started waiting, so enqueue order is preserved across
/// producers. `get` suspends until an item is available and is cancel-safe:
/// dropping a pending `get` never loses an item.
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use kgflow_runtime::{QueueItem, WorkQueue};
///
/// let queue = WorkQueue::bounded("documents", 16);
/// queue.put("doc-1").await;
/// queue.put_end_of_stream().await;
///
/// assert_eq!(queue.get().await, QueueItem::Task("doc-1"));
/// queue.mark_done().unwrap();
/// assert!(queue.get().await.is_end_of_stream());
/// queue.mark_done().unwrap();
///
/// queue.join().await;
/// # });
/// ```
pub struct WorkQueue<T> {
    name: String,
    items: Mutex<VecDeque<QueueItem<T>>>,
    /// One permit per item in `items`
    available: Semaphore,
    /// One permit per free slot; `None` when unbounded
    slots: Option<Semaphore>,
    capacity: Option<usize>,
    pending: AtomicUsize,
    /// End-of-stream markers ever put
    end_of_stream: AtomicUsize,
    drained: Notify,
}

impl<T> WorkQueue<T> {
    /// Create a queue, bounded when `capacity` is set
    pub fn new(name: impl Into<String>, capacity: Option<usize>) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            slots: capacity.map(Semaphore::new),
            capacity,
            pending: AtomicUsize::new(0),
            end_of_stream: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Create a bounded queue
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, Some(capacity))
    }

    /// Create an unbounded queue
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Queue name (used in logs and errors)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of buffered items (`None` = unbounded)
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether no item is buffered
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Items put but not yet marked done
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// End-of-stream markers put on this queue so far, consumed or not
    ///
    /// Worker pools use this to account for markers a producer put
    /// alongside their own.
    pub fn end_of_stream_count(&self) -> usize {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    /// Enqueue a task, suspending while the queue is full
    pub async fn put(&self, task: T) {
        self.push(QueueItem::Task(task)).await;
    }

    /// Enqueue one end-of-stream marker
    pub async fn put_end_of_stream(&self) {
        self.push(QueueItem::EndOfStream).await;
    }

    async fn push(&self, item: QueueItem<T>) {
        if let Some(slots) = &self.slots {
            // Slot permits are handed back by `take`, never through drop.
            // The semaphore is never closed.
            if let Ok(permit) = slots.acquire().await {
                permit.forget();
            }
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        if item.is_end_of_stream() {
            self.end_of_stream.fetch_add(1, Ordering::SeqCst);
        }
        self.items.lock().push_back(item);
        self.available.add_permits(1);
    }

    /// Dequeue the oldest item, suspending until one is available
    pub async fn get(&self) -> QueueItem<T> {
        loop {
            if let Ok(permit) = self.available.acquire().await {
                permit.forget();
            }
            if let Some(item) = self.take() {
                return item;
            }
        }
    }

    /// Dequeue the oldest item if one is available right now
    pub fn try_get(&self) -> Option<QueueItem<T>> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.take()
    }

    fn take(&self) -> Option<QueueItem<T>> {
        let item = self.items.lock().pop_front()?;
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        Some(item)
    }

    /// Remove up to `max` buffered end-of-stream markers, newest first
    ///
    /// Removed markers count as done. Used once no worker is left to
    /// consume them. Returns how many were removed.
    pub fn discard_end_of_stream(&self, max: usize) -> usize {
        let removed = {
            let mut items = self.items.lock();
            let mut removed = 0;
            let mut index = items.len();
            while index > 0 && removed < max {
                index -= 1;
                if items[index].is_end_of_stream() {
                    items.remove(index);
                    removed += 1;
                }
            }
            removed
        };

        for _ in 0..removed {
            // A failed acquire means a `get` already holds the permit and
            // will find the item gone
            if let Ok(permit) = self.available.try_acquire() {
                permit.forget();
            }
            if let Some(slots) = &self.slots {
                slots.add_permits(1);
            }
            if let Err(err) = self.mark_done() {
                error!(error = %err, "Discarded marker was not pending");
            }
        }
        removed
    }

    /// Record that one dequeued item has been fully handled
    pub fn mark_done(&self) -> Result<(), QueueError> {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| QueueError::NotPending(self.name.clone()))?;

        if previous == 1 {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Wait until every item put so far has been marked done
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::unbounded("fifo");
        for i in 0..5 {
            queue.put(i).await;
        }
        queue.put_end_of_stream().await;

        for i in 0..5 {
            assert_eq!(queue.get().await, QueueItem::Task(i));
        }
        assert!(queue.get().await.is_end_of_stream());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_put_suspends_when_full() {
        let queue = WorkQueue::bounded("bounded", 1);
        queue.put(1).await;

        let mut blocked = tokio_test::task::spawn(queue.put(2));
        assert_pending!(blocked.poll());

        assert_eq!(queue.get().await, QueueItem::Task(1));
        assert!(blocked.is_woken());
        assert_ready!(blocked.poll());
        drop(blocked);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, QueueItem::Task(2));
    }

    #[tokio::test]
    async fn test_get_suspends_until_put() {
        let queue = WorkQueue::unbounded("wait");

        let mut waiting = tokio_test::task::spawn(queue.get());
        assert_pending!(waiting.poll());

        queue.put("a").await;
        assert!(waiting.is_woken());
        assert_eq!(assert_ready!(waiting.poll()), QueueItem::Task("a"));
    }

    #[tokio::test]
    async fn test_dropped_get_loses_nothing() {
        let queue = WorkQueue::unbounded("cancel");

        let mut waiting = tokio_test::task::spawn(queue.get());
        assert_pending!(waiting.poll());
        drop(waiting);

        queue.put(7).await;
        assert_eq!(queue.try_get(), Some(QueueItem::Task(7)));
        assert_eq!(queue.try_get(), None);
    }

    #[tokio::test]
    async fn test_join_waits_for_mark_done() {
        let queue = Arc::new(WorkQueue::unbounded("join"));
        queue.put(1).await;
        queue.put(2).await;

        let mut join = tokio_test::task::spawn(queue.join());
        assert_pending!(join.poll());

        queue.get().await;
        queue.mark_done().unwrap();
        assert_pending!(join.poll());

        queue.get().await;
        queue.mark_done().unwrap();
        assert!(join.is_woken());
        assert_ready!(join.poll());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_returns() {
        let queue: WorkQueue<()> = WorkQueue::unbounded("empty");
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .expect("join on an empty queue should resolve");
    }

    #[test]
    fn test_mark_done_without_pending() {
        let queue: WorkQueue<()> = WorkQueue::unbounded("strict");
        assert_eq!(
            queue.mark_done(),
            Err(QueueError::NotPending("strict".into()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_producers_and_consumers() {
        let queue = Arc::new(WorkQueue::bounded("mpmc", 4));
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25 {
                    queue.put(p * 100 + i).await;
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match queue.get().await {
                        QueueItem::Task(v) => seen.push(v),
                        QueueItem::EndOfStream => {
                            queue.mark_done().unwrap();
                            return seen;
                        }
                    }
                    queue.mark_done().unwrap();
                }
            }));
        }

        for producer in producers {
            producer.await.unwrap();
        }
        for _ in 0..3 {
            queue.put_end_of_stream().await;
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        let mut expected: Vec<i32> = (0..4)
            .flat_map(|p| (0..25).map(move |i| p * 100 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);

        queue.join().await;
    }

    #[tokio::test]
    async fn test_discard_end_of_stream_settles_pending() {
        let queue = WorkQueue::bounded("leftover", 4);
        queue.put(1).await;
        queue.put_end_of_stream().await;
        queue.put(2).await;
        queue.put_end_of_stream().await;
        assert_eq!(queue.end_of_stream_count(), 2);

        assert_eq!(queue.discard_end_of_stream(1), 1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending(), 3);

        assert_eq!(queue.discard_end_of_stream(5), 1);
        assert_eq!(queue.discard_end_of_stream(5), 0);
        assert_eq!(queue.end_of_stream_count(), 2);

        // Freed slots admit new puts without blocking
        queue.put(3).await;
        queue.put(4).await;

        for expected in 1..=4 {
            assert_eq!(queue.try_get(), Some(QueueItem::Task(expected)));
            queue.mark_done().unwrap();
        }
        assert_eq!(queue.try_get(), None);
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .expect("every item is accounted for");
    }

    #[test]
    fn test_queue_item_helpers() {
        assert_eq!(QueueItem::Task(3).into_task(), Some(3));
        assert_eq!(QueueItem::<i32>::EndOfStream.into_task(), None);
        assert!(!QueueItem::Task(()).is_end_of_stream());
    }
}
