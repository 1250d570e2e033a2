//! The bounded telemetry queue with tiered backpressure.
//!
//! Admission rules at capacity:
//! - tier 0 is appended anyway (the queue may briefly exceed capacity);
//! - tier 1 sheds the first tier-2 record present, else the first tier 1,
//!   else is dropped;
//! - tier 2 sheds the first tier-2 record present, else is dropped.
//!
//! Dequeue is FIFO. Shed and dropped records count toward their own tier's
//! drop counter; tier 0 is never counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::record::{Record, Tier};

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct BoundedQueue {
    items: Mutex<VecDeque<Record>>,
    notify: Notify,
    capacity: usize,
    dropped_tier1: AtomicU64,
    dropped_tier2: AtomicU64,
    closed: AtomicBool,
}

impl BoundedQueue {
    /// A queue with the given capacity; zero selects the default (10 000).
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            dropped_tier1: AtomicU64::new(0),
            dropped_tier2: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Cumulative drop counters `(tier1, tier2)`.
    pub fn drop_counts(&self) -> (u64, u64) {
        (
            self.dropped_tier1.load(Ordering::Relaxed),
            self.dropped_tier2.load(Ordering::Relaxed),
        )
    }

    /// Read-and-reset the drop counters, for delta reporting in health
    /// snapshots.
    pub fn take_drop_counts(&self) -> (u64, u64) {
        (
            self.dropped_tier1.swap(0, Ordering::Relaxed),
            self.dropped_tier2.swap(0, Ordering::Relaxed),
        )
    }

    /// Enqueue under the tier rules. Returns whether the record was admitted.
    pub fn enqueue(&self, record: Record) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let admitted = {
            let mut items = self.items.lock();
            match record.tier {
                Tier::Lifecycle => {
                    items.push_back(record);
                    true
                }
                Tier::Operation => {
                    if items.len() < self.capacity {
                        items.push_back(record);
                        true
                    } else if shed_first(&mut items, Tier::Verbose) {
                        self.dropped_tier2.fetch_add(1, Ordering::Relaxed);
                        items.push_back(record);
                        true
                    } else if shed_first(&mut items, Tier::Operation) {
                        self.dropped_tier1.fetch_add(1, Ordering::Relaxed);
                        items.push_back(record);
                        true
                    } else {
                        self.dropped_tier1.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
                Tier::Verbose => {
                    if items.len() < self.capacity {
                        items.push_back(record);
                        true
                    } else if shed_first(&mut items, Tier::Verbose) {
                        self.dropped_tier2.fetch_add(1, Ordering::Relaxed);
                        items.push_back(record);
                        true
                    } else {
                        self.dropped_tier2.fetch_add(1, Ordering::Relaxed);
                        false
                    }
                }
            }
        };

        if admitted {
            self.notify.notify_one();
        }
        admitted
    }

    /// Block until a record is available or the queue is closed. After close,
    /// drains what remains, then returns `None`.
    pub async fn dequeue(&self) -> Option<Record> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut items = self.items.lock();
                if let Some(record) = items.pop_front() {
                    return Some(record);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Up to `n` records in FIFO order, without blocking.
    pub fn dequeue_batch(&self, n: usize) -> Vec<Record> {
        let mut items = self.items.lock();
        let take = n.min(items.len());
        items.drain(..take).collect()
    }

    /// Close the queue: all blocked dequeuers wake, enqueues are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Remove the oldest record of the given tier. Tier 0 is never a candidate.
fn shed_first(items: &mut VecDeque<Record>, tier: Tier) -> bool {
    debug_assert!(tier != Tier::Lifecycle);
    if let Some(pos) = items.iter().position(|r| r.tier == tier) {
        items.remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_result;
    use crate::record::{Record, WorkerHealthRecord, FORMAT_VERSION};

    fn record(tier: Tier) -> Record {
        match tier {
            Tier::Lifecycle => Record::worker_health(WorkerHealthRecord {
                format: FORMAT_VERSION.into(),
                ts: chrono::Utc::now(),
                worker_id: "wkr_00000001".into(),
                active_vus: 0,
                active_sessions: 0,
                in_flight_ops: 0,
                rss_bytes: 0,
                queue_depth: 0,
                queue_capacity: 0,
                dropped_tier1: 0,
                dropped_tier2: 0,
            }),
            Tier::Operation => Record::op_log(sample_result()),
            Tier::Verbose => Record::verbose_op_log(sample_result()),
        }
    }

    #[test]
    fn zero_capacity_selects_default() {
        assert_eq!(BoundedQueue::new(0).capacity(), DEFAULT_CAPACITY);
        assert_eq!(BoundedQueue::new(5).capacity(), 5);
    }

    #[test]
    fn tiered_shedding_scenario() {
        // Capacity 5 filled with 3×T0 + 2×T2.
        let queue = BoundedQueue::new(5);
        for _ in 0..3 {
            assert!(queue.enqueue(record(Tier::Lifecycle)));
        }
        for _ in 0..2 {
            assert!(queue.enqueue(record(Tier::Verbose)));
        }
        assert_eq!(queue.len(), 5);

        // A tier-1 enqueue succeeds by shedding one tier 2.
        assert!(queue.enqueue(record(Tier::Operation)));
        assert_eq!(queue.drop_counts(), (0, 1));
        assert_eq!(queue.len(), 5);

        // A tier-2 enqueue sheds the remaining tier 2 (still counts a drop).
        assert!(queue.enqueue(record(Tier::Verbose)));
        assert_eq!(queue.drop_counts(), (0, 2));

        // Tier 0 is appended regardless, briefly exceeding capacity.
        assert!(queue.enqueue(record(Tier::Lifecycle)));
        assert_eq!(queue.len(), 6);
    }

    #[test]
    fn tier1_sheds_oldest_tier1_when_no_tier2_present() {
        let queue = BoundedQueue::new(2);
        assert!(queue.enqueue(record(Tier::Operation)));
        assert!(queue.enqueue(record(Tier::Operation)));
        assert!(queue.enqueue(record(Tier::Operation)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drop_counts(), (1, 0));
    }

    #[test]
    fn tier1_dropped_when_queue_is_all_lifecycle() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(record(Tier::Lifecycle));
        queue.enqueue(record(Tier::Lifecycle));
        assert!(!queue.enqueue(record(Tier::Operation)));
        assert_eq!(queue.drop_counts(), (1, 0));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn tier2_dropped_when_no_tier2_to_shed() {
        let queue = BoundedQueue::new(2);
        queue.enqueue(record(Tier::Operation));
        queue.enqueue(record(Tier::Operation));
        assert!(!queue.enqueue(record(Tier::Verbose)));
        assert_eq!(queue.drop_counts(), (0, 1));
    }

    #[test]
    fn fifo_order_per_enqueue_thread() {
        let queue = BoundedQueue::new(10);
        for _ in 0..3 {
            queue.enqueue(record(Tier::Operation));
        }
        queue.enqueue(record(Tier::Lifecycle));
        let batch = queue.dequeue_batch(10);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].tier, Tier::Operation);
        assert_eq!(batch[3].tier, Tier::Lifecycle);
    }

    #[test]
    fn take_drop_counts_resets() {
        let queue = BoundedQueue::new(1);
        queue.enqueue(record(Tier::Verbose));
        queue.enqueue(record(Tier::Verbose)); // sheds
        assert_eq!(queue.take_drop_counts(), (0, 1));
        assert_eq!(queue.take_drop_counts(), (0, 0));
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(record(Tier::Operation));
        let record = waiter.await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn close_unblocks_and_drains() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4));
        queue.enqueue(record(Tier::Operation));
        queue.close();

        // Post-close dequeues drain the remainder, then return None.
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());

        // Enqueue after close is refused.
        assert!(!queue.enqueue(record(Tier::Operation)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_dequeuer() {
        let queue = std::sync::Arc::new(BoundedQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }
}
