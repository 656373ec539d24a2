//! Bounded concurrency gate with priority-ordered admission.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Scheduling class for a queued call. Higher priorities are admitted first;
/// equal priorities are served in arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

struct Waiter {
    priority: Priority,
    /// Monotonic arrival stamp; breaks priority ties FIFO.
    seq: u64,
    /// The grant carries the permit itself: a waiter abandoned after the
    /// hand-off drops the buffered permit, which returns the slot.
    tx: oneshot::Sender<SlotPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority wins, then the older sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

/// Fixed pool of call slots. `acquire` resolves immediately while slots are
/// free and otherwise parks the caller; releasing a slot hands it to the
/// best-ranked waiter directly. Clones share the pool.
#[derive(Clone)]
pub struct SlotQueue {
    state: Arc<Mutex<QueueState>>,
}

impl SlotQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                available: capacity.max(1),
                waiters: BinaryHeap::new(),
                next_seq: 0,
            })),
        }
    }

    /// Wait for a slot. The returned permit releases it on drop.
    pub async fn acquire(&self, priority: Priority) -> SlotPermit {
        let rx = {
            let mut state = self.state.lock().expect("slot queue mutex poisoned");
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter { priority, seq, tx });
                Some(rx)
            }
        };

        match rx {
            None => SlotPermit {
                state: Arc::clone(&self.state),
                spent: false,
            },
            Some(rx) => match rx.await {
                Ok(permit) => permit,
                // A closed sender means the queue itself went away; treat
                // the slot as granted so the caller is not wedged.
                Err(_) => SlotPermit {
                    state: Arc::clone(&self.state),
                    spent: false,
                },
            },
        }
    }

    /// Waiters currently parked. Test and observability hook.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .expect("slot queue mutex poisoned")
            .waiters
            .len()
    }
}

/// Held slot; dropping it releases the slot to the next waiter.
pub struct SlotPermit {
    state: Arc<Mutex<QueueState>>,
    /// Set once the slot has moved elsewhere; a spent permit releases
    /// nothing.
    spent: bool,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.spent {
            return;
        }
        let mut state = self.state.lock().expect("slot queue mutex poisoned");
        // Skip waiters whose acquire future was dropped while parked.
        while let Some(waiter) = state.waiters.pop() {
            let grant = SlotPermit {
                state: Arc::clone(&self.state),
                spent: false,
            };
            match waiter.tx.send(grant) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Receiver vanished before the grant landed; neutralize
                    // the permit (its drop would re-enter this lock) and
                    // offer the slot to the next waiter.
                    unclaimed.spent = true;
                }
            }
        }
        state.available += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[tokio::test]
    async fn test_acquire_immediate_under_capacity() {
        let queue = SlotQueue::new(2);
        let _a = queue.acquire(Priority::Normal).await;
        let _b = queue.acquire(Priority::Normal).await;
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn test_third_caller_waits_until_release() {
        let queue = SlotQueue::new(2);
        let a = queue.acquire(Priority::Normal).await;
        let _b = queue.acquire(Priority::Normal).await;

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            queue.acquire(Priority::Normal),
        )
        .await;
        assert!(pending.is_err(), "third acquire should park");

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.acquire(Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(a);
        let _c = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_high_priority_jumps_earlier_normal() {
        let queue = SlotQueue::new(1);
        let held = queue.acquire(Priority::Normal).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for (label, priority) in [
            ("normal-1", Priority::Normal),
            ("normal-2", Priority::Normal),
            ("high", Priority::High),
        ] {
            let queue = queue.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = queue.acquire(priority).await;
                let _ = tx.send(label);
                drop(permit);
            });
            // Stagger arrivals so sequence numbers are deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);

        let mut order = Vec::new();
        for _ in 0..3 {
            let label = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(label);
        }
        assert_eq!(order, vec!["high", "normal-1", "normal-2"]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let queue = SlotQueue::new(1);
        let held = queue.acquire(Priority::Normal).await;

        let mut abandoned = Box::pin(queue.acquire(Priority::High));
        let poll = tokio::time::timeout(Duration::from_millis(10), &mut abandoned).await;
        assert!(poll.is_err(), "acquire should be parked");
        drop(abandoned);

        let survivor = tokio::spawn({
            let queue = queue.clone();
            async move { queue.acquire(Priority::Low).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        let _permit = tokio::time::timeout(Duration::from_millis(100), survivor)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_abandoned_after_grant_returns_slot() {
        let queue = SlotQueue::new(1);
        let held = queue.acquire(Priority::Normal).await;

        let mut parked = Box::pin(queue.acquire(Priority::Normal));
        let poll = tokio::time::timeout(Duration::from_millis(10), &mut parked).await;
        assert!(poll.is_err(), "acquire should be parked");

        // Release hands the slot straight to the parked waiter, which is
        // then dropped without ever being polled again.
        drop(held);
        drop(parked);

        let _recovered =
            tokio::time::timeout(Duration::from_millis(200), queue.acquire(Priority::Normal))
                .await
                .expect("slot must return to the pool when a grant goes unclaimed");
    }

    #[tokio::test]
    async fn test_release_with_no_waiters_restores_capacity() {
        let queue = SlotQueue::new(1);
        let a = queue.acquire(Priority::Normal).await;
        drop(a);
        // Slot fully returned; next acquire is immediate.
        let _b = tokio::time::timeout(Duration::from_millis(20), queue.acquire(Priority::Low))
            .await
            .unwrap();
    }
}
