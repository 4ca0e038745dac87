//! Bounded, ordered event queue sitting between the data source and the
//! replay loop.
//!
//! Generalizes the teacher crate's `backtest_v2::queue` (an unbounded
//! `BinaryHeap<TimestampedEvent>`) with the size cap and overflow policy the
//! spec requires, plus a blocking `pop` so the replay thread can wait on a
//! producer thread instead of polling.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use tracing::warn;

use crate::engine::events::{MarketEvent, TimestampedEvent};

/// Behavior when `push` is called against a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer until space frees up (or the queue closes).
    Block,
    /// Evict the earliest-ordered element, then insert.
    DropOldest,
    /// Discard the incoming element, keep the queue as-is.
    DropNewest,
}

struct QueueInner {
    heap: BinaryHeap<std::cmp::Reverse<TimestampedEvent>>,
    next_seq: u64,
    closed: bool,
    /// Counters for observability; not load-bearing for correctness.
    dropped_oldest: u64,
    dropped_newest: u64,
}

/// Bounded priority queue ordering `MarketEvent`s by `(ts, priority, seq)`.
pub struct EventQueue {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "EventQueue capacity must be positive");
        Self {
            capacity,
            policy,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
                closed: false,
                dropped_oldest: 0,
                dropped_newest: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Pushes an event, applying the queue's overflow policy if full.
    /// Returns `false` if the queue is closed and the push was refused.
    pub fn push(&self, event: MarketEvent) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }

        loop {
            if inner.heap.len() < self.capacity {
                break;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    inner = self.not_full.wait(inner).unwrap();
                    if inner.closed {
                        return false;
                    }
                }
                OverflowPolicy::DropOldest => {
                    // `BinaryHeap<Reverse<_>>` pops the smallest ts, which is
                    // the oldest-ordered element.
                    if inner.heap.pop().is_some() {
                        inner.dropped_oldest += 1;
                        warn!(dropped_oldest = inner.dropped_oldest, "event queue full, dropped oldest");
                    }
                    break;
                }
                OverflowPolicy::DropNewest => {
                    inner.dropped_newest += 1;
                    warn!(dropped_newest = inner.dropped_newest, "event queue full, dropped newest");
                    return true;
                }
            }
        }

        let ts = event.ts();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .heap
            .push(std::cmp::Reverse(TimestampedEvent { ts, seq, event }));
        self.not_empty.notify_one();
        true
    }

    /// Blocks until an event is available or the queue closes and drains.
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<MarketEvent> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(std::cmp::Reverse(ev)) = inner.heap.pop() {
                self.not_full.notify_one();
                return Some(ev.event);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop; returns `None` if the queue is currently empty,
    /// open or closed.
    pub fn try_pop(&self) -> Option<MarketEvent> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.heap.pop().map(|std::cmp::Reverse(ev)| ev.event);
        if popped.is_some() {
            self.not_full.notify_one();
        }
        popped
    }

    /// Peeks the next event's timestamp without removing it.
    pub fn peek_ts(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.heap.peek().map(|std::cmp::Reverse(ev)| ev.ts)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marks the queue closed: further pushes are refused, pending pops
    /// drain remaining events, then return `None`. Wakes every waiter.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn dropped_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.dropped_oldest, inner.dropped_newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::QuoteRecord;

    fn quote(ts: i64, symbol: &str) -> MarketEvent {
        MarketEvent::Quote(QuoteRecord {
            ts,
            symbol: symbol.into(),
            bid_price: 1.0,
            bid_size: 1.0,
            ask_price: 1.1,
            ask_size: 1.0,
            bid_exchange: "Q".into(),
            ask_exchange: "Q".into(),
            tape: 'A',
        })
    }

    #[test]
    fn pops_in_timestamp_order_regardless_of_push_order() {
        let q = EventQueue::new(8, OverflowPolicy::Block);
        q.push(quote(300, "A"));
        q.push(quote(100, "B"));
        q.push(quote(200, "C"));
        assert_eq!(q.pop().unwrap().ts(), 100);
        assert_eq!(q.pop().unwrap().ts(), 200);
        assert_eq!(q.pop().unwrap().ts(), 300);
    }

    #[test]
    fn drop_newest_discards_incoming_when_full() {
        let q = EventQueue::new(1, OverflowPolicy::DropNewest);
        assert!(q.push(quote(100, "A")));
        assert!(q.push(quote(200, "B")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().ts(), 100);
    }

    #[test]
    fn drop_oldest_evicts_earliest_when_full() {
        let q = EventQueue::new(1, OverflowPolicy::DropOldest);
        assert!(q.push(quote(100, "A")));
        assert!(q.push(quote(200, "B")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().ts(), 200);
    }

    #[test]
    fn close_drains_then_returns_none() {
        let q = EventQueue::new(8, OverflowPolicy::Block);
        q.push(quote(100, "A"));
        q.close();
        assert!(!q.push(quote(200, "B")));
        assert_eq!(q.pop().unwrap().ts(), 100);
        assert_eq!(q.pop(), None);
    }
}
