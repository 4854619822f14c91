//! Heap-ordered timer queue with a no-allocation overflow list.
//!
//! The primary store is a binary heap ordered by deadline. Enqueue must not
//! fail: if growing the heap's storage fails, the entry is instead threaded
//! onto a singly-linked overflow list through the entries' own `next`
//! links, kept sorted by insertion (O(n), used only under memory pressure).
//! Every query and dequeue consults both structures.

use super::TimerEntry;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

struct HeapSlot {
    due: Instant,
    /// Insertion order breaks deadline ties deterministically.
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for HeapSlot {}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for a min-heap: earliest deadline first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Timer store owned by the timer thread (single writer).
pub(crate) struct TimerQueue {
    heap: BinaryHeap<HeapSlot>,
    overflow: Option<Arc<TimerEntry>>,
    next_seq: u64,
    /// Test hook: route every enqueue through the overflow list.
    #[cfg(test)]
    force_overflow: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            overflow: None,
            next_seq: 0,
            #[cfg(test)]
            force_overflow: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_forced_overflow() -> Self {
        Self {
            force_overflow: true,
            ..Self::new()
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.overflow.is_none()
    }

    /// Returns the earliest deadline across both structures.
    pub(crate) fn earliest_due_time(&self) -> Option<Instant> {
        let heap_due = self.heap.peek().map(|slot| slot.due);
        let overflow_due = self.overflow.as_ref().map(|entry| entry.deadline);
        match (heap_due, overflow_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Enqueues a timer; never fails.
    pub(crate) fn enqueue_timer(&mut self, entry: Arc<TimerEntry>) {
        #[cfg(test)]
        if self.force_overflow {
            Self::insert_sorted(&mut self.overflow, entry);
            return;
        }
        match self.heap.try_reserve(1) {
            Ok(()) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.heap.push(HeapSlot {
                    due: entry.deadline,
                    seq,
                    entry,
                });
            }
            // Out of memory: thread the entry onto the overflow list,
            // which allocates nothing.
            Err(_) => Self::insert_sorted(&mut self.overflow, entry),
        }
    }

    fn insert_sorted(slot: &mut Option<Arc<TimerEntry>>, entry: Arc<TimerEntry>) {
        let insert_here = match slot {
            None => true,
            Some(head) => head.deadline > entry.deadline,
        };
        if insert_here {
            *entry.next.lock() = slot.take();
            *slot = Some(entry);
        } else {
            let head = slot.as_ref().expect("non-empty arm");
            let mut next = head.next.lock();
            Self::insert_sorted(&mut next, entry);
        }
    }

    /// Moves every timer due at or before `now` onto `ready`.
    pub(crate) fn dequeue_due_timers(&mut self, now: Instant, ready: &mut Vec<Arc<TimerEntry>>) {
        while let Some(slot) = self.heap.peek() {
            if slot.due > now {
                break;
            }
            let slot = self.heap.pop().expect("peeked");
            ready.push(slot.entry);
        }
        while let Some(head) = &self.overflow {
            if head.deadline > now {
                break;
            }
            let head = self.overflow.take().expect("peeked");
            self.overflow = head.next.lock().take();
            ready.push(head);
        }
    }

    /// Moves every timer whose token fired onto `ready`, scanning both the
    /// heap and the overflow list.
    pub(crate) fn remove_cancelled_timers(&mut self, ready: &mut Vec<Arc<TimerEntry>>) {
        if self
            .heap
            .iter()
            .any(|slot| slot.entry.token.is_cancellation_requested())
        {
            let slots = std::mem::take(&mut self.heap).into_vec();
            for slot in slots {
                if slot.entry.token.is_cancellation_requested() {
                    ready.push(slot.entry);
                } else {
                    self.heap.push(slot);
                }
            }
        }
        Self::remove_cancelled_overflow(&mut self.overflow, ready);
    }

    fn remove_cancelled_overflow(
        slot: &mut Option<Arc<TimerEntry>>,
        ready: &mut Vec<Arc<TimerEntry>>,
    ) {
        loop {
            let cancelled = match slot {
                None => return,
                Some(entry) => entry.token.is_cancellation_requested(),
            };
            if cancelled {
                let removed = slot.take().expect("non-empty arm");
                *slot = removed.next.lock().take();
                ready.push(removed);
            } else {
                let head = slot.as_ref().expect("non-empty arm");
                let mut next = head.next.lock();
                Self::remove_cancelled_overflow(&mut next, ready);
                return;
            }
        }
    }

    /// Moves every remaining timer onto `ready` (shutdown teardown).
    pub(crate) fn drain_all(&mut self, ready: &mut Vec<Arc<TimerEntry>>) {
        for slot in std::mem::take(&mut self.heap).into_vec() {
            ready.push(slot.entry);
        }
        while let Some(head) = self.overflow.take() {
            self.overflow = head.next.lock().take();
            ready.push(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelSource, CancelToken};
    use std::time::Duration;

    fn entry_at(base: Instant, offset_ms: u64, token: CancelToken) -> Arc<TimerEntry> {
        TimerEntry::for_test(base + Duration::from_millis(offset_ms), token)
    }

    #[test]
    fn empty_queue() {
        let queue = TimerQueue::new();
        assert!(queue.is_empty());
        assert!(queue.earliest_due_time().is_none());
    }

    #[test]
    fn heap_orders_by_deadline() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();
        queue.enqueue_timer(entry_at(base, 50, CancelToken::none()));
        queue.enqueue_timer(entry_at(base, 10, CancelToken::none()));
        queue.enqueue_timer(entry_at(base, 30, CancelToken::none()));

        assert_eq!(
            queue.earliest_due_time(),
            Some(base + Duration::from_millis(10))
        );

        let mut ready = Vec::new();
        queue.dequeue_due_timers(base + Duration::from_millis(35), &mut ready);
        let offsets: Vec<_> = ready.iter().map(|e| e.deadline - base).collect();
        assert_eq!(
            offsets,
            vec![Duration::from_millis(10), Duration::from_millis(30)]
        );
        assert!(!queue.is_empty());

        ready.clear();
        queue.dequeue_due_timers(base + Duration::from_millis(100), &mut ready);
        assert_eq!(ready.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_list_is_insertion_sorted() {
        let base = Instant::now();
        let mut queue = TimerQueue::with_forced_overflow();
        queue.enqueue_timer(entry_at(base, 40, CancelToken::none()));
        queue.enqueue_timer(entry_at(base, 10, CancelToken::none()));
        queue.enqueue_timer(entry_at(base, 25, CancelToken::none()));

        assert_eq!(
            queue.earliest_due_time(),
            Some(base + Duration::from_millis(10))
        );

        let mut ready = Vec::new();
        queue.dequeue_due_timers(base + Duration::from_millis(60), &mut ready);
        let offsets: Vec<_> = ready.iter().map(|e| e.deadline - base).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(25),
                Duration::from_millis(40)
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn earliest_considers_both_structures() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();
        queue.enqueue_timer(entry_at(base, 30, CancelToken::none()));

        let mut forced = TimerQueue::with_forced_overflow();
        forced.enqueue_timer(entry_at(base, 5, CancelToken::none()));
        // Splice the forced overflow list into the primary queue.
        queue.overflow = forced.overflow.take();

        assert_eq!(
            queue.earliest_due_time(),
            Some(base + Duration::from_millis(5))
        );
    }

    #[test]
    fn cancelled_timers_are_pulled_from_both() {
        let base = Instant::now();
        let source = CancelSource::new();
        let mut queue = TimerQueue::new();

        queue.enqueue_timer(entry_at(base, 10, source.token()));
        queue.enqueue_timer(entry_at(base, 20, CancelToken::none()));

        let mut forced = TimerQueue::with_forced_overflow();
        forced.enqueue_timer(entry_at(base, 30, source.token()));
        forced.enqueue_timer(entry_at(base, 40, CancelToken::none()));
        queue.overflow = forced.overflow.take();

        source.request_cancel();
        let mut ready = Vec::new();
        queue.remove_cancelled_timers(&mut ready);

        assert_eq!(ready.len(), 2);
        assert!(ready
            .iter()
            .all(|entry| entry.token.is_cancellation_requested()));

        // Survivors still dequeue in order.
        ready.clear();
        queue.dequeue_due_timers(base + Duration::from_millis(100), &mut ready);
        let offsets: Vec<_> = ready.iter().map(|e| e.deadline - base).collect();
        assert_eq!(
            offsets,
            vec![Duration::from_millis(20), Duration::from_millis(40)]
        );
    }

    #[test]
    fn drain_all_empties_everything() {
        let base = Instant::now();
        let mut queue = TimerQueue::new();
        queue.enqueue_timer(entry_at(base, 10, CancelToken::none()));
        let mut forced = TimerQueue::with_forced_overflow();
        forced.enqueue_timer(entry_at(base, 20, CancelToken::none()));
        queue.overflow = forced.overflow.take();

        let mut ready = Vec::new();
        queue.drain_all(&mut ready);
        assert_eq!(ready.len(), 2);
        assert!(queue.is_empty());
    }
}
