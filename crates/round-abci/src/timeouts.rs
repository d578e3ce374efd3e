//! A min-heap of scheduled timeout events, ordered by deadline.
//!
//! `AbciApp::update_time` advances a monotonic clock and pops every
//! entry whose deadline has passed, in deadline order. Cancellation is
//! lazy: [`Timeouts::cancel`] drops the handle from a `live` set rather
//! than removing the entry from the heap, since `BinaryHeap` has no
//! efficient arbitrary removal; entries popped off the root that are no
//! longer `live` are simply discarded.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A scheduled timeout, ordered first by `deadline` and, for equal
/// deadlines, by insertion order (`seq`) so that entries scheduled
/// earlier fire first even when their deadlines coincide exactly.
#[derive(Debug, Clone, PartialEq)]
struct TimeoutEntry<E> {
    deadline: f64,
    seq: u64,
    event: E,
}

impl<E> PartialOrd for TimeoutEntry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Eq for TimeoutEntry<E> {}

impl<E> Ord for TimeoutEntry<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq)
            .partial_cmp(&(other.deadline, other.seq))
            .expect("deadlines must not be NaN")
    }
}

/// An opaque handle to a scheduled timeout, returned by [`Timeouts::add`]
/// and accepted by [`Timeouts::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeoutHandle(u64);

/// A min-heap of pending timeouts.
#[derive(Debug)]
pub struct Timeouts<E> {
    heap: BinaryHeap<Reverse<TimeoutEntry<E>>>,
    next_seq: u64,
    live: std::collections::HashSet<u64>,
}

impl<E> Default for Timeouts<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Timeouts<E> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 0, live: std::collections::HashSet::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedule `event` to fire at `deadline`.
    pub fn add(&mut self, deadline: f64, event: E) -> TimeoutHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.heap.push(Reverse(TimeoutEntry { deadline, seq, event }));
        TimeoutHandle(seq)
    }

    /// Cancel a previously scheduled timeout. Cancelling an id that is
    /// unknown, already fired, or already cancelled is a no-op: the
    /// original implementation treats double-cancellation as harmless.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        self.live.remove(&handle.0);
    }

    /// The deadline of the earliest non-cancelled entry, without popping
    /// it.
    pub fn peek_earliest_deadline(&mut self) -> Option<f64> {
        self.drop_cancelled_prefix();
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop and return the earliest non-cancelled entry whose deadline is
    /// `<= now`, if any.
    pub fn pop_expired(&mut self, now: f64) -> Option<E> {
        self.drop_cancelled_prefix();
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.deadline <= now => {
                let Reverse(entry) = self.heap.pop().expect("just peeked");
                self.live.remove(&entry.seq);
                Some(entry.event)
            }
            _ => None,
        }
    }

    fn drop_cancelled_prefix(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.live.contains(&entry.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut timeouts = Timeouts::new();
        timeouts.add(3.0, "c");
        timeouts.add(1.0, "a");
        timeouts.add(2.0, "b");
        assert_eq!(timeouts.pop_expired(10.0), Some("a"));
        assert_eq!(timeouts.pop_expired(10.0), Some("b"));
        assert_eq!(timeouts.pop_expired(10.0), Some("c"));
        assert_eq!(timeouts.pop_expired(10.0), None);
    }

    #[test]
    fn pop_expired_respects_now() {
        let mut timeouts = Timeouts::new();
        timeouts.add(5.0, "late");
        assert_eq!(timeouts.pop_expired(4.0), None);
        assert_eq!(timeouts.pop_expired(5.0), Some("late"));
    }

    #[test]
    fn cancel_is_idempotent_and_skips_on_pop() {
        let mut timeouts = Timeouts::new();
        let handle = timeouts.add(1.0, "x");
        timeouts.cancel(handle);
        timeouts.cancel(handle);
        assert_eq!(timeouts.pop_expired(10.0), None);
    }

    #[test]
    fn cancel_of_unknown_handle_is_a_no_op() {
        let mut timeouts: Timeouts<&str> = Timeouts::new();
        timeouts.cancel(TimeoutHandle(999));
        assert!(timeouts.is_empty());
    }

    #[test]
    fn ties_on_deadline_fire_in_insertion_order() {
        let mut timeouts = Timeouts::new();
        timeouts.add(1.0, "first");
        timeouts.add(1.0, "second");
        assert_eq!(timeouts.pop_expired(1.0), Some("first"));
        assert_eq!(timeouts.pop_expired(1.0), Some("second"));
    }

    proptest! {
        #[test]
        fn firing_order_always_matches_deadline_order(
            deadlines in proptest::collection::vec(0i64..1000, 1..30)
        ) {
            let mut timeouts = Timeouts::new();
            // event payload is the original index, so we can look its
            // deadline back up after popping.
            for (i, d) in deadlines.iter().enumerate() {
                timeouts.add(*d as f64, i);
            }
            let mut fired_deadlines = Vec::new();
            while let Some(index) = timeouts.pop_expired(f64::MAX) {
                fired_deadlines.push(deadlines[index]);
            }
            prop_assert_eq!(fired_deadlines.len(), deadlines.len());
            prop_assert!(fired_deadlines.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
