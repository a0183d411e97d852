use std::{cmp::Ordering, collections::BinaryHeap, time::Instant};

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Deadline-ordered callbacks bound for the event thread.
///
/// Ties on the deadline fire in insertion order. Entries cannot be removed;
/// callers model cancellation by checking a flag inside the closure.
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest (deadline, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), seq: 0 }
    }

    /// Returns true when the entry became the new head, i.e. the poll sleep
    /// must be shortened.
    pub fn schedule(&mut self, deadline: Instant, callback: Callback) -> bool {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Entry { deadline, seq, callback });
        self.heap.peek().is_some_and(|head| head.seq == seq)
    }

    /// Removes and returns every callback due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Callback> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            let Some(entry) = self.heap.pop() else { break };
            due.push(entry.callback);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }
}
