//! The Manager's priority queue: lower `priority` dispatches first, ties broken
//! by enqueue order. See `SPEC_FULL.md` §4.1 "Priority queue ordering".
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::task::Task;

struct Entry {
    priority: i32,
    enqueued_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// `BinaryHeap` is a max-heap, but *lower* priority number must come out
    /// first, so the natural order here is reversed relative to "priority
    /// order": the best (lowest priority, earliest, lowest seq) entry compares
    /// greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct PriorityQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        PriorityQueue {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.push_with_priority(task.priority(), task);
    }

    /// Used for dependency re-enqueue, where the task keeps its original
    /// priority but gets a fresh position in FIFO order among equals.
    pub(crate) fn push_with_priority(&self, priority: i32, task: Task) {
        let entry = Entry {
            priority,
            enqueued_at: Instant::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .map(|entry| entry.task)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StoredResult;

    fn dummy_task(id: u64, priority: i32) -> Task {
        Task::new(
            id,
            format!("task-{id}"),
            Box::new(|_| Ok(StoredResult::new(()))),
            priority,
            Vec::new(),
            crate::task::RetryConfig::default(),
            None,
            None,
            None,
            std::collections::HashMap::new(),
        )
    }

    #[test]
    fn fifo_tiebreak_on_equal_priority() {
        let q = PriorityQueue::new();
        q.push(dummy_task(1, 5));
        q.push(dummy_task(2, 5));
        q.push(dummy_task(3, 5));
        assert_eq!(q.pop().unwrap().id(), 1);
        assert_eq!(q.pop().unwrap().id(), 2);
        assert_eq!(q.pop().unwrap().id(), 3);
    }

    #[test]
    fn lower_priority_number_dequeues_first() {
        let q = PriorityQueue::new();
        q.push(dummy_task(1, 5));
        q.push(dummy_task(2, 0));
        assert_eq!(q.pop().unwrap().id(), 2);
        assert_eq!(q.pop().unwrap().id(), 1);
    }
}
