// Cooperative single-threaded task queue with priorities and delays.
// Numan Thabit 2026

use std::{
    cell::Cell,
    cmp::Ordering,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

/// Urgent work, e.g. accepting on a listener.
pub const PRIORITY_HIGH: i32 = -100;
/// Ordinary work.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Background work, e.g. periodic cleanup.
pub const PRIORITY_LOW: i32 = 100;

/// A task bound to the loop context `C`.
pub type Task<C> = Box<dyn FnOnce(&mut C)>;

/// Handle returned for every posted task. Cancelling before the task fires
/// prevents it from running; cancelling afterwards is a no-op.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle {
    /// Prevents the task from firing if it has not fired yet.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Returns true when [`TaskHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

struct Ready<C> {
    priority: i32,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    task: Task<C>,
}

struct Delayed<C> {
    due: Instant,
    priority: i32,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    task: Task<C>,
}

// BinaryHeap is a max-heap; reverse the comparisons so that the smallest
// (priority, seq) and earliest due pop first.
impl<C> PartialEq for Ready<C> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<C> Eq for Ready<C> {}
impl<C> PartialOrd for Ready<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<C> Ord for Ready<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl<C> PartialEq for Delayed<C> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<C> Eq for Delayed<C> {}
impl<C> PartialOrd for Delayed<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<C> Ord for Delayed<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.priority, other.seq).cmp(&(self.due, self.priority, self.seq))
    }
}

/// The serialization point of the whole substrate: every side-effect outside
/// a reactor callback runs as a task popped from this queue, on one thread.
///
/// Ready tasks run strictly in `(priority, insertion)` order. Delayed tasks
/// join the ready set once their deadline passes.
pub struct Scheduler<C> {
    ready: BinaryHeap<Ready<C>>,
    delayed: BinaryHeap<Delayed<C>>,
    seq: u64,
}

impl<C> Scheduler<C> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// Posts a task to run on the next dispatch, ordered by `priority`
    /// (lower is more urgent).
    pub fn post<F>(&mut self, priority: i32, task: F) -> TaskHandle
    where
        F: FnOnce(&mut C) + 'static,
    {
        let cancelled = Rc::new(Cell::new(false));
        let seq = self.next_seq();
        self.ready.push(Ready {
            priority,
            seq,
            cancelled: Rc::clone(&cancelled),
            task: Box::new(task),
        });
        TaskHandle { cancelled }
    }

    /// Posts a task to run no earlier than `delay` from now.
    pub fn post_after<F>(&mut self, delay: Duration, priority: i32, task: F) -> TaskHandle
    where
        F: FnOnce(&mut C) + 'static,
    {
        let cancelled = Rc::new(Cell::new(false));
        let seq = self.next_seq();
        self.delayed.push(Delayed {
            due: Instant::now() + delay,
            priority,
            seq,
            cancelled: Rc::clone(&cancelled),
            task: Box::new(task),
        });
        TaskHandle { cancelled }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(head) = self.delayed.peek() {
            if head.due > now {
                break;
            }
            let entry = self.delayed.pop().expect("peeked entry");
            self.ready.push(Ready {
                priority: entry.priority,
                seq: entry.seq,
                cancelled: entry.cancelled,
                task: entry.task,
            });
        }
    }

    /// Pops the next runnable task, skipping cancelled ones.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Task<C>> {
        self.promote_due(now);
        while let Some(entry) = self.ready.pop() {
            if entry.cancelled.get() {
                continue;
            }
            return Some(entry.task);
        }
        None
    }

    /// Deadline of the earliest delayed task, used to bound poll timeouts.
    pub fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|entry| entry.due).min()
    }

    /// Returns true when a task is runnable right now.
    pub fn has_ready(&self, now: Instant) -> bool {
        if self.ready.iter().any(|entry| !entry.cancelled.get()) {
            return true;
        }
        self.delayed
            .iter()
            .any(|entry| entry.due <= now && !entry.cancelled.get())
    }

    /// Number of live (not cancelled) tasks, ready or delayed.
    pub fn len(&self) -> usize {
        self.ready.iter().filter(|e| !e.cancelled.get()).count()
            + self.delayed.iter().filter(|e| !e.cancelled.get()).count()
    }

    /// Returns true when no live task remains.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}
