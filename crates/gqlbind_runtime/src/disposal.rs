//! Cancellable delayed disposal.
//!
//! A [`DisposalQueue`] orders tasks by deadline. A [`DisposalScheduler`]
//! wraps one behind a lock, stamps deadlines with a fixed grace period and
//! wakes whoever drives it when the earliest deadline moves.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Identifies a scheduled disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Tasks ordered by deadline.
#[derive(Debug)]
pub struct DisposalQueue<T> {
    deadlines: BTreeMap<(Instant, TaskId), T>,
    index: FxHashMap<TaskId, Instant>,
    next_id: u64,
}

impl<T> Default for DisposalQueue<T> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
            index: FxHashMap::default(),
            next_id: 0,
        }
    }
}

impl<T> DisposalQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `item` for `deadline`.
    pub fn schedule(&mut self, deadline: Instant, item: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.deadlines.insert((deadline, id), item);
        self.index.insert(id, deadline);
        id
    }

    /// Cancels a task. Returns its item if it was still scheduled.
    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        let deadline = self.index.remove(&id)?;
        self.deadlines.remove(&(deadline, id))
    }

    /// Earliest deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes every task due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TaskId, T)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), item) = entry.remove_entry();
            self.index.remove(&id);
            expired.push((id, item));
        }
        expired
    }

    /// Number of scheduled tasks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// A shared [`DisposalQueue`] with a fixed delay.
#[derive(Debug)]
pub struct DisposalScheduler<T> {
    queue: Mutex<DisposalQueue<T>>,
    notify: Notify,
    grace_period: Duration,
}

impl<T> DisposalScheduler<T> {
    /// Creates a scheduler delaying every task by `grace_period`.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            queue: Mutex::new(DisposalQueue::new()),
            notify: Notify::new(),
            grace_period,
        }
    }

    /// The delay applied to every task.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Schedules `item` one grace period from now.
    pub fn schedule(&self, item: T) -> TaskId {
        let deadline = Instant::now() + self.grace_period;
        let id = self.queue.lock().schedule(deadline, item);
        self.notify.notify_one();
        id
    }

    /// Cancels a task. Returns true if it was still scheduled.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.queue.lock().cancel(id).is_some()
    }

    /// Earliest deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().next_deadline()
    }

    /// Removes every task due at `now`.
    pub fn pop_expired(&self, now: Instant) -> Vec<(TaskId, T)> {
        self.queue.lock().pop_expired(now)
    }

    /// Number of scheduled tasks.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Resolves after the next call to [`schedule`](Self::schedule).
    pub fn scheduled(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
