//! Deterministic scheduling for the client core.
//!
//! All waiting in tether is a one-shot task in a [`Scheduler`]: push
//! timeouts, heartbeats, reconnect/rejoin backoff, and teardown polling.
//! The embedding advances the scheduler with its own notion of time, so
//! every timing-dependent path is deterministic under test.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Handle to a scheduled task, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

struct Task {
    id: u64,
    deadline_ms: u64,
    callback: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct SchedulerState {
    now_ms: u64,
    next_id: u64,
    tasks: Vec<Task>,
}

/// A virtual-time one-shot task queue.
///
/// Tasks run in deadline order; tasks sharing a deadline run in schedule
/// order. Clones share the same queue.
#[derive(Clone, Default)]
pub struct Scheduler {
    state: Rc<RefCell<SchedulerState>>,
}

impl Scheduler {
    /// Create a scheduler with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.state.borrow().now_ms
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Schedule `callback` to run `delay_ms` after the current time.
    pub fn schedule(&self, delay_ms: u64, callback: impl FnOnce() + 'static) -> TaskId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = state.next_id;
        let deadline_ms = state.now_ms.saturating_add(delay_ms);
        state.tasks.push(Task {
            id,
            deadline_ms,
            callback: Box::new(callback),
        });
        TaskId(id)
    }

    /// Cancel a pending task. Returns whether it was still pending.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.tasks.len();
        state.tasks.retain(|task| task.id != id.0);
        state.tasks.len() != before
    }

    /// Run every task due at or before `now_ms`, then set the clock to it.
    ///
    /// The clock is monotonic: a target in the past is ignored. Tasks may
    /// schedule or cancel other tasks while running; a task scheduled for
    /// a deadline inside the advanced window runs in the same call.
    pub fn advance_to(&self, now_ms: u64) {
        loop {
            let task = {
                let mut state = self.state.borrow_mut();
                let target = now_ms.max(state.now_ms);
                let due = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, task)| task.deadline_ms <= target)
                    .min_by_key(|(_, task)| (task.deadline_ms, task.id))
                    .map(|(index, _)| index);
                match due {
                    Some(index) => {
                        let task = state.tasks.remove(index);
                        // run the task with the clock at its deadline so
                        // nested schedules measure from there
                        state.now_ms = state.now_ms.max(task.deadline_ms);
                        Some(task)
                    }
                    None => {
                        state.now_ms = target;
                        None
                    }
                }
            };
            match task {
                Some(task) => (task.callback)(),
                None => break,
            }
        }
    }

    /// Advance the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        let target = self.now_ms().saturating_add(delta_ms);
        self.advance_to(target);
    }
}

struct RetryTimerInner {
    scheduler: Scheduler,
    callback: Box<dyn Fn()>,
    timer_calc: Box<dyn Fn(u32) -> u64>,
    tries: Cell<u32>,
    pending: Cell<Option<TaskId>>,
}

/// A retry scheduler with a single in-flight slot.
///
/// `schedule_timeout` supersedes any pending invocation and schedules the
/// callback after `timer_calc(tries + 1)` milliseconds; firing increments
/// `tries` first, so backoff grows across attempts until `reset`.
pub struct RetryTimer {
    inner: Rc<RetryTimerInner>,
}

impl RetryTimer {
    /// Create a timer over a shared scheduler.
    #[must_use]
    pub fn new(
        scheduler: Scheduler,
        callback: impl Fn() + 'static,
        timer_calc: impl Fn(u32) -> u64 + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(RetryTimerInner {
                scheduler,
                callback: Box::new(callback),
                timer_calc: Box::new(timer_calc),
                tries: Cell::new(0),
                pending: Cell::new(None),
            }),
        }
    }

    /// Cancel any pending invocation and zero the attempt counter.
    pub fn reset(&self) {
        self.inner.tries.set(0);
        self.cancel_pending();
    }

    /// Cancel any pending invocation and schedule a new one after
    /// `timer_calc(tries + 1)` milliseconds.
    pub fn schedule_timeout(&self) {
        self.cancel_pending();
        let delay_ms = (self.inner.timer_calc)(self.inner.tries.get() + 1);
        let weak = Rc::downgrade(&self.inner);
        let id = self.inner.scheduler.schedule(delay_ms, move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.pending.set(None);
                inner.tries.set(inner.tries.get() + 1);
                (inner.callback)();
            }
        });
        self.inner.pending.set(Some(id));
    }

    /// Attempts completed since the last reset.
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.inner.tries.get()
    }

    fn cancel_pending(&self) {
        if let Some(id) = self.inner.pending.take() {
            self.inner.scheduler.cancel(id);
        }
    }
}
