//! Delayed task scheduling on top of the timer wheel.
//!
//! [`DelayedScheduler::schedule`] parks a closure until its delay elapses,
//! then either runs it inline on the timer thread or hands it to the tokio
//! runtime's blocking pool, depending on how the scheduler was built.
//! [`DelayedScheduler::unschedule`] cancels: a cancellation that lands before
//! the task started guarantees the task never runs; afterwards it is a no-op.
//!
//! Shutdown drains every pending task and reports each to the dropped
//! callback instead of running it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::timer::{Timer, TimerId};

/// Identifier returned by [`DelayedScheduler::schedule`].
pub type DelayedTaskId = u64;

/// A unit of deferred work.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// Where expired tasks execute.
#[derive(Clone)]
enum Dispatch {
    /// Run on the timer thread itself. Tasks must not block.
    Inline,
    /// Hand off to the tokio blocking pool.
    Pool(tokio::runtime::Handle),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Inline => write!(f, "Inline"),
            Dispatch::Pool(_) => write!(f, "Pool"),
        }
    }
}

/// The task slot is shared between the expiry path and the cancel path;
/// whoever takes the runnable first wins.
type TaskSlot = Arc<Mutex<Option<Runnable>>>;

struct ScheduledTask {
    timer_id: TimerId,
    slot: TaskSlot,
}

struct SchedulerState {
    next_id: DelayedTaskId,
    tasks: HashMap<DelayedTaskId, ScheduledTask>,
}

/// Schedules closures after a delay, with cancellation.
pub struct DelayedScheduler {
    timer: Timer,
    state: Arc<Mutex<SchedulerState>>,
    dispatch: Dispatch,
    default_delay: Duration,
    on_dropped: Option<Arc<dyn Fn(DelayedTaskId) + Send + Sync>>,
}

impl std::fmt::Debug for DelayedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.state.lock().expect("scheduler lock").tasks.len();
        f.debug_struct("DelayedScheduler")
            .field("pending", &pending)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

impl DelayedScheduler {
    /// Scheduler whose tasks run inline on the timer thread.
    pub fn single_threaded(default_delay: Duration) -> Self {
        Self::build(Dispatch::Inline, default_delay)
    }

    /// Scheduler whose tasks run on the tokio blocking pool.
    pub fn thread_pool(handle: tokio::runtime::Handle, default_delay: Duration) -> Self {
        Self::build(Dispatch::Pool(handle), default_delay)
    }

    fn build(dispatch: Dispatch, default_delay: Duration) -> Self {
        Self {
            timer: Timer::new(),
            state: Arc::new(Mutex::new(SchedulerState {
                next_id: 0,
                tasks: HashMap::new(),
            })),
            dispatch,
            default_delay,
            on_dropped: None,
        }
    }

    /// Callback invoked (with the task id) for every pending task discarded
    /// by [`DelayedScheduler::shutdown`].
    pub fn set_on_dropped(&mut self, callback: Arc<dyn Fn(DelayedTaskId) + Send + Sync>) {
        self.on_dropped = Some(callback);
    }

    /// Schedule `task` to run after the scheduler's default delay.
    pub fn schedule_default(&self, task: Runnable) -> DelayedTaskId {
        self.schedule(task, self.default_delay)
    }

    /// Schedule `task` to run after `delay`.
    pub fn schedule(&self, task: Runnable, delay: Duration) -> DelayedTaskId {
        let slot: TaskSlot = Arc::new(Mutex::new(Some(task)));

        // The state lock is held across add_timer so the expiry path (which
        // takes the same lock) cannot observe a task id it does not know yet.
        let mut state = self.state.lock().expect("scheduler lock");
        state.next_id += 1;
        let task_id = state.next_id;

        let expire_slot = Arc::clone(&slot);
        let expire_state = Arc::clone(&self.state);
        let dispatch = self.dispatch.clone();
        let on_expired = Arc::new(move |_timer_id| {
            expire_state
                .lock()
                .expect("scheduler lock")
                .tasks
                .remove(&task_id);
            let Some(task) = expire_slot.lock().expect("task slot").take() else {
                return; // lost the race against unschedule
            };
            match &dispatch {
                Dispatch::Inline => task(),
                Dispatch::Pool(handle) => {
                    handle.spawn_blocking(task);
                }
            }
        });
        // Removal bookkeeping happens in unschedule/shutdown, which hold the
        // task entry and know whether the runnable was still pending.
        let on_removed = Arc::new(|_timer_id| {});

        let timer_id = self.timer.add_timer(on_expired, on_removed, delay, false);
        state.tasks.insert(task_id, ScheduledTask { timer_id, slot });
        task_id
    }

    /// Cancel a scheduled task.
    ///
    /// Returns `true` if the task had not started and will not run.
    pub fn unschedule(&self, task_id: DelayedTaskId) -> bool {
        let entry = self
            .state
            .lock()
            .expect("scheduler lock")
            .tasks
            .remove(&task_id);
        let Some(entry) = entry else {
            return false;
        };
        // Claim the runnable before touching the timer: once the slot is
        // empty the expiry path is inert even if it already won the wheel.
        let pending = entry.slot.lock().expect("task slot").take().is_some();
        self.timer.remove_timer(entry.timer_id);
        pending
    }

    /// Drop all pending tasks and stop the timer worker.
    ///
    /// Must be called before the scheduler is destructed if deterministic
    /// drop reporting is wanted; otherwise drop performs the same drain.
    pub fn shutdown(&self) {
        self.timer.shutdown();
        let drained: Vec<(DelayedTaskId, ScheduledTask)> = {
            let mut state = self.state.lock().expect("scheduler lock");
            state.tasks.drain().collect()
        };
        for (task_id, entry) in drained {
            if entry.slot.lock().expect("task slot").take().is_some() {
                log::debug!("[Scheduler] dropping pending task {task_id}");
                if let Some(on_dropped) = &self.on_dropped {
                    on_dropped(task_id);
                }
            }
        }
    }
}

impl Drop for DelayedScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
