//! Timer wheel: one worker thread over an ordered deadline map.
//!
//! Entries are one-shot or periodic and carry an on-expire and an on-remove
//! callback. Both callbacks run on the worker thread with the internal lock
//! dropped, so re-entrant [`Timer::add_timer`] / [`Timer::remove_timer`] from
//! inside a callback is allowed. A `remove_timer` issued from inside the
//! firing entry's own expiry callback wins against the periodic re-insert.
//!
//! Shutdown stops the worker, joins it, and invokes on-remove for every entry
//! still pending.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Identifier returned by [`Timer::add_timer`].
pub type TimerId = u64;

/// Deadlines are clamped this far out so that "effectively infinite" delays
/// never overflow `Instant` arithmetic.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

fn deadline_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay.min(FAR_FUTURE))
        .unwrap_or_else(|| base + FAR_FUTURE)
}

/// Callback invoked on the timer worker thread. Must not block.
pub type TimerCallback = Arc<dyn Fn(TimerId) + Send + Sync>;

struct TimerEntry {
    id: TimerId,
    interval: Duration,
    periodic: bool,
    on_expired: TimerCallback,
    on_removed: TimerCallback,
}

struct TimerState {
    /// Ordered by deadline; the id breaks ties between equal deadlines.
    entries: BTreeMap<(Instant, TimerId), TimerEntry>,
    next_id: TimerId,
    running: bool,
    /// Id of the entry whose expiry callback is currently executing.
    firing: Option<TimerId>,
    /// Set when `remove_timer` targets the currently firing entry.
    fire_removed: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Single-worker timer wheel.
pub struct Timer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.shared.state.lock().expect("timer lock").entries.len();
        f.debug_struct("Timer").field("pending", &pending).finish()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                entries: BTreeMap::new(),
                next_id: 0,
                running: true,
                firing: None,
                fire_removed: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("timer-wheel".to_owned())
            .spawn(move || Self::run(&worker_shared))
            .expect("spawn timer worker");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Insert a timer expiring after `delay`.
    ///
    /// If `periodic`, the entry re-arms at `previous deadline + delay` after
    /// each fire until removed.
    pub fn add_timer(
        &self,
        on_expired: TimerCallback,
        on_removed: TimerCallback,
        delay: Duration,
        periodic: bool,
    ) -> TimerId {
        let (id, is_new_head) = {
            let mut state = self.shared.state.lock().expect("timer lock");
            state.next_id += 1;
            let id = state.next_id;
            let deadline = deadline_after(Instant::now(), delay);
            state.entries.insert(
                (deadline, id),
                TimerEntry {
                    id,
                    interval: delay,
                    periodic,
                    on_expired,
                    on_removed,
                },
            );
            let is_new_head = state
                .entries
                .keys()
                .next()
                .is_some_and(|head| head.1 == id);
            (id, is_new_head)
        };
        if is_new_head {
            // The worker may be sleeping towards a later deadline.
            self.shared.wakeup.notify_one();
        }
        id
    }

    /// Remove an active timer, invoking its on-remove callback.
    ///
    /// Returns `false` if no timer with that id is active. When called from
    /// inside the entry's own expiry callback, the periodic re-insert is
    /// suppressed and the worker invokes on-remove after the callback
    /// returns.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        let removed = {
            let mut state = self.shared.state.lock().expect("timer lock");
            if state.firing == Some(id) {
                state.fire_removed = true;
                return true;
            }
            let key = state
                .entries
                .iter()
                .find(|(_, entry)| entry.id == id)
                .map(|(key, _)| *key);
            match key {
                None => return false,
                Some(key) => {
                    let was_head = state.entries.keys().next() == Some(&key);
                    let entry = state.entries.remove(&key).expect("key just found");
                    (entry, was_head)
                }
            }
        };
        let (entry, was_head) = removed;
        if was_head {
            self.shared.wakeup.notify_one();
        }
        (entry.on_removed)(id);
        log::trace!("[Timer] removed timer {id}");
        true
    }

    /// Stop the worker, join it, and fire on-remove for all pending entries.
    ///
    /// Idempotent; also invoked on drop.
    pub fn shutdown(&self) {
        let worker = {
            let mut state = self.shared.state.lock().expect("timer lock");
            state.running = false;
            self.shared.wakeup.notify_all();
            self.worker.lock().expect("worker lock").take()
        };
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::error!("[Timer] worker thread panicked");
            }
        }
        let leftovers: Vec<TimerEntry> = {
            let mut state = self.shared.state.lock().expect("timer lock");
            std::mem::take(&mut state.entries).into_values().collect()
        };
        for entry in leftovers {
            (entry.on_removed)(entry.id);
        }
    }

    fn run(shared: &Shared) {
        let mut state = shared.state.lock().expect("timer lock");
        loop {
            if !state.running {
                break;
            }
            let Some((&head_key, _)) = state.entries.iter().next() else {
                state = shared.wakeup.wait(state).expect("timer lock");
                continue;
            };
            let now = Instant::now();
            if head_key.0 > now {
                let (next, _timeout) = shared
                    .wakeup
                    .wait_timeout(state, head_key.0 - now)
                    .expect("timer lock");
                state = next;
                // Head may have changed; re-evaluate from scratch.
                continue;
            }

            let entry = state.entries.remove(&head_key).expect("head present");
            state.firing = Some(entry.id);
            state.fire_removed = false;
            drop(state);

            (entry.on_expired)(entry.id);

            state = shared.state.lock().expect("timer lock");
            let removed_during_fire = state.fire_removed;
            state.firing = None;
            state.fire_removed = false;
            if removed_during_fire {
                let on_removed = Arc::clone(&entry.on_removed);
                let id = entry.id;
                drop(state);
                on_removed(id);
                state = shared.state.lock().expect("timer lock");
            } else if entry.periodic && state.running {
                let next_deadline = deadline_after(head_key.0, entry.interval);
                state.entries.insert((next_deadline, entry.id), entry);
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
