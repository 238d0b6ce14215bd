use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    Heartbeat,
    Poll,
}

/// Identifies one armed timer. Ids are never reused, so a firing can be
/// matched against the currently armed handle to discard stale ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub id: u64,
    pub kind: TimerKind,
}

/// Source of one-shot and repeating timers. Firings are delivered as
/// [`TimerHandle`] values on a channel owned by whoever consumes them.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, kind: TimerKind, delay: Duration) -> TimerHandle;
    fn schedule_repeating(&self, kind: TimerKind, period: Duration) -> TimerHandle;
    fn cancel(&self, handle: TimerHandle);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<TimerHandle>,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(fired: mpsc::UnboundedSender<TimerHandle>) -> Self {
        Self {
            fired,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn next_handle(&self, kind: TimerKind) -> TimerHandle {
        TimerHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    fn track(&self, handle: TimerHandle, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(handle.id, task);
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let handle = self.next_handle(kind);
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(handle);
        });
        self.track(handle, task);
        handle
    }

    fn schedule_repeating(&self, kind: TimerKind, period: Duration) -> TimerHandle {
        let handle = self.next_handle(kind);
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if fired.send(handle).is_err() {
                    break;
                }
            }
        });
        self.track(handle, task);
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = lock(&self.tasks).remove(&handle.id) {
            debug!(timer_id = handle.id, kind = ?handle.kind, "timer cancelled");
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct ManualTimer {
    handle: TimerHandle,
    due: Duration,
    period: Option<Duration>,
}

#[derive(Debug, Default)]
struct ManualClock {
    now: Duration,
    next_id: u64,
    armed: Vec<ManualTimer>,
}

/// Deterministic scheduler driven by [`ManualScheduler::advance`].
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves virtual time forward and returns every firing in due order.
    pub fn advance(&self, by: Duration) -> Vec<TimerHandle> {
        let mut clock = lock(&self.clock);
        let target = clock.now + by;
        let mut fired = Vec::new();
        loop {
            let next = clock
                .armed
                .iter()
                .enumerate()
                .filter(|(_, timer)| timer.due <= target)
                .min_by_key(|(_, timer)| (timer.due, timer.handle.id))
                .map(|(index, _)| index);
            let Some(index) = next else {
                break;
            };
            let timer = clock.armed.remove(index);
            clock.now = timer.due;
            fired.push(timer.handle);
            if let Some(period) = timer.period.filter(|period| !period.is_zero()) {
                clock.armed.push(ManualTimer {
                    due: timer.due + period,
                    ..timer
                });
            }
        }
        clock.now = target;
        fired
    }

    pub fn armed(&self) -> Vec<TimerHandle> {
        lock(&self.clock)
            .armed
            .iter()
            .map(|timer| timer.handle)
            .collect()
    }

    pub fn armed_of(&self, kind: TimerKind) -> Vec<TimerHandle> {
        self.armed()
            .into_iter()
            .filter(|handle| handle.kind == kind)
            .collect()
    }

    /// Delay until the given timer next fires, relative to virtual now.
    pub fn remaining(&self, handle: TimerHandle) -> Option<Duration> {
        let clock = lock(&self.clock);
        clock
            .armed
            .iter()
            .find(|timer| timer.handle == handle)
            .map(|timer| timer.due.saturating_sub(clock.now))
    }

    fn arm(&self, kind: TimerKind, delay: Duration, period: Option<Duration>) -> TimerHandle {
        let mut clock = lock(&self.clock);
        clock.next_id += 1;
        let handle = TimerHandle {
            id: clock.next_id,
            kind,
        };
        let due = clock.now + delay;
        clock.armed.push(ManualTimer {
            handle,
            due,
            period,
        });
        handle
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, kind: TimerKind, delay: Duration) -> TimerHandle {
        self.arm(kind, delay, None)
    }

    fn schedule_repeating(&self, kind: TimerKind, period: Duration) -> TimerHandle {
        self.arm(kind, period, Some(period))
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.clock)
            .armed
            .retain(|timer| timer.handle != handle);
    }
}

#[cfg(test)]
#[path = "tests/scheduler_tests.rs"]
mod tests;
