// timer.rs: cancellable delayed actions
//
// The emergency lifecycle owns at most one of these at a time. A handle is
// returned by `schedule` and cancelled explicitly; dropping it does not cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, ManualClock, Timestamp};
use crate::error::{IgathaError, Result};

pub type TimerAction = Box<dyn FnOnce() + Send + 'static>;

/// Runs an action once after a delay, on an execution context of its choosing.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, after: Duration, action: TimerAction) -> TimerHandle;
}

#[derive(Debug, Default)]
struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
}

impl TimerState {
    /// Claims the right to run the action. False if cancelled or already run.
    fn begin_fire(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        !self.fired.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    fn new(state: Arc<TimerState>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self { state, abort }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.has_fired()
    }
}

// ─── Tokio-backed scheduler ──────────────────────────────────────────────────

/// Spawns one sleeping task per timer on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| IgathaError::Internal(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, action: TimerAction) -> TimerHandle {
        let state = Arc::new(TimerState::default());
        let task_state = Arc::clone(&state);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            if task_state.begin_fire() {
                action();
            }
        });
        TimerHandle::new(state, Some(task.abort_handle()))
    }
}

// ─── Manual scheduler ────────────────────────────────────────────────────────

struct PendingTimer {
    deadline: Timestamp,
    seq: u64,
    state: Arc<TimerState>,
    action: TimerAction,
}

#[derive(Default)]
struct ManualQueue {
    timers: Vec<PendingTimer>,
    next_seq: u64,
}

/// Virtual-time scheduler: timers only fire inside `advance`, on the caller's thread.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    queue: Arc<Mutex<ManualQueue>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: Arc::new(Mutex::new(ManualQueue::default())),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Number of timers that are neither cancelled nor fired.
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue
            .timers
            .iter()
            .filter(|t| !t.state.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Moves virtual time forward, firing due timers in deadline order.
    pub fn advance(&self, secs: f64) {
        let target = self.clock.now() + secs.max(0.0);
        while let Some(timer) = self.pop_due(target) {
            self.clock.set(timer.deadline);
            if timer.state.begin_fire() {
                (timer.action)();
            }
        }
        self.clock.set(target);
    }

    fn pop_due(&self, target: Timestamp) -> Option<PendingTimer> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue
            .timers
            .retain(|t| !t.state.cancelled.load(Ordering::SeqCst));
        let idx = queue
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.deadline <= target)
            .min_by(|(_, a), (_, b)| {
                a.deadline
                    .total_cmp(&b.deadline)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)?;
        Some(queue.timers.swap_remove(idx))
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, after: Duration, action: TimerAction) -> TimerHandle {
        let state = Arc::new(TimerState::default());
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.timers.push(PendingTimer {
            deadline: self.clock.now() + after.as_secs_f64(),
            seq,
            state: Arc::clone(&state),
            action,
        });
        TimerHandle::new(state, None)
    }
}
