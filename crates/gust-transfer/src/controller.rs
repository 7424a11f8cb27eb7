/// Coordination primitives shared by the sibling workers of one session:
/// funnels (one-shot three-state barriers electing a single worker for a
/// shared action), named condition variables, a per-thread state registry,
/// and one-shot start/end hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, Once};

/// Funnel used to elect the worker that replays the chunk inventory.
pub const SEND_FILE_CHUNKS_FUNNEL: &str = "send-file-chunks";
/// Condition workers park on while deciding between finishing and
/// forwarding fresh checkpoints.
pub const WAIT_FOR_FINISH_OR_CHECKPOINT_CV: &str = "finish-or-checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStatus {
    Start,
    Progress,
    End,
}

/// Three-state one-shot barrier. Exactly one observer sees `Start` (and is
/// thereby elected); everyone else sees `Progress` until the elected worker
/// reports success (`End`) or failure (back to `Start`, a new election).
pub struct Funnel {
    state: Mutex<FunnelStatus>,
    cond: Condvar,
}

impl Funnel {
    fn new() -> Funnel {
        Funnel {
            state: Mutex::new(FunnelStatus::Start),
            cond: Condvar::new(),
        }
    }

    /// Observe the funnel. The first caller to see `Start` wins the election
    /// and flips the funnel to `Progress` for everyone after it.
    pub fn status(&self) -> FunnelStatus {
        let mut state = self.state.lock();
        if *state == FunnelStatus::Start {
            *state = FunnelStatus::Progress;
            return FunnelStatus::Start;
        }
        *state
    }

    /// Park while the elected worker is still in progress.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if *state == FunnelStatus::Progress {
            self.cond.wait_for(&mut state, timeout);
        }
    }

    pub fn notify_success(&self) {
        let mut state = self.state.lock();
        *state = FunnelStatus::End;
        self.cond.notify_all();
    }

    pub fn notify_fail(&self) {
        let mut state = self.state.lock();
        *state = FunnelStatus::Start;
        self.cond.notify_all();
    }
}

/// A named condition variable with its lock. Callers hold the guard while
/// checking their predicate, re-checking after every wake.
pub struct Condition {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Condition {
    fn new() -> Condition {
        Condition {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> ConditionGuard<'_> {
        ConditionGuard {
            guard: self.lock.lock(),
            cond: &self.cond,
        }
    }
}

pub struct ConditionGuard<'a> {
    guard: MutexGuard<'a, ()>,
    cond: &'a Condvar,
}

impl ConditionGuard<'_> {
    /// Timed wait; returns true if woken by a notify before the timeout.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        !self.cond.wait_for(&mut self.guard, timeout).timed_out()
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }
}

/// Registry and rendezvous point for one session's worker threads.
pub struct ThreadsController {
    num_threads: usize,
    states: Mutex<HashMap<usize, ThreadStatus>>,
    funnels: Mutex<HashMap<String, Arc<Funnel>>>,
    conditions: Mutex<HashMap<String, Arc<Condition>>>,
    start_once: Once,
    end_once: Once,
}

impl ThreadsController {
    pub fn new(num_threads: usize) -> ThreadsController {
        ThreadsController {
            num_threads,
            states: Mutex::new(HashMap::with_capacity(num_threads)),
            funnels: Mutex::new(HashMap::new()),
            conditions: Mutex::new(HashMap::new()),
            start_once: Once::new(),
            end_once: Once::new(),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn register_thread(&self, index: usize) {
        self.states.lock().insert(index, ThreadStatus::Running);
    }

    /// Remove the thread from the registry; it no longer counts toward any
    /// status query.
    pub fn deregister_thread(&self, index: usize) {
        self.states.lock().remove(&index);
    }

    pub fn mark_state(&self, index: usize, status: ThreadStatus) {
        self.states.lock().insert(index, status);
    }

    /// Is any registered thread other than `excluding` in `status`?
    pub fn has_threads(&self, excluding: usize, status: ThreadStatus) -> bool {
        self.states
            .lock()
            .iter()
            .any(|(&i, &s)| i != excluding && s == status)
    }

    pub fn get_funnel(&self, name: &str) -> Arc<Funnel> {
        let mut funnels = self.funnels.lock();
        funnels
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Funnel::new()))
            .clone()
    }

    pub fn get_condition(&self, name: &str) -> Arc<Condition> {
        let mut conditions = self.conditions.lock();
        conditions
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Condition::new()))
            .clone()
    }

    /// Run `f` if and only if no caller has run a start hook before.
    pub fn execute_at_start(&self, f: impl FnOnce()) {
        self.start_once.call_once(f);
    }

    /// Run `f` if and only if every thread has deregistered; the last one
    /// out triggers it exactly once.
    pub fn execute_at_end(&self, f: impl FnOnce()) {
        if self.states.lock().is_empty() {
            self.end_once.call_once(f);
        }
    }
}
