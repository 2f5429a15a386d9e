use crate::types::ThreadHandle;
use log::error;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

struct RunState {
    running: Option<ThreadHandle>,
    /// Host thread currently executing `running`, once it has picked up
    /// the baton.
    host: Option<ThreadId>,
    halted: Option<String>,
}

/// The processor itself: a baton that exactly one kernel thread holds.
///
/// Every kernel thread is backed by a host thread. A host thread executes
/// kernel code only while its kernel thread holds the baton, and parks on
/// the condition variable otherwise. Handing the baton over is the context
/// switch.
pub(crate) struct Switcher {
    state: Mutex<RunState>,
    turn: Condvar,
}

impl Switcher {
    pub(crate) fn new(first: ThreadHandle) -> Self {
        Self {
            state: Mutex::new(RunState {
                running: Some(first),
                host: Some(thread::current().id()),
                halted: None,
            }),
            turn: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn hand_off(&self, next: ThreadHandle) {
        let mut state = self.state();
        state.running = Some(next);
        state.host = None;
        self.turn.notify_all();
    }

    /// Parks the calling host thread until `me` holds the baton.
    pub(crate) fn wait_turn(&self, me: ThreadHandle) {
        let mut state = self.state();
        loop {
            if let Some(reason) = &state.halted {
                let reason = reason.clone();
                drop(state);
                panic!("kernel halted: {reason}");
            }
            if state.running == Some(me) {
                state.host = Some(thread::current().id());
                return;
            }
            state = self.turn.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops the processor. Every parked thread wakes up and panics with
    /// `reason`; only the first reason is kept.
    pub(crate) fn halt(&self, reason: String) {
        let mut state = self.state();
        if state.halted.is_none() {
            error!("kernel halted: {reason}");
            state.halted = Some(reason);
        }
        state.running = None;
        state.host = None;
        self.turn.notify_all();
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.state().halted.is_some()
    }

    /// True when the calling host thread holds the baton.
    pub(crate) fn on_cpu(&self) -> bool {
        self.state().host == Some(thread::current().id())
    }
}
