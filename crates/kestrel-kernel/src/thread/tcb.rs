use crate::types::{LockId, Priority, ThreadHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Priority fields the lock protocol reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityState {
    pub base: Priority,
    /// Never below `base`; above it only while a donation is in effect.
    pub effective: Priority,
    pub donated: bool,
}

impl PriorityState {
    pub fn new(base: Priority) -> Self {
        Self {
            base,
            effective: base,
            donated: false,
        }
    }
}

pub struct ThreadControlBlock {
    pub handle: ThreadHandle,
    pub name: String,
    pub state: ThreadState,
    pub priority: PriorityState,
    /// Lock this thread is waiting to acquire, if any.
    pub blocked_on: Option<LockId>,
    pub held_locks: Vec<LockId>,
}

impl ThreadControlBlock {
    pub fn new(handle: ThreadHandle, name: &str, priority: Priority, state: ThreadState) -> Self {
        Self {
            handle,
            name: name.to_string(),
            state,
            priority: PriorityState::new(priority),
            blocked_on: None,
            held_locks: Vec::new(),
        }
    }

    pub fn effective_priority(&self) -> Priority {
        self.priority.effective
    }

    pub fn holds(&self, lock: LockId) -> bool {
        self.held_locks.contains(&lock)
    }
}
