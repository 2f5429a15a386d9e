use crate::sync::WaitQueue;
use crate::thread::ThreadTable;
use crate::types::{Priority, ThreadHandle};
use alloc::collections::VecDeque;

pub trait Scheduler: Send {
    /// Select next thread to run
    fn schedule(&mut self, threads: &ThreadTable) -> Option<ThreadHandle>;

    /// Add thread to ready queue
    fn enqueue(&mut self, thread: ThreadHandle);

    /// Remove thread from ready queue
    fn dequeue(&mut self, thread: ThreadHandle) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a ready thread should take the processor from a running
    /// thread at `current` priority.
    fn preempts(&self, threads: &ThreadTable, current: Priority) -> bool;
}

fn effective(threads: &ThreadTable, thread: ThreadHandle) -> Priority {
    threads
        .get(&thread)
        .map(|tcb| tcb.effective_priority())
        .unwrap_or(Priority::MIN)
}

/// Runs the ready thread with the highest effective priority. Priorities
/// are read at selection time, so a donation to a ready thread takes effect
/// without requeueing it.
#[derive(Default)]
pub struct PriorityScheduler {
    ready_queue: WaitQueue,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            ready_queue: WaitQueue::new(),
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn schedule(&mut self, threads: &ThreadTable) -> Option<ThreadHandle> {
        self.ready_queue.pop_highest(|t| effective(threads, t))
    }

    fn enqueue(&mut self, thread: ThreadHandle) {
        self.ready_queue.push_back(thread);
    }

    fn dequeue(&mut self, thread: ThreadHandle) -> bool {
        self.ready_queue.remove(thread)
    }

    fn len(&self) -> usize {
        self.ready_queue.len()
    }

    fn preempts(&self, threads: &ThreadTable, current: Priority) -> bool {
        self.ready_queue
            .highest_priority(|t| effective(threads, t))
            .is_some_and(|highest| highest > current)
    }
}

pub struct RoundRobinScheduler {
    ready_queue: VecDeque<ThreadHandle>,
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
        }
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(&mut self, _threads: &ThreadTable) -> Option<ThreadHandle> {
        self.ready_queue.pop_front()
    }

    fn enqueue(&mut self, thread: ThreadHandle) {
        self.ready_queue.push_back(thread);
    }

    fn dequeue(&mut self, thread: ThreadHandle) -> bool {
        if let Some(pos) = self.ready_queue.iter().position(|&h| h == thread) {
            self.ready_queue.remove(pos);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.ready_queue.len()
    }

    fn preempts(&self, _threads: &ThreadTable, _current: Priority) -> bool {
        false
    }
}
