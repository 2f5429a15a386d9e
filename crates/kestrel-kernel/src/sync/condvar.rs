use super::{KernelCell, Lock, Semaphore};
use crate::types::{Priority, ThreadHandle};
use crate::Kernel;
use alloc::collections::VecDeque;
use log::debug;
use std::sync::Arc;

struct CondWaiter {
    thread: ThreadHandle,
    semaphore: Arc<Semaphore>,
}

/// Mesa-style condition variable. A woken waiter re-acquires the lock
/// before `wait` returns and must re-check its predicate.
pub struct Condvar {
    kernel: Arc<Kernel>,
    waiters: KernelCell<VecDeque<CondWaiter>>,
}

impl Condvar {
    pub fn new(kernel: &Arc<Kernel>) -> Self {
        Self {
            kernel: Arc::clone(kernel),
            waiters: KernelCell::new(VecDeque::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signaled, then re-acquires
    /// `lock`.
    pub fn wait(&self, lock: &Lock) {
        self.kernel.assert_on_cpu();
        assert!(
            !self.kernel.in_interrupt_context(),
            "condition wait called from interrupt context"
        );
        assert!(
            lock.held_by_current_thread(),
            "condition wait without holding lock {}",
            lock.id()
        );

        let semaphore = Arc::new(Semaphore::new(&self.kernel, 0));
        {
            let _masked = self.kernel.interrupts().mask();
            let thread = self.kernel.current_thread();
            self.waiters.borrow_mut(&self.kernel).push_back(CondWaiter {
                thread,
                semaphore: Arc::clone(&semaphore),
            });
            debug!("thread {thread} waits on condition (lock {})", lock.id());
        }

        lock.release();
        semaphore.down();
        lock.acquire();
    }

    /// Wakes the waiter whose thread has the highest effective priority,
    /// earliest arrival first among equals.
    pub fn signal(&self, lock: &Lock) {
        self.check_holder(lock, "signal");
        self.wake_one();
    }

    /// Wakes every thread that is waiting right now.
    pub fn broadcast(&self, lock: &Lock) {
        self.check_holder(lock, "broadcast");
        let pending = self.waiters();
        for _ in 0..pending {
            if !self.wake_one() {
                break;
            }
        }
    }

    pub fn waiters(&self) -> usize {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        self.waiters.borrow_mut(&self.kernel).len()
    }

    fn check_holder(&self, lock: &Lock, operation: &str) {
        self.kernel.assert_on_cpu();
        assert!(
            !self.kernel.in_interrupt_context(),
            "condition {operation} called from interrupt context"
        );
        assert!(
            lock.held_by_current_thread(),
            "condition {operation} without holding lock {}",
            lock.id()
        );
    }

    fn wake_one(&self) -> bool {
        let chosen = {
            let _masked = self.kernel.interrupts().mask();
            let mut waiters = self.waiters.borrow_mut(&self.kernel);
            let manager = self.kernel.thread_manager();

            let mut best: Option<(usize, Priority)> = None;
            for (index, waiter) in waiters.iter().enumerate() {
                let priority = manager.effective_priority(waiter.thread);
                let better = match best {
                    Some((_, top)) => priority > top,
                    None => true,
                };
                if better {
                    best = Some((index, priority));
                }
            }
            best.and_then(|(index, _)| waiters.remove(index))
        };

        match chosen {
            Some(waiter) => {
                debug!("condition signals thread {}", waiter.thread);
                waiter.semaphore.up();
                true
            }
            None => false,
        }
    }
}
