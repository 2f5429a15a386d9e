use super::{KernelCell, WaitQueue};
use crate::types::ThreadHandle;
use crate::Kernel;
use log::debug;
use std::sync::Arc;

struct SemaphoreState {
    value: usize,
    waiters: WaitQueue,
}

/// Counting semaphore whose waiters are woken in priority order.
///
/// `down` is the only operation in the synchronization core that suspends
/// the caller; locks and condition variables are built on top of it.
pub struct Semaphore {
    kernel: Arc<Kernel>,
    state: KernelCell<SemaphoreState>,
}

impl Semaphore {
    pub fn new(kernel: &Arc<Kernel>, value: usize) -> Self {
        Self {
            kernel: Arc::clone(kernel),
            state: KernelCell::new(SemaphoreState {
                value,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Waits for the value to become positive, then decrements it.
    pub fn down(&self) {
        self.kernel.assert_on_cpu();
        assert!(
            !self.kernel.in_interrupt_context(),
            "semaphore down called from interrupt context"
        );

        let old = self.kernel.interrupts().disable();
        loop {
            {
                let mut state = self.state.borrow_mut(&self.kernel);
                if state.value > 0 {
                    state.value -= 1;
                    break;
                }
                let manager = self.kernel.thread_manager();
                let me = manager.current();
                state
                    .waiters
                    .insert_ordered(me, |t| manager.effective_priority(t));
                debug!("thread {me} waits on semaphore ({} waiting)", state.waiters.len());
            }
            self.kernel.block_current();
        }
        self.kernel.interrupts().set_level(old);
    }

    /// Decrements the value if it is positive. Never blocks.
    pub fn try_down(&self) -> bool {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        let mut state = self.state.borrow_mut(&self.kernel);
        if state.value > 0 {
            state.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the value and wakes the waiter with the highest current
    /// priority, then gives that waiter a chance to run.
    pub fn up(&self) {
        self.kernel.assert_on_cpu();
        let old = self.kernel.interrupts().disable();
        let woken = {
            let mut state = self.state.borrow_mut(&self.kernel);
            let woken = {
                let manager = self.kernel.thread_manager();
                state
                    .waiters
                    .pop_highest(|t| manager.effective_priority(t))
            };
            state.value += 1;
            woken
        };
        if let Some(thread) = woken {
            self.kernel.unblock(thread);
        }
        self.kernel.interrupts().set_level(old);

        if self.kernel.in_interrupt_context() {
            self.kernel.interrupts().yield_on_return();
        } else {
            self.kernel.yield_now();
        }
    }

    pub fn value(&self) -> usize {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        self.state.borrow_mut(&self.kernel).value
    }

    /// Waiting threads in queue order.
    pub fn waiters(&self) -> Vec<ThreadHandle> {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        self.state.borrow_mut(&self.kernel).waiters.iter().collect()
    }
}
