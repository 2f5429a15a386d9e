use super::{donation, Semaphore};
use crate::thread::ThreadManager;
use crate::types::{LockId, Priority, ThreadHandle};
use crate::Kernel;
use log::debug;
use std::sync::Arc;

/// Mutual exclusion lock with priority donation.
///
/// A thread that blocks on a held lock lends its effective priority to the
/// holder, and transitively to whatever holds the lock that holder is
/// waiting for. The loan is returned when the holder releases.
pub struct Lock {
    kernel: Arc<Kernel>,
    id: LockId,
    semaphore: Semaphore,
}

impl Lock {
    pub fn new(kernel: &Arc<Kernel>) -> Self {
        kernel.assert_on_cpu();
        let id = {
            let _masked = kernel.interrupts().mask();
            kernel.thread_manager().register_lock()
        };
        Self {
            kernel: Arc::clone(kernel),
            id,
            semaphore: Semaphore::new(kernel, 1),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn acquire(&self) {
        self.kernel.assert_on_cpu();
        assert!(
            !self.kernel.in_interrupt_context(),
            "lock acquire called from interrupt context"
        );

        let old = self.kernel.interrupts().disable();
        {
            let mut manager = self.kernel.thread_manager();
            let me = manager.current();
            assert!(
                !manager.thread(me).holds(self.id),
                "thread {me} already holds lock {}",
                self.id
            );

            if let Some(holder) = manager.lock(self.id).holder {
                manager.thread_mut(me).blocked_on = Some(self.id);
                let raised = donation::donate(
                    &mut manager,
                    me,
                    self.id,
                    self.kernel.config().max_donation_depth,
                );
                debug!(
                    "thread {me} waits for lock {} held by thread {holder}, raised {raised} holders",
                    self.id
                );
            }
        }

        self.semaphore.down();

        {
            let mut manager = self.kernel.thread_manager();
            let me = manager.current();
            manager.thread_mut(me).blocked_on = None;
            self.claim(&mut manager, me);
        }
        self.kernel.interrupts().set_level(old);
    }

    /// Takes the lock only if it is free right now. Never donates and never
    /// blocks, so an interrupt handler may call it; the lock then belongs to
    /// the interrupted thread.
    pub fn try_acquire(&self) -> bool {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        let mut manager = self.kernel.thread_manager();
        let me = manager.current();
        assert!(
            !manager.thread(me).holds(self.id),
            "thread {me} already holds lock {}",
            self.id
        );

        if !self.semaphore.try_down() {
            return false;
        }
        self.claim(&mut manager, me);
        true
    }

    fn claim(&self, manager: &mut ThreadManager, me: ThreadHandle) {
        manager.lock_mut(self.id).holder = Some(me);
        manager.thread_mut(me).held_locks.push(self.id);

        // Threads still queued on the semaphore keep donating to the new
        // holder.
        let effective = donation::refresh_priority(manager, me);
        // The holder's own priority is the floor for the new lock's record.
        manager.lock_mut(self.id).max_priority_of_waiting = effective;
        debug!("thread {me} acquired lock {} at priority {effective}", self.id);
    }

    pub fn release(&self) {
        self.kernel.assert_on_cpu();
        let old = self.kernel.interrupts().disable();
        {
            let mut manager = self.kernel.thread_manager();
            let me = manager.current();
            assert_eq!(
                manager.lock(self.id).holder,
                Some(me),
                "thread {me} does not hold lock {}",
                self.id
            );

            manager.thread_mut(me).held_locks.retain(|&held| held != self.id);
            manager.lock_mut(self.id).holder = None;
            let effective = donation::refresh_priority(&mut manager, me);
            debug!(
                "thread {me} released lock {}, priority back to {effective}",
                self.id
            );
        }
        self.kernel.interrupts().set_level(old);

        self.semaphore.up();
    }

    /// Acquires the lock and releases it when the guard goes out of scope.
    pub fn lock(&self) -> LockGuard<'_> {
        self.acquire();
        LockGuard { lock: self }
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        let manager = self.kernel.thread_manager();
        manager.lock(self.id).holder == Some(manager.current())
    }

    pub fn holder(&self) -> Option<ThreadHandle> {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        self.kernel.thread_manager().lock(self.id).holder
    }

    pub fn max_priority_of_waiting(&self) -> Priority {
        self.kernel.assert_on_cpu();
        let _masked = self.kernel.interrupts().mask();
        self.kernel
            .thread_manager()
            .lock(self.id)
            .max_priority_of_waiting
    }

    /// Threads queued on the lock, in queue order.
    pub fn waiters(&self) -> Vec<ThreadHandle> {
        self.semaphore.waiters()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.kernel.is_halted() {
            return;
        }
        let _masked = self.kernel.interrupts().mask();
        self.kernel.thread_manager().unregister_lock(self.id);
    }
}

pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl LockGuard<'_> {
    pub fn lock(&self) -> &Lock {
        self.lock
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Threads unwinding out of a halted kernel no longer own the
        // processor.
        if self.lock.kernel.is_halted() {
            return;
        }
        self.lock.release();
    }
}
