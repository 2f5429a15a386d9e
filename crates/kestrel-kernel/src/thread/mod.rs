pub mod scheduler;
pub(crate) mod switch;
pub mod tcb;

use crate::config::SchedulerKind;
use crate::error::KernelError;
use crate::interrupt::InterruptLevel;
use crate::sync::{donation, Semaphore};
use crate::types::{LockId, Priority, ThreadHandle};
use crate::Kernel;
use log::{debug, info, trace, warn};
use scheduler::{PriorityScheduler, RoundRobinScheduler, Scheduler};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tcb::{ThreadControlBlock, ThreadState};

pub type ThreadTable = HashMap<ThreadHandle, ThreadControlBlock>;

/// Donation bookkeeping of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: Option<ThreadHandle>,
    pub max_priority_of_waiting: Priority,
}

/// Thread table, lock ledger and ready queue. Lives inside the kernel's
/// `KernelCell` and is only touched with interrupts masked.
pub struct ThreadManager {
    pub threads: ThreadTable,
    pub locks: HashMap<LockId, LockRecord>,
    pub scheduler: Box<dyn Scheduler>,
    pub current_thread: Option<ThreadHandle>,
    next_handle: u32,
    next_lock_id: u32,
}

impl ThreadManager {
    pub fn new(kind: SchedulerKind) -> Self {
        let scheduler: Box<dyn Scheduler> = match kind {
            SchedulerKind::Priority => Box::new(PriorityScheduler::new()),
            SchedulerKind::RoundRobin => Box::new(RoundRobinScheduler::new()),
        };
        Self {
            threads: HashMap::new(),
            locks: HashMap::new(),
            scheduler,
            current_thread: None,
            next_handle: 1,
            next_lock_id: 1,
        }
    }

    fn allocate_handle(&mut self) -> ThreadHandle {
        let handle = ThreadHandle::new(self.next_handle).expect("thread handles start at 1");
        self.next_handle += 1;
        handle
    }

    /// Adopts the caller as the running thread.
    pub fn boot_thread(&mut self, name: &str, priority: Priority) -> ThreadHandle {
        let handle = self.allocate_handle();
        let tcb = ThreadControlBlock::new(handle, name, priority, ThreadState::Running);
        self.threads.insert(handle, tcb);
        self.current_thread = Some(handle);
        handle
    }

    /// New threads start blocked and become runnable through `make_ready`.
    pub fn create_thread(&mut self, name: &str, priority: Priority) -> ThreadHandle {
        let handle = self.allocate_handle();
        let tcb = ThreadControlBlock::new(handle, name, priority, ThreadState::Blocked);
        self.threads.insert(handle, tcb);
        handle
    }

    pub fn current(&self) -> ThreadHandle {
        self.current_thread
            .expect("no kernel thread is running on this processor")
    }

    pub fn thread(&self, handle: ThreadHandle) -> &ThreadControlBlock {
        self.threads
            .get(&handle)
            .unwrap_or_else(|| panic!("unknown thread {handle}"))
    }

    pub fn thread_mut(&mut self, handle: ThreadHandle) -> &mut ThreadControlBlock {
        self.threads
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("unknown thread {handle}"))
    }

    pub fn effective_priority(&self, handle: ThreadHandle) -> Priority {
        self.thread(handle).effective_priority()
    }

    pub fn register_lock(&mut self) -> LockId {
        let id = LockId::new(self.next_lock_id).expect("lock ids start at 1");
        self.next_lock_id += 1;
        self.locks.insert(
            id,
            LockRecord {
                holder: None,
                max_priority_of_waiting: Priority::MIN,
            },
        );
        id
    }

    pub fn unregister_lock(&mut self, id: LockId) {
        if let Some(LockRecord {
            holder: Some(holder),
            ..
        }) = self.locks.remove(&id)
        {
            warn!("lock {id} dropped while held by thread {holder}");
            if let Some(tcb) = self.threads.get_mut(&holder) {
                tcb.held_locks.retain(|&held| held != id);
            }
        }
    }

    pub fn lock(&self, id: LockId) -> &LockRecord {
        self.locks
            .get(&id)
            .unwrap_or_else(|| panic!("unknown lock {id}"))
    }

    pub fn lock_mut(&mut self, id: LockId) -> &mut LockRecord {
        self.locks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown lock {id}"))
    }

    /// Forgets a thread that will never run again. Locks it still holds
    /// keep naming it as their holder.
    pub fn reap(&mut self, handle: ThreadHandle) {
        if self.threads.remove(&handle).is_some() {
            trace!("reaped thread {handle}");
        }
    }

    pub fn make_ready(&mut self, handle: ThreadHandle) {
        self.thread_mut(handle).state = ThreadState::Ready;
        self.scheduler.enqueue(handle);
    }

    pub fn next_thread_to_run(&mut self) -> Option<ThreadHandle> {
        self.scheduler.schedule(&self.threads)
    }

    /// Whether a ready thread should preempt the running one.
    pub fn outranked(&self) -> bool {
        let current = self.effective_priority(self.current());
        self.scheduler.preempts(&self.threads, current)
    }
}

/// Waits for a spawned kernel thread to finish.
pub struct JoinHandle {
    handle: ThreadHandle,
    exited: Arc<Semaphore>,
}

impl JoinHandle {
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// Blocks the calling kernel thread until the thread has exited.
    pub fn join(self) {
        self.exited.down();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}

impl Kernel {
    pub fn current_thread(&self) -> ThreadHandle {
        self.thread_manager().current()
    }

    /// Creates a kernel thread running `f`. A thread with a higher priority
    /// than its creator runs before `spawn` returns.
    pub fn spawn<F>(
        self: &Arc<Self>,
        name: &str,
        priority: Priority,
        f: F,
    ) -> Result<JoinHandle, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.assert_on_cpu();
        assert!(
            !self.in_interrupt_context(),
            "spawn called from interrupt context"
        );

        let exited = Arc::new(Semaphore::new(self, 0));
        let handle = {
            let _masked = self.interrupts().mask();
            self.thread_manager().create_thread(name, priority)
        };

        let kernel = Arc::clone(self);
        let on_exit = Arc::clone(&exited);
        let spawned = thread::Builder::new()
            .name(format!("kestrel-{name}"))
            .spawn(move || kernel.run_thread(handle, f, &on_exit));

        if let Err(source) = spawned {
            let _masked = self.interrupts().mask();
            self.thread_manager().reap(handle);
            return Err(KernelError::Spawn {
                name: name.to_string(),
                source,
            });
        }

        info!("spawned thread {handle} '{name}' at priority {priority}");
        self.unblock(handle);
        self.preempt_if_outranked();

        Ok(JoinHandle { handle, exited })
    }

    fn run_thread<F: FnOnce()>(&self, me: ThreadHandle, f: F, exited: &Semaphore) {
        self.switch.wait_turn(me);
        self.interrupts().enable();

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => {
                exited.up();
                self.exit_current();
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.switch.halt(format!("thread {me} panicked: {message}"));
            }
        }
    }

    fn exit_current(&self) {
        self.interrupts().disable();
        {
            let mut manager = self.thread_manager();
            let me = manager.current();
            let tcb = manager.thread_mut(me);
            if !tcb.held_locks.is_empty() {
                warn!(
                    "thread {me} '{}' exited holding locks {:?}",
                    tcb.name, tcb.held_locks
                );
            }
            tcb.state = ThreadState::Terminated;
            info!("thread {me} '{}' exited", tcb.name);
        }
        self.schedule();
    }

    /// Switches to the next ready thread. The current thread's state must
    /// already say why it is giving up the processor.
    fn schedule(&self) {
        assert_eq!(
            self.interrupts().level(),
            InterruptLevel::Off,
            "schedule called with interrupts enabled"
        );

        let (prev, next, prev_alive) = {
            let mut manager = self.thread_manager();
            let prev = manager.current();
            let prev_state = manager.thread(prev).state;
            let next = manager.next_thread_to_run();
            match next {
                Some(next) => {
                    manager.current_thread = Some(next);
                    manager.thread_mut(next).state = ThreadState::Running;
                    // The exiting host thread never touches its TCB again.
                    let prev_alive = prev_state != ThreadState::Terminated;
                    if !prev_alive {
                        manager.reap(prev);
                    }
                    (prev, next, prev_alive)
                }
                None => {
                    drop(manager);
                    let reason = format!(
                        "deadlock: no runnable thread after thread {prev} became {prev_state:?}"
                    );
                    self.switch.halt(reason.clone());
                    panic!("{reason}");
                }
            }
        };

        if prev == next {
            return;
        }
        trace!("context switch {prev} -> {next}");
        self.switch.hand_off(next);
        if prev_alive {
            self.switch.wait_turn(prev);
        }
    }

    /// Gives up the processor. The caller stays runnable and is picked
    /// again once it is the best ready thread.
    pub fn yield_now(&self) {
        self.assert_on_cpu();
        assert!(
            !self.in_interrupt_context(),
            "yield_now called from interrupt context"
        );
        let old = self.interrupts().disable();
        {
            let mut manager = self.thread_manager();
            let me = manager.current();
            manager.make_ready(me);
        }
        self.schedule();
        self.interrupts().set_level(old);
    }

    /// Suspends the current thread until someone calls [`Kernel::unblock`]
    /// on it. Interrupts must already be masked.
    pub fn block_current(&self) {
        self.assert_on_cpu();
        assert!(
            !self.in_interrupt_context(),
            "blocking call from interrupt context"
        );
        assert_eq!(
            self.interrupts().level(),
            InterruptLevel::Off,
            "block_current called with interrupts enabled"
        );
        {
            let mut manager = self.thread_manager();
            let me = manager.current();
            manager.thread_mut(me).state = ThreadState::Blocked;
            debug!("thread {me} blocked");
        }
        self.schedule();
    }

    /// Makes a blocked thread runnable without preempting the caller.
    pub fn unblock(&self, thread: ThreadHandle) {
        self.assert_on_cpu();
        let old = self.interrupts().disable();
        {
            let mut manager = self.thread_manager();
            let state = manager.thread(thread).state;
            assert_eq!(
                state,
                ThreadState::Blocked,
                "unblock of thread {thread} in state {state:?}"
            );
            manager.make_ready(thread);
            debug!("thread {thread} unblocked");
        }
        self.interrupts().set_level(old);
    }

    fn preempt_if_outranked(&self) {
        let outranked = {
            let _masked = self.interrupts().mask();
            self.thread_manager().outranked()
        };
        if !outranked {
            return;
        }
        if self.in_interrupt_context() {
            self.interrupts().yield_on_return();
        } else {
            self.yield_now();
        }
    }

    /// Sets the current thread's base priority. Donations still in effect
    /// keep the effective priority up until the donating locks are released.
    pub fn set_priority(&self, priority: Priority) {
        self.assert_on_cpu();
        let old = self.interrupts().disable();
        {
            let mut manager = self.thread_manager();
            let me = manager.current();
            manager.thread_mut(me).priority.base = priority;
            let effective = donation::refresh_priority(&mut manager, me);
            debug!("thread {me} base priority {priority}, effective {effective}");
        }
        self.interrupts().set_level(old);
        self.preempt_if_outranked();
    }

    /// Effective priority of the current thread.
    pub fn priority(&self) -> Priority {
        let _masked = self.interrupts().mask();
        let manager = self.thread_manager();
        manager.effective_priority(manager.current())
    }

    pub fn thread_priority(&self, thread: ThreadHandle) -> Priority {
        let _masked = self.interrupts().mask();
        self.thread_manager().effective_priority(thread)
    }

    pub fn base_priority(&self, thread: ThreadHandle) -> Priority {
        let _masked = self.interrupts().mask();
        self.thread_manager().thread(thread).priority.base
    }

    pub fn is_donated(&self, thread: ThreadHandle) -> bool {
        let _masked = self.interrupts().mask();
        self.thread_manager().thread(thread).priority.donated
    }

    /// Number of threads that have not exited yet, `main` included.
    pub fn thread_count(&self) -> usize {
        let _masked = self.interrupts().mask();
        self.thread_manager().threads.len()
    }

    /// `None` once the thread has exited.
    pub fn thread_state(&self, thread: ThreadHandle) -> Option<ThreadState> {
        let _masked = self.interrupts().mask();
        self.thread_manager()
            .threads
            .get(&thread)
            .map(|tcb| tcb.state)
    }

    pub fn thread_name(&self, thread: ThreadHandle) -> Option<String> {
        let _masked = self.interrupts().mask();
        self.thread_manager()
            .threads
            .get(&thread)
            .map(|tcb| tcb.name.clone())
    }

    pub fn blocked_on(&self, thread: ThreadHandle) -> Option<LockId> {
        let _masked = self.interrupts().mask();
        self.thread_manager().thread(thread).blocked_on
    }

    pub fn held_locks(&self, thread: ThreadHandle) -> Vec<LockId> {
        let _masked = self.interrupts().mask();
        self.thread_manager().thread(thread).held_locks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priority(value: u8) -> Priority {
        Priority::new(value).unwrap()
    }

    #[test]
    fn boot_thread_is_running_and_current() {
        let mut manager = ThreadManager::new(SchedulerKind::Priority);
        let main = manager.boot_thread("main", Priority::DEFAULT);
        assert_eq!(main.val(), 1);
        assert_eq!(manager.current(), main);
        assert_eq!(manager.thread(main).state, ThreadState::Running);

        let child = manager.create_thread("child", priority(40));
        assert_eq!(manager.thread(child).state, ThreadState::Blocked);
        assert!(!manager.outranked());

        manager.make_ready(child);
        assert!(manager.outranked());
        assert_eq!(manager.next_thread_to_run(), Some(child));
        assert_eq!(manager.next_thread_to_run(), None);
    }

    #[test]
    fn dropping_a_held_lock_forgets_it() {
        let mut manager = ThreadManager::new(SchedulerKind::RoundRobin);
        let main = manager.boot_thread("main", Priority::DEFAULT);
        let lock = manager.register_lock();
        assert_eq!(manager.lock(lock).max_priority_of_waiting, Priority::MIN);

        manager.lock_mut(lock).holder = Some(main);
        manager.thread_mut(main).held_locks.push(lock);
        manager.unregister_lock(lock);

        assert!(manager.locks.is_empty());
        assert!(manager.thread(main).held_locks.is_empty());
    }

    #[test]
    fn reaped_threads_leave_the_table() {
        let mut manager = ThreadManager::new(SchedulerKind::Priority);
        manager.boot_thread("main", Priority::DEFAULT);
        let child = manager.create_thread("child", priority(10));
        assert_eq!(manager.threads.len(), 2);

        manager.reap(child);
        manager.reap(child);
        assert_eq!(manager.threads.len(), 1);
        assert!(!manager.threads.contains_key(&child));
    }

    #[test]
    #[should_panic(expected = "unknown thread")]
    fn unknown_handles_are_fatal() {
        let manager = ThreadManager::new(SchedulerKind::Priority);
        manager.thread(ThreadHandle::new(7).unwrap());
    }
}
