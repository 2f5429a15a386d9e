extern crate alloc;

pub mod config;
pub mod error;
pub mod interrupt;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod types;

pub use config::{KernelConfig, SchedulerKind, DEFAULT_MAX_DONATION_DEPTH};
pub use error::KernelError;
pub use interrupt::{InterruptLevel, Interrupts};
pub use sync::{Condvar, Lock, LockGuard, Semaphore, WaitQueue};
pub use syscall::FileSystemLock;
pub use thread::tcb::ThreadState;
pub use thread::JoinHandle;
pub use types::{LockId, Priority, ThreadHandle};

use core::cell::RefMut;
use log::{info, trace};
use std::sync::Arc;
use sync::KernelCell;
use thread::switch::Switcher;
use thread::ThreadManager;

/// A single simulated processor with its threads and interrupt level.
///
/// The host thread that calls [`Kernel::boot`] becomes the kernel thread
/// `main`. Every thread created through [`Kernel::spawn`] is backed by its
/// own host thread, but only one of them executes kernel code at a time.
pub struct Kernel {
    config: KernelConfig,
    interrupts: Interrupts,
    threads: KernelCell<ThreadManager>,
    switch: Switcher,
}

impl Kernel {
    pub fn boot(config: KernelConfig) -> Result<Arc<Self>, KernelError> {
        config.validate()?;

        let mut manager = ThreadManager::new(config.scheduler);
        let main = manager.boot_thread("main", config.main_priority);
        info!(
            "kernel booted: main thread {main} at priority {}, {:?} scheduler, donation depth {:?}",
            config.main_priority, config.scheduler, config.max_donation_depth
        );

        Ok(Arc::new(Self {
            switch: Switcher::new(main),
            threads: KernelCell::new(manager),
            interrupts: Interrupts::new(),
            config,
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    pub fn in_interrupt_context(&self) -> bool {
        self.interrupts.in_context()
    }

    /// True once a kernel thread panicked or the processor ran out of
    /// runnable threads.
    pub fn is_halted(&self) -> bool {
        self.switch.is_halted()
    }

    pub(crate) fn thread_manager(&self) -> RefMut<'_, ThreadManager> {
        self.threads.borrow_mut(self)
    }

    /// Kernel state belongs to whichever host thread runs the current
    /// kernel thread. Everyone else is refused.
    pub(crate) fn assert_on_cpu(&self) {
        assert!(
            self.switch.on_cpu(),
            "kernel state touched from a host thread that is not running a kernel thread"
        );
    }

    /// Delivers an external interrupt to the running thread: `handler` runs
    /// in interrupt context with interrupts masked. If the handler asked for
    /// it, the interrupted thread yields once the handler has returned.
    pub fn raise_interrupt<H: FnOnce()>(&self, handler: H) {
        self.assert_on_cpu();
        assert_eq!(
            self.interrupts.level(),
            InterruptLevel::On,
            "external interrupt raised while interrupts are masked"
        );

        let old = self.interrupts.disable();
        self.interrupts.enter_handler();
        trace!("entering interrupt handler");
        handler();
        let wants_yield = self.interrupts.leave_handler();
        self.interrupts.set_level(old);

        if wants_yield {
            trace!("yield on interrupt return");
            self.yield_now();
        }
    }
}
