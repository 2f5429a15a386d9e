//! Interrupt level of the single simulated processor.
//!
//! Masking interrupts is the only mutual exclusion the synchronization core
//! relies on: while the level is [`InterruptLevel::Off`] the running thread
//! cannot be preempted, so every read-modify-write of primitive state done
//! inside a masked section is atomic with respect to other kernel threads.
//!
//! The level is processor-global rather than per-thread. A thread that blocks
//! with interrupts off hands the processor over with them still off; the
//! thread that resumes restores whatever level it saved before it blocked.

use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    On,
    Off,
}

impl InterruptLevel {
    fn from_enabled(enabled: bool) -> Self {
        if enabled {
            InterruptLevel::On
        } else {
            InterruptLevel::Off
        }
    }
}

pub struct Interrupts {
    enabled: AtomicBool,
    in_context: AtomicBool,
    yield_on_return: AtomicBool,
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts {
    /// Boots with interrupts enabled and no handler running.
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            in_context: AtomicBool::new(false),
            yield_on_return: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> InterruptLevel {
        InterruptLevel::from_enabled(self.enabled.load(Ordering::SeqCst))
    }

    /// Sets the level and returns the previous one.
    pub fn set_level(&self, level: InterruptLevel) -> InterruptLevel {
        match level {
            InterruptLevel::On => self.enable(),
            InterruptLevel::Off => self.disable(),
        }
    }

    pub fn disable(&self) -> InterruptLevel {
        InterruptLevel::from_enabled(self.enabled.swap(false, Ordering::SeqCst))
    }

    pub fn enable(&self) -> InterruptLevel {
        assert!(
            !self.in_context(),
            "interrupts enabled from inside an interrupt handler"
        );
        InterruptLevel::from_enabled(self.enabled.swap(true, Ordering::SeqCst))
    }

    /// Masks interrupts until the returned guard is dropped, then restores
    /// the level that was in effect before.
    pub fn mask(&self) -> InterruptGuard<'_> {
        let previous = self.disable();
        InterruptGuard {
            interrupts: self,
            previous,
        }
    }

    /// True while an external interrupt handler is running.
    pub fn in_context(&self) -> bool {
        self.in_context.load(Ordering::SeqCst)
    }

    /// Asks for the interrupted thread to yield once the handler returns.
    pub fn yield_on_return(&self) {
        assert!(
            self.in_context(),
            "yield_on_return requested outside an interrupt handler"
        );
        self.yield_on_return.store(true, Ordering::SeqCst);
    }

    pub(crate) fn enter_handler(&self) {
        assert!(!self.in_context(), "nested external interrupt");
        self.in_context.store(true, Ordering::SeqCst);
    }

    /// Leaves the handler and reports whether a yield was requested.
    pub(crate) fn leave_handler(&self) -> bool {
        self.in_context.store(false, Ordering::SeqCst);
        self.yield_on_return.swap(false, Ordering::SeqCst)
    }
}

pub struct InterruptGuard<'a> {
    interrupts: &'a Interrupts,
    previous: InterruptLevel,
}

impl InterruptGuard<'_> {
    pub fn previous(&self) -> InterruptLevel {
        self.previous
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.interrupts.set_level(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_reports_previous_level() {
        let interrupts = Interrupts::new();
        assert_eq!(interrupts.disable(), InterruptLevel::On);
        assert_eq!(interrupts.disable(), InterruptLevel::Off);
        assert_eq!(interrupts.set_level(InterruptLevel::On), InterruptLevel::Off);
        assert_eq!(interrupts.level(), InterruptLevel::On);
    }

    #[test]
    fn nested_masks_restore_in_order() {
        let interrupts = Interrupts::new();
        {
            let outer = interrupts.mask();
            assert_eq!(outer.previous(), InterruptLevel::On);
            {
                let inner = interrupts.mask();
                assert_eq!(inner.previous(), InterruptLevel::Off);
            }
            assert_eq!(interrupts.level(), InterruptLevel::Off);
        }
        assert_eq!(interrupts.level(), InterruptLevel::On);
    }

    #[test]
    fn yield_request_is_consumed_on_return() {
        let interrupts = Interrupts::new();
        interrupts.enter_handler();
        assert!(interrupts.in_context());
        interrupts.yield_on_return();
        assert!(interrupts.leave_handler());
        assert!(!interrupts.in_context());

        interrupts.enter_handler();
        assert!(!interrupts.leave_handler());
    }

    #[test]
    #[should_panic(expected = "inside an interrupt handler")]
    fn enabling_inside_handler_is_fatal() {
        let interrupts = Interrupts::new();
        interrupts.enter_handler();
        interrupts.enable();
    }
}
