use crate::sync::{Lock, LockGuard};
use crate::Kernel;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

/// The process-wide gate around file system state.
///
/// Every file system call runs with this lock held, so concurrent system
/// calls from different threads are serialized by `Lock::acquire` and a
/// high-priority caller donates to whichever thread is inside the file
/// system.
pub struct FileSystemLock<F> {
    lock: Lock,
    fs: UnsafeCell<F>,
}

// `fs` is only reachable through a guard, and a guard exists only while
// `lock` is held.
unsafe impl<F: Send> Sync for FileSystemLock<F> {}

impl<F> FileSystemLock<F> {
    pub fn new(kernel: &Arc<Kernel>, fs: F) -> Self {
        Self {
            lock: Lock::new(kernel),
            fs: UnsafeCell::new(fs),
        }
    }

    /// Blocks until the file system is free.
    pub fn access(&self) -> FileSystemGuard<'_, F> {
        let held = self.lock.lock();
        FileSystemGuard { gate: self, _held: held }
    }

    /// Runs one file system operation under the lock.
    pub fn with<R>(&self, op: impl FnOnce(&mut F) -> R) -> R {
        let mut fs = self.access();
        op(&mut fs)
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

pub struct FileSystemGuard<'a, F> {
    gate: &'a FileSystemLock<F>,
    _held: LockGuard<'a>,
}

impl<F> Deref for FileSystemGuard<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        unsafe { &*self.gate.fs.get() }
    }
}

impl<F> DerefMut for FileSystemGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        unsafe { &mut *self.gate.fs.get() }
    }
}
