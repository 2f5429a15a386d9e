use crate::Kernel;
use core::cell::{RefCell, RefMut};

/// Interior mutability for state that only the running kernel thread touches.
///
/// There is exactly one logical processor, so at most one kernel thread
/// executes at any instant and hand-offs between the host threads backing
/// kernel threads go through the run baton's mutex. Every borrow checks that
/// the calling host thread holds the baton, which is what makes the `Sync`
/// impl below sound. The `RefCell` turns an accidental overlapping borrow
/// (for example holding a borrow across a context switch) into a panic
/// instead of aliasing.
pub(crate) struct KernelCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T: Send> Sync for KernelCell<T> {}

impl<T> KernelCell<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            inner: RefCell::new(data),
        }
    }

    /// Panics unless the caller is the host thread running `kernel`'s
    /// current kernel thread.
    pub(crate) fn borrow_mut<'a>(&'a self, kernel: &Kernel) -> RefMut<'a, T> {
        kernel.assert_on_cpu();
        self.inner.borrow_mut()
    }
}
