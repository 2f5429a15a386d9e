//! Kernel synchronization primitives.
//!
//! All of them keep their state in a `KernelCell` and serialize access by
//! masking interrupts on the single processor. Only the host thread running
//! the current kernel thread may touch them; any other host thread panics.

mod cell;
mod condvar;
pub(crate) mod donation;
mod lock;
mod semaphore;
mod wait_queue;

pub(crate) use cell::KernelCell;
pub use condvar::Condvar;
pub use lock::{Lock, LockGuard};
pub use semaphore::Semaphore;
pub use wait_queue::{by_priority_desc, WaitQueue};
