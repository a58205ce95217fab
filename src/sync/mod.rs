//! Kernel synchronization primitives: a busy-wait spinlock for short
//! critical sections, and scheduler-integrated blocking primitives for
//! everything that may need to sleep.

pub mod condvar;
pub mod semaphore;
pub mod spinlock;
pub mod waitqueue;

pub use condvar::CondVar;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waitqueue::WaitQueue;
