//! Thread-blocking wait queue. Unlike `SpinLock`, waiting here yields the
//! CPU to the scheduler instead of spinning.

use alloc::collections::VecDeque;

use super::spinlock::{SpinLock, SpinLockGuard};
use crate::scheduler::ThreadId;

pub struct WaitQueue {
    waiters: SpinLock<VecDeque<ThreadId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Block the calling thread until `pred` no longer holds, then return
    /// with `lock` held again. `lock` is dropped before each sleep and
    /// re-acquired before re-checking `pred`, so a wakeup racing with
    /// going to sleep is never missed: the thread is already on the
    /// waiter list before its state lock is released.
    pub fn wait_while<'a, T>(
        &self,
        lock: &'a SpinLock<T>,
        mut pred: impl FnMut(&T) -> bool,
    ) -> SpinLockGuard<'a, T> {
        loop {
            let guard = lock.lock();
            if !pred(&guard) {
                return guard;
            }
            let me = crate::scheduler::current_thread_id();
            self.waiters.lock().push_back(me);
            drop(guard);
            unsafe {
                crate::scheduler::block_current_on_queue(self as *const _ as usize);
            }
        }
    }

    /// Wake a single waiter, if any, moving it back to its run queue.
    pub fn wake_one(&self) {
        if let Some(tid) = self.waiters.lock().pop_front() {
            crate::scheduler::wake_thread(tid);
        }
    }

    /// Wake every waiter currently queued.
    pub fn wake_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(tid) = waiters.pop_front() {
            crate::scheduler::wake_thread(tid);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SpinLock;

    #[test]
    fn wait_while_returns_immediately_when_predicate_is_already_false() {
        let queue = WaitQueue::new();
        let state = SpinLock::new(42u32);
        let guard = queue.wait_while(&state, |v| *v != 42);
        assert_eq!(*guard, 42);
        assert!(queue.is_empty());
    }

    #[test]
    fn freshly_created_queue_is_empty() {
        let queue = WaitQueue::new();
        assert!(queue.is_empty());
    }
}
