//! Condition variable: wait for a state change signalled by another
//! thread, without the condvar itself tracking the boolean invariant.
//! Used by the TCP collaborator to wake blocked `accept`/`recv` callers.

use alloc::collections::VecDeque;

use super::spinlock::{SpinLock, SpinLockGuard};
use crate::scheduler::ThreadId;

pub struct CondVar {
    waiters: SpinLock<VecDeque<ThreadId>>,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Release `guard`'s lock, block until `notify_one`/`notify_all` runs,
    /// then re-acquire it and return the new guard. The caller is
    /// responsible for re-checking whatever condition it cares about,
    /// since a wake here carries no guarantee the condition now holds.
    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>, lock: &'a SpinLock<T>) -> SpinLockGuard<'a, T> {
        let me = crate::scheduler::current_thread_id();
        self.waiters.lock().push_back(me);
        drop(guard);
        unsafe {
            crate::scheduler::block_current_on_queue(self as *const _ as usize);
        }
        lock.lock()
    }

    /// Like `wait`, but gives up after `timeout_ticks` timer ticks even if
    /// never notified. Returns `true` if woken by a notify, `false` on
    /// timeout.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: SpinLockGuard<'a, T>,
        lock: &'a SpinLock<T>,
        timeout_ticks: u64,
    ) -> (SpinLockGuard<'a, T>, bool) {
        let me = crate::scheduler::current_thread_id();
        self.waiters.lock().push_back(me);
        drop(guard);
        let woken = unsafe { crate::scheduler::block_current_on_queue_timeout(self as *const _ as usize, timeout_ticks) };
        if !woken {
            self.waiters.lock().retain(|&t| t != me);
        }
        (lock.lock(), woken)
    }

    pub fn notify_one(&self) {
        if let Some(tid) = self.waiters.lock().pop_front() {
            crate::scheduler::wake_thread(tid);
        }
    }

    pub fn notify_all(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(tid) = waiters.pop_front() {
            crate::scheduler::wake_thread(tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // wait/wait_timeout always park the calling thread through the
    // scheduler, so they need a live scheduler to exercise; only the
    // no-waiters paths are safe to test standalone here.

    #[test]
    fn notify_one_on_an_empty_waiter_list_is_a_no_op() {
        let cv = CondVar::new();
        cv.notify_one();
    }

    #[test]
    fn notify_all_on_an_empty_waiter_list_is_a_no_op() {
        let cv = CondVar::new();
        cv.notify_all();
    }
}
