//! Counting semaphore built on `WaitQueue`.

use super::spinlock::SpinLock;
use super::waitqueue::WaitQueue;

struct Count(usize);

pub struct Semaphore {
    count: SpinLock<Count>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Semaphore {
            count: SpinLock::new(Count(initial)),
            waiters: WaitQueue::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut guard = self.waiters.wait_while(&self.count, |c| c.0 == 0);
        guard.0 -= 1;
    }

    /// Take a permit only if one is immediately available.
    pub fn try_wait(&self) -> bool {
        let mut guard = self.count.lock();
        if guard.0 > 0 {
            guard.0 -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit and wake one waiter. Safe to call from interrupt
    /// context: never sleeps, never allocates.
    pub fn post(&self) {
        self.count.lock().0 += 1;
        self.waiters.wake_one();
    }

    pub fn available(&self) -> usize {
        self.count.lock().0
    }
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_wait_respects_count() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn post_increments_available() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.available(), 0);
        sem.post();
        assert_eq!(sem.available(), 1);
    }
}
