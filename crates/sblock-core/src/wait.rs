use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::Wait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The blocking condition cleared (or teardown forced a wake).
    Woken,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Default)]
struct WaitState {
    interrupts: u64,
}

/// Condition variable for callers blocked on an empty pool or ring.
///
/// Wakers must not hold a queue lock when calling [`WaitQueue::wake_all`]:
/// waiters evaluate their condition, which takes that lock, while holding
/// the wait-queue mutex.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitQueue {
    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while `blocked()` returns true.
    pub(crate) fn wait_while(&self, wait: Wait, mut blocked: impl FnMut() -> bool) -> WaitOutcome {
        let deadline = match wait {
            Wait::NoWait => return WaitOutcome::TimedOut,
            Wait::Forever => None,
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
        };

        let mut state = self.lock();
        let interrupts = state.interrupts;
        loop {
            if state.interrupts != interrupts {
                return WaitOutcome::Interrupted;
            }
            if !blocked() {
                return WaitOutcome::Woken;
            }
            state = match deadline {
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub(crate) fn wake_all(&self) {
        // Taking the lock orders this wake after any in-progress condition check.
        drop(self.lock());
        self.cond.notify_all();
    }

    pub(crate) fn interrupt_all(&self) {
        self.lock().interrupts += 1;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn returns_immediately_when_not_blocked() {
        let queue = WaitQueue::default();
        assert_eq!(queue.wait_while(Wait::Forever, || false), WaitOutcome::Woken);
    }

    #[test]
    fn no_wait_never_blocks() {
        let queue = WaitQueue::default();
        assert_eq!(queue.wait_while(Wait::NoWait, || true), WaitOutcome::TimedOut);
    }

    #[test]
    fn bounded_wait_times_out() {
        let queue = WaitQueue::default();
        let start = Instant::now();
        let outcome = queue.wait_while(Wait::Timeout(Duration::from_millis(30)), || true);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wake_after_condition_clears() {
        let queue = Arc::new(WaitQueue::default());
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = Arc::clone(&queue);
            let ready = Arc::clone(&ready);
            thread::spawn(move || queue.wait_while(Wait::Forever, || !ready.load(Ordering::SeqCst)))
        };

        thread::sleep(Duration::from_millis(20));
        ready.store(true, Ordering::SeqCst);
        queue.wake_all();
        assert_eq!(waiter.join().expect("join"), WaitOutcome::Woken);
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let queue = Arc::new(WaitQueue::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_while(Wait::Forever, || true))
        };
        while !waiter.is_finished() {
            queue.interrupt_all();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(waiter.join().expect("join"), WaitOutcome::Interrupted);
    }
}
