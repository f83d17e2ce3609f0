// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Completion signal for a blocked caller
//!
//! A [`Waiter`] is shared between the submitting thread and whoever finishes
//! the request (event dispatcher, timeout recheck, flush). Every transition
//! names the generation it applies to and only succeeds from
//! `Pending` with that generation, so a request is finished exactly once and a
//! stale completion for a reused slot can never wake the wrong caller.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Tagged request state
#[derive(Debug)]
pub enum WaitState<T> {
    Pending { generation: u32 },
    /// `outcome` is `None` once taken by the waiter
    Completed { generation: u32, outcome: Option<T> },
    /// The waiter gave up; nobody will be woken
    Reclaimed { generation: u32 },
}

/// How a polled wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEnd {
    Completed,
    TimedOut,
    /// The liveness check failed first
    Aborted,
}

/// One outstanding request
pub struct Waiter<T> {
    state: Mutex<WaitState<T>>,
    cond: Condvar,
}

impl<T> Waiter<T> {
    pub fn new(generation: u32) -> Self {
        Self {
            state: Mutex::new(WaitState::Pending { generation }),
            cond: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u32 {
        match *self.state.lock() {
            WaitState::Pending { generation }
            | WaitState::Completed { generation, .. }
            | WaitState::Reclaimed { generation } => generation,
        }
    }

    /// Finish the request. Returns `false` if it was already finished or the
    /// generation does not match.
    pub fn complete(&self, generation: u32, outcome: T) -> bool {
        let mut state = self.state.lock();
        match *state {
            WaitState::Pending { generation: g } if g == generation => {
                *state = WaitState::Completed {
                    generation,
                    outcome: Some(outcome),
                };
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Abandon the request without waking anyone
    pub fn reclaim(&self, generation: u32) -> bool {
        let mut state = self.state.lock();
        match *state {
            WaitState::Pending { generation: g } if g == generation => {
                *state = WaitState::Reclaimed { generation };
                true
            }
            _ => false,
        }
    }

    /// Block until the request leaves `Pending` or `timeout` elapses.
    /// Returns whether it completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while let WaitState::Pending { .. } = *state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        matches!(*state, WaitState::Completed { .. })
    }

    /// Like [`Waiter::wait`], but wakes at least every `poll` to ask
    /// `alive`, and gives up as soon as it says no.
    pub fn wait_polled<F: FnMut() -> bool>(
        &self,
        timeout: Duration,
        poll: Duration,
        mut alive: F,
    ) -> WaitEnd {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return if self.is_completed() {
                    WaitEnd::Completed
                } else {
                    WaitEnd::TimedOut
                };
            }
            if self.wait((deadline - now).min(poll)) {
                return WaitEnd::Completed;
            }
            if !self.is_pending() {
                return WaitEnd::TimedOut;
            }
            if !alive() {
                return if self.is_completed() {
                    WaitEnd::Completed
                } else {
                    WaitEnd::Aborted
                };
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), WaitState::Pending { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.state.lock(), WaitState::Completed { .. })
    }

    /// Take the outcome of a completed request
    pub fn take_outcome(&self) -> Option<T> {
        match &mut *self.state.lock() {
            WaitState::Completed { outcome, .. } => outcome.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_complete_once() {
        let waiter = Waiter::new(3);
        assert!(waiter.complete(3, 10u32));
        assert!(!waiter.complete(3, 11));
        assert!(!waiter.reclaim(3));
        assert_eq!(waiter.take_outcome(), Some(10));
        assert_eq!(waiter.take_outcome(), None);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let waiter = Waiter::new(5);
        assert!(!waiter.complete(4, ()));
        assert!(waiter.is_pending());
        assert!(waiter.reclaim(5));
        assert!(!waiter.complete(5, ()));
        assert!(!waiter.is_completed());
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let waiter = Arc::new(Waiter::new(1));
        let remote = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.complete(1, "done")
        });
        assert!(waiter.wait(Duration::from_secs(5)));
        assert!(handle.join().unwrap());
        assert_eq!(waiter.take_outcome(), Some("done"));
    }

    #[test]
    fn test_polled_wait_stops_when_not_alive() {
        let waiter: Waiter<()> = Waiter::new(0);
        let mut checks = 0;
        let start = Instant::now();
        let end = waiter.wait_polled(Duration::from_secs(5), Duration::from_millis(5), || {
            checks += 1;
            checks < 3
        });
        assert_eq!(end, WaitEnd::Aborted);
        assert_eq!(checks, 3);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(waiter.is_pending());
    }

    #[test]
    fn test_polled_wait_sees_completion() {
        let waiter = Arc::new(Waiter::new(2));
        let remote = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.complete(2, 9u8)
        });
        let end = waiter.wait_polled(Duration::from_secs(5), Duration::from_millis(5), || true);
        assert_eq!(end, WaitEnd::Completed);
        assert!(handle.join().unwrap());
        assert_eq!(
            waiter.wait_polled(Duration::from_millis(10), Duration::from_millis(5), || true),
            WaitEnd::Completed
        );
    }

    #[test]
    fn test_wait_times_out() {
        let waiter: Waiter<()> = Waiter::new(0);
        let start = Instant::now();
        assert!(!waiter.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(waiter.is_pending());
    }
}
