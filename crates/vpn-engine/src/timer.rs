//! Reconnection timer
//!
//! A single session-wide budget for "time since the user clicked connect or
//! since we were last fully connected". Only one timer can be armed; arming
//! it again while active is a no-op, never a reset, so fast failures cannot
//! extend the retry window.

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Armed {
    id: u64,
    deadline: Instant,
}

#[derive(Debug)]
pub struct ReconnectionTimer {
    budget: Duration,
    armed: Option<Armed>,
    next_id: u64,
}

impl ReconnectionTimer {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            armed: None,
            next_id: 1,
        }
    }

    /// Arm the timer. Returns `false` if it was already running.
    pub fn start(&mut self) -> bool {
        self.start_at(Instant::now())
    }

    pub fn start_at(&mut self, now: Instant) -> bool {
        if self.armed.is_some() {
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.armed = Some(Armed {
            id,
            deadline: now + self.budget,
        });
        debug!("Reconnection timer #{} armed ({:?})", id, self.budget);
        true
    }

    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            debug!("Reconnection timer #{} cancelled", armed.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.armed.is_some()
    }

    /// Identifier of the armed timer; expiry notices carry it.
    pub fn id(&self) -> Option<u64> {
        self.armed.map(|a| a.id)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|a| a.deadline)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.armed.is_some_and(|a| now >= a.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_is_noop() {
        let mut timer = ReconnectionTimer::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(timer.start_at(t0));
        let id = timer.id();
        let deadline = timer.deadline();

        assert!(!timer.start_at(t0 + Duration::from_secs(30)));
        assert_eq!(timer.id(), id);
        assert_eq!(timer.deadline(), deadline);
    }

    #[test]
    fn test_cancel_then_start_gets_new_id() {
        let mut timer = ReconnectionTimer::new(Duration::from_secs(1));

        timer.start();
        let first = timer.id().unwrap();
        timer.cancel();
        assert!(!timer.is_active());

        timer.start();
        assert_ne!(timer.id().unwrap(), first);
    }

    #[test]
    fn test_due() {
        let mut timer = ReconnectionTimer::new(Duration::from_millis(10));
        let t0 = Instant::now();
        timer.start_at(t0);

        assert!(!timer.is_due(t0));
        assert!(timer.is_due(t0 + Duration::from_millis(10)));
    }
}
