//! Bounded waiting for the rendezvous.
//!
//! Listen and connect poll the side channel until the peer shows up. Every
//! wait is bounded by a [`Deadline`] and paced by an exponential [`Backoff`]
//! so a missing peer turns into a timeout instead of a hang.

use std::time::{Duration, Instant};

/// Absolute point in monotonic time after which waiting stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    start: Instant,
    expiry: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        let start = Instant::now();
        let expiry = start.checked_add(timeout).unwrap_or(start + Duration::from_secs(86_400 * 365));
        Self { start, expiry }
    }

    /// Returns the remaining time until the deadline expires.
    ///
    /// Returns `None` if the deadline has already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.expiry > now {
            Some(self.expiry - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Time spent since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Sleeps for the next backoff step, clipped to the remaining time.
    ///
    /// Returns `false` without sleeping once the deadline has passed.
    pub fn sleep(&self, backoff: &mut Backoff) -> bool {
        match self.remaining() {
            Some(remaining) => {
                std::thread::sleep(backoff.next_delay().min(remaining));
                true
            }
            None => false,
        }
    }
}

/// Exponential backoff between side-channel polls, doubling up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Starts at `initial`, never waits longer than `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
            attempts: 0,
        }
    }

    /// Returns the delay for this attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
