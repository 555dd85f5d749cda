//! Deadlines for connectivity watches.
//!
//! A [`Deadline`] is an absolute point on the tokio clock, so it can be shared
//! by several concurrent per-channel waits and still expire at one moment.

use std::time::Duration;

use tokio::time::Instant;

/// Absolute deadline on the tokio clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    expiry: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self::at(now.checked_add(timeout).unwrap_or_else(far_future))
    }

    /// Creates a deadline expiring at the given instant.
    pub fn at(expiry: Instant) -> Self {
        Self { expiry }
    }

    /// Returns the instant at which the deadline expires.
    pub fn instant(&self) -> Instant {
        self.expiry
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
}

// About thirty years out.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::new(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(expiry: Instant) -> Self {
        Self::at(expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_remaining_counts_down() {
        let deadline = Deadline::new(Duration::from_secs(10));
        assert_eq!(deadline.remaining(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Some(Duration::from_secs(6)));
        assert!(!deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let deadline = Deadline::new(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ordering() {
        let early = Deadline::new(Duration::from_secs(1));
        let late = Deadline::new(Duration::from_secs(2));
        assert!(early < late);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_overflow() {
        let deadline = Deadline::new(Duration::MAX);
        assert!(!deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_instant() {
        let at = Instant::now() + Duration::from_secs(3);
        let deadline: Deadline = at.into();
        assert_eq!(deadline.instant(), at);
    }
}
