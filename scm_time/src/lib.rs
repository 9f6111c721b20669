//! Abstractions over the system clock so that anything time-based can be
//! driven deterministically from tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

/// An instant in time, with nanosecond precision.
///
/// Wraps a UTC timestamp. All arithmetic is checked; overflowing operations
/// return `None` rather than panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create a `Time` from the provided number of nanoseconds since the epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Create a `Time` from the provided number of milliseconds since the epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(
            DateTime::from_timestamp_millis(millis)
                .expect("timestamp millis out of range"),
        )
    }

    /// Returns the number of nanoseconds since the epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0
            .timestamp_nanos_opt()
            .expect("timestamp nanos out of range")
    }

    /// Returns the number of milliseconds since the epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the duration since `earlier`, or `None` if `earlier` is later
    /// than `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// Adds `duration` to this time, returning `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(duration).map(Time)
    }

    /// Subtracts `duration` from this time, returning `None` on overflow.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let duration = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_sub_signed(duration).map(Time)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

/// A source of the current time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

impl TimeProvider for Arc<dyn TimeProvider> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

/// A [`TimeProvider`] that reads the wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new [`SystemProvider`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a fixed value until told otherwise.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a [`MockProvider`] that reports `start` as the current time.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the reported time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance the reported time by `duration`, returning the new value.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl TimeProvider for Arc<MockProvider> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_provider() {
        let provider = SystemProvider::new();
        let a = provider.now();
        std::thread::sleep(Duration::from_millis(10));
        let b = provider.now();
        assert!(b > a);
    }

    #[test]
    fn test_mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now().timestamp_nanos(), 0);

        provider.set(Time::from_timestamp_millis(12));
        assert_eq!(provider.now().timestamp_millis(), 12);

        let advanced = provider.inc(Duration::from_millis(8));
        assert_eq!(advanced.timestamp_millis(), 20);
        assert_eq!(provider.now().timestamp_millis(), 20);
    }

    #[test]
    fn test_duration_since() {
        let a = Time::from_timestamp_millis(100);
        let b = Time::from_timestamp_millis(150);

        assert_eq!(b.checked_duration_since(a), Some(Duration::from_millis(50)));
        assert_eq!(a.checked_duration_since(a), Some(Duration::from_millis(0)));
        assert_eq!(a.checked_duration_since(b), None);
    }

    #[test]
    fn test_arithmetic() {
        let a = Time::from_timestamp_millis(100);

        assert_eq!(a + Duration::from_millis(25), Time::from_timestamp_millis(125));
        assert_eq!(a - Duration::from_millis(25), Time::from_timestamp_millis(75));
    }
}
