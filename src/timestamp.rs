//! Monotonic wall-clock timestamps with microsecond resolution.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(micros_since_epoch: i64) -> Self {
        Timestamp(micros_since_epoch)
    }

    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(d.as_micros() as i64)
    }

    pub fn invalid() -> Self {
        Timestamp(0)
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    pub fn valid(&self) -> bool {
        self.0 > 0
    }

    pub fn add(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROSECONDS_PER_SECOND as f64) as i64;
        Timestamp(self.0 + delta)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.0 / MICROSECONDS_PER_SECOND;
        let micros = self.0 % MICROSECONDS_PER_SECOND;
        write!(f, "{}.{:06}", seconds, micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        let a = Timestamp::new(100);
        let b = Timestamp::new(200);
        assert!(a < b);
    }

    #[test]
    fn add_seconds() {
        let a = Timestamp::new(0);
        let b = a.add(1.5);
        assert_eq!(b.micros_since_epoch(), 1_500_000);
    }
}
