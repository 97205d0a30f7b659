//! Time source used by the plugins to decide when operations are due.
//!
//! Production code uses [`SystemTimeProvider`]; tests drive a
//! [`VirtualTimeProvider`] forward explicitly so that passes are deterministic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time
pub trait TimeProvider: Send + Sync + 'static {
    /// Get the current instant
    fn now(&self) -> Instant;
}

/// Production time provider that uses the real monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Virtual time provider for testing
///
/// Time only moves when [`advance`](Self::advance) is called. Clones share the
/// same virtual clock.
#[derive(Debug, Clone)]
pub struct VirtualTimeProvider {
    instant: Arc<Mutex<Instant>>,
}

impl VirtualTimeProvider {
    /// Create a virtual clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            instant: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move virtual time forward
    pub fn advance(&self, duration: Duration) {
        let mut instant = self.instant.lock();
        *instant += duration;
    }
}

impl Default for VirtualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for VirtualTimeProvider {
    fn now(&self) -> Instant {
        *self.instant.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_time_only_moves_on_advance() {
        let time = VirtualTimeProvider::new();
        let start = time.now();
        assert_eq!(time.now(), start);

        time.advance(Duration::from_millis(250));
        assert_eq!(time.now() - start, Duration::from_millis(250));

        let shared = time.clone();
        shared.advance(Duration::from_millis(50));
        assert_eq!(time.now() - start, Duration::from_millis(300));
    }
}
