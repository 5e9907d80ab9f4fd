// ABOUTME: Server-side monotonic wall clock
// ABOUTME: Epoch-millisecond timestamps that never step backwards

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Server clock for generating timestamps
///
/// Clients compare server timestamps against their own wall clocks, so values
/// are Unix epoch milliseconds. The epoch reading is taken once at creation
/// and advanced with a monotonic instant, so NTP steps on the host never make
/// the server clock jump mid-session.
#[derive(Debug)]
pub struct ServerClock {
    /// When the clock was created
    start: Instant,
    /// Unix epoch milliseconds at `start`
    epoch_millis: i64,
}

impl ServerClock {
    /// Create a new server clock starting now
    pub fn new() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            start: Instant::now(),
            epoch_millis,
        }
    }

    /// Get current server time in Unix epoch milliseconds
    #[inline]
    pub fn now_millis(&self) -> i64 {
        self.epoch_millis + self.start.elapsed().as_millis() as i64
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}
