use std::time::Duration;

use serde::Deserialize;

// =======================================================
// TIMEOUTS CONFIG
// =======================================================
//
// All values are milliseconds, as floats, so sub-millisecond
// deadlines can be expressed in test configurations.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Deadline for dialing an upstream and for waiting on the pool.
    pub connect_ms: f64,
    /// Deadline for acquiring one message chunk from a socket.
    pub read_ms: f64,
    /// Deadline for writing a buffer to a socket.
    pub write_ms: f64,
    /// Wall-clock cap for a whole client session.
    pub total_ms: f64,
}

impl TimeoutsConfig {
    pub fn connect(&self) -> Duration {
        from_ms(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        from_ms(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        from_ms(self.write_ms)
    }

    pub fn total(&self) -> Duration {
        from_ms(self.total_ms)
    }
}

fn from_ms(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}
