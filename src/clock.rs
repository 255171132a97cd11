use std::fmt;
use std::sync::Arc;

use chrono::Utc;

/// Sentinel accepted by [`Clock::from`] meaning "use real wall-clock time".
pub const WALL_CLOCK: i64 = -1;

/// Time source for a file system: a fixed epoch-ms value, a nullary
/// closure, or the wall clock.
#[derive(Clone)]
pub enum Clock {
    Fixed(i64),
    Source(Arc<dyn Fn() -> i64 + Send + Sync>),
    System,
}

impl Clock {
    pub fn now_ms(&self) -> i64 {
        match self {
            Clock::Fixed(ms) => *ms,
            Clock::Source(f) => f(),
            Clock::System => Utc::now().timestamp_millis(),
        }
    }

    pub fn source(f: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Clock::Source(Arc::new(f))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

impl From<i64> for Clock {
    fn from(ms: i64) -> Self {
        if ms == WALL_CLOCK {
            Clock::System
        } else {
            Clock::Fixed(ms)
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clock::Fixed(ms) => write!(f, "Clock::Fixed({})", ms),
            Clock::Source(_) => f.write_str("Clock::Source(..)"),
            Clock::System => f.write_str("Clock::System"),
        }
    }
}
