use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic clock for one run. Every time in a run's outcomes and
/// confirmations is seconds since `origin`, so they compare directly.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Wall-clock time at which the origin was captured.
    pub fn wall_origin(&self) -> DateTime<Utc> {
        self.wall_origin
    }

    pub fn now_s(&self) -> f64 {
        self.at(Instant::now())
    }

    pub fn at(&self, instant: Instant) -> f64 {
        instant.saturating_duration_since(self.origin).as_secs_f64()
    }
}
