//! Tracking clock for filter timestamps and exchange ids

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::types::Timestamp;

/// Monotonic time base for the tracking session
///
/// Pose samples are stamped with milliseconds since the clock base so the
/// smoothing filter sees a steadily increasing time axis. The clock also hands
/// out exchange ids that tag each capture sent to the detection worker.
///
/// The clock can be cloned; clones share the base and the id counter.
#[derive(Clone)]
pub struct TrackingClock {
    /// Base instant when the clock started
    base: Arc<Instant>,

    /// Exchange id counter
    exchange_counter: Arc<AtomicU64>,
}

impl TrackingClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self::with_base(Instant::now())
    }

    /// Create a new clock with a specific base instant
    pub fn with_base(base: Instant) -> Self {
        Self {
            base: Arc::new(base),
            exchange_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Current time since the clock base
    pub fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.base.elapsed())
    }

    /// Get a timestamp relative to the clock base
    pub fn timestamp_from_instant(&self, instant: Instant) -> Timestamp {
        Timestamp::from_duration(instant.saturating_duration_since(*self.base))
    }

    /// Generate a new exchange id. Ids start at 1 and never repeat.
    pub fn next_exchange_id(&self) -> u64 {
        self.exchange_counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TrackingClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrackingClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingClock")
            .field("elapsed", &self.base.elapsed())
            .field(
                "next_exchange",
                &self.exchange_counter.load(Ordering::Relaxed),
            )
            .finish()
    }
}
