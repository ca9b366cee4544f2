//! Token-bucket pacing between import batches.
//!
//! Long imports otherwise saturate the disk; the throttle spaces batches
//! out evenly so other work on the host keeps its share of I/O.

use std::{num::NonZeroU32, thread, time::Duration};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

/// Limits how many batches the pipeline hands to storage per second.
pub struct BatchThrottle {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl std::fmt::Debug for BatchThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchThrottle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl BatchThrottle {
    /// Allow at most `max_batches_per_sec` batches per second, without
    /// bursts. Zero means unlimited.
    ///
    /// # Examples
    /// ```
    /// use mapstore_data::BatchThrottle;
    ///
    /// assert!(!BatchThrottle::new(0).is_enabled());
    /// assert!(BatchThrottle::new(5).is_enabled());
    /// ```
    #[must_use]
    pub fn new(max_batches_per_sec: u32) -> Self {
        let limiter = NonZeroU32::new(max_batches_per_sec).map(|rate| {
            RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN))
        });
        Self { limiter }
    }

    /// Block until the next batch may proceed.
    pub fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            while limiter.check().is_err() {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Whether batches are being paced at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }
}
