use std::time::{Duration, Instant};

/// Wall-clock allowance for one crawl.
///
/// Pure arithmetic against a fixed start: never paused, never extended. Shared
/// by reference across every concurrent branch of the crawl, each of which
/// checks it before starting new work.
#[derive(Debug, Clone, Copy)]
pub struct CrawlBudget {
    start: Instant,
    max_duration: Duration,
}

impl CrawlBudget {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            max_duration,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.max_duration.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.max_duration
    }

    /// Share of the budget consumed, 0.0 ..= 1.0.
    pub fn fraction_used(&self) -> f64 {
        if self.max_duration.is_zero() {
            return 1.0;
        }
        (self.elapsed().as_secs_f64() / self.max_duration.as_secs_f64()).min(1.0)
    }

    /// True once more than `high_water` of the budget is gone.
    pub fn past(&self, high_water: f64) -> bool {
        self.expired() || self.fraction_used() >= high_water
    }
}
