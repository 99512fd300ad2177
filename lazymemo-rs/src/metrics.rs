//! Keeps track of how a cache is being used.
//!
//! All counters are atomics so that they can be updated by callers and refresh tasks alike,
//! without requiring a mutable reference or a lock.
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Collects the usage counters of a single [AggregateCache](crate::cache::AggregateCache).
///
/// # Example
///
/// ```
/// # use lazymemo::metrics::Metrics;
/// let metrics = Metrics::default();
/// metrics.record_read(true);
/// metrics.record_read(false);
///
/// assert_eq!(metrics.reads(), 2);
/// assert_eq!(metrics.hits(), 1);
/// assert_eq!(metrics.hit_rate().round() as i32, 50);
/// ```
#[derive(Default, Debug)]
pub struct Metrics {
    reads: AtomicUsize,
    hits: AtomicUsize,
    refreshes: AtomicUsize,
    failures: AtomicUsize,
    invalidations: AtomicUsize,
}

impl Metrics {
    /// Records a call. A hit is a call which was answered without waiting for a computation.
    pub fn record_read(&self, hit: bool) {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records that a refresh has been started.
    pub fn record_refresh(&self) {
        let _ = self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records that a refresh has failed.
    pub fn record_failure(&self) {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records that the whole cache has been invalidated.
    pub fn record_invalidation(&self) {
        let _ = self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of calls.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of calls which didn't have to wait for a computation.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of refreshes which have been started.
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Returns the number of refreshes which failed.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns how often the cache has been invalidated.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads() {
            0 => 0.,
            n => self.hits() as f32 / n as f32 * 100.,
        }
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reads ({:.1}% hits), {} refreshes, {} failures, {} invalidations",
            self.reads(),
            self.hit_rate(),
            self.refreshes(),
            self.failures(),
            self.invalidations()
        )
    }
}
