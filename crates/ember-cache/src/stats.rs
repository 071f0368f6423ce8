//! Statement cache statistics for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for statement cache operations.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Plan lookups by statement id.
    lookups: AtomicU64,
    /// Lookups that found a valid plan.
    hits: AtomicU64,
    /// Lookups of invalidated or unknown statements.
    misses: AtomicU64,
    /// Statements given a new id.
    registrations: AtomicU64,
    /// Plans compiled again from retained SQL.
    recompiles: AtomicU64,
    /// Statements dropped after their last use ended.
    removals: AtomicU64,
    /// Plans invalidated by schema changes.
    invalidations: AtomicU64,
}

impl CacheStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a lookup and whether it found a plan.
    #[inline]
    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a newly registered statement.
    #[inline]
    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a plan compiled again.
    #[inline]
    pub fn record_recompile(&self) {
        self.recompiles.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a removed statement.
    #[inline]
    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `count` invalidated plans.
    #[inline]
    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns lookups.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Returns hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns registrations.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Returns recompiles.
    pub fn recompiles(&self) -> u64 {
        self.recompiles.load(Ordering::Relaxed)
    }

    /// Returns removals.
    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Returns invalidations.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            0.0
        } else {
            self.hits() as f64 / lookups as f64
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        for counter in [
            &self.lookups,
            &self.hits,
            &self.misses,
            &self.registrations,
            &self.recompiles,
            &self.removals,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            lookups: AtomicU64::new(self.lookups()),
            hits: AtomicU64::new(self.hits()),
            misses: AtomicU64::new(self.misses()),
            registrations: AtomicU64::new(self.registrations()),
            recompiles: AtomicU64::new(self.recompiles()),
            removals: AtomicU64::new(self.removals()),
            invalidations: AtomicU64::new(self.invalidations()),
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CacheStats {{ lookups: {}, hits: {}, hit_ratio: {:.2}%, registrations: {}, recompiles: {}, removals: {} }}",
            self.lookups(),
            self.hits(),
            self.hit_ratio() * 100.0,
            self.registrations(),
            self.recompiles(),
            self.removals()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ratio() {
        let stats = CacheStats::new();
        stats.record_lookup(true);
        stats.record_lookup(false);

        assert_eq!(stats.lookups(), 2);
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert!((stats.hit_ratio() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStats::new();
        stats.record_registration();
        stats.record_invalidations(3);
        stats.reset();

        assert_eq!(stats.registrations(), 0);
        assert_eq!(stats.invalidations(), 0);
    }

    #[test]
    fn test_clone_snapshots() {
        let stats = CacheStats::new();
        stats.record_removal();
        let snapshot = stats.clone();
        stats.record_removal();

        assert_eq!(snapshot.removals(), 1);
        assert_eq!(stats.removals(), 2);
    }
}
