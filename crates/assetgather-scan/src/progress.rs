//! Gather progress reporting.

use std::time::{Duration, Instant};

/// Progress information sent to subscribers after each batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatherProgress {
    /// Files queued and not yet read.
    pub files_remaining: usize,
    /// Directories discovery has not finished.
    pub paths_remaining: i64,
    /// Files served from the cache so far.
    pub cached_files: usize,
    /// Files read from disk so far.
    pub uncached_files: usize,
    /// Gatherer has no runnable work.
    pub is_idle: bool,
    /// Time since the gatherer was created.
    pub elapsed: Duration,
}

impl GatherProgress {
    /// Total files processed.
    pub fn files_processed(&self) -> usize {
        self.cached_files + self.uncached_files
    }

    /// Files processed per second.
    pub fn files_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.files_processed() as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Share of processed files served from the cache, in `[0, 1]`.
    pub fn cache_hit_ratio(&self) -> f64 {
        match self.files_processed() {
            0 => 0.0,
            total => self.cached_files as f64 / total as f64,
        }
    }
}

/// Counters behind [`GatherProgress`] snapshots.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    start_time: Instant,
    cached_files: usize,
    uncached_files: usize,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cached_files: 0,
            uncached_files: 0,
        }
    }

    pub(crate) fn record(&mut self, cached: usize, uncached: usize) {
        self.cached_files += cached;
        self.uncached_files += uncached;
    }

    pub(crate) fn cached_files(&self) -> usize {
        self.cached_files
    }

    pub(crate) fn uncached_files(&self) -> usize {
        self.uncached_files
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub(crate) fn snapshot(&self, files_remaining: usize, paths_remaining: i64, is_idle: bool) -> GatherProgress {
        GatherProgress {
            files_remaining,
            paths_remaining,
            cached_files: self.cached_files,
            uncached_files: self.uncached_files,
            is_idle,
            elapsed: self.elapsed(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let mut tracker = ProgressTracker::new();
        tracker.record(3, 1);
        tracker.record(0, 4);
        let progress = tracker.snapshot(7, 2, false);
        assert_eq!(progress.cached_files, 3);
        assert_eq!(progress.uncached_files, 5);
        assert_eq!(progress.files_processed(), 8);
        assert_eq!(progress.files_remaining, 7);
        assert!(!progress.is_idle);
        assert!((progress.cache_hit_ratio() - 0.375).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_progress() {
        let progress = GatherProgress::default();
        assert_eq!(progress.files_per_second(), 0.0);
        assert_eq!(progress.cache_hit_ratio(), 0.0);
    }
}
