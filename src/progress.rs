// 📶 Progress reporting - purely observational, never required

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Receives `(current_percent, total_percent, stage_label)` updates
pub trait ProgressReporter: Send + Sync {
    fn report(&self, current: u8, total: u8, stage: &str);
}

/// Any `Fn(u8, u8, &str)` closure is a reporter
impl<F> ProgressReporter for F
where
    F: Fn(u8, u8, &str) + Send + Sync,
{
    fn report(&self, current: u8, total: u8, stage: &str) {
        self(current, total, stage)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _current: u8, _total: u8, _stage: &str) {}
}

/// Logs every update at info level (CLI default)
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, current: u8, total: u8, stage: &str) {
        tracing::info!(percent = current, total, stage, "upload progress");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub current: u8,
    pub total: u8,
    pub stage: String,
}

// ============================================================================
// PIPELINE TRACKER
// ============================================================================

/// Wraps an optional reporter and keeps the percentages it forwards
/// monotonic and within 0..=100.
pub struct ProgressTracker<'a> {
    reporter: Option<&'a dyn ProgressReporter>,
    last: AtomicU8,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(reporter: Option<&'a dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            last: AtomicU8::new(0),
        }
    }

    pub fn report(&self, percent: u8, stage: &str) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::Relaxed);
        if let Some(reporter) = self.reporter {
            reporter.report(percent.max(previous), 100, stage);
        }
    }

    /// Progress for batch `done` of `total`, spread across `start..=end`
    pub fn report_batch(&self, start: u8, end: u8, done: usize, total: usize, stage: &str) {
        let span = end.saturating_sub(start) as usize;
        let offset = if total == 0 { span } else { span * done.min(total) / total };
        self.report(start.saturating_add(offset as u8), stage);
    }

    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_reporter_and_monotonic_tracker() {
        let seen: Mutex<Vec<ProgressUpdate>> = Mutex::new(Vec::new());
        let reporter = |current: u8, total: u8, stage: &str| {
            seen.lock().unwrap().push(ProgressUpdate {
                current,
                total,
                stage: stage.to_string(),
            });
        };

        let tracker = ProgressTracker::new(Some(&reporter));
        tracker.report(10, "parsing file");
        tracker.report(40, "uploading file");
        tracker.report(25, "late update");
        tracker.report(140, "done");

        let seen = seen.lock().unwrap();
        let percents: Vec<u8> = seen.iter().map(|u| u.current).collect();
        assert_eq!(percents, vec![10, 40, 40, 100]);
        assert!(seen.iter().all(|u| u.total == 100));
        assert_eq!(seen[0].stage, "parsing file");
    }

    #[test]
    fn test_batch_progress_spreads_over_range() {
        let tracker = ProgressTracker::new(None);
        tracker.report_batch(55, 95, 0, 4, "batch");
        assert_eq!(tracker.last(), 55);
        tracker.report_batch(55, 95, 2, 4, "batch");
        assert_eq!(tracker.last(), 75);
        tracker.report_batch(55, 95, 4, 4, "batch");
        assert_eq!(tracker.last(), 95);
    }

    #[test]
    fn test_noop_is_silent() {
        let tracker = ProgressTracker::new(Some(&NoopProgress));
        tracker.report(50, "anything");
        assert_eq!(tracker.last(), 50);
    }
}
