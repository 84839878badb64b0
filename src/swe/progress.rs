//! Background progress monitor for dataset construction.
//!
//! Periodically logs how many issues have been fetched, linked, extracted,
//! assembled and rejected so operators can follow a long mining run without
//! reading per-issue log lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of the pipeline counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Issues pulled from the tracker.
    pub fetched: usize,
    /// Issues tied to exactly one merged pull request.
    pub linked: usize,
    /// Linked pull requests that yielded a gold patch.
    pub extracted: usize,
    /// Data points that passed every validation.
    pub assembled: usize,
    /// Issues skipped at any stage.
    pub rejected: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Issues that have left the pipeline one way or the other.
    pub fn settled(&self) -> usize {
        self.assembled + self.rejected
    }
}

/// Shared atomic counters, cloned into pipeline workers.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub fetched: Arc<AtomicUsize>,
    pub linked: Arc<AtomicUsize>,
    pub extracted: Arc<AtomicUsize>,
    pub assembled: Arc<AtomicUsize>,
    pub rejected: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            fetched: Arc::new(AtomicUsize::new(0)),
            linked: Arc::new(AtomicUsize::new(0)),
            extracted: Arc::new(AtomicUsize::new(0)),
            assembled: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            linked: self.linked.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
            assembled: self.assembled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs pipeline progress.
///
/// Call [`ProgressMonitor::stop`] to end it; dropping the monitor also
/// signals the task to exit on its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start logging every `interval`.
    ///
    /// # Arguments
    ///
    /// * `counters` - Shared counters incremented by pipeline workers
    /// * `max_issues` - Issue ceiling for the run, used for the percentage
    /// * `interval` - How often to emit progress logs
    pub fn start(counters: ProgressCounters, max_issues: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if max_issues > 0 {
                    (snap.settled() as f64 / max_issues as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let issues_per_sec = if elapsed_secs > 0.0 {
                    snap.settled() as f64 / elapsed_secs
                } else {
                    0.0
                };

                tracing::info!(
                    fetched = snap.fetched,
                    linked = snap.linked,
                    extracted = snap.extracted,
                    assembled = snap.assembled,
                    rejected = snap.rejected,
                    max_issues = max_issues,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    issues_per_sec = format!("{:.2}", issues_per_sec),
                    "Mining progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
