//! Progress-callback trait for remote parse events.
//!
//! Pass an [`Arc<dyn ParseProgressCallback>`] to
//! [`crate::pipeline::remote::RemoteParser::parse_document`] to observe the
//! orchestrator as it moves through its phases. The server logs events with
//! [`TracingProgressCallback`]; the CLI drives a terminal spinner.
//!
//! # Example
//!
//! ```rust
//! use edgequake_papers::{ParsePhase, ParseProgressCallback};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! struct PollCounter(AtomicU32);
//!
//! impl ParseProgressCallback for PollCounter {
//!     fn on_poll(&self, attempt: u32, _max: u32, _counts: &edgequake_papers::StateCounts) {
//!         self.0.store(attempt, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::sync::Arc;
use tracing::{info, warn};

/// Orchestrator phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestUploadUrls,
    Upload,
    Poll,
    Download,
    Extract,
}

impl ParsePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ParsePhase::RequestUploadUrls => "request-upload-urls",
            ParsePhase::Upload => "upload",
            ParsePhase::Poll => "poll",
            ParsePhase::Download => "download",
            ParsePhase::Extract => "extract",
        }
    }
}

/// Per-state file counts from one batch status poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.failed
    }

    pub fn all_terminal(&self) -> bool {
        self.total() > 0 && self.pending == 0 && self.running == 0
    }
}

/// Called by the remote parsing orchestrator as it runs.
///
/// All methods default to no-ops so implementors only override what they
/// care about.
pub trait ParseProgressCallback: Send + Sync {
    fn on_phase_start(&self, phase: ParsePhase) {
        let _ = phase;
    }

    /// After each status poll.
    fn on_poll(&self, attempt: u32, max_attempts: u32, counts: &StateCounts) {
        let _ = (attempt, max_attempts, counts);
    }

    /// A file in the batch reached `failed`; its siblings carry on.
    fn on_file_failed(&self, file_name: &str, error: &str) {
        let _ = (file_name, error);
    }

    /// A bundle download attempt failed and another will follow.
    fn on_download_retry(&self, attempt: u32, max_attempts: u32, error: &str) {
        let _ = (attempt, max_attempts, error);
    }

    fn on_parse_complete(&self, figure_count: usize) {
        let _ = figure_count;
    }
}

pub struct NoopProgressCallback;

impl ParseProgressCallback for NoopProgressCallback {}

/// Logs every event through `tracing`.
pub struct TracingProgressCallback {
    label: String,
}

impl TracingProgressCallback {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ParseProgressCallback for TracingProgressCallback {
    fn on_phase_start(&self, phase: ParsePhase) {
        info!(doc = %self.label, phase = phase.as_str(), "parse phase started");
    }

    fn on_poll(&self, attempt: u32, max_attempts: u32, counts: &StateCounts) {
        info!(
            doc = %self.label,
            attempt,
            max_attempts,
            done = counts.done,
            failed = counts.failed,
            running = counts.running + counts.pending,
            "batch status"
        );
    }

    fn on_file_failed(&self, file_name: &str, error: &str) {
        warn!(doc = %self.label, file = file_name, "remote parse failed: {}", error);
    }

    fn on_download_retry(&self, attempt: u32, max_attempts: u32, error: &str) {
        warn!(
            doc = %self.label,
            "bundle download attempt {}/{} failed: {}",
            attempt,
            max_attempts,
            error
        );
    }

    fn on_parse_complete(&self, figure_count: usize) {
        info!(doc = %self.label, figure_count, "image-aware parse complete");
    }
}

pub type ProgressCallback = Arc<dyn ParseProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<ParsePhase>>,
        failures: AtomicUsize,
        retries: AtomicUsize,
    }

    impl ParseProgressCallback for Recorder {
        fn on_phase_start(&self, phase: ParsePhase) {
            self.phases.lock().unwrap().push(phase);
        }

        fn on_file_failed(&self, _file_name: &str, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_download_retry(&self, _attempt: u32, _max: u32, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn defaults_are_noops() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_phase_start(ParsePhase::Poll);
        cb.on_poll(1, 200, &StateCounts::default());
        cb.on_file_failed("a.pdf", "boom");
        cb.on_download_retry(1, 3, "timeout");
        cb.on_parse_complete(4);
    }

    #[test]
    fn recorder_sees_overridden_events() {
        let rec = Recorder::default();
        rec.on_phase_start(ParsePhase::Upload);
        rec.on_phase_start(ParsePhase::Poll);
        rec.on_file_failed("b.pdf", "bad");
        rec.on_download_retry(1, 3, "reset");
        rec.on_parse_complete(2);
        assert_eq!(
            *rec.phases.lock().unwrap(),
            vec![ParsePhase::Upload, ParsePhase::Poll]
        );
        assert_eq!(rec.failures.load(Ordering::SeqCst), 1);
        assert_eq!(rec.retries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_counts_terminal() {
        let mut c = StateCounts::default();
        assert!(!c.all_terminal());
        c.done = 1;
        c.running = 1;
        assert!(!c.all_terminal());
        c.running = 0;
        c.failed = 1;
        assert!(c.all_terminal());
        assert_eq!(c.total(), 2);
    }
}
