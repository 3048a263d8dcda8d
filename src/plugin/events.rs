//! Install progress events

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Callback receiving `(percent, label)` at stage boundaries
pub type ProgressSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Stage boundaries reported while installing a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    DownloadStarted,
    Downloaded,
    Verified,
    Validated,
    Activated,
    Registered,
    Complete,
}

impl InstallStage {
    pub fn percent(&self) -> u8 {
        match self {
            InstallStage::DownloadStarted => 10,
            InstallStage::Downloaded => 40,
            InstallStage::Verified => 55,
            InstallStage::Validated => 70,
            InstallStage::Activated => 85,
            InstallStage::Registered => 95,
            InstallStage::Complete => 100,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstallStage::DownloadStarted => "downloading",
            InstallStage::Downloaded => "downloaded",
            InstallStage::Verified => "verified",
            InstallStage::Validated => "validated",
            InstallStage::Activated => "activated",
            InstallStage::Registered => "registered",
            InstallStage::Complete => "complete",
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Forwards stage events to an optional sink, never letting percent go down
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Option<ProgressSink>,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            sink,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn silent() -> Self {
        Self::new(None)
    }

    pub fn stage(&self, stage: InstallStage) {
        self.report(stage.percent(), stage.label());
    }

    /// Forward `percent` and its label; events behind the last one are dropped
    pub fn report(&self, percent: u8, label: &str) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent < previous {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(percent, label);
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("has_sink", &self.sink.is_some())
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}
