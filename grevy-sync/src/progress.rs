//! Progress reporting for the outer layers.

use tracing::debug;

/// One progress sample for a named stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// The slot the stage has reached.
    pub slot: u64,
    /// The chain offset the stage has reached.
    pub end_offset: u64,
}

/// Receives progress samples keyed by stage name (`"download"`, `"parse"`).
///
/// The outer layer can compute completion percentages against a known
/// target offset.
pub trait ProgressSink: Send + Sync {
    /// Records one sample for `key`.
    fn report(&self, key: &str, progress: Progress);
}

/// A sink that logs each sample.
#[derive(Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, key: &str, progress: Progress) {
        debug!(
            key,
            slot = progress.slot,
            end_offset = progress.end_offset,
            "sync progress"
        );
    }
}
