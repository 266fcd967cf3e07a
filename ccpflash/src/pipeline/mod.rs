//! Block transfer pipelines built on top of [`Session`](crate::session::Session).
//!
//! - [`download`]: chunked firmware download with batch and continuous CRCs
//! - [`upload`]: block-transfer reads assembled into one buffer

pub mod download;
pub mod upload;

pub use download::{DownloadPlan, DownloadStep, DownloadSummary, swap_bytes};

/// Decides when a progress observer should be notified.
///
/// A report is due once at least 1% of the total has been transferred since
/// the previous one, and always when the transfer completes.
#[derive(Debug, Clone, Copy)]
pub struct ProgressThrottle {
    total: usize,
    last: usize,
    finished: bool,
}

impl ProgressThrottle {
    /// Create a throttle for a transfer of `total` bytes.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            last: 0,
            finished: false,
        }
    }

    /// Record that `done` bytes are complete. Returns whether to report.
    pub fn update(&mut self, done: usize) -> bool {
        if done >= self.total {
            let report = !self.finished;
            self.finished = true;
            self.last = done;
            return report;
        }

        if done.saturating_sub(self.last).saturating_mul(100) >= self.total {
            self.last = done;
            return true;
        }

        false
    }
}
