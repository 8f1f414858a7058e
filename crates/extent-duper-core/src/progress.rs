use crate::session::SessionState;

/// Trait for reporting session progress.
///
/// The CLI implements it with indicatif bars. All methods default to no-ops and may be
/// called from worker threads.
pub trait ProgressReporter: Send + Sync {
    fn on_state(&self, _state: SessionState) {}
    fn on_file_hashed(&self, _files_hashed: usize, _total_files: usize) {}
    fn on_scan_complete(&self, _total_files: usize, _bytes_scanned: u64, _duration_secs: f64) {}
    fn on_index_complete(&self, _groups: usize, _candidates: usize) {}
    fn on_range_complete(&self, _ranges_done: usize, _total_ranges: usize) {}
    fn on_execute_complete(&self, _merged: usize, _bytes_deduplicated: u64, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
