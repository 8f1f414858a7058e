use extent_duper_core::{ProgressReporter, SessionState};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Scanning: bar over files hashed
/// - Indexing: spinner
/// - Verifying/Executing: bar over candidate ranges, whose total grows when collisions split
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn lock_bar(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.lock_bar();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.lock_bar().take() {
            pb.finish_and_clear();
        }
    }

    fn start_spinner(&self, message: &'static str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(TICK_CHARS),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn start_bar(&self, template: &str) {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template(template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("━╸─")
                .tick_chars(TICK_CHARS),
        );
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn update(&self, position: usize, total: usize) {
        if let Some(pb) = self.lock_bar().as_ref() {
            if pb.length() != Some(total as u64) {
                pb.set_length(total as u64);
            }
            pb.set_position(position as u64);
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_state(&self, state: SessionState) {
        match state {
            SessionState::Scanning => self.start_bar(
                "  {spinner:.cyan} Hashing [{bar:30.cyan/dim}] {pos}/{len} files ({eta} remaining)",
            ),
            SessionState::Indexing => self.start_spinner("Indexing block fingerprints..."),
            SessionState::Verifying => self.start_bar(
                "  {spinner:.cyan} Deduplicating [{bar:30.cyan/dim}] {pos}/{len} ranges ({eta} remaining)",
            ),
            SessionState::Reporting => self.finish_bar(),
            SessionState::Ready | SessionState::Executing | SessionState::Done => {}
        }
    }

    fn on_file_hashed(&self, files_hashed: usize, total_files: usize) {
        self.update(files_hashed, total_files);
    }

    fn on_scan_complete(&self, total_files: usize, bytes_scanned: u64, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Scan complete: {} files, {} bytes in {:.2}s",
            total_files, bytes_scanned, duration_secs
        );
    }

    fn on_index_complete(&self, groups: usize, candidates: usize) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Index complete: {} groups, {} candidate ranges",
            groups, candidates
        );
    }

    fn on_range_complete(&self, ranges_done: usize, total_ranges: usize) {
        self.update(ranges_done, total_ranges);
    }

    fn on_execute_complete(&self, merged: usize, bytes_deduplicated: u64, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Dedupe complete: {} ranges merged, {} bytes in {:.2}s",
            merged, bytes_deduplicated, duration_secs
        );
    }
}
