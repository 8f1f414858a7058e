use crate::executor::{DedupeOutcome, Execution};
use crate::verify::{CandidateRange, Rejected};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: PathBuf,
    pub message: String,
}

/// How a candidate range ended: turned away by verification, or executed to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Rejected(Rejected),
    Executed(Execution),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Rejected(rejected) => write!(f, "rejected: {}", rejected),
            Disposition::Executed(execution) => match &execution.outcome {
                DedupeOutcome::Failed(reason) => write!(f, "failed: {}", reason),
                outcome => f.write_str(outcome.label()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeReport {
    pub src: PathBuf,
    pub src_offset: u64,
    pub dest: PathBuf,
    pub dest_offset: u64,
    pub length: u64,
    #[serde(serialize_with = "serialize_display")]
    pub disposition: Disposition,
}

impl RangeReport {
    pub fn new(candidate: &CandidateRange, disposition: Disposition) -> Self {
        Self {
            src: candidate.src.path().to_path_buf(),
            src_offset: candidate.src_offset,
            dest: candidate.dest.path().to_path_buf(),
            dest_offset: candidate.dest_offset,
            length: candidate.length,
            disposition,
        }
    }

    pub fn outcome(&self) -> Option<&DedupeOutcome> {
        match &self.disposition {
            Disposition::Executed(execution) => Some(&execution.outcome),
            Disposition::Rejected(_) => None,
        }
    }

    pub fn bytes_deduped(&self) -> u64 {
        match &self.disposition {
            Disposition::Executed(execution) => execution.bytes_deduped,
            Disposition::Rejected(_) => 0,
        }
    }

    pub fn bytes_reclaimed(&self) -> u64 {
        match &self.disposition {
            Disposition::Executed(execution) => execution.bytes_reclaimed,
            Disposition::Rejected(_) => 0,
        }
    }
}

/// Aggregate of a session. Counters only grow, and each equals the sum over `ranges`
/// (or `file_errors`) of the matching contribution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub files: usize,
    pub bytes_scanned: u64,
    pub candidates_total: usize,
    pub ranges_attempted: usize,
    pub ranges_merged: usize,
    pub ranges_differ: usize,
    pub ranges_rejected: usize,
    pub ranges_failed: usize,
    pub bytes_deduplicated: u64,
    pub bytes_reclaimed: u64,
    pub cancelled: bool,
    pub scan_duration: Duration,
    pub execute_duration: Duration,
    pub file_errors: Vec<FileError>,
    pub ranges: Vec<RangeReport>,
}

impl SessionReport {
    pub fn record_range(&mut self, range: RangeReport) {
        self.ranges_attempted += 1;
        match &range.disposition {
            Disposition::Rejected(_) => self.ranges_rejected += 1,
            Disposition::Executed(execution) => match execution.outcome {
                DedupeOutcome::Merged { .. } => self.ranges_merged += 1,
                DedupeOutcome::RangesDiffer => self.ranges_differ += 1,
                DedupeOutcome::PartialMerge { .. } | DedupeOutcome::Failed(_) => {
                    self.ranges_failed += 1
                }
            },
        }
        self.bytes_deduplicated += range.bytes_deduped();
        self.bytes_reclaimed += range.bytes_reclaimed();
        self.ranges.push(range);
    }

    pub fn record_file_error(&mut self, path: PathBuf, message: String) {
        self.file_errors.push(FileError { path, message });
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &DedupeOutcome> {
        self.ranges.iter().filter_map(RangeReport::outcome)
    }
}

fn serialize_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
