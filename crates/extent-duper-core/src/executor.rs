use crate::handle::FileId;
use crate::primitive::{ExtentShare, PrimitiveError, ShareReply, ShareStatus};
use crate::verify::{RangeVerifier, Rejected, VerifiedRange};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("primitive refused the call: {0}")]
    Primitive(#[from] PrimitiveError),

    #[error("retry limit exhausted")]
    RetryExhausted,

    #[error("re-verification failed: {0}")]
    Verification(Rejected),
}

/// Result of submitting a verified range. `reclaimed` counts destination bytes shared for
/// the first time in this session; repeating a merge reclaims nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupeOutcome {
    Merged { bytes: u64, reclaimed: u64 },
    RangesDiffer,
    PartialMerge { bytes: u64, reclaimed: u64 },
    Failed(FailureReason),
}

impl DedupeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, DedupeOutcome::Merged { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DedupeOutcome::Merged { .. } => "merged",
            DedupeOutcome::RangesDiffer => "ranges_differ",
            DedupeOutcome::PartialMerge { .. } => "partial_merge",
            DedupeOutcome::Failed(_) => "failed",
        }
    }
}

/// Terminal result of a range after any resubmissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: DedupeOutcome,
    pub attempts: u32,
    pub bytes_deduped: u64,
    pub bytes_reclaimed: u64,
}

pub struct DedupeExecutor {
    primitive: Arc<dyn ExtentShare>,
    /// Destination intervals already shared, per file: sorted, disjoint `[start, end)`.
    shared: DashMap<FileId, Vec<(u64, u64)>>,
}

impl DedupeExecutor {
    pub fn new(primitive: Arc<dyn ExtentShare>) -> Self {
        Self {
            primitive,
            shared: DashMap::new(),
        }
    }

    /// One call to the primitive, interpreted.
    pub fn execute(&self, range: &VerifiedRange) -> DedupeOutcome {
        let reply = self.primitive.dedupe_range(
            range.src().file(),
            range.src_offset(),
            range.length(),
            range.dest().file(),
            range.dest_offset(),
        );

        match reply {
            Err(err) => {
                warn!(
                    "Dedupe of {}@{} -> {}@{} ({} bytes) refused: {}",
                    range.src().path().display(),
                    range.src_offset(),
                    range.dest().path().display(),
                    range.dest_offset(),
                    range.length(),
                    err
                );
                DedupeOutcome::Failed(err.into())
            }
            Ok(ShareReply {
                status: ShareStatus::Differs,
                ..
            }) => {
                debug!(
                    "Ranges differ at execution: {}@{} -> {}@{}",
                    range.src().id(),
                    range.src_offset(),
                    range.dest().id(),
                    range.dest_offset()
                );
                DedupeOutcome::RangesDiffer
            }
            Ok(ShareReply {
                status: ShareStatus::Same,
                bytes_deduped: 0,
            }) => {
                // Already sharing storage: the whole range is merged, nothing new reclaimed.
                debug!(
                    "Range already shared: {}@{} -> {}@{}",
                    range.src().id(),
                    range.src_offset(),
                    range.dest().id(),
                    range.dest_offset()
                );
                self.record_shared(range.dest().id(), range.dest_offset(), range.length());
                DedupeOutcome::Merged {
                    bytes: range.length(),
                    reclaimed: 0,
                }
            }
            Ok(ShareReply {
                status: ShareStatus::Same,
                bytes_deduped,
            }) => {
                let bytes = bytes_deduped.min(range.length());
                let reclaimed = self.record_shared(range.dest().id(), range.dest_offset(), bytes);
                if bytes == range.length() {
                    DedupeOutcome::Merged { bytes, reclaimed }
                } else {
                    DedupeOutcome::PartialMerge { bytes, reclaimed }
                }
            }
        }
    }

    /// Drive `range` to a terminal outcome. Partial merges resubmit the tail; a reported
    /// difference triggers one re-verification. Both count against `retry_limit`.
    pub fn execute_with_retry(
        &self,
        range: VerifiedRange,
        verifier: &RangeVerifier,
        retry_limit: u32,
    ) -> Execution {
        let mut current = range;
        let mut attempts = 0u32;
        let mut bytes_deduped = 0u64;
        let mut bytes_reclaimed = 0u64;
        let mut reverified = false;

        let finish = |outcome, attempts, bytes_deduped, bytes_reclaimed| Execution {
            outcome,
            attempts,
            bytes_deduped,
            bytes_reclaimed,
        };

        loop {
            attempts += 1;
            match self.execute(&current) {
                DedupeOutcome::Merged { bytes, reclaimed } => {
                    bytes_deduped += bytes;
                    bytes_reclaimed += reclaimed;
                    return finish(
                        DedupeOutcome::Merged {
                            bytes: bytes_deduped,
                            reclaimed: bytes_reclaimed,
                        },
                        attempts,
                        bytes_deduped,
                        bytes_reclaimed,
                    );
                }
                DedupeOutcome::Failed(reason) => {
                    return finish(
                        DedupeOutcome::Failed(reason),
                        attempts,
                        bytes_deduped,
                        bytes_reclaimed,
                    );
                }
                DedupeOutcome::PartialMerge { bytes, reclaimed } => {
                    bytes_deduped += bytes;
                    bytes_reclaimed += reclaimed;
                    if let Some(tail) = current.tail(bytes) {
                        current = tail;
                    }
                }
                DedupeOutcome::RangesDiffer => {
                    if reverified {
                        return finish(
                            DedupeOutcome::RangesDiffer,
                            attempts,
                            bytes_deduped,
                            bytes_reclaimed,
                        );
                    }
                    reverified = true;
                    match verifier.verify(&current.as_candidate()) {
                        Ok(fresh) => current = fresh,
                        Err(Rejected::HashCollision { .. }) => {
                            return finish(
                                DedupeOutcome::RangesDiffer,
                                attempts,
                                bytes_deduped,
                                bytes_reclaimed,
                            );
                        }
                        Err(rejected) => {
                            return finish(
                                DedupeOutcome::Failed(FailureReason::Verification(rejected)),
                                attempts,
                                bytes_deduped,
                                bytes_reclaimed,
                            );
                        }
                    }
                }
            }

            if attempts > retry_limit {
                debug!(
                    "Giving up on {}@{} after {} attempts, {} bytes left",
                    current.dest().id(),
                    current.dest_offset(),
                    attempts,
                    current.length()
                );
                return finish(
                    DedupeOutcome::Failed(FailureReason::RetryExhausted),
                    attempts,
                    bytes_deduped,
                    bytes_reclaimed,
                );
            }
        }
    }

    /// Total destination bytes shared so far.
    pub fn reclaimed_bytes(&self) -> u64 {
        self.shared
            .iter()
            .map(|entry| entry.value().iter().map(|(s, e)| e - s).sum::<u64>())
            .sum()
    }

    fn record_shared(&self, file: FileId, offset: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let mut intervals = self.shared.entry(file).or_default();
        insert_interval(&mut intervals, offset, offset + len)
    }
}

/// Merge `[start, end)` into a sorted disjoint interval list; returns the bytes not
/// previously covered.
fn insert_interval(intervals: &mut Vec<(u64, u64)>, start: u64, end: u64) -> u64 {
    let mut already = 0u64;
    let (mut merged_start, mut merged_end) = (start, end);
    let mut result = Vec::with_capacity(intervals.len() + 1);

    for &(s, e) in intervals.iter() {
        if e < start || s > end {
            result.push((s, e));
            continue;
        }
        already += e.min(end).saturating_sub(s.max(start));
        merged_start = merged_start.min(s);
        merged_end = merged_end.max(e);
    }

    result.push((merged_start, merged_end));
    result.sort_unstable();
    *intervals = result;
    (end - start) - already
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::FileHandle;
    use crate::primitive::ByteCompareShare;
    use std::fs::{self, File};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Replies from a fixed script, then falls through to byte comparison.
    struct ScriptedShare {
        script: Mutex<Vec<ShareReply>>,
        fallback: ByteCompareShare,
    }

    impl ExtentShare for ScriptedShare {
        fn dedupe_range(
            &self,
            src: &File,
            src_offset: u64,
            length: u64,
            dest: &File,
            dest_offset: u64,
        ) -> Result<ShareReply, PrimitiveError> {
            let next = self.script.lock().unwrap().pop();
            match next {
                Some(reply) => Ok(reply),
                None => self
                    .fallback
                    .dedupe_range(src, src_offset, length, dest, dest_offset),
            }
        }
    }

    fn unchecked_range(a: &[u8], b: &[u8]) -> (tempfile::TempDir, VerifiedRange) {
        let tmp = tempdir().unwrap();
        let pa = tmp.path().join("a.bin");
        let pb = tmp.path().join("b.bin");
        fs::write(&pa, a).unwrap();
        fs::write(&pb, b).unwrap();
        let range = VerifiedRange {
            src: Arc::new(FileHandle::open(FileId(0), &pa, false).unwrap()),
            src_offset: 0,
            dest: Arc::new(FileHandle::open(FileId(1), &pb, false).unwrap()),
            dest_offset: 0,
            length: a.len() as u64,
        };
        (tmp, range)
    }

    #[test]
    fn test_identical_ranges_merge_full_length() {
        let data = vec![0xC3u8; 16384];
        let (_tmp, range) = unchecked_range(&data, &data);
        let executor = DedupeExecutor::new(Arc::new(ByteCompareShare::new()));

        assert_eq!(
            executor.execute(&range),
            DedupeOutcome::Merged { bytes: 16384, reclaimed: 16384 }
        );
    }

    #[test]
    fn test_forced_collision_yields_ranges_differ() {
        let a = vec![1u8; 8192];
        let mut b = a.clone();
        b[5000] = 0;
        let (_tmp, range) = unchecked_range(&a, &b);
        let executor = DedupeExecutor::new(Arc::new(ByteCompareShare::new()));

        assert_eq!(executor.execute(&range), DedupeOutcome::RangesDiffer);

        let execution = executor.execute_with_retry(range, &RangeVerifier::new(4096), 3);
        assert_eq!(execution.outcome, DedupeOutcome::RangesDiffer);
        assert_eq!(execution.attempts, 1);
        assert_eq!(execution.bytes_deduped, 0);
    }

    #[test]
    fn test_repeat_merge_reclaims_nothing() {
        let data = vec![7u8; 8192];
        let (_tmp, range) = unchecked_range(&data, &data);
        let executor = DedupeExecutor::new(Arc::new(ByteCompareShare::new()));

        assert_eq!(
            executor.execute(&range),
            DedupeOutcome::Merged { bytes: 8192, reclaimed: 8192 }
        );
        assert_eq!(
            executor.execute(&range),
            DedupeOutcome::Merged { bytes: 8192, reclaimed: 0 }
        );
        assert_eq!(executor.reclaimed_bytes(), 8192);
    }

    #[test]
    fn test_already_shared_reply_is_an_idempotent_merge() {
        let data = vec![5u8; 8192];
        let (_tmp, range) = unchecked_range(&data, &data);
        let share = Arc::new(ByteCompareShare::new().reporting_repeats_as_shared());
        let executor = DedupeExecutor::new(share.clone());
        let verifier = RangeVerifier::new(4096);

        let first = executor.execute_with_retry(range.clone(), &verifier, 3);
        assert_eq!(
            first.outcome,
            DedupeOutcome::Merged { bytes: 8192, reclaimed: 8192 }
        );

        let second = executor.execute_with_retry(range, &verifier, 3);
        assert_eq!(
            second.outcome,
            DedupeOutcome::Merged { bytes: 8192, reclaimed: 0 }
        );
        assert_eq!(second.attempts, 1);
        assert_eq!(second.bytes_reclaimed, 0);
        assert_eq!(share.calls(), 2, "a zero-byte success is not resubmitted");
    }

    #[test]
    fn test_already_shared_in_earlier_session_reclaims_nothing() {
        let data = vec![6u8; 4096];
        let (_tmp, range) = unchecked_range(&data, &data);
        let share = ScriptedShare {
            script: Mutex::new(vec![ShareReply {
                status: ShareStatus::Same,
                bytes_deduped: 0,
            }]),
            fallback: ByteCompareShare::new(),
        };
        let executor = DedupeExecutor::new(Arc::new(share));

        assert_eq!(
            executor.execute(&range),
            DedupeOutcome::Merged { bytes: 4096, reclaimed: 0 }
        );
        assert_eq!(
            executor.execute(&range),
            DedupeOutcome::Merged { bytes: 4096, reclaimed: 0 }
        );
    }

    #[test]
    fn test_partial_merges_resubmit_tail() {
        let data = vec![2u8; 12288];
        let (_tmp, range) = unchecked_range(&data, &data);
        let share = Arc::new(ByteCompareShare::new().with_max_bytes_per_call(4096));
        let executor = DedupeExecutor::new(share.clone());

        let execution = executor.execute_with_retry(range, &RangeVerifier::new(4096), 3);
        assert_eq!(
            execution.outcome,
            DedupeOutcome::Merged { bytes: 12288, reclaimed: 12288 }
        );
        assert_eq!(execution.attempts, 3);
        assert_eq!(share.calls(), 3);
    }

    #[test]
    fn test_retry_limit_exhausted_keeps_partial_progress() {
        let data = vec![2u8; 8192];
        let (_tmp, range) = unchecked_range(&data, &data);
        let executor =
            DedupeExecutor::new(Arc::new(ByteCompareShare::new().with_max_bytes_per_call(1000)));

        let execution = executor.execute_with_retry(range, &RangeVerifier::new(4096), 3);
        assert_eq!(
            execution.outcome,
            DedupeOutcome::Failed(FailureReason::RetryExhausted)
        );
        assert_eq!(execution.attempts, 4);
        assert_eq!(execution.bytes_deduped, 4000);
        assert_eq!(execution.bytes_reclaimed, 4000);
    }

    #[test]
    fn test_primitive_failure_is_not_retried() {
        let data = vec![2u8; 4096];
        let (_tmp, range) = unchecked_range(&data, &data);
        let share = Arc::new(ByteCompareShare::new().failing_with(PrimitiveError::CrossDevice));
        let executor = DedupeExecutor::new(share.clone());

        let execution = executor.execute_with_retry(range, &RangeVerifier::new(4096), 3);
        assert_eq!(
            execution.outcome,
            DedupeOutcome::Failed(FailureReason::Primitive(PrimitiveError::CrossDevice))
        );
        assert_eq!(share.calls(), 1);
    }

    #[test]
    fn test_transient_difference_is_reverified_and_retried() {
        let data = vec![9u8; 4096];
        let (_tmp, range) = unchecked_range(&data, &data);
        let share = ScriptedShare {
            script: Mutex::new(vec![ShareReply {
                status: ShareStatus::Differs,
                bytes_deduped: 0,
            }]),
            fallback: ByteCompareShare::new(),
        };
        let executor = DedupeExecutor::new(Arc::new(share));

        let execution = executor.execute_with_retry(range, &RangeVerifier::new(4096), 3);
        assert_eq!(
            execution.outcome,
            DedupeOutcome::Merged { bytes: 4096, reclaimed: 4096 }
        );
        assert_eq!(execution.attempts, 2);
    }

    #[test]
    fn test_insert_interval_counts_only_new_bytes() {
        let mut intervals = Vec::new();
        assert_eq!(insert_interval(&mut intervals, 0, 100), 100);
        assert_eq!(insert_interval(&mut intervals, 200, 300), 100);
        assert_eq!(insert_interval(&mut intervals, 50, 250), 100);
        assert_eq!(intervals, vec![(0, 300)]);
        assert_eq!(insert_interval(&mut intervals, 0, 300), 0);
    }
}
