use crate::config::{self, DedupeConfig};
use crate::error::Result;
use crate::executor::DedupeExecutor;
use crate::handle::{FileHandle, FileId};
use crate::hasher::{BlockFingerprint, BlockHasher, FingerprintCache};
use crate::index::{CandidateGroup, CandidateIndex};
use crate::lock::{LockedRange, RangeGuard, RangeLocks};
use crate::primitive::{ExtentShare, FideduperangeShare};
use crate::progress::ProgressReporter;
use crate::report::{Disposition, RangeReport, SessionReport};
use crate::verify::{CandidateRange, RangeVerifier, Rejected, VerifiedRange};
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Session lifecycle. Transitions only move forward; cancellation jumps to `Reporting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum SessionState {
    Ready,
    Scanning,
    Indexing,
    Verifying,
    Executing,
    Reporting,
    Done,
}

/// Cloneable handle for observing a running session and requesting a cooperative stop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancelled: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SessionState::Ready)),
        }
    }

    /// In-flight verify/execute units finish; nothing new starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

enum VerifyStep<'a> {
    Verified(VerifiedRange, RangeGuard<'a>),
    Rejected(Rejected),
    /// Lock contended; verify and execute later as one blocking unit.
    Deferred,
    Abandoned,
}

pub struct DedupeSession {
    paths: Vec<PathBuf>,
    config: DedupeConfig,
    pool: rayon::ThreadPool,
    hasher: BlockHasher,
    verifier: RangeVerifier,
    executor: DedupeExecutor,
    locks: RangeLocks,
    cache: Option<FingerprintCache>,
    failed_files: DashMap<FileId, String>,
    handle: SessionHandle,
}

impl DedupeSession {
    /// Validates `config` and prepares the worker pool; no file is touched until `run`.
    pub fn new(paths: Vec<PathBuf>, config: DedupeConfig, primitive: Arc<dyn ExtentShare>) -> Result<Self> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("extent-duper-{}", i))
            .build()?;

        let cache = match &config.cache_path {
            Some(path) => Some(FingerprintCache::open(path)?),
            None => None,
        };

        Ok(Self {
            paths: config::unique_paths(paths),
            hasher: BlockHasher::new(config.block_size),
            verifier: RangeVerifier::new(config.max_compare_bytes),
            executor: DedupeExecutor::new(primitive),
            locks: RangeLocks::new(),
            cache,
            failed_files: DashMap::new(),
            handle: SessionHandle::new(),
            pool,
            config,
        })
    }

    /// A session backed by the kernel's `FIDEDUPERANGE`.
    pub fn with_kernel_primitive(paths: Vec<PathBuf>, config: DedupeConfig) -> Result<Self> {
        Self::new(paths, config, Arc::new(FideduperangeShare))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    /// Run the pipeline to completion or cancellation. File handles are closed on return.
    pub fn run(self, reporter: &dyn ProgressReporter) -> SessionReport {
        let mut report = SessionReport {
            files: self.paths.len(),
            ..SessionReport::default()
        };

        // Scanning
        self.enter(SessionState::Scanning, reporter);
        let scan_start = Instant::now();
        let handles = self.open_files(&mut report);
        let index = Mutex::new(CandidateIndex::new(self.config.block_size));
        let handles = self.scan(handles, &index, &mut report, reporter);
        report.scan_duration = scan_start.elapsed();
        reporter.on_scan_complete(
            handles.len(),
            report.bytes_scanned,
            report.scan_duration.as_secs_f64(),
        );
        info!(
            "Scanned {} files ({} bytes) in {:.2}s",
            handles.len(),
            report.bytes_scanned,
            report.scan_duration.as_secs_f64()
        );
        if self.handle.is_cancelled() {
            return self.finish(report, reporter);
        }

        // Indexing
        self.enter(SessionState::Indexing, reporter);
        let index = index.into_inner().unwrap_or_else(|e| e.into_inner());
        let groups = index.groups();
        let candidates = expand_groups(&groups, &handles);
        report.candidates_total = candidates.len();
        reporter.on_index_complete(groups.len(), candidates.len());
        info!(
            "{} candidate groups, {} candidate ranges from {} blocks",
            groups.len(),
            candidates.len(),
            index.block_count()
        );
        drop(index);
        if self.handle.is_cancelled() {
            return self.finish(report, reporter);
        }

        // Verifying
        self.enter(SessionState::Verifying, reporter);
        let execute_start = Instant::now();
        let done = AtomicUsize::new(0);
        let (verified, deferred) = self.verify_all(candidates, &mut report, &done, reporter);
        if self.handle.is_cancelled() {
            report.execute_duration = execute_start.elapsed();
            return self.finish(report, reporter);
        }

        // Executing
        self.enter(SessionState::Executing, reporter);
        self.execute_all(verified, deferred, &mut report, &done, reporter);
        report.execute_duration = execute_start.elapsed();
        reporter.on_execute_complete(
            report.ranges_merged,
            report.bytes_deduplicated,
            report.execute_duration.as_secs_f64(),
        );

        self.finish(report, reporter)
    }

    fn enter(&self, state: SessionState, reporter: &dyn ProgressReporter) {
        debug!("Session state: {:?} -> {:?}", self.handle.state(), state);
        self.handle.set_state(state);
        reporter.on_state(state);
    }

    fn finish(&self, mut report: SessionReport, reporter: &dyn ProgressReporter) -> SessionReport {
        self.enter(SessionState::Reporting, reporter);
        report.cancelled = self.handle.is_cancelled();

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save() {
                error!("Error saving fingerprint cache: {}", e);
            }
        }

        info!(
            "{} of {} candidate ranges attempted: {} merged, {} differ, {} rejected, {} failed; {} bytes deduplicated, {} reclaimed{}",
            report.ranges_attempted,
            report.candidates_total,
            report.ranges_merged,
            report.ranges_differ,
            report.ranges_rejected,
            report.ranges_failed,
            report.bytes_deduplicated,
            report.bytes_reclaimed,
            if report.cancelled { " (cancelled)" } else { "" }
        );

        self.enter(SessionState::Done, reporter);
        report
    }

    fn open_files(&self, report: &mut SessionReport) -> Vec<Arc<FileHandle>> {
        let mut handles = Vec::with_capacity(self.paths.len());
        for (i, path) in self.paths.iter().enumerate() {
            match FileHandle::open(FileId(i), path, self.config.open_writable) {
                Ok(handle) => handles.push(Arc::new(handle)),
                Err(e) => {
                    error!("Error opening {}: {}", path.display(), e);
                    report.record_file_error(path.clone(), e.to_string());
                }
            }
        }
        handles
    }

    /// Hash files in parallel; each worker inserts its file's blocks as one batch.
    /// Returns the handles that scanned cleanly.
    fn scan(
        &self,
        handles: Vec<Arc<FileHandle>>,
        index: &Mutex<CandidateIndex>,
        report: &mut SessionReport,
        reporter: &dyn ProgressReporter,
    ) -> Vec<Arc<FileHandle>> {
        let total = handles.len();
        let hashed = AtomicUsize::new(0);

        let results: Vec<(Arc<FileHandle>, Option<io::Result<u64>>)> = self.pool.install(|| {
            handles
                .into_par_iter()
                .map(|handle| {
                    if self.handle.is_cancelled() {
                        return (handle, None);
                    }
                    let result = self.scan_file(&handle, index);
                    reporter.on_file_hashed(hashed.fetch_add(1, Ordering::SeqCst) + 1, total);
                    (handle, Some(result))
                })
                .collect()
        });

        let mut scanned = Vec::with_capacity(results.len());
        for (handle, result) in results {
            match result {
                Some(Ok(bytes)) => {
                    report.bytes_scanned += bytes;
                    scanned.push(handle);
                }
                Some(Err(e)) => {
                    error!("Error hashing {}: {}", handle.path().display(), e);
                    report.record_file_error(handle.path().to_path_buf(), e.to_string());
                }
                None => {}
            }
        }
        scanned
    }

    fn scan_file(&self, handle: &FileHandle, index: &Mutex<CandidateIndex>) -> io::Result<u64> {
        let block_size = self.hasher.block_size();
        let cached = match &self.cache {
            Some(cache) => cache.get(handle, block_size).unwrap_or_else(|e| {
                warn!("Fingerprint cache lookup failed for {}: {}", handle.path().display(), e);
                None
            }),
            None => None,
        };

        let blocks: Vec<BlockFingerprint> = match cached {
            Some(blocks) => blocks,
            None => {
                let blocks = self
                    .hasher
                    .hash_blocks(handle)
                    .collect::<io::Result<Vec<_>>>()?;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.put(handle, block_size, blocks.clone()) {
                        warn!("Could not cache fingerprints for {}: {}", handle.path().display(), e);
                    }
                }
                blocks
            }
        };

        let bytes = blocks.iter().map(|b| b.len).sum();
        debug!(
            "Hashed {} blocks of {}",
            blocks.len(),
            handle.path().display()
        );

        let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
        for block in blocks {
            index.insert(handle.id(), block);
        }
        Ok(bytes)
    }

    /// Verify every candidate, holding each verified range's locks into execution.
    /// Collisions are split around the differing block and the pieces verified in the next round.
    fn verify_all<'a>(
        &'a self,
        candidates: Vec<CandidateRange>,
        report: &mut SessionReport,
        done: &AtomicUsize,
        reporter: &dyn ProgressReporter,
    ) -> (Vec<(VerifiedRange, RangeGuard<'a>)>, Vec<CandidateRange>) {
        let mut verified = Vec::new();
        let mut deferred = Vec::new();
        let mut queue = candidates;

        while !queue.is_empty() && !self.handle.is_cancelled() {
            let steps: Vec<VerifyStep<'a>> = self
                .pool
                .install(|| queue.par_iter().map(|c| self.verify_one(c)).collect());

            let mut next = Vec::new();
            for (candidate, step) in queue.into_iter().zip(steps) {
                match step {
                    VerifyStep::Verified(range, guard) => verified.push((range, guard)),
                    VerifyStep::Deferred => deferred.push(candidate),
                    VerifyStep::Abandoned => {}
                    VerifyStep::Rejected(rejected) => {
                        let pieces = self.handle_rejection(&candidate, &rejected);
                        report.candidates_total += pieces.len();
                        next.extend(pieces);
                        report.record_range(RangeReport::new(&candidate, Disposition::Rejected(rejected)));
                        reporter.on_range_complete(
                            done.fetch_add(1, Ordering::SeqCst) + 1,
                            report.candidates_total,
                        );
                    }
                }
            }
            queue = next;
        }

        (verified, deferred)
    }

    fn verify_one(&self, candidate: &CandidateRange) -> VerifyStep<'_> {
        if self.handle.is_cancelled() {
            return VerifyStep::Abandoned;
        }
        if let Some(rejected) = self.excluded(candidate) {
            return VerifyStep::Rejected(rejected);
        }
        let Some(guard) = self.locks.try_acquire(&lock_ranges(candidate)) else {
            return VerifyStep::Deferred;
        };
        match self.verifier.verify(candidate) {
            Ok(range) => VerifyStep::Verified(range, guard),
            Err(rejected) => VerifyStep::Rejected(rejected),
        }
    }

    fn execute_all(
        &self,
        verified: Vec<(VerifiedRange, RangeGuard<'_>)>,
        deferred: Vec<CandidateRange>,
        report: &mut SessionReport,
        done: &AtomicUsize,
        reporter: &dyn ProgressReporter,
    ) {
        let total = AtomicUsize::new(report.candidates_total);
        let retry_limit = self.config.retry_limit;

        let executed: Vec<Option<RangeReport>> = self.pool.install(|| {
            verified
                .into_par_iter()
                .map(|(range, guard)| {
                    if self.handle.is_cancelled() {
                        return None;
                    }
                    let candidate = range.as_candidate();
                    let execution = self.executor.execute_with_retry(range, &self.verifier, retry_limit);
                    drop(guard);
                    reporter.on_range_complete(
                        done.fetch_add(1, Ordering::SeqCst) + 1,
                        total.load(Ordering::SeqCst),
                    );
                    Some(RangeReport::new(&candidate, Disposition::Executed(execution)))
                })
                .collect()
        });
        for range in executed.into_iter().flatten() {
            report.record_range(range);
        }

        // Every carried guard is released by now, so blocking acquisition cannot deadlock.
        let units: Vec<(Vec<RangeReport>, usize)> = self.pool.install(|| {
            deferred
                .into_par_iter()
                .map(|candidate| {
                    if self.handle.is_cancelled() {
                        return (Vec::new(), 0);
                    }
                    let unit = self.process_unit(candidate, retry_limit);
                    total.fetch_add(unit.1, Ordering::SeqCst);
                    reporter.on_range_complete(
                        done.fetch_add(unit.0.len(), Ordering::SeqCst) + unit.0.len(),
                        total.load(Ordering::SeqCst),
                    );
                    unit
                })
                .collect()
        });
        for (ranges, extra_candidates) in units {
            report.candidates_total += extra_candidates;
            for range in ranges {
                report.record_range(range);
            }
        }
    }

    /// Verify and execute `candidate` under one blocking lock, salvaging sub-ranges
    /// around a collision. Returns the range reports and the number of extra candidates split off.
    fn process_unit(&self, candidate: CandidateRange, retry_limit: u32) -> (Vec<RangeReport>, usize) {
        let mut reports = Vec::new();
        let mut extra = 0usize;
        let mut queue = vec![candidate];

        while let Some(candidate) = queue.pop() {
            if let Some(rejected) = self.excluded(&candidate) {
                reports.push(RangeReport::new(&candidate, Disposition::Rejected(rejected)));
                continue;
            }

            let guard = self.locks.acquire(&lock_ranges(&candidate));
            let disposition = match self.verifier.verify(&candidate) {
                Ok(range) => Disposition::Executed(self.executor.execute_with_retry(
                    range,
                    &self.verifier,
                    retry_limit,
                )),
                Err(rejected) => {
                    let pieces = self.handle_rejection(&candidate, &rejected);
                    extra += pieces.len();
                    queue.extend(pieces);
                    Disposition::Rejected(rejected)
                }
            };
            drop(guard);
            reports.push(RangeReport::new(&candidate, disposition));
        }

        (reports, extra)
    }

    /// Bookkeeping for a rejection: I/O errors retire the file, collisions yield the
    /// block-aligned pieces before and after the differing block.
    fn handle_rejection(&self, candidate: &CandidateRange, rejected: &Rejected) -> Vec<CandidateRange> {
        match rejected {
            Rejected::HashCollision { offset } => {
                debug!(
                    "Hash collision {} bytes into {}@{} -> {}@{}",
                    offset,
                    candidate.src.id(),
                    candidate.src_offset,
                    candidate.dest.id(),
                    candidate.dest_offset
                );
                split_around(candidate, *offset, self.config.block_size)
            }
            Rejected::Io { file, message } => {
                warn!("Excluding file {} after I/O error: {}", file, message);
                self.failed_files.insert(*file, message.clone());
                Vec::new()
            }
            Rejected::RangeShrunk { file, len } => {
                debug!("File {} shrank to {} bytes since scan", file, len);
                Vec::new()
            }
        }
    }

    fn excluded(&self, candidate: &CandidateRange) -> Option<Rejected> {
        [candidate.src.id(), candidate.dest.id()]
            .into_iter()
            .find_map(|file| {
                self.failed_files.get(&file).map(|message| Rejected::Io {
                    file,
                    message: format!("file excluded after earlier error: {}", message.value()),
                })
            })
    }
}

fn expand_groups(groups: &[CandidateGroup], handles: &[Arc<FileHandle>]) -> Vec<CandidateRange> {
    let by_id: HashMap<FileId, &Arc<FileHandle>> = handles.iter().map(|h| (h.id(), h)).collect();

    groups
        .iter()
        .flat_map(|group| {
            let by_id = &by_id;
            group.destinations.iter().filter_map(move |dest| {
                let src = by_id.get(&group.source.file)?;
                let dest_handle = by_id.get(&dest.file)?;
                Some(CandidateRange {
                    src: Arc::clone(src),
                    src_offset: group.source.offset,
                    dest: Arc::clone(dest_handle),
                    dest_offset: dest.offset,
                    length: group.length,
                })
            })
        })
        .collect()
}

fn lock_ranges(candidate: &CandidateRange) -> [LockedRange; 2] {
    [
        LockedRange::shared(candidate.src.id(), candidate.src_offset, candidate.length),
        LockedRange::exclusive(candidate.dest.id(), candidate.dest_offset, candidate.length),
    ]
}

/// Pieces of `candidate` before and after the block containing byte `offset`.
fn split_around(candidate: &CandidateRange, offset: u64, block_size: u64) -> Vec<CandidateRange> {
    let bad_start = offset / block_size * block_size;
    let bad_end = (bad_start + block_size).min(candidate.length);
    let mut pieces = Vec::new();

    if bad_start > 0 {
        pieces.push(candidate.sub_range(0, bad_start));
    }
    if bad_end < candidate.length {
        pieces.push(candidate.sub_range(bad_end, candidate.length - bad_end));
    }
    pieces
}
