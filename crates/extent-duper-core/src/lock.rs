use crate::handle::FileId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

type HeldSpans = HashMap<FileId, Vec<(u64, u64, LockMode)>>;

/// Advisory byte-range locks over the session's files. A guard covers every range of one
/// verify+execute unit and is acquired all at once, so holders never wait on each other
/// in a cycle.
#[derive(Debug, Default)]
pub struct RangeLocks {
    held: Mutex<HeldSpans>,
    released: Condvar,
}

/// Sources are only read, so any number of units may share one; destinations are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedRange {
    pub file: FileId,
    pub offset: u64,
    pub length: u64,
    pub mode: LockMode,
}

impl LockedRange {
    pub fn shared(file: FileId, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
            mode: LockMode::Shared,
        }
    }

    pub fn exclusive(file: FileId, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
            mode: LockMode::Exclusive,
        }
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

pub struct RangeGuard<'a> {
    locks: &'a RangeLocks,
    ranges: Vec<LockedRange>,
}

impl RangeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until none of `ranges` overlaps a held range, then hold them all.
    pub fn acquire(&self, ranges: &[LockedRange]) -> RangeGuard<'_> {
        let mut held = self.lock_held();
        while ranges.iter().any(|r| overlaps_held(&held, r)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }

        self.grant(&mut held, ranges)
    }

    /// Like `acquire`, but gives up instead of waiting.
    pub fn try_acquire(&self, ranges: &[LockedRange]) -> Option<RangeGuard<'_>> {
        let mut held = self.lock_held();
        if ranges.iter().any(|r| overlaps_held(&held, r)) {
            return None;
        }
        Some(self.grant(&mut held, ranges))
    }

    fn grant(&self, held: &mut HeldSpans, ranges: &[LockedRange]) -> RangeGuard<'_> {
        for range in ranges {
            held.entry(range.file)
                .or_default()
                .push((range.offset, range.end(), range.mode));
        }

        RangeGuard {
            locks: self,
            ranges: ranges.to_vec(),
        }
    }

    pub fn held_count(&self) -> usize {
        self.lock_held().values().map(Vec::len).sum()
    }

    fn lock_held(&self) -> MutexGuard<'_, HeldSpans> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn overlaps_held(held: &HeldSpans, range: &LockedRange) -> bool {
    held.get(&range.file).map_or(false, |spans| {
        spans.iter().any(|&(start, end, mode)| {
            let both_shared = mode == LockMode::Shared && range.mode == LockMode::Shared;
            !both_shared && start < range.end() && range.offset < end
        })
    })
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.lock_held();
        for range in &self.ranges {
            if let Some(spans) = held.get_mut(&range.file) {
                if let Some(pos) = spans
                    .iter()
                    .position(|&span| span == (range.offset, range.end(), range.mode))
                {
                    spans.swap_remove(pos);
                }
                if spans.is_empty() {
                    held.remove(&range.file);
                }
            }
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
