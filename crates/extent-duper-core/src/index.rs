use crate::handle::FileId;
use crate::hasher::BlockFingerprint;
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Upper bound on unclaimed candidates examined per source block. Keeps pathological
/// buckets (zero-filled files) from turning group formation quadratic.
const MAX_CANDIDATES_PER_BLOCK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct BlockLocation {
    pub file: FileId,
    pub offset: u64,
}

/// A maximal run of matching blocks: one source and one or more destinations,
/// every location covering the same number of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateGroup {
    pub digest: u64,
    pub block_count: u64,
    pub length: u64,
    pub source: BlockLocation,
    pub destinations: Vec<BlockLocation>,
}

impl CandidateGroup {
    pub fn locations(&self) -> impl Iterator<Item = BlockLocation> + '_ {
        std::iter::once(self.source).chain(self.destinations.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Free,
    Source,
    Destination,
}

/// Fingerprint → locations, plus each file's block table for run extension.
#[derive(Debug, Default)]
pub struct CandidateIndex {
    block_size: u64,
    files: BTreeMap<FileId, Vec<Option<BlockFingerprint>>>,
    buckets: AHashMap<(u64, u64), Vec<BlockLocation>>,
}

impl CandidateIndex {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            files: BTreeMap::new(),
            buckets: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, file: FileId, fingerprint: BlockFingerprint) {
        if fingerprint.offset % self.block_size != 0 {
            warn!(
                "Ignoring unaligned block at offset {} in file {}",
                fingerprint.offset, file
            );
            return;
        }

        let index = (fingerprint.offset / self.block_size) as usize;
        let table = self.files.entry(file).or_default();
        if table.len() <= index {
            table.resize(index + 1, None);
        }
        if let Some(stale) = table[index].replace(fingerprint) {
            let location = BlockLocation {
                file,
                offset: fingerprint.offset,
            };
            if let Some(bucket) = self.buckets.get_mut(&stale.key()) {
                bucket.retain(|l| *l != location);
                if bucket.is_empty() {
                    self.buckets.remove(&stale.key());
                }
            }
        }

        self.buckets
            .entry(fingerprint.key())
            .or_default()
            .push(BlockLocation {
                file,
                offset: fingerprint.offset,
            });
    }

    pub fn block_count(&self) -> usize {
        self.files.values().map(|t| t.iter().flatten().count()).sum()
    }

    /// Form candidate groups, walking files in id order and blocks in offset order.
    /// Each block is claimed at most once as a destination, and a claimed destination
    /// never serves as a source.
    pub fn groups(&self) -> Vec<CandidateGroup> {
        let mut buckets: AHashMap<(u64, u64), Vec<BlockLocation>> = self
            .buckets
            .iter()
            .filter(|(_, locations)| locations.len() > 1)
            .map(|(key, locations)| {
                let mut sorted = locations.clone();
                sorted.sort();
                (*key, sorted)
            })
            .collect();

        let mut claims: AHashMap<FileId, Vec<Claim>> = self
            .files
            .iter()
            .map(|(file, table)| (*file, vec![Claim::Free; table.len()]))
            .collect();

        let mut groups = Vec::new();

        for (&file, table) in &self.files {
            for (index, slot) in table.iter().enumerate() {
                let Some(fingerprint) = slot else { continue };
                if self.claim_at(&claims, file, index as u64) == Claim::Destination {
                    continue;
                }
                let Some(bucket) = buckets.get_mut(&fingerprint.key()) else {
                    continue;
                };

                let source = BlockLocation {
                    file,
                    offset: fingerprint.offset,
                };
                let mut candidates: Vec<BlockLocation> = bucket
                    .iter()
                    .copied()
                    .filter(|l| *l != source && self.claim(&claims, *l) == Claim::Free)
                    .collect();
                candidates.sort_by_key(|l| candidate_rank(source, *l));
                candidates.truncate(MAX_CANDIDATES_PER_BLOCK);

                groups.extend(self.groups_from_source(source, candidates, &mut claims));
                bucket.retain(|l| self.claim(&claims, *l) != Claim::Destination);
            }
        }

        debug!("Formed {} candidate groups", groups.len());
        groups
    }

    fn groups_from_source(
        &self,
        source: BlockLocation,
        mut candidates: Vec<BlockLocation>,
        claims: &mut AHashMap<FileId, Vec<Claim>>,
    ) -> Vec<CandidateGroup> {
        let mut groups = Vec::new();

        loop {
            let best = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (i, self.run_length(source, *c, claims)))
                .filter(|(_, run)| *run > 0)
                .fold(None, |best: Option<(usize, u64)>, (i, run)| match best {
                    Some((_, best_run)) if best_run >= run => best,
                    _ => Some((i, run)),
                });
            let Some((best_index, run)) = best else { break };

            let first = candidates.remove(best_index);
            self.mark(claims, source, run, Claim::Source);
            self.mark(claims, first, run, Claim::Destination);
            let mut destinations = vec![first];

            candidates.retain(|candidate| {
                if self.run_length(source, *candidate, claims) >= run {
                    self.mark(claims, *candidate, run, Claim::Destination);
                    destinations.push(*candidate);
                    false
                } else {
                    true
                }
            });

            groups.push(CandidateGroup {
                digest: self.fingerprint_at(source, 0).map(|f| f.digest).unwrap_or(0),
                block_count: run,
                length: self.run_bytes(source, run),
                source,
                destinations,
            });
        }

        groups
    }

    /// Blocks for which `source` and `candidate` keep matching, stopping at claimed blocks,
    /// at self-overlap within one file, and after any non-extendable tail block.
    fn run_length(
        &self,
        source: BlockLocation,
        candidate: BlockLocation,
        claims: &AHashMap<FileId, Vec<Claim>>,
    ) -> u64 {
        if source == candidate {
            return 0;
        }

        let source_start = source.offset / self.block_size;
        let candidate_start = candidate.offset / self.block_size;
        let mut run = 0u64;

        loop {
            if source.file == candidate.file {
                let (lo, hi) = if source_start < candidate_start {
                    (source_start, candidate_start)
                } else {
                    (candidate_start, source_start)
                };
                if lo + run >= hi {
                    break;
                }
            }

            let (Some(a), Some(b)) = (
                self.fingerprint_at(source, run),
                self.fingerprint_at(candidate, run),
            ) else {
                break;
            };
            if a.key() != b.key() {
                break;
            }
            if self.claim_at(claims, source.file, source_start + run) == Claim::Destination
                || self.claim_at(claims, candidate.file, candidate_start + run) != Claim::Free
            {
                break;
            }
            if !a.extendable || !b.extendable {
                if run == 0 {
                    run = 1;
                }
                break;
            }
            run += 1;
        }

        run
    }

    fn fingerprint_at(&self, location: BlockLocation, block: u64) -> Option<&BlockFingerprint> {
        let index = (location.offset / self.block_size + block) as usize;
        self.files.get(&location.file)?.get(index)?.as_ref()
    }

    fn run_bytes(&self, location: BlockLocation, run: u64) -> u64 {
        (0..run)
            .filter_map(|block| self.fingerprint_at(location, block))
            .map(|f| f.len)
            .sum()
    }

    fn claim(&self, claims: &AHashMap<FileId, Vec<Claim>>, location: BlockLocation) -> Claim {
        self.claim_at(claims, location.file, location.offset / self.block_size)
    }

    fn claim_at(&self, claims: &AHashMap<FileId, Vec<Claim>>, file: FileId, block: u64) -> Claim {
        claims
            .get(&file)
            .and_then(|c| c.get(block as usize))
            .copied()
            .unwrap_or(Claim::Free)
    }

    fn mark(
        &self,
        claims: &mut AHashMap<FileId, Vec<Claim>>,
        location: BlockLocation,
        run: u64,
        claim: Claim,
    ) {
        let Some(blocks) = claims.get_mut(&location.file) else {
            return;
        };
        let start = (location.offset / self.block_size) as usize;
        for slot in blocks.iter_mut().skip(start).take(run as usize) {
            // A destination claim wins; source claims never downgrade it.
            if *slot != Claim::Destination {
                *slot = claim;
            }
        }
    }
}

/// Examination order within a bucket, which also breaks ties between equal runs: other files before the source's own file,
/// and within a file the location at the source's offset first, since identical copies
/// line up there and give the longest runs.
fn candidate_rank(source: BlockLocation, candidate: BlockLocation) -> (bool, u64, BlockLocation) {
    (
        candidate.file == source.file,
        candidate.offset.abs_diff(source.offset),
        candidate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BS: u64 = 4096;

    fn block(offset: u64, digest: u64) -> BlockFingerprint {
        BlockFingerprint {
            offset,
            len: BS,
            digest,
            extendable: true,
        }
    }

    fn index_with(files: &[&[u64]]) -> CandidateIndex {
        let mut index = CandidateIndex::new(BS);
        for (id, digests) in files.iter().enumerate() {
            for (i, digest) in digests.iter().enumerate() {
                index.insert(FileId(id), block(i as u64 * BS, *digest));
            }
        }
        index
    }

    #[test]
    fn test_identical_files_form_one_maximal_group() {
        let index = index_with(&[&[1, 2, 3, 4], &[1, 2, 3, 4]]);
        let groups = index.groups();

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.block_count, 4);
        assert_eq!(group.length, 4 * BS);
        assert_eq!(group.source, BlockLocation { file: FileId(0), offset: 0 });
        assert_eq!(group.destinations, vec![BlockLocation { file: FileId(1), offset: 0 }]);
    }

    #[test]
    fn test_mismatching_block_splits_the_run() {
        let index = index_with(&[&[1, 2, 3, 4, 5], &[1, 2, 9, 4, 5]]);
        let groups = index.groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].block_count, 2);
        assert_eq!(groups[1].source.offset, 3 * BS);
        assert_eq!(groups[1].block_count, 2);
    }

    #[test]
    fn test_three_copies_share_one_source() {
        let index = index_with(&[&[1, 2, 3], &[1, 2, 3], &[1, 2, 3]]);
        let groups = index.groups();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].destinations.len(), 2);
        assert_eq!(groups[0].block_count, 3);
    }

    #[test]
    fn test_shorter_match_gets_its_own_group() {
        let index = index_with(&[&[1, 2, 3, 4], &[1, 2, 3, 4], &[1, 2, 8, 9]]);
        let groups = index.groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].block_count, 4);
        assert_eq!(groups[0].destinations, vec![BlockLocation { file: FileId(1), offset: 0 }]);
        assert_eq!(groups[1].block_count, 2);
        assert_eq!(groups[1].source, BlockLocation { file: FileId(0), offset: 0 });
        assert_eq!(groups[1].destinations, vec![BlockLocation { file: FileId(2), offset: 0 }]);
    }

    #[test]
    fn test_no_self_pairing_or_repeated_location() {
        // A single file of identical blocks only pairs non-overlapping halves.
        let index = index_with(&[&[7; 8], &[7; 3]]);
        let groups = index.groups();
        assert!(!groups.is_empty());

        let mut destinations = HashSet::new();
        for group in &groups {
            let locations: Vec<_> = group.locations().collect();
            let unique: HashSet<_> = locations.iter().collect();
            assert_eq!(unique.len(), locations.len(), "group repeats a location");
            assert!(!group.destinations.contains(&group.source));

            for dest in &group.destinations {
                for block in 0..group.block_count {
                    let claimed = (dest.file, dest.offset + block * BS);
                    assert!(destinations.insert(claimed), "destination block claimed twice");
                }
                if dest.file == group.source.file {
                    let (lo, hi) = if dest.offset < group.source.offset {
                        (dest.offset, group.source.offset)
                    } else {
                        (group.source.offset, dest.offset)
                    };
                    assert!(lo + group.length <= hi, "same-file ranges overlap");
                }
            }
        }
    }

    #[test]
    fn test_partial_tail_never_joins_full_run() {
        let mut index = index_with(&[&[1, 2], &[1, 2]]);
        let tail = BlockFingerprint {
            offset: 2 * BS,
            len: 100,
            digest: 42,
            extendable: false,
        };
        index.insert(FileId(0), tail);
        index.insert(FileId(1), tail);

        let groups = index.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].length, 2 * BS);
        assert_eq!(groups[1].block_count, 1);
        assert_eq!(groups[1].length, 100);
        assert_eq!(groups[1].source.offset, 2 * BS);
    }

    #[test]
    fn test_repeated_content_pairs_whole_files() {
        // Every block identical: the crowded bucket must still reach the other file's
        // aligned copy instead of filling up with the source file's own blocks.
        let blocks = vec![0u64; 1024];
        let index = index_with(&[&blocks, &blocks]);
        let groups = index.groups();

        assert_eq!(groups.len(), 1, "got {:?}", groups.iter().map(|g| g.block_count).collect::<Vec<_>>());
        assert_eq!(groups[0].block_count, 1024);
        assert_eq!(groups[0].source, BlockLocation { file: FileId(0), offset: 0 });
        assert_eq!(groups[0].destinations, vec![BlockLocation { file: FileId(1), offset: 0 }]);
    }

    #[test]
    fn test_equal_runs_prefer_other_file() {
        // 0@0 matches 0@2 and 1@0 for two blocks each.
        let index = index_with(&[&[5, 5, 5, 5], &[5, 5]]);
        let groups = index.groups();

        assert_eq!(groups[0].source, BlockLocation { file: FileId(0), offset: 0 });
        assert_eq!(groups[0].block_count, 2);
        assert_eq!(groups[0].destinations[0], BlockLocation { file: FileId(1), offset: 0 });
    }

    #[test]
    fn test_reinserted_block_replaces_stale_fingerprint() {
        let mut index = index_with(&[&[1, 2], &[1, 2]]);
        index.insert(FileId(1), block(BS, 9));

        let groups = index.groups();
        assert_eq!(index.block_count(), 4);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].block_count, 1);
    }

    #[test]
    fn test_unique_blocks_produce_no_groups() {
        let index = index_with(&[&[1, 2, 3], &[4, 5, 6]]);
        assert!(index.groups().is_empty());
        assert_eq!(index.block_count(), 6);
    }
}
