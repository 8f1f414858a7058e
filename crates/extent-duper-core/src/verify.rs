use crate::handle::{FileHandle, FileId};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// A source/destination pair suspected to hold identical bytes.
#[derive(Debug, Clone)]
pub struct CandidateRange {
    pub src: Arc<FileHandle>,
    pub src_offset: u64,
    pub dest: Arc<FileHandle>,
    pub dest_offset: u64,
    pub length: u64,
}

impl CandidateRange {
    /// `length` bytes starting `start` bytes into this range.
    pub fn sub_range(&self, start: u64, length: u64) -> CandidateRange {
        CandidateRange {
            src: Arc::clone(&self.src),
            src_offset: self.src_offset + start,
            dest: Arc::clone(&self.dest),
            dest_offset: self.dest_offset + start,
            length,
        }
    }
}

/// A range pair proven byte-identical at verification time. Only `RangeVerifier`
/// constructs these.
#[derive(Debug, Clone)]
pub struct VerifiedRange {
    pub(crate) src: Arc<FileHandle>,
    pub(crate) src_offset: u64,
    pub(crate) dest: Arc<FileHandle>,
    pub(crate) dest_offset: u64,
    pub(crate) length: u64,
}

impl VerifiedRange {
    pub fn src(&self) -> &FileHandle {
        &self.src
    }

    pub fn src_offset(&self) -> u64 {
        self.src_offset
    }

    pub fn dest(&self) -> &FileHandle {
        &self.dest
    }

    pub fn dest_offset(&self) -> u64 {
        self.dest_offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// The part left after the first `consumed` bytes were merged.
    pub fn tail(&self, consumed: u64) -> Option<VerifiedRange> {
        if consumed >= self.length {
            return None;
        }
        Some(VerifiedRange {
            src: Arc::clone(&self.src),
            src_offset: self.src_offset + consumed,
            dest: Arc::clone(&self.dest),
            dest_offset: self.dest_offset + consumed,
            length: self.length - consumed,
        })
    }

    pub fn as_candidate(&self) -> CandidateRange {
        CandidateRange {
            src: Arc::clone(&self.src),
            src_offset: self.src_offset,
            dest: Arc::clone(&self.dest),
            dest_offset: self.dest_offset,
            length: self.length,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    /// Matching fingerprints over differing bytes. Expected occasionally, not a fault.
    #[error("Hash collision: ranges differ {offset} bytes into the range")]
    HashCollision { offset: u64 },

    #[error("Range shrunk: file {file} is now {len} bytes")]
    RangeShrunk { file: FileId, len: u64 },

    #[error("IO error on file {file}: {message}")]
    Io { file: FileId, message: String },
}

impl Rejected {
    fn io(file: &FileHandle, err: io::Error) -> Self {
        Rejected::Io {
            file: file.id(),
            message: err.to_string(),
        }
    }
}

/// Byte-exact comparison in bounded chunks, stopping at the first difference.
#[derive(Debug, Clone, Copy)]
pub struct RangeVerifier {
    chunk_size: usize,
}

impl RangeVerifier {
    pub fn new(max_compare_bytes: usize) -> Self {
        Self {
            chunk_size: max_compare_bytes.max(1),
        }
    }

    pub fn verify(&self, candidate: &CandidateRange) -> Result<VerifiedRange, Rejected> {
        check_len(&candidate.src, candidate.src_offset + candidate.length)?;
        check_len(&candidate.dest, candidate.dest_offset + candidate.length)?;

        let buf_len = (self.chunk_size as u64).min(candidate.length) as usize;
        let mut src_buf = vec![0u8; buf_len];
        let mut dest_buf = vec![0u8; buf_len];

        let mut position = 0u64;
        while position < candidate.length {
            let n = ((candidate.length - position) as usize).min(buf_len);
            read_chunk(&candidate.src, &mut src_buf[..n], candidate.src_offset + position)?;
            read_chunk(&candidate.dest, &mut dest_buf[..n], candidate.dest_offset + position)?;

            if src_buf[..n] != dest_buf[..n] {
                let first = src_buf[..n]
                    .iter()
                    .zip(&dest_buf[..n])
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                return Err(Rejected::HashCollision {
                    offset: position + first as u64,
                });
            }
            position += n as u64;
        }

        trace!(
            "Verified {} bytes: {}@{} == {}@{}",
            candidate.length,
            candidate.src.id(),
            candidate.src_offset,
            candidate.dest.id(),
            candidate.dest_offset
        );

        Ok(VerifiedRange {
            src: Arc::clone(&candidate.src),
            src_offset: candidate.src_offset,
            dest: Arc::clone(&candidate.dest),
            dest_offset: candidate.dest_offset,
            length: candidate.length,
        })
    }
}

fn check_len(file: &FileHandle, required: u64) -> Result<(), Rejected> {
    let len = file.current_len().map_err(|e| Rejected::io(file, e))?;
    if len < required {
        return Err(Rejected::RangeShrunk {
            file: file.id(),
            len,
        });
    }
    Ok(())
}

fn read_chunk(file: &FileHandle, buf: &mut [u8], offset: u64) -> Result<(), Rejected> {
    match file.read_exact_at(buf, offset) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Rejected::RangeShrunk {
            file: file.id(),
            len: file.current_len().unwrap_or(offset),
        }),
        Err(e) => Err(Rejected::io(file, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use tempfile::tempdir;

    fn candidate(a: &[u8], b: &[u8], length: u64) -> (tempfile::TempDir, CandidateRange) {
        let tmp = tempdir().unwrap();
        let pa = tmp.path().join("a.bin");
        let pb = tmp.path().join("b.bin");
        fs::write(&pa, a).unwrap();
        fs::write(&pb, b).unwrap();
        let range = CandidateRange {
            src: Arc::new(FileHandle::open(FileId(0), &pa, false).unwrap()),
            src_offset: 0,
            dest: Arc::new(FileHandle::open(FileId(1), &pb, false).unwrap()),
            dest_offset: 0,
            length,
        };
        (tmp, range)
    }

    #[test]
    fn test_identical_ranges_verify() {
        let data = vec![0x5Au8; 10_000];
        let (_tmp, range) = candidate(&data, &data, 10_000);
        let verified = RangeVerifier::new(4096).verify(&range).unwrap();
        assert_eq!(verified.length(), 10_000);
    }

    #[test]
    fn test_collision_reports_first_difference_across_chunks() {
        let a = vec![1u8; 10_000];
        let mut b = a.clone();
        b[9_000] = 2;
        b[9_500] = 3;
        let (_tmp, range) = candidate(&a, &b, 10_000);

        let rejected = RangeVerifier::new(4096).verify(&range).unwrap_err();
        assert_eq!(rejected, Rejected::HashCollision { offset: 9_000 });
    }

    #[test]
    fn test_truncated_file_is_range_shrunk() {
        let data = vec![9u8; 8192];
        let (tmp, range) = candidate(&data, &data, 8192);
        OpenOptions::new()
            .write(true)
            .open(tmp.path().join("b.bin"))
            .unwrap()
            .set_len(4096)
            .unwrap();

        match RangeVerifier::new(4096).verify(&range) {
            Err(Rejected::RangeShrunk { file, len }) => {
                assert_eq!(file, FileId(1));
                assert_eq!(len, 4096);
            }
            other => panic!("Expected RangeShrunk, got {:?}", other),
        }
    }

    #[test]
    fn test_tail_after_partial_merge() {
        let data = vec![4u8; 8192];
        let (_tmp, range) = candidate(&data, &data, 8192);
        let verified = RangeVerifier::new(8192).verify(&range).unwrap();

        let tail = verified.tail(4096).unwrap();
        assert_eq!(tail.src_offset(), 4096);
        assert_eq!(tail.dest_offset(), 4096);
        assert_eq!(tail.length(), 4096);
        assert!(verified.tail(8192).is_none());
    }
}
