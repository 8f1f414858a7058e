use super::{ExtentShare, PrimitiveError, ShareReply, ShareStatus};
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const COMPARE_CHUNK: usize = 64 * 1024;

/// Userspace stand-in for the kernel primitive: compares the ranges and reports what
/// `FIDEDUPERANGE` would, without touching storage. Works on any filesystem.
#[derive(Debug, Default)]
pub struct ByteCompareShare {
    max_bytes_per_call: Option<u64>,
    fail_with: Option<PrimitiveError>,
    calls: AtomicUsize,
    /// `(dev, ino, offset, length)` of destination ranges merged so far, when repeats
    /// are reported as already shared.
    shared: Option<Mutex<HashSet<(u64, u64, u64, u64)>>>,
}

impl ByteCompareShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report at most `limit` bytes deduped per call, like filesystems that cap request size.
    pub fn with_max_bytes_per_call(mut self, limit: u64) -> Self {
        self.max_bytes_per_call = Some(limit);
        self
    }

    /// Refuse every call with `err`.
    pub fn failing_with(mut self, err: PrimitiveError) -> Self {
        self.fail_with = Some(err);
        self
    }

    /// Answer a repeated merge of the same destination range with `Same` and zero bytes,
    /// as the kernel does for ranges that already share storage.
    pub fn reporting_repeats_as_shared(mut self) -> Self {
        self.shared = Some(Mutex::new(HashSet::new()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ExtentShare for ByteCompareShare {
    fn dedupe_range(
        &self,
        src: &File,
        src_offset: u64,
        length: u64,
        dest: &File,
        dest_offset: u64,
    ) -> Result<ShareReply, PrimitiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }

        let length = match self.max_bytes_per_call {
            Some(limit) => length.min(limit),
            None => length,
        };

        let same = ranges_equal(src, src_offset, dest, dest_offset, length).map_err(|e| {
            match e.kind() {
                io::ErrorKind::UnexpectedEof => PrimitiveError::InvalidArgument,
                _ => PrimitiveError::Os(e.raw_os_error().unwrap_or(0)),
            }
        })?;

        if same {
            if let Some(shared) = &self.shared {
                let metadata = dest
                    .metadata()
                    .map_err(|e| PrimitiveError::Os(e.raw_os_error().unwrap_or(0)))?;
                let key = (metadata.dev(), metadata.ino(), dest_offset, length);
                if !shared.lock().unwrap_or_else(|e| e.into_inner()).insert(key) {
                    return Ok(ShareReply {
                        status: ShareStatus::Same,
                        bytes_deduped: 0,
                    });
                }
            }
        }

        Ok(if same {
            ShareReply {
                status: ShareStatus::Same,
                bytes_deduped: length,
            }
        } else {
            ShareReply {
                status: ShareStatus::Differs,
                bytes_deduped: 0,
            }
        })
    }
}

fn ranges_equal(src: &File, src_offset: u64, dest: &File, dest_offset: u64, length: u64) -> io::Result<bool> {
    let mut a = vec![0u8; COMPARE_CHUNK];
    let mut b = vec![0u8; COMPARE_CHUNK];
    let mut position = 0u64;

    while position < length {
        let n = ((length - position) as usize).min(COMPARE_CHUNK);
        src.read_exact_at(&mut a[..n], src_offset + position)?;
        dest.read_exact_at(&mut b[..n], dest_offset + position)?;
        if a[..n] != b[..n] {
            return Ok(false);
        }
        position += n as u64;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_reports_same_differs_and_caps() {
        let tmp = tempdir().unwrap();
        let pa = tmp.path().join("a");
        let pb = tmp.path().join("b");
        let mut other = vec![1u8; 8192];
        other[8000] = 0;
        fs::write(&pa, vec![1u8; 8192]).unwrap();
        fs::write(&pb, &other).unwrap();
        let a = File::open(&pa).unwrap();
        let b = File::open(&pb).unwrap();

        let share = ByteCompareShare::new();
        assert_eq!(
            share.dedupe_range(&a, 0, 4096, &b, 0).unwrap(),
            ShareReply { status: ShareStatus::Same, bytes_deduped: 4096 }
        );
        assert_eq!(
            share.dedupe_range(&a, 0, 8192, &b, 0).unwrap().status,
            ShareStatus::Differs
        );
        assert_eq!(
            share.dedupe_range(&a, 4096, 8192, &b, 4096),
            Err(PrimitiveError::InvalidArgument)
        );

        let capped = ByteCompareShare::new().with_max_bytes_per_call(1000);
        assert_eq!(capped.dedupe_range(&a, 0, 4096, &b, 0).unwrap().bytes_deduped, 1000);
        assert_eq!(share.calls(), 3);
    }
}
