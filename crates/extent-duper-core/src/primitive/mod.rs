//! The filesystem's extent-sharing primitive, behind a trait so sessions can be
//! driven by the kernel ioctl or by a userspace stand-in.

pub mod emulated;
#[cfg(target_os = "linux")]
mod linux;

pub use emulated::ByteCompareShare;

use std::fs::File;
use thiserror::Error;

/// Per-destination status reported by a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    /// Ranges compared equal and `bytes_deduped` bytes now share storage.
    Same,
    /// Ranges compared unequal; nothing was shared.
    Differs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareReply {
    pub status: ShareStatus,
    /// May be less than the requested length.
    pub bytes_deduped: u64,
}

/// The call itself was refused. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("source and destination are on different filesystems")]
    CrossDevice,

    #[error("filesystem does not support extent sharing")]
    Unsupported,

    #[error("invalid argument (unaligned range or range beyond EOF)")]
    InvalidArgument,

    #[error("file is busy")]
    Busy,

    #[error("is a directory")]
    IsDirectory,

    #[error("OS error {0}")]
    Os(i32),
}

/// Share storage between `length` bytes of `src` at `src_offset` and `dest` at `dest_offset`
/// if, and only if, they are identical. Blocking; may wait on filesystem I/O.
pub trait ExtentShare: Send + Sync {
    fn dedupe_range(
        &self,
        src: &File,
        src_offset: u64,
        length: u64,
        dest: &File,
        dest_offset: u64,
    ) -> Result<ShareReply, PrimitiveError>;
}

/// `FIDEDUPERANGE` with a single destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct FideduperangeShare;

#[cfg(not(target_os = "linux"))]
impl ExtentShare for FideduperangeShare {
    fn dedupe_range(
        &self,
        _src: &File,
        _src_offset: u64,
        _length: u64,
        _dest: &File,
        _dest_offset: u64,
    ) -> Result<ShareReply, PrimitiveError> {
        Err(PrimitiveError::Unsupported)
    }
}
