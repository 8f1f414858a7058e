use super::{ExtentShare, FideduperangeShare, PrimitiveError, ShareReply, ShareStatus};
use nix::errno::Errno;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use tracing::trace;

const FILE_DEDUPE_RANGE_SAME: i32 = 0;
const FILE_DEDUPE_RANGE_DIFFERS: i32 = 1;

/// `struct file_dedupe_range` from `linux/fs.h`, without the trailing info array.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FileDedupeRange {
    pub src_offset: u64,
    pub src_length: u64,
    pub dest_count: u16,
    pub reserved1: u16,
    pub reserved2: u32,
}

/// `struct file_dedupe_range_info`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FileDedupeRangeInfo {
    pub dest_fd: i64,
    pub dest_offset: u64,
    pub bytes_deduped: u64,
    pub status: i32,
    pub reserved: u32,
}

/// Header immediately followed by its one info record, as the kernel reads it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SingleDestRequest {
    pub range: FileDedupeRange,
    pub info: FileDedupeRangeInfo,
}

// The ioctl number encodes the header size only (_IOWR(0x94, 54, struct file_dedupe_range)).
nix::ioctl_readwrite!(ioctl_fideduperange, 0x94, 54, FileDedupeRange);

impl ExtentShare for FideduperangeShare {
    fn dedupe_range(
        &self,
        src: &File,
        src_offset: u64,
        length: u64,
        dest: &File,
        dest_offset: u64,
    ) -> Result<ShareReply, PrimitiveError> {
        let mut request = SingleDestRequest {
            range: FileDedupeRange {
                src_offset,
                src_length: length,
                dest_count: 1,
                ..Default::default()
            },
            info: FileDedupeRangeInfo {
                dest_fd: dest.as_raw_fd() as i64,
                dest_offset,
                ..Default::default()
            },
        };

        loop {
            // SAFETY: `request` is a repr(C) header followed by exactly `dest_count` info
            // records and outlives the call.
            let res = unsafe {
                ioctl_fideduperange(
                    src.as_raw_fd(),
                    &mut request as *mut SingleDestRequest as *mut FileDedupeRange,
                )
            };
            match res {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(map_errno(errno)),
            }
        }

        trace!(
            "FIDEDUPERANGE status={} bytes_deduped={}",
            request.info.status,
            request.info.bytes_deduped
        );

        match request.info.status {
            FILE_DEDUPE_RANGE_SAME => Ok(ShareReply {
                status: ShareStatus::Same,
                bytes_deduped: request.info.bytes_deduped,
            }),
            FILE_DEDUPE_RANGE_DIFFERS => Ok(ShareReply {
                status: ShareStatus::Differs,
                bytes_deduped: 0,
            }),
            status if status < 0 => Err(map_errno(Errno::from_i32(-status))),
            status => Err(PrimitiveError::Os(status)),
        }
    }
}

fn map_errno(errno: Errno) -> PrimitiveError {
    match errno {
        Errno::EPERM | Errno::EACCES => PrimitiveError::PermissionDenied,
        Errno::EXDEV => PrimitiveError::CrossDevice,
        Errno::EOPNOTSUPP | Errno::ENOTTY => PrimitiveError::Unsupported,
        Errno::EINVAL => PrimitiveError::InvalidArgument,
        Errno::ETXTBSY => PrimitiveError::Busy,
        Errno::EISDIR => PrimitiveError::IsDirectory,
        other => PrimitiveError::Os(other as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_layout_matches_kernel_abi() {
        assert_eq!(size_of::<FileDedupeRange>(), 24);
        assert_eq!(size_of::<FileDedupeRangeInfo>(), 32);
        assert_eq!(size_of::<SingleDestRequest>(), 56);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(map_errno(Errno::EXDEV), PrimitiveError::CrossDevice);
        assert_eq!(map_errno(Errno::EACCES), PrimitiveError::PermissionDenied);
        assert_eq!(map_errno(Errno::ENOTTY), PrimitiveError::Unsupported);
        assert_eq!(map_errno(Errno::EIO), PrimitiveError::Os(Errno::EIO as i32));
    }
}
