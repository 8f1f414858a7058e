use crate::handle::FileHandle;
use std::hash::Hasher as _;
use std::io;
use twox_hash::XxHash64;

/// Digest of one block. Equal fingerprints make two blocks candidates, not duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockFingerprint {
    pub offset: u64,
    /// Bytes hashed; shorter than the block size only for a file's final block.
    pub len: u64,
    pub digest: u64,
    /// False for the trailing partial block, which never joins a run of full blocks.
    pub extendable: bool,
}

impl BlockFingerprint {
    /// Bucket key: blocks of different lengths never collide.
    pub fn key(&self) -> (u64, u64) {
        (self.digest, self.len)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockHasher {
    block_size: u64,
}

impl BlockHasher {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Lazily fingerprint `file` from offset 0. Every call starts a fresh pass.
    pub fn hash_blocks<'a>(&self, file: &'a FileHandle) -> BlockHashes<'a> {
        BlockHashes {
            file,
            buffer: vec![0; self.block_size as usize],
            offset: 0,
            done: false,
        }
    }
}

pub struct BlockHashes<'a> {
    file: &'a FileHandle,
    buffer: Vec<u8>,
    offset: u64,
    done: bool,
}

impl Iterator for BlockHashes<'_> {
    type Item = io::Result<BlockFingerprint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let read = match self.file.read_at(&mut self.buffer, self.offset) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if read == 0 {
            self.done = true;
            return None;
        }

        let extendable = read == self.buffer.len();
        if !extendable {
            self.done = true;
        }

        let fingerprint = BlockFingerprint {
            offset: self.offset,
            len: read as u64,
            digest: hash_data(&self.buffer[..read]),
            extendable,
        };
        self.offset += read as u64;
        Some(Ok(fingerprint))
    }
}

pub fn hash_data(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}
