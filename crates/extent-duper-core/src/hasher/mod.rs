pub mod blocks;
pub mod cache;

pub use blocks::{hash_data, BlockFingerprint, BlockHasher, BlockHashes};
pub use cache::FingerprintCache;
