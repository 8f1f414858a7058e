use super::blocks::BlockFingerprint;
use crate::error::Result;
use crate::handle::FileHandle;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tracing::{debug, trace};

/// Persistent per-file fingerprint lists, reused across sessions while a file is unchanged.
pub struct FingerprintCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<BlockFingerprint>>>,
}

impl FingerprintCache {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match File::open(path) {
            Ok(file) => bincode::deserialize_from(BufReader::new(file))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Using '{}' for fingerprint cache ({} entries)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, file: &FileHandle, block_size: u64) -> io::Result<Option<Vec<BlockFingerprint>>> {
        let key = cache_key(file, block_size)?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let hit = entries.get(&key).cloned();
        if hit.is_some() {
            trace!("Found fingerprints for {} in cache", file.path().display());
        }
        Ok(hit)
    }

    pub fn put(&self, file: &FileHandle, block_size: u64, blocks: Vec<BlockFingerprint>) -> io::Result<()> {
        let key = cache_key(file, block_size)?;
        trace!("Caching {} fingerprints for {}", blocks.len(), file.path().display());
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, blocks);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Write the cache atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let tmp_path = partial_path(&self.path);
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            bincode::serialize_into(&mut writer, &*entries)?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!("Saved {} fingerprint cache entries", entries.len());
        Ok(())
    }
}

/// Sibling of `path` with `.partial` appended, never equal to `path` itself.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Key includes subsecond mtime and length so rewritten files miss the cache.
fn cache_key(file: &FileHandle, block_size: u64) -> io::Result<String> {
    let metadata = file.file().metadata()?;
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
    let canonical = fs::canonicalize(file.path())?;

    Ok(format!(
        "{}|{}.{}|{}|{}",
        canonical.to_string_lossy(),
        modified.as_secs(),
        modified.subsec_nanos(),
        metadata.len(),
        block_size
    ))
}
