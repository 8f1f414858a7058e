use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Position of a file in the session's input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct FileId(pub usize);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open file participating in a session. Reads are positional so one handle
/// can be shared by every worker without seeking.
#[derive(Debug)]
pub struct FileHandle {
    id: FileId,
    path: PathBuf,
    file: File,
    len_at_open: u64,
}

impl FileHandle {
    pub fn open(id: FileId, path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            len_at_open: metadata.len(),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len_at_open(&self) -> u64 {
        self.len_at_open
    }

    /// Length as of now; may differ from `len_at_open` if the file was truncated or grown.
    pub fn current_len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Fill as much of `buf` as the file holds from `offset`, returning the byte count.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_read_at_stops_at_eof() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("short.bin");
        fs::write(&path, b"0123456789").unwrap();

        let handle = FileHandle::open(FileId(0), &path, false).unwrap();
        assert_eq!(handle.len_at_open(), 10);

        let mut buf = [0u8; 8];
        assert_eq!(handle.read_at(&mut buf, 6).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(handle.read_at(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_open_rejects_directories() {
        let tmp = tempdir().unwrap();
        assert!(FileHandle::open(FileId(0), tmp.path(), false).is_err());
    }
}
