//! Positional block I/O.
//!
//! Codeblocks are read with pread-style positional access so that many
//! threads can pull from one file handle without seeking under a lock.

use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{IsyntaxError, IsyntaxResult};

/// Read-only random access to the bytes of a slide container.
///
/// Implementations must be safe to call from multiple threads at once.
pub trait BlockSource: Send + Sync {
    /// Fill `buf` from `offset`. Short reads are errors: a codeblock that
    /// runs past the end of the container is corrupt.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length of the container in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from slide container",
            ));
        }
        filled += n;
    }
    Ok(())
}

/// A slide container on disk.
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> IsyntaxResult<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                IsyntaxError::not_found(format!("{}", path.display()))
            } else {
                IsyntaxError::Io(e)
            }
        })?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl BlockSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        read_exact_at(&self.file, offset, buf)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// A slide container held entirely in memory.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockSource for MemorySource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of in-memory container",
                )
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_file_source_reads_at_offset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        let source = FileSource::open(&path).unwrap();
        assert_eq!(source.len(), 10);

        let mut buf = [0u8; 4];
        source.read_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn test_file_source_short_read_is_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob.bin");
        std::fs::write(&path, b"abc").unwrap();

        let source = FileSource::open(&path).unwrap();
        let mut buf = [0u8; 8];
        assert!(source.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_file_source_missing_path() {
        let result = FileSource::open(Path::new("/nonexistent/slide.isyntax"));
        assert!(matches!(result, Err(IsyntaxError::NotFound(_))));
    }

    #[test]
    fn test_memory_source_bounds() {
        let source = MemorySource::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        source.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(source.read_at(3, &mut buf).is_err());
    }
}
