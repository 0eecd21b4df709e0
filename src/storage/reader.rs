//! Random-access byte sources for the parser and cache.
//!
//! [`BlockReader`] is the narrow contract the parser reads files through:
//! absolute seeks, chunked reads, a size and a modification stamp. The
//! hardware build backs it with a FAT file on flash storage; here a plain
//! [`std::fs::File`] wrapper and an in-memory reader cover both real use
//! and tests.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Seekable read-only byte source over one named file.
pub trait BlockReader: Send {
    /// Position the read cursor at `offset` bytes from the start.
    fn seek(&mut self, offset: u32) -> io::Result<()>;
    /// Read up to `buf.len()` bytes; returns the number read (0 at EOF).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Total size in bytes.
    fn size(&self) -> u32;
    /// Modification stamp used as the cache key. Any monotonic encoding
    /// works (unix seconds here, packed FAT date/time on the device).
    fn mtime(&self) -> u32;
}

/// Fill `buf` completely or fail, on top of the chunked `read`.
pub fn read_exact(reader: &mut dyn BlockReader, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file truncated"));
        }
        filled += n;
    }
    Ok(())
}

/// [`BlockReader`] over a file on disk.
pub struct FileReader {
    file: File,
    size: u32,
    mtime: u32,
}

impl FileReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        let size = metadata.len().min(u32::MAX as u64) as u32;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Ok(Self { file, size, mtime })
    }
}

impl BlockReader for FileReader {
    fn seek(&mut self, offset: u32) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64)).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn mtime(&self) -> u32 {
        self.mtime
    }
}

/// [`BlockReader`] over a byte vector, for tests and RAM-resident files.
pub struct MemReader {
    data: Vec<u8>,
    pos: usize,
    mtime: u32,
}

impl MemReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0, mtime: 0 }
    }

    pub fn with_mtime(data: Vec<u8>, mtime: u32) -> Self {
        Self { data, pos: 0, mtime }
    }
}

impl BlockReader for MemReader {
    fn seek(&mut self, offset: u32) -> io::Result<()> {
        self.pos = (offset as usize).min(self.data.len());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn mtime(&self) -> u32 {
        self.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_reader_seek_and_read() {
        let mut reader = MemReader::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        reader.seek(3).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [4, 5]);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_exact_detects_truncation() {
        let mut reader = MemReader::new(vec![1, 2]);
        let mut buf = [0u8; 4];
        assert!(read_exact(&mut reader, &mut buf).is_err());
    }

    #[test]
    fn test_seek_past_end_clamps() {
        let mut reader = MemReader::new(vec![1, 2, 3]);
        reader.seek(100).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
