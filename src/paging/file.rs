//! Raw page I/O over a single flat file
//!
//! The first 4096 bytes of the file are reserved for the redundant
//! file header; pages start immediately after it. Page `n` lives at
//! byte offset `HEADER_REGION_SIZE + n * page_size`.
//!
//! Reads past the end of the file zero-fill: a page that was
//! allocated but never written reads as zeroes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::errors::{PagingError, PagingResult};
use super::PageId;

/// Size of the reserved header region at the start of the file.
pub const HEADER_REGION_SIZE: u32 = 4096;

/// Raw page-granular file access.
pub struct PageFile {
    path: PathBuf,
    file: Mutex<File>,
    page_size: u32,
    /// File length observed at open. Zero for a fresh file.
    initial_len: u64,
}

impl PageFile {
    /// Opens (or creates) the page file at `path`.
    pub fn open(path: &Path, page_size: u32) -> PagingResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                PagingError::io_error(format!("failed to open page file: {}", path.display()), e)
            })?;
        let initial_len = file
            .metadata()
            .map_err(|e| PagingError::io_error("failed to read page file metadata", e))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_size,
            initial_len,
        })
    }

    /// Returns true when the file was empty at open (needs reset, not
    /// recovery).
    pub fn is_new(&self) -> bool {
        self.initial_len == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The fixed page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of pages needed to hold `byte_len` bytes.
    pub fn pages(&self, byte_len: u32) -> u32 {
        if byte_len == 0 {
            return 1;
        }
        (byte_len - 1) / self.page_size + 1
    }

    fn offset(&self, page: PageId) -> u64 {
        u64::from(HEADER_REGION_SIZE) + u64::from(page) * u64::from(self.page_size)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> PagingResult<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| PagingError::io_error("seek failed", e))?;
        // Partial reads at EOF leave the remainder zeroed.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PagingError::io_error("read failed", e)),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> PagingResult<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| PagingError::io_error("seek failed", e))?;
        file.write_all(data)
            .map_err(|e| PagingError::io_error("write failed", e))
    }

    /// Reads into `buf` starting at the first byte of `page`. `buf`
    /// may span multiple pages.
    pub fn read(&self, page: PageId, buf: &mut [u8]) -> PagingResult<()> {
        self.read_at(self.offset(page), buf)
    }

    /// Reads `count` whole pages starting at `page`.
    pub fn read_pages(&self, page: PageId, count: u32) -> PagingResult<Vec<u8>> {
        let mut buf = vec![0u8; (self.page_size * count) as usize];
        self.read(page, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` starting at the first byte of `page`. `data` must
    /// not extend past the pages it is expected to occupy; the caller
    /// owns that accounting.
    pub fn write(&self, page: PageId, data: &[u8]) -> PagingResult<()> {
        self.write_at(self.offset(page), data)
    }

    /// Reads the reserved header region.
    pub fn read_header_region(&self) -> PagingResult<Vec<u8>> {
        let mut buf = vec![0u8; HEADER_REGION_SIZE as usize];
        self.read_at(0, &mut buf)?;
        Ok(buf)
    }

    /// Writes the reserved header region.
    pub fn write_header_region(&self, data: &[u8]) -> PagingResult<()> {
        self.write_at(0, data)
    }

    /// Forces all written data to disk.
    pub fn sync(&self) -> PagingResult<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
            .map_err(|e| PagingError::io_error("fsync failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_file(page_size: u32) -> (TempDir, PageFile) {
        let dir = TempDir::new().unwrap();
        let pf = PageFile::open(&dir.path().join("pages.db"), page_size).unwrap();
        (dir, pf)
    }

    #[test]
    fn test_fresh_file_is_new() {
        let (_dir, pf) = open_test_file(512);
        assert!(pf.is_new());
    }

    #[test]
    fn test_reopened_file_is_not_new() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pages.db");
        {
            let pf = PageFile::open(&path, 512).unwrap();
            pf.write(0, b"x").unwrap();
        }
        let pf = PageFile::open(&path, 512).unwrap();
        assert!(!pf.is_new());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, pf) = open_test_file(512);
        pf.write(3, b"hello page three").unwrap();
        let mut buf = [0u8; 16];
        pf.read(3, &mut buf).unwrap();
        assert_eq!(&buf, b"hello page three");
    }

    #[test]
    fn test_unwritten_page_reads_zeroes() {
        let (_dir, pf) = open_test_file(512);
        pf.write(0, b"first").unwrap();
        let mut buf = [0xffu8; 32];
        pf.read(9, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn test_pages_are_disjoint() {
        let (_dir, pf) = open_test_file(64);
        pf.write(0, &[0xaa; 64]).unwrap();
        pf.write(1, &[0xbb; 64]).unwrap();
        let a = pf.read_pages(0, 1).unwrap();
        let b = pf.read_pages(1, 1).unwrap();
        assert!(a.iter().all(|&x| x == 0xaa));
        assert!(b.iter().all(|&x| x == 0xbb));
    }

    #[test]
    fn test_multi_page_read() {
        let (_dir, pf) = open_test_file(64);
        pf.write(0, &[1u8; 64]).unwrap();
        pf.write(1, &[2u8; 64]).unwrap();
        let both = pf.read_pages(0, 2).unwrap();
        assert_eq!(both.len(), 128);
        assert!(both[..64].iter().all(|&x| x == 1));
        assert!(both[64..].iter().all(|&x| x == 2));
    }

    #[test]
    fn test_header_region_does_not_overlap_pages() {
        let (_dir, pf) = open_test_file(512);
        let header = vec![0xcc; HEADER_REGION_SIZE as usize];
        pf.write_header_region(&header).unwrap();
        pf.write(0, &[0x11; 512]).unwrap();
        let header_back = pf.read_header_region().unwrap();
        assert!(header_back.iter().all(|&x| x == 0xcc));
        let page_back = pf.read_pages(0, 1).unwrap();
        assert!(page_back.iter().all(|&x| x == 0x11));
    }

    #[test]
    fn test_pages_ceiling_division() {
        let (_dir, pf) = open_test_file(512);
        assert_eq!(pf.pages(0), 1);
        assert_eq!(pf.pages(1), 1);
        assert_eq!(pf.pages(512), 1);
        assert_eq!(pf.pages(513), 2);
        assert_eq!(pf.pages(1024), 2);
    }
}
