//! The redundant file header
//!
//! The reserved region at the start of the file holds two identical
//! 2048-byte header copies, each independently checksummed. The
//! header is rewritten in place, so a crash mid-write can corrupt one
//! copy; decode falls back to the other. Both copies corrupt means
//! the file is unusable.
//!
//! The header records the durable baseline: everything up to
//! `base_revision` is fully applied to true page locations, and the
//! recovery pointers bracket the batch records that may still need
//! replaying.

use crate::paging::{compute_checksum, verify_checksum, PageFile, PageId, PagingError, PagingResult, HEADER_REGION_SIZE};

const MAGIC: &[u8] = b"pagedb:1.0\n";
const MAGIC_SIZE: usize = 32;
const COPY_SIZE: usize = (HEADER_REGION_SIZE / 2) as usize;
// magic + base_revision + page_size + three page pointers + crc
const ENCODED_SIZE: usize = MAGIC_SIZE + 8 + 4 + 4 + 4 + 4 + 4;

/// Decoded file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Highest revision fully performed and synced.
    pub base_revision: i64,
    pub page_size: u32,
    /// Extent head of the persisted free list.
    pub free_list_page: Option<PageId>,
    /// Record of the oldest batch that may still need performing.
    /// Recovery starts here when the optimistic pointer is stale.
    pub pessimistic_page: Option<PageId>,
    /// Record of the newest stored batch. Usually valid, but written
    /// without waiting for the batch store to sync.
    pub optimistic_page: Option<PageId>,
}

impl Header {
    pub fn new(page_size: u32) -> Self {
        Self {
            base_revision: -1,
            page_size,
            free_list_page: None,
            pessimistic_page: None,
            optimistic_page: None,
        }
    }

    fn encode_copy(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COPY_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.resize(MAGIC_SIZE, 0);
        buf.extend_from_slice(&self.base_revision.to_le_bytes());
        buf.extend_from_slice(&self.page_size.to_le_bytes());
        for pointer in [
            self.free_list_page,
            self.pessimistic_page,
            self.optimistic_page,
        ] {
            let raw = pointer.map(|p| p as i32).unwrap_or(-1);
            buf.extend_from_slice(&raw.to_le_bytes());
        }
        let crc = compute_checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), ENCODED_SIZE);
        buf.resize(COPY_SIZE, 0);
        buf
    }

    fn decode_copy(data: &[u8]) -> PagingResult<Self> {
        let body = &data[..ENCODED_SIZE - 4];
        let crc = u32::from_le_bytes(data[ENCODED_SIZE - 4..ENCODED_SIZE].try_into().unwrap());
        if !verify_checksum(body, crc) {
            return Err(PagingError::data_corruption("header checksum mismatch"));
        }
        if &body[..MAGIC.len()] != MAGIC {
            return Err(PagingError::data_corruption("bad header magic"));
        }
        let base_revision = i64::from_le_bytes(body[MAGIC_SIZE..MAGIC_SIZE + 8].try_into().unwrap());
        let page_size =
            u32::from_le_bytes(body[MAGIC_SIZE + 8..MAGIC_SIZE + 12].try_into().unwrap());
        let mut pointers = [None; 3];
        for (i, pointer) in pointers.iter_mut().enumerate() {
            let start = MAGIC_SIZE + 12 + i * 4;
            let raw = i32::from_le_bytes(body[start..start + 4].try_into().unwrap());
            *pointer = if raw < 0 { None } else { Some(raw as PageId) };
        }
        Ok(Self {
            base_revision,
            page_size,
            free_list_page: pointers[0],
            pessimistic_page: pointers[1],
            optimistic_page: pointers[2],
        })
    }

    /// Writes both header copies. Does not sync; the caller decides
    /// when durability matters.
    pub fn store(&self, file: &PageFile) -> PagingResult<()> {
        let copy = self.encode_copy();
        let mut region = Vec::with_capacity(COPY_SIZE * 2);
        region.extend_from_slice(&copy);
        region.extend_from_slice(&copy);
        file.write_header_region(&region)
    }

    /// Reads the header, falling back to the second copy if the first
    /// is torn.
    pub fn load(file: &PageFile) -> PagingResult<Self> {
        let region = file.read_header_region()?;
        match Self::decode_copy(&region[..COPY_SIZE]) {
            Ok(header) => Ok(header),
            Err(_) => Self::decode_copy(&region[COPY_SIZE..]).map_err(|_| {
                PagingError::data_corruption("both file header copies are corrupt")
            }),
        }
    }
}
