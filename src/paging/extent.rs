//! Extent chains
//!
//! Records larger than one page (batch records, the persisted free
//! list) are stored as a chain of pages. Each page carries a small
//! header followed by a payload chunk:
//!
//! - next page id (i32 LE, -1 terminates the chain)
//! - chunk length (u32 LE)
//! - chunk bytes
//!
//! Chain pages are allocated individually and need not be contiguous.
//! `unfree_extent` re-marks a chain's pages allocated during recovery;
//! the persisted free list never accounts for extent pages, so
//! recovery rediscovers them by walking the chains.

use std::collections::HashSet;

use super::allocator::Allocator;
use super::errors::{PagingError, PagingResult};
use super::file::PageFile;
use super::PageId;

const EXTENT_HEADER_SIZE: u32 = 8;
const NO_NEXT: i32 = -1;

fn chunk_capacity(file: &PageFile) -> usize {
    (file.page_size() - EXTENT_HEADER_SIZE) as usize
}

/// Writes `payload` as an extent chain, allocating its pages.
/// Returns the head page id.
pub fn write_extent(file: &PageFile, allocator: &Allocator, payload: &[u8]) -> PagingResult<PageId> {
    let cap = chunk_capacity(file);
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(cap).collect()
    };

    let mut pages = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        match allocator.alloc(1) {
            Ok(page) => pages.push(page),
            Err(e) => {
                for page in pages {
                    allocator.free(page, 1);
                }
                return Err(e);
            }
        }
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let next = if i + 1 < pages.len() {
            pages[i + 1] as i32
        } else {
            NO_NEXT
        };
        let mut buf = Vec::with_capacity(EXTENT_HEADER_SIZE as usize + chunk.len());
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        buf.extend_from_slice(chunk);
        file.write(pages[i], &buf)?;
    }
    Ok(pages[0])
}

/// Walks the chain starting at `head`, returning each page id and its
/// decoded chunk bounds. Shared by read/free/unfree.
fn walk_extent(file: &PageFile, head: PageId) -> PagingResult<Vec<(PageId, Vec<u8>)>> {
    let cap = chunk_capacity(file);
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    let mut page = head as i32;

    while page != NO_NEXT {
        if page < 0 || !visited.insert(page) {
            return Err(PagingError::corruption_at_page(
                head,
                "extent chain is cyclic or has an invalid link",
            ));
        }
        let raw = file.read_pages(page as PageId, 1)?;
        let next = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        if len > cap {
            return Err(PagingError::corruption_at_page(
                page as PageId,
                "extent chunk length exceeds page capacity",
            ));
        }
        let start = EXTENT_HEADER_SIZE as usize;
        chain.push((page as PageId, raw[start..start + len].to_vec()));
        page = next;
    }
    Ok(chain)
}

/// Reads the payload of the extent chain starting at `head`.
pub fn read_extent(file: &PageFile, head: PageId) -> PagingResult<Vec<u8>> {
    let chain = walk_extent(file, head)?;
    let mut payload = Vec::new();
    for (_, chunk) in chain {
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

/// Returns the pages occupied by the extent chain starting at `head`.
pub fn extent_pages(file: &PageFile, head: PageId) -> PagingResult<Vec<PageId>> {
    Ok(walk_extent(file, head)?.into_iter().map(|(p, _)| p).collect())
}

/// Frees every page of the extent chain starting at `head`.
pub fn free_extent(file: &PageFile, allocator: &Allocator, head: PageId) -> PagingResult<()> {
    for page in extent_pages(file, head)? {
        allocator.free(page, 1);
    }
    Ok(())
}

/// Recovery: re-marks every page of the chain as allocated.
pub fn unfree_extent(file: &PageFile, allocator: &Allocator, head: PageId) -> PagingResult<()> {
    for page in extent_pages(file, head)? {
        allocator.unfree(page, 1);
    }
    Ok(())
}
