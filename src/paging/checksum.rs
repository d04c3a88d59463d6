//! CRC32 checksum computation for on-disk records
//!
//! Every on-disk structure carries a checksum:
//! - each of the two file header copies
//! - every batch record
//! - the persisted free list
//!
//! Any checksum mismatch is corruption.
//!
//! Uses CRC32 (IEEE polynomial).

use crc32fast::Hasher;

/// Computes a CRC32 checksum over the provided data.
///
/// Deterministic: the same input always produces the same output.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies that the computed checksum matches the expected checksum.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}
