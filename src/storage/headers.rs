//! # Store Header
//!
//! The first two pages of a store hold identical-layout, double-buffered
//! headers. A commit writes the slot that the *new* generation selects
//! (`generation % 2`), so the previously valid header is never touched while
//! it is still the published one. On open, both slots are parsed and the one
//! with the highest generation whose checksum verifies wins; if neither
//! verifies the store is corrupt and refuses to open.
//!
//! ## Header Layout (120 bytes, page 0 and page 1)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       16    magic        b"VellumStore\x00\x00\x00\x00\x00"
//! 16      4     version      On-disk schema version (currently 1)
//! 20      4     page_size    Fixed at creation, immutable
//! 24      48    root         Root tree state (see TreeState)
//! 72      8     next_page    First never-allocated page number
//! 80      8     global_etag  Last assigned document etag
//! 88      8     last_txn_id  Id of the committing transaction
//! 96      8     generation   Monotonic commit counter, selects the slot
//! 104     8     checksum     CRC-64/ECMA-182 over bytes 0..104
//! ```
//!
//! All fields are little-endian. The checksum is computed over the header
//! with the checksum field zeroed, using the same CRC-64 polynomial the rest
//! of the codebase uses for frame integrity.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::CURRENT_SCHEMA_VERSION;
use crate::errors::StoreError;
use crate::tree::TreeState;

pub const STORE_MAGIC: &[u8; 16] = b"VellumStore\x00\x00\x00\x00\x00";
pub const STORE_HEADER_SIZE: usize = 112;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    root: TreeState,
    next_page: U64,
    global_etag: U64,
    last_txn_id: U64,
    generation: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == STORE_HEADER_SIZE);

impl StoreHeader {
    pub fn new(page_size: u32, root: TreeState, next_page: u64) -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: U32::new(CURRENT_SCHEMA_VERSION),
            page_size: U32::new(page_size),
            root,
            next_page: U64::new(next_page),
            global_etag: U64::new(0),
            last_txn_id: U64::new(0),
            generation: U64::new(0),
            checksum: U64::new(0),
        }
    }

    /// Parses a header slot without verifying its checksum. Recovery reads
    /// both slots this way and then picks the newest one that verifies.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= STORE_HEADER_SIZE,
            "buffer too small for StoreHeader: {} < {}",
            bytes.len(),
            STORE_HEADER_SIZE
        );

        let header = Self::read_from_bytes(&bytes[..STORE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreHeader: {:?}", e))?;

        ensure!(
            &header.magic == STORE_MAGIC,
            StoreError::Corrupt("bad magic in store header".into())
        );

        ensure!(
            header.version.get() == CURRENT_SCHEMA_VERSION,
            "unsupported store version: {} (expected {})",
            header.version.get(),
            CURRENT_SCHEMA_VERSION
        );

        Ok(header)
    }

    fn compute_checksum(&self) -> u64 {
        let bytes = self.as_bytes();
        CRC64.checksum(&bytes[..STORE_HEADER_SIZE - 8])
    }

    /// Stamps the checksum; call after all other fields are final.
    pub fn seal(&mut self) {
        self.checksum = U64::new(0);
        let sum = self.compute_checksum();
        self.checksum = U64::new(sum);
    }

    pub fn verify(&self) -> bool {
        self.compute_checksum() == self.checksum.get()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root(&self) -> TreeState {
        self.root
    }

    pub fn set_root(&mut self, root: TreeState) {
        self.root = root;
    }

    pub fn next_page(&self) -> u64 {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, page: u64) {
        self.next_page = U64::new(page);
    }

    pub fn global_etag(&self) -> u64 {
        self.global_etag.get()
    }

    pub fn set_global_etag(&mut self, etag: u64) {
        self.global_etag = U64::new(etag);
    }

    pub fn last_txn_id(&self) -> u64 {
        self.last_txn_id.get()
    }

    pub fn set_last_txn_id(&mut self, id: u64) {
        self.last_txn_id = U64::new(id);
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = U64::new(generation);
    }

    /// Header page this generation is written to.
    pub fn slot(&self) -> u64 {
        self.generation.get() % 2
    }
}

/// Picks the newest verified header out of the two slots. `slots` are the
/// raw contents of pages 0 and 1.
pub fn select_header(slot0: &[u8], slot1: &[u8]) -> Result<StoreHeader> {
    let mut best: Option<StoreHeader> = None;

    for bytes in [slot0, slot1] {
        let Ok(header) = StoreHeader::from_bytes(bytes) else {
            continue;
        };
        if !header.verify() {
            continue;
        }
        match &best {
            Some(current) if current.generation() >= header.generation() => {}
            _ => best = Some(header),
        }
    }

    best.ok_or_else(|| StoreError::Corrupt("no valid store header in either slot".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_header(generation: u64) -> StoreHeader {
        let mut header = StoreHeader::new(4096, TreeState::empty(), 3);
        header.set_generation(generation);
        header.seal();
        header
    }

    #[test]
    fn store_header_size_is_112() {
        assert_eq!(std::mem::size_of::<StoreHeader>(), 112);
    }

    #[test]
    fn sealed_header_verifies() {
        let header = sealed_header(1);
        assert!(header.verify());
    }

    #[test]
    fn tampering_breaks_verification() {
        let mut header = sealed_header(1);
        header.set_next_page(999);

        assert!(!header.verify());
    }

    #[test]
    fn generation_selects_alternating_slots() {
        assert_eq!(sealed_header(4).slot(), 0);
        assert_eq!(sealed_header(5).slot(), 1);
    }

    #[test]
    fn select_header_prefers_highest_valid_generation() {
        let old = sealed_header(6);
        let new = sealed_header(7);

        let picked = select_header(old.as_bytes(), new.as_bytes()).unwrap();

        assert_eq!(picked.generation(), 7);
    }

    #[test]
    fn select_header_falls_back_when_newest_is_torn() {
        let old = sealed_header(6);
        let mut torn = sealed_header(7);
        torn.set_global_etag(12345); // not resealed: simulates a torn write

        let picked = select_header(torn.as_bytes(), old.as_bytes()).unwrap();

        assert_eq!(picked.generation(), 6);
    }

    #[test]
    fn select_header_rejects_two_bad_slots() {
        let zeroes = vec![0u8; STORE_HEADER_SIZE];

        let result = select_header(&zeroes, &zeroes);

        assert!(result.is_err());
    }

    #[test]
    fn from_bytes_rejects_foreign_magic() {
        let mut bytes = sealed_header(1).as_bytes().to_vec();
        bytes[..16].copy_from_slice(b"NotAVellumStore!");

        assert!(StoreHeader::from_bytes(&bytes).is_err());
    }
}
