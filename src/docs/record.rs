//! # Document and Tombstone Records
//!
//! On-disk encodings for the document store's tree values. Both record
//! kinds open with a fixed little-endian header followed by their
//! variable-length strings and, for documents, the body bytes. The original
//! key casing is preserved here; the tree key is the case-folded form.
//!
//! ## Document Record
//!
//! ```text
//! +--------+---------------+---------+----------------+------+
//! | header | key (orig.)   | collection name          | body |
//! | 24 B   | key_len B     | collection_len B         | rest |
//! +--------+---------------+---------+----------------+------+
//! ```
//!
//! ## Tombstone Record
//!
//! Same shape without the body; `deleted_etag` is the etag the document
//! carried when it was deleted, `etag` is the deletion's own position in
//! the change feed.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errors::StoreError;

pub const DOC_RECORD_HEADER_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DocRecordHeader {
    etag: U64,
    last_modified: U64,
    key_len: U16,
    collection_len: U16,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<DocRecordHeader>() == DOC_RECORD_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TombstoneRecordHeader {
    etag: U64,
    deleted_etag: U64,
    key_len: U16,
    collection_len: U16,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<TombstoneRecordHeader>() == DOC_RECORD_HEADER_SIZE);

/// Decoded view of a document record, borrowing the record bytes.
pub struct DocView<'a> {
    pub etag: u64,
    pub last_modified: u64,
    pub key: &'a str,
    pub collection: &'a str,
    pub body: &'a [u8],
}

/// Decoded view of a tombstone record.
pub struct TombstoneView<'a> {
    pub etag: u64,
    pub deleted_etag: u64,
    pub key: &'a str,
    pub collection: &'a str,
}

pub fn encode_document(
    etag: u64,
    last_modified: u64,
    key: &str,
    collection: &str,
    body: &[u8],
) -> Vec<u8> {
    let header = DocRecordHeader {
        etag: U64::new(etag),
        last_modified: U64::new(last_modified),
        key_len: U16::new(key.len() as u16),
        collection_len: U16::new(collection.len() as u16),
        reserved: [0; 4],
    };

    let mut record =
        Vec::with_capacity(DOC_RECORD_HEADER_SIZE + key.len() + collection.len() + body.len());
    record.extend_from_slice(header.as_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(collection.as_bytes());
    record.extend_from_slice(body);
    record
}

pub fn decode_document(record: &[u8]) -> Result<DocView<'_>> {
    ensure!(
        record.len() >= DOC_RECORD_HEADER_SIZE,
        StoreError::InvalidData("document record shorter than its header".into())
    );

    let header = DocRecordHeader::ref_from_bytes(&record[..DOC_RECORD_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse document record header: {:?}", e))?;

    let key_end = DOC_RECORD_HEADER_SIZE + header.key_len.get() as usize;
    let collection_end = key_end + header.collection_len.get() as usize;
    ensure!(
        record.len() >= collection_end,
        StoreError::InvalidData("document record truncated".into())
    );

    let key = std::str::from_utf8(&record[DOC_RECORD_HEADER_SIZE..key_end])
        .map_err(|_| StoreError::InvalidData("document key is not UTF-8".into()))?;
    let collection = std::str::from_utf8(&record[key_end..collection_end])
        .map_err(|_| StoreError::InvalidData("collection name is not UTF-8".into()))?;

    Ok(DocView {
        etag: header.etag.get(),
        last_modified: header.last_modified.get(),
        key,
        collection,
        body: &record[collection_end..],
    })
}

pub fn encode_tombstone(etag: u64, deleted_etag: u64, key: &str, collection: &str) -> Vec<u8> {
    let header = TombstoneRecordHeader {
        etag: U64::new(etag),
        deleted_etag: U64::new(deleted_etag),
        key_len: U16::new(key.len() as u16),
        collection_len: U16::new(collection.len() as u16),
        reserved: [0; 4],
    };

    let mut record = Vec::with_capacity(DOC_RECORD_HEADER_SIZE + key.len() + collection.len());
    record.extend_from_slice(header.as_bytes());
    record.extend_from_slice(key.as_bytes());
    record.extend_from_slice(collection.as_bytes());
    record
}

pub fn decode_tombstone(record: &[u8]) -> Result<TombstoneView<'_>> {
    ensure!(
        record.len() >= DOC_RECORD_HEADER_SIZE,
        StoreError::InvalidData("tombstone record shorter than its header".into())
    );

    let header = TombstoneRecordHeader::ref_from_bytes(&record[..DOC_RECORD_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to parse tombstone record header: {:?}", e))?;

    let key_end = DOC_RECORD_HEADER_SIZE + header.key_len.get() as usize;
    let collection_end = key_end + header.collection_len.get() as usize;
    ensure!(
        record.len() >= collection_end,
        StoreError::InvalidData("tombstone record truncated".into())
    );

    let key = std::str::from_utf8(&record[DOC_RECORD_HEADER_SIZE..key_end])
        .map_err(|_| StoreError::InvalidData("tombstone key is not UTF-8".into()))?;
    let collection = std::str::from_utf8(&record[key_end..collection_end])
        .map_err(|_| StoreError::InvalidData("collection name is not UTF-8".into()))?;

    Ok(TombstoneView {
        etag: header.etag.get(),
        deleted_etag: header.deleted_etag.get(),
        key,
        collection,
    })
}
