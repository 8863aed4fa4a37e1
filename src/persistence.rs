//! Metadata persistence: turns the in-memory File Table, Directory
//! Index, and Attribute Table into three metadata extents, each encoded
//! as a sequence of pages with a trailing CRC-32 per page, and describes
//! those extents in the superblock payload. Analogous to how
//! `examples/chiro2001-rfs/src/rfs_lib/desc.rs` lays inode and directory
//! blocks onto disk, generalized from ext2's fixed block groups to the
//! allocator's dynamic extents.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::allocator::{Allocator, ExtentOwner, Reservation};
use crate::attributes::AttributeTable;
use crate::directory::DirectoryIndex;
use crate::error::{VfsError, VfsResult};
use crate::file_table::{FileAttributes, FileMetadata, FileTable};
use crate::ids::{FileId, FileKind, PageId, PageSpan};

const CRC_LEN: usize = 4;

#[derive(Serialize, Deserialize)]
struct FileRecord {
    id: u64,
    kind: FileKind,
    attributes: u32,
    length: u64,
    extents: Vec<(u64, u32)>,
    created_at_ms: i64,
    modified_at_ms: i64,
    accessed_at_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct DirectoryRecord {
    parent: u64,
    name: String,
    child: u64,
    kind: FileKind,
    attributes: u32,
    created_at_ms: i64,
    modified_at_ms: i64,
    accessed_at_ms: i64,
    generation: u64,
}

#[derive(Serialize, Deserialize)]
struct AttributeRecord {
    file: u64,
    name: String,
    value: Vec<u8>,
}

/// Describes one metadata extent inside the superblock payload: where it
/// lives, how many pages it spans, and how many raw bytes of the decoded
/// (CRC-stripped) page stream are meaningful.
#[derive(Serialize, Deserialize, Clone, Copy)]
pub struct ExtentDescriptor {
    pub start: u64,
    pub pages: u32,
    pub byte_len: u64,
}

impl ExtentDescriptor {
    fn span(&self) -> PageSpan {
        PageSpan::new(PageId(self.start), self.pages)
    }
}

#[derive(Serialize, Deserialize)]
pub struct SuperblockPayload {
    pub root_id: u64,
    pub file_table: ExtentDescriptor,
    pub directory_index: ExtentDescriptor,
    pub attribute_table: ExtentDescriptor,
}

fn epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Split `raw` into `page_size`-sized pages, each carrying `page_size -
/// CRC_LEN` bytes of payload followed by a CRC-32 of that payload. The
/// final page is zero-padded. Returns the full page buffer and the
/// number of pages it occupies.
fn encode_pages(raw: &[u8], page_size: usize) -> (Vec<u8>, u32) {
    let chunk_len = page_size - CRC_LEN;
    let pages = if raw.is_empty() {
        1
    } else {
        raw.len().div_ceil(chunk_len)
    };
    let mut buf = vec![0u8; pages * page_size];
    for i in 0..pages {
        let raw_start = i * chunk_len;
        let raw_end = (raw_start + chunk_len).min(raw.len());
        let chunk = &raw[raw_start..raw_end];
        let page_start = i * page_size;
        buf[page_start..page_start + chunk.len()].copy_from_slice(chunk);
        let crc = storage_engine::crc32(&buf[page_start..page_start + chunk_len]);
        buf[page_start + chunk_len..page_start + page_size].copy_from_slice(&crc.to_le_bytes());
    }
    (buf, pages as u32)
}

fn decode_pages(buf: &[u8], page_size: usize, byte_len: u64) -> VfsResult<Vec<u8>> {
    let chunk_len = page_size - CRC_LEN;
    let mut raw = Vec::with_capacity(buf.len());
    for page in buf.chunks(page_size) {
        let payload = &page[..chunk_len];
        let stored_crc = u32::from_le_bytes(page[chunk_len..page_size].try_into().unwrap());
        let actual_crc = storage_engine::crc32(payload);
        if stored_crc != actual_crc {
            return Err(VfsError::Corruption(
                "metadata extent page checksum mismatch".to_string(),
            ));
        }
        raw.extend_from_slice(payload);
    }
    raw.truncate(byte_len as usize);
    Ok(raw)
}

fn to_file_record(meta: &FileMetadata) -> FileRecord {
    FileRecord {
        id: meta.id.0,
        kind: meta.kind,
        attributes: meta.attributes.bits(),
        length: meta.length,
        extents: meta.extents.iter().map(|s| (s.start.0, s.length)).collect(),
        created_at_ms: epoch_ms(meta.created_at),
        modified_at_ms: epoch_ms(meta.modified_at),
        accessed_at_ms: epoch_ms(meta.accessed_at),
    }
}

fn from_file_record(rec: FileRecord) -> FileMetadata {
    FileMetadata {
        id: FileId(rec.id),
        kind: rec.kind,
        attributes: FileAttributes::from_bits_truncate(rec.attributes),
        length: rec.length,
        extents: rec
            .extents
            .into_iter()
            .map(|(start, len)| PageSpan::new(PageId(start), len))
            .collect(),
        created_at: from_epoch_ms(rec.created_at_ms),
        modified_at: from_epoch_ms(rec.modified_at_ms),
        accessed_at: from_epoch_ms(rec.accessed_at_ms),
    }
}

/// Serializes the three live tables, reserves fresh metadata extents for
/// each, and returns both the page buffers to write and the descriptors
/// to embed in the superblock payload. Extents are held as `Reservation`s
/// rather than bare spans: the caller must `commit()` each one only after
/// the write+superblock-commit sequence that references it has succeeded.
/// Dropping an uncommitted reservation frees its span back to the
/// allocator, so a failed write or commit never leaks pages.
pub struct EncodedMetadata<'a> {
    pub file_table_pages: Vec<u8>,
    pub directory_index_pages: Vec<u8>,
    pub attribute_table_pages: Vec<u8>,
    pub payload: SuperblockPayload,
    pub reservations: Vec<Reservation<'a>>,
}

pub fn encode<'a>(
    file_table: &FileTable,
    directory_index: &DirectoryIndex,
    attribute_table: &AttributeTable,
    root_id: FileId,
    allocator: &'a Allocator,
    page_size: usize,
) -> VfsResult<EncodedMetadata<'a>> {
    let file_records: Vec<FileRecord> = file_table.enumerate().iter().map(to_file_record).collect();
    let mut dir_records = Vec::new();
    for file in file_table.enumerate() {
        if file.kind.is_directory() {
            for entry in directory_index.enumerate(file.id) {
                dir_records.push(DirectoryRecord {
                    parent: entry.parent.0,
                    name: entry.name,
                    child: entry.child.0,
                    kind: entry.kind,
                    attributes: entry.attributes.bits(),
                    created_at_ms: epoch_ms(entry.created_at),
                    modified_at_ms: epoch_ms(entry.modified_at),
                    accessed_at_ms: epoch_ms(entry.accessed_at),
                    generation: entry.generation,
                });
            }
        }
    }
    let mut attr_records = Vec::new();
    for file in file_table.enumerate() {
        for (name, value) in attribute_table.enumerate(file.id) {
            attr_records.push(AttributeRecord {
                file: file.id.0,
                name,
                value,
            });
        }
    }

    let raw_files = bincode::serialize(&file_records)
        .map_err(|e| VfsError::Corruption(format!("file table encode failed: {e}")))?;
    let raw_dirs = bincode::serialize(&dir_records)
        .map_err(|e| VfsError::Corruption(format!("directory index encode failed: {e}")))?;
    let raw_attrs = bincode::serialize(&attr_records)
        .map_err(|e| VfsError::Corruption(format!("attribute table encode failed: {e}")))?;

    let (file_pages, file_page_count) = encode_pages(&raw_files, page_size);
    let (dir_pages, dir_page_count) = encode_pages(&raw_dirs, page_size);
    let (attr_pages, attr_page_count) = encode_pages(&raw_attrs, page_size);

    let (file_span, _) = allocator.reserve(ExtentOwner::Metadata, file_page_count);
    let file_reservation = Reservation::new(allocator, ExtentOwner::Metadata, file_span);
    let (dir_span, _) = allocator.reserve(ExtentOwner::Metadata, dir_page_count);
    let dir_reservation = Reservation::new(allocator, ExtentOwner::Metadata, dir_span);
    let (attr_span, _) = allocator.reserve(ExtentOwner::Metadata, attr_page_count);
    let attr_reservation = Reservation::new(allocator, ExtentOwner::Metadata, attr_span);

    let payload = SuperblockPayload {
        root_id: root_id.0,
        file_table: ExtentDescriptor {
            start: file_span.start.0,
            pages: file_span.length,
            byte_len: raw_files.len() as u64,
        },
        directory_index: ExtentDescriptor {
            start: dir_span.start.0,
            pages: dir_span.length,
            byte_len: raw_dirs.len() as u64,
        },
        attribute_table: ExtentDescriptor {
            start: attr_span.start.0,
            pages: attr_span.length,
            byte_len: raw_attrs.len() as u64,
        },
    };

    Ok(EncodedMetadata {
        file_table_pages: file_pages,
        directory_index_pages: dir_pages,
        attribute_table_pages: attr_pages,
        payload,
        reservations: vec![file_reservation, dir_reservation, attr_reservation],
    })
}

/// Rehydrate the three live tables from raw page buffers read back from
/// the container, as described by a superblock payload.
pub struct DecodedMetadata {
    pub file_table: FileTable,
    pub directory_index: DirectoryIndex,
    pub attribute_table: AttributeTable,
    pub used_spans: Vec<PageSpan>,
}

pub fn decode(
    payload: &SuperblockPayload,
    file_table_pages: &[u8],
    directory_index_pages: &[u8],
    attribute_table_pages: &[u8],
    page_size: usize,
    attribute_capacity: usize,
) -> VfsResult<DecodedMetadata> {
    let raw_files = decode_pages(file_table_pages, page_size, payload.file_table.byte_len)?;
    let raw_dirs = decode_pages(
        directory_index_pages,
        page_size,
        payload.directory_index.byte_len,
    )?;
    let raw_attrs = decode_pages(
        attribute_table_pages,
        page_size,
        payload.attribute_table.byte_len,
    )?;

    let file_records: Vec<FileRecord> = bincode::deserialize(&raw_files)
        .map_err(|e| VfsError::Corruption(format!("file table decode failed: {e}")))?;
    let dir_records: Vec<DirectoryRecord> = bincode::deserialize(&raw_dirs)
        .map_err(|e| VfsError::Corruption(format!("directory index decode failed: {e}")))?;
    let attr_records: Vec<AttributeRecord> = bincode::deserialize(&raw_attrs)
        .map_err(|e| VfsError::Corruption(format!("attribute table decode failed: {e}")))?;

    let file_table = FileTable::new();
    let mut used_spans = Vec::new();
    for rec in file_records {
        let meta = from_file_record(rec);
        used_spans.extend(meta.extents.iter().copied());
        file_table.insert_raw(meta);
    }

    let directory_index = DirectoryIndex::new();
    for rec in dir_records {
        directory_index.insert_raw(crate::directory::DirectoryEntry {
            parent: FileId(rec.parent),
            name: rec.name,
            child: FileId(rec.child),
            kind: rec.kind,
            attributes: FileAttributes::from_bits_truncate(rec.attributes),
            created_at: from_epoch_ms(rec.created_at_ms),
            modified_at: from_epoch_ms(rec.modified_at_ms),
            accessed_at: from_epoch_ms(rec.accessed_at_ms),
            generation: rec.generation,
        });
    }

    let attribute_table = AttributeTable::new(attribute_capacity);
    for rec in attr_records {
        attribute_table.insert_raw(FileId(rec.file), &rec.name, rec.value);
    }

    used_spans.push(payload.file_table.span());
    used_spans.push(payload.directory_index.span());
    used_spans.push(payload.attribute_table.span());

    Ok(DecodedMetadata {
        file_table,
        directory_index,
        attribute_table,
        used_spans,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_empty_pages() {
        let (buf, pages) = encode_pages(&[], 64);
        assert_eq!(pages, 1);
        let raw = decode_pages(&buf, 64, 0).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn encode_decode_round_trips_multi_page() {
        let raw_in: Vec<u8> = (0..300u32).map(|b| b as u8).collect();
        let (buf, pages) = encode_pages(&raw_in, 64);
        assert!(pages >= 5);
        let raw_out = decode_pages(&buf, 64, raw_in.len() as u64).unwrap();
        assert_eq!(raw_in, raw_out);
    }

    #[test]
    fn corrupted_page_is_detected() {
        let raw_in = vec![7u8; 40];
        let (mut buf, _) = encode_pages(&raw_in, 64);
        buf[0] ^= 0xFF;
        let err = decode_pages(&buf, 64, raw_in.len() as u64);
        assert!(err.is_err());
    }

    #[test]
    fn full_table_round_trip() {
        let file_table = FileTable::new();
        let now = Utc::now();
        file_table.seed_root(now);
        let id = file_table.allocate(FileKind::File, now);
        file_table.mutate(id, |m| m.length = 10);

        let dir_index = DirectoryIndex::new();
        dir_index
            .insert(FileId::ROOT, "f.txt", id, FileKind::File, FileAttributes::empty(), now)
            .unwrap();

        let attrs = AttributeTable::new(4096);
        attrs.upsert(id, "tag", b"x".to_vec()).unwrap();

        let allocator = Allocator::new();
        let encoded = encode(&file_table, &dir_index, &attrs, FileId::ROOT, &allocator, 64).unwrap();

        let decoded = decode(
            &encoded.payload,
            &encoded.file_table_pages,
            &encoded.directory_index_pages,
            &encoded.attribute_table_pages,
            64,
            4096,
        )
        .unwrap();

        assert_eq!(decoded.file_table.len(), 2);
        assert_eq!(decoded.directory_index.try_get(FileId::ROOT, "f.txt").unwrap().child, id);
        assert_eq!(decoded.attribute_table.try_get(id, "tag").unwrap(), b"x".to_vec());
    }
}
