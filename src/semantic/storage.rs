//! Binary storage for an index generation.
//!
//! File format: notes.bin
//!
//! Header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - built_at: i64 (unix millis, little-endian)
//! - note_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Notes (repeated `note_count` times):
//! - path: str
//! - content_hash: u64
//! - modified_at: i64
//! - entry_count: u32
//! - entries (repeated): chunk_index u32, title str, directory str,
//!   tag_count u32 + tags str*, text str, vector [f32; dimensions]
//!
//! Trailer: u32 CRC32 of everything after the header.
//!
//! `str` is a u32 byte length followed by UTF-8 bytes. All integers and
//! floats are little-endian.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::semantic::chunker::Chunk;
use crate::semantic::index::{Generation, IndexEntry, NoteRecord};
use crate::storage::atomic_write;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + built_at(8) + note_count(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for persisted generations.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load a generation, validating model and dimensions.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Generation, VectorStorageError> {
        let bytes = std::fs::read(&self.path)?;
        if bytes.len() < HEADER_SIZE + 4 {
            return Err(VectorStorageError::InvalidFormat(
                "file is shorter than its header".to_string(),
            ));
        }

        let header = Header::decode(&bytes[..HEADER_SIZE])?;
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let body_end = bytes.len() - 4;
        let body = &bytes[HEADER_SIZE..body_end];
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        if crc32fast::hash(body) != stored {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut reader = Reader { bytes: body, pos: 0 };
        let mut records = HashMap::with_capacity(header.note_count as usize);

        for _ in 0..header.note_count {
            let path = reader.string()?;
            let content_hash = reader.u64()?;
            let modified_at = reader.i64()?;
            let entry_count = reader.u32()?;

            let mut entries = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                let chunk_index = reader.u32()?;
                let title = reader.string()?;
                let directory = reader.string()?;
                let tag_count = reader.u32()?;
                let tags = (0..tag_count)
                    .map(|_| reader.string())
                    .collect::<Result<Vec<_>, _>>()?;
                let text = reader.string()?;
                let vector = (0..dimensions)
                    .map(|_| reader.f32())
                    .collect::<Result<Vec<_>, _>>()?;

                entries.push(IndexEntry {
                    chunk: Chunk {
                        note_path: path.clone(),
                        title,
                        tags,
                        directory,
                        note_modified_at: modified_at,
                        chunk_index,
                        text,
                    },
                    vector,
                });
            }

            records.insert(
                path,
                Arc::new(NoteRecord {
                    content_hash,
                    modified_at,
                    entries,
                }),
            );
        }

        if reader.pos != body.len() {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last note".to_string(),
            ));
        }

        let built_at = DateTime::<Utc>::from_timestamp_millis(header.built_at).unwrap_or_default();
        Ok(Generation::with_records(dimensions, built_at, records))
    }

    /// Save a generation. Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        generation: &Generation,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let snapshot = generation.snapshot();

        let mut body = Vec::new();
        for (path, record) in &snapshot {
            put_string(&mut body, path);
            body.extend_from_slice(&record.content_hash.to_le_bytes());
            body.extend_from_slice(&record.modified_at.to_le_bytes());
            body.extend_from_slice(&(record.entries.len() as u32).to_le_bytes());

            for entry in &record.entries {
                let chunk = &entry.chunk;
                body.extend_from_slice(&chunk.chunk_index.to_le_bytes());
                put_string(&mut body, &chunk.title);
                put_string(&mut body, &chunk.directory);
                body.extend_from_slice(&(chunk.tags.len() as u32).to_le_bytes());
                for tag in &chunk.tags {
                    put_string(&mut body, tag);
                }
                put_string(&mut body, &chunk.text);
                for value in &entry.vector {
                    body.extend_from_slice(&value.to_le_bytes());
                }
            }
        }

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: generation.dimensions as u16,
            built_at: generation.built_at.timestamp_millis(),
            note_count: snapshot.len() as u64,
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &bytes)?;

        Ok(())
    }

}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    built_at: i64,
    note_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = self.version;
        header_bytes[1..33].copy_from_slice(&self.model_id);
        header_bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&self.built_at.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&self.note_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..51]);
        header_bytes[51..55].copy_from_slice(&checksum.to_le_bytes());

        header_bytes
    }

    fn decode(header_bytes: &[u8]) -> Result<Self, VectorStorageError> {
        let version = header_bytes[0];

        // Version check first
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let mut reader = Reader {
            bytes: header_bytes,
            pos: 51,
        };
        let stored_checksum = reader.u32()?;
        if stored_checksum != crc32fast::hash(&header_bytes[0..51]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let mut reader = Reader {
            bytes: header_bytes,
            pos: 33,
        };
        let dimensions = reader.u16()?;
        let built_at = reader.i64()?;
        let note_count = reader.u64()?;

        Ok(Header {
            version,
            model_id,
            dimensions,
            built_at,
            note_count,
        })
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], VectorStorageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| VectorStorageError::InvalidFormat("unexpected end of file".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], VectorStorageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, VectorStorageError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, VectorStorageError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, VectorStorageError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, VectorStorageError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, VectorStorageError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, VectorStorageError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VectorStorageError::InvalidFormat("string is not valid utf8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn sample_generation() -> Generation {
        let generation = Generation::new(3);
        let chunks = vec![
            Chunk {
                note_path: "projects/k8s.md".to_string(),
                title: "Kubernetes".to_string(),
                tags: vec!["infra".to_string(), "k8s".to_string()],
                directory: "projects".to_string(),
                note_modified_at: 1_700_000_000_000,
                chunk_index: 0,
                text: "Intro".to_string(),
            },
            Chunk {
                note_path: "projects/k8s.md".to_string(),
                title: "Kubernetes".to_string(),
                tags: vec!["infra".to_string(), "k8s".to_string()],
                directory: "projects".to_string(),
                note_modified_at: 1_700_000_000_000,
                chunk_index: 1,
                text: "## Pods\nüñí".to_string(),
            },
        ];
        let record =
            NoteRecord::build(chunks, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]], 3).unwrap();
        generation.put("projects/k8s.md", Arc::new(record));
        generation
    }

    #[test]
    fn test_save_and_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(dir.path().join("index/notes.bin"));
        let model_id = test_model_id();

        storage.save(&Generation::new(384), &model_id).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id, 384).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions, 384);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(dir.path().join("notes.bin"));
        let model_id = test_model_id();
        let generation = sample_generation();

        storage.save(&generation, &model_id).unwrap();
        let loaded = storage.load(&model_id, 3).unwrap();

        assert_eq!(loaded.note_count(), 1);
        assert_eq!(loaded.chunk_count(), 2);
        assert_eq!(
            loaded.get("projects/k8s.md").unwrap(),
            generation.get("projects/k8s.md").unwrap()
        );
        assert_eq!(
            loaded.built_at.timestamp_millis(),
            generation.built_at.timestamp_millis()
        );
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(dir.path().join("notes.bin"));
        storage.save(&Generation::new(3), &test_model_id()).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;

        let result = storage.load(&wrong_model_id, 3);
        assert!(matches!(result, Err(VectorStorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(dir.path().join("notes.bin"));
        storage.save(&Generation::new(3), &test_model_id()).unwrap();

        let result = storage.load(&test_model_id(), 384);
        assert!(matches!(result, Err(VectorStorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_header_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        let storage = VectorStorage::new(path.clone());
        storage.save(&sample_generation(), &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_body_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        let storage = VectorStorage::new(path.clone());
        storage.save(&sample_generation(), &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(HEADER_SIZE as u64 + 6)).unwrap();
        file.write_all(&[0x00]).unwrap();

        let result = storage.load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        std::fs::write(&path, [FORMAT_VERSION, 1, 2]).unwrap();

        let result = VectorStorage::new(path).load(&test_model_id(), 3);
        assert!(matches!(result, Err(VectorStorageError::InvalidFormat(_))));
    }

}
