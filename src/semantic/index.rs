//! In-memory index generations.
//!
//! A `Generation` maps note paths to `NoteRecord`s. A record owns every
//! entry (chunk + vector) of one note and is never mutated after it is
//! built: updating a note swaps in a new `Arc<NoteRecord>`, so readers see
//! either the whole old chunk set or the whole new one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::eid::Eid;
use crate::semantic::chunker::{content_hash, Chunk};

/// A chunk and its embedding. The vector is stored L2-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Every entry of one note.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRecord {
    pub content_hash: u64,
    /// Modification time of the file the entries were derived from
    pub modified_at: i64,
    pub entries: Vec<IndexEntry>,
}

impl NoteRecord {
    /// Pair chunks with their vectors, validating shape and normalizing.
    pub fn build(
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        dimensions: usize,
    ) -> Result<Self, RecordError> {
        if chunks.is_empty() {
            return Err(RecordError::EmptyNote);
        }
        if chunks.len() != vectors.len() {
            return Err(RecordError::LengthMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }

        let note_path = chunks[0].note_path.clone();
        if chunks.iter().any(|c| c.note_path != note_path) {
            return Err(RecordError::MixedPaths);
        }

        let hash = content_hash(&chunks);
        let modified_at = chunks[0].note_modified_at;

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                Ok(IndexEntry {
                    chunk,
                    vector: normalize(vector, dimensions)?,
                })
            })
            .collect::<Result<Vec<_>, RecordError>>()?;

        Ok(Self {
            content_hash: hash,
            modified_at,
            entries,
        })
    }

    pub fn note_path(&self) -> &str {
        self.entries
            .first()
            .map(|e| e.chunk.note_path.as_str())
            .unwrap_or_default()
    }

    /// Copy with updated modification time and otherwise identical entries.
    pub fn touched(&self, modified_at: i64) -> Self {
        let mut record = self.clone();
        record.modified_at = modified_at;
        for entry in &mut record.entries {
            entry.chunk.note_modified_at = modified_at;
        }
        record
    }
}

/// One complete, internally consistent version of the index.
pub struct Generation {
    pub id: Eid,
    pub built_at: DateTime<Utc>,
    pub dimensions: usize,
    records: RwLock<HashMap<String, Arc<NoteRecord>>>,
}

impl Generation {
    #[cfg(test)]
    pub fn new(dimensions: usize) -> Self {
        Self::with_records(dimensions, Utc::now(), HashMap::new())
    }

    pub fn with_records(
        dimensions: usize,
        built_at: DateTime<Utc>,
        records: HashMap<String, Arc<NoteRecord>>,
    ) -> Self {
        Self {
            id: Eid::new(),
            built_at,
            dimensions,
            records: RwLock::new(records),
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<NoteRecord>> {
        self.read().get(path).cloned()
    }

    /// Swap in the record for `path`, returning the one it replaced.
    pub fn put(&self, path: &str, record: Arc<NoteRecord>) -> Option<Arc<NoteRecord>> {
        self.write().insert(path.to_string(), record)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<NoteRecord>> {
        self.write().remove(path)
    }

    /// Move a record to a new key in one step.
    pub fn replace_key(&self, old_path: &str, new_path: &str, record: Arc<NoteRecord>) {
        let mut records = self.write();
        records.remove(old_path);
        records.insert(new_path.to_string(), record);
    }

    /// Point-in-time copy of the record table (cheap: `Arc` clones).
    pub fn snapshot(&self) -> Vec<(String, Arc<NoteRecord>)> {
        let mut records: Vec<_> = self
            .read()
            .iter()
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    pub fn paths(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(path, _)| path).collect()
    }

    pub fn recorded_modified_at(&self, path: &str) -> Option<i64> {
        self.read().get(path).map(|r| r.modified_at)
    }

    pub fn note_count(&self) -> usize {
        self.read().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.read().values().map(|r| r.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // The map only ever sees whole-value inserts and removes, so a writer
    // that panicked cannot leave it half-updated.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<NoteRecord>>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<NoteRecord>>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// L2-normalize a vector of the expected size.
pub fn normalize(mut vector: Vec<f32>, dimensions: usize) -> Result<Vec<f32>, RecordError> {
    if vector.len() != dimensions {
        return Err(RecordError::DimensionMismatch {
            expected: dimensions,
            got: vector.len(),
        });
    }

    let norm = l2_norm(&vector);
    if norm < f32::EPSILON {
        return Err(RecordError::ZeroNormVector);
    }

    for value in &mut vector {
        *value /= norm;
    }
    Ok(vector)
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity of two normalized vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Errors building or validating a note record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("{chunks} chunks but {vectors} vectors")]
    LengthMismatch { chunks: usize, vectors: usize },

    #[error("A note record needs at least one chunk")]
    EmptyNote,

    #[error("Chunks of one record must belong to one note")]
    MixedPaths,
}
