//! The index store: generations, per-path updates, rebuilds and queries.
//!
//! State is an explicit `IndexState`. Per-path updates (upsert, delete,
//! metadata moves) are serialized per path and land as a single
//! `Arc<NoteRecord>` swap. A rebuild builds a whole new `Generation` aside
//! while the previous one keeps serving reads; updates that arrive in the
//! meantime are applied to the previous generation and journalled so they
//! can be replayed onto the new one right before it is published.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::semantic::chunker::{chunk_note, content_hash, embedding_input, Chunk};
use crate::semantic::embeddings::{embed_checked, model_id_hash, Embedder, EmbeddingError};
use crate::semantic::hybrid::{fuse, rank_notes, ChunkScore, RankedNote};
use crate::semantic::index::{cosine, normalize, Generation, NoteRecord, RecordError};
use crate::semantic::lexical::{score_chunk, tokenize};
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::storage::PathLocks;
use crate::vault::{directory_of, Vault, VaultError};

/// Errors that can occur during index store operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("a rebuild is already running")]
    RebuildInProgress,

    #[error("rebuild interrupted, previous generation kept")]
    RebuildInterrupted,

    #[error("index lock poisoned")]
    Poisoned,
}

/// Availability of the index, as seen by readers.
pub enum IndexState {
    Unavailable { reason: String },
    /// A rebuild is running; `previous` keeps serving reads.
    Building { previous: Option<Arc<Generation>> },
    Ready(Arc<Generation>),
}

impl IndexState {
    pub fn label(&self) -> &'static str {
        match self {
            IndexState::Unavailable { .. } => "unavailable",
            IndexState::Building { .. } => "building",
            IndexState::Ready(_) => "ready",
        }
    }

    /// Generation readers should use, if any.
    pub fn readable(&self) -> Option<Arc<Generation>> {
        match self {
            IndexState::Ready(generation) => Some(generation.clone()),
            IndexState::Building { previous } => previous.clone(),
            IndexState::Unavailable { .. } => None,
        }
    }

    fn unavailable_reason(&self) -> String {
        match self {
            IndexState::Unavailable { reason } => reason.clone(),
            IndexState::Building { .. } => "first build in progress".to_string(),
            IndexState::Ready(_) => String::new(),
        }
    }
}

/// Ranking knobs for `hybrid_query`.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub semantic_weight: f32,
    pub min_score: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            semantic_weight: crate::semantic::DEFAULT_SEMANTIC_WEIGHT,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchQuery {
    pub text: String,
    /// Top-level directory or path prefix
    pub directory: Option<String>,
    /// All of these tags must be present
    pub tags: Vec<String>,
    /// Only notes modified at or after this time (unix millis)
    pub since: Option<i64>,
    pub limit: usize,
}

/// Metadata changes applied without re-embedding.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub new_path: Option<String>,
    pub new_title: Option<String>,
    pub new_tags: Option<Vec<String>>,
}

/// What `index_file` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IndexOutcome {
    Indexed { chunks: usize },
    /// Content hash matched, nothing re-embedded
    Unchanged,
    /// The file is gone; its entries were dropped
    Removed,
    /// Not a note (ignored location, wrong extension, oversized)
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedNote {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildStats {
    pub generation: String,
    pub notes_indexed: usize,
    pub chunks_created: usize,
    pub duration_ms: u64,
    pub skipped: Vec<SkippedNote>,
    /// Whether the new generation reached disk
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexHealth {
    pub state: &'static str,
    pub reason: Option<String>,
    pub model: String,
    pub generation: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
    pub notes: usize,
    pub chunks: usize,
    /// Paths whose last index attempt failed, with the error
    pub failures: BTreeMap<String, String>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Cooperative cancellation for rebuilds.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A per-path mutation, applied to a generation and journalled during
/// rebuilds.
#[derive(Clone)]
enum PathOp {
    Put(String, Arc<NoteRecord>),
    Remove(String),
    Move {
        from: String,
        to: String,
        record: Arc<NoteRecord>,
    },
}

impl PathOp {
    fn apply_to(&self, generation: &Generation) {
        match self {
            PathOp::Put(path, record) => {
                generation.put(path, record.clone());
            }
            PathOp::Remove(path) => {
                generation.remove(path);
            }
            PathOp::Move { from, to, record } => generation.replace_key(from, to, record.clone()),
        }
    }
}

/// Placeholder embedder for a store that could not load its model.
struct Unloaded {
    reason: String,
}

impl Embedder for Unloaded {
    fn model_id(&self) -> &str {
        "none"
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::InitFailed(self.reason.clone()))
    }
}

pub struct IndexStore {
    embedder: Arc<dyn Embedder>,
    storage: VectorStorage,
    model_hash: [u8; 32],
    settings: SearchSettings,
    /// Set when the store can never become ready (disabled, model missing)
    disabled: Option<String>,
    state: RwLock<IndexState>,
    /// `Some` while a rebuild runs. Lock order: journal, then state.
    journal: Mutex<Option<Vec<PathOp>>>,
    locks: PathLocks,
    rebuild_guard: Mutex<()>,
    persist_lock: Mutex<()>,
    dirty: AtomicBool,
    failures: Mutex<BTreeMap<String, String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl IndexStore {
    /// Open the store, loading the persisted generation if it matches the
    /// embedder. A missing or unusable file leaves the store `Unavailable`.
    pub fn open(embedder: Arc<dyn Embedder>, index_path: PathBuf, settings: SearchSettings) -> Self {
        let model_hash = model_id_hash(embedder.model_id());
        let storage = VectorStorage::new(index_path);

        let state = if !storage.exists() {
            log::info!("No index at {}, keyword fallback until first rebuild", storage.path().display());
            IndexState::Unavailable {
                reason: "index has not been built yet".to_string(),
            }
        } else {
            match storage.load(&model_hash, embedder.dimensions()) {
                Ok(generation) => {
                    log::info!(
                        "Loaded index: {} notes, {} chunks",
                        generation.note_count(),
                        generation.chunk_count()
                    );
                    IndexState::Ready(Arc::new(generation))
                }
                Err(e) => {
                    log::warn!("Index at {} is unusable, keyword fallback until rebuild: {e}", storage.path().display());
                    IndexState::Unavailable {
                        reason: format!("stored index could not be loaded: {e}"),
                    }
                }
            }
        };

        Self::with_state(embedder, storage, model_hash, settings, state, None)
    }

    /// A store that stays unavailable, e.g. when indexing is disabled or the
    /// model failed to load.
    pub fn disabled(reason: &str, index_path: PathBuf) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(Unloaded {
            reason: reason.to_string(),
        });
        let model_hash = model_id_hash(embedder.model_id());
        let state = IndexState::Unavailable {
            reason: reason.to_string(),
        };

        Self::with_state(
            embedder,
            VectorStorage::new(index_path),
            model_hash,
            SearchSettings::default(),
            state,
            Some(reason.to_string()),
        )
    }

    fn with_state(
        embedder: Arc<dyn Embedder>,
        storage: VectorStorage,
        model_hash: [u8; 32],
        settings: SearchSettings,
        state: IndexState,
        disabled: Option<String>,
    ) -> Self {
        Self {
            embedder,
            storage,
            model_hash,
            settings,
            disabled,
            state: RwLock::new(state),
            journal: Mutex::new(None),
            locks: PathLocks::new(),
            rebuild_guard: Mutex::new(()),
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            failures: Mutex::new(BTreeMap::new()),
            last_success: Mutex::new(None),
        }
    }

    pub fn state_label(&self) -> &'static str {
        self.state.read().map(|s| s.label()).unwrap_or("unavailable")
    }

    /// A generation exists that queries can run against.
    pub fn is_available(&self) -> bool {
        self.readable().is_ok()
    }

    fn readable(&self) -> Result<Arc<Generation>, IndexError> {
        let state = self.state.read().map_err(|_| IndexError::Poisoned)?;
        state
            .readable()
            .ok_or_else(|| IndexError::Unavailable(state.unavailable_reason()))
    }

    /// Record stored for `path`. `Ok(None)` while a first build runs.
    fn lookup(&self, path: &str) -> Result<Option<Arc<NoteRecord>>, IndexError> {
        let state = self.state.read().map_err(|_| IndexError::Poisoned)?;
        match &*state {
            IndexState::Unavailable { reason } => Err(IndexError::Unavailable(reason.clone())),
            other => Ok(other.readable().and_then(|g| g.get(path))),
        }
    }

    /// Apply a per-path op to the live generation, journalling it if a
    /// rebuild is running.
    fn apply(&self, op: PathOp) -> Result<(), IndexError> {
        let mut journal = self.journal.lock().map_err(|_| IndexError::Poisoned)?;
        let state = self.state.read().map_err(|_| IndexError::Poisoned)?;

        match &*state {
            IndexState::Unavailable { reason } => {
                return Err(IndexError::Unavailable(reason.clone()))
            }
            IndexState::Ready(generation) => op.apply_to(generation),
            IndexState::Building { previous } => {
                if let Some(generation) = previous {
                    op.apply_to(generation);
                }
            }
        }

        if let Some(pending) = journal.as_mut() {
            pending.push(op);
        }
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Replace every entry of `note_path` with `chunks` + `vectors` in one
    /// swap. The caller holds the path lock.
    fn upsert(
        &self,
        note_path: &str,
        chunks: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<(), IndexError> {
        let record = NoteRecord::build(chunks, vectors, self.embedder.dimensions())?;
        if record.note_path() != note_path {
            return Err(RecordError::MixedPaths.into());
        }
        self.apply(PathOp::Put(note_path.to_string(), Arc::new(record)))
    }

    /// Drop every entry of `note_path`.
    pub fn delete(&self, note_path: &str) -> Result<(), IndexError> {
        self.locks
            .with_lock(note_path, || self.apply(PathOp::Remove(note_path.to_string())))
    }

    /// Rewrite metadata of a note's entries without re-embedding. Returns
    /// `false` when nothing is stored for `note_path`.
    pub fn update_metadata(
        &self,
        note_path: &str,
        update: &MetadataUpdate,
    ) -> Result<bool, IndexError> {
        let target = update.new_path.as_deref().unwrap_or(note_path);

        self.with_two_locks(note_path, target, || {
            let Some(record) = self.lookup(note_path)? else {
                return Ok(false);
            };

            let mut chunks: Vec<Chunk> = record.entries.iter().map(|e| e.chunk.clone()).collect();
            for chunk in &mut chunks {
                if let Some(new_path) = &update.new_path {
                    chunk.note_path = new_path.clone();
                    chunk.directory = directory_of(new_path);
                }
                if let Some(title) = &update.new_title {
                    chunk.title = title.clone();
                }
                if let Some(tags) = &update.new_tags {
                    chunk.tags = tags.clone();
                }
            }

            let updated = NoteRecord {
                content_hash: content_hash(&chunks),
                modified_at: record.modified_at,
                entries: record
                    .entries
                    .iter()
                    .zip(chunks)
                    .map(|(entry, chunk)| crate::semantic::index::IndexEntry {
                        chunk,
                        vector: entry.vector.clone(),
                    })
                    .collect(),
            };

            self.apply(PathOp::Move {
                from: note_path.to_string(),
                to: target.to_string(),
                record: Arc::new(updated),
            })?;
            Ok(true)
        })
    }

    fn with_two_locks<R>(&self, a: &str, b: &str, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.locks.with_lock(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        self.locks
            .with_lock(first, || self.locks.with_lock(second, f))
    }

    /// Bring the entries of one vault file in line with its current state
    /// on disk. Unchanged content is not re-embedded.
    pub fn index_file(&self, vault: &Vault, rel: &str) -> Result<IndexOutcome, IndexError> {
        if !vault.is_indexable(rel) {
            return Ok(IndexOutcome::Skipped);
        }

        let result = self.locks.with_lock(rel, || self.index_file_locked(vault, rel));
        self.track(rel, &result);
        result
    }

    fn index_file_locked(&self, vault: &Vault, rel: &str) -> Result<IndexOutcome, IndexError> {
        let note = match vault.note_file(rel).and_then(|file| {
            if vault.is_oversized(&file) {
                return Ok(None);
            }
            vault.read_file(&file).map(Some)
        }) {
            Ok(Some(note)) => note,
            Ok(None) => {
                // same outcome as a rebuild, which never sees the file
                if self.lookup(rel)?.is_some() {
                    self.apply(PathOp::Remove(rel.to_string()))?;
                }
                log::debug!("not indexing oversized note {rel}");
                return Ok(IndexOutcome::Skipped);
            }
            Err(VaultError::NotFound(_)) => {
                self.apply(PathOp::Remove(rel.to_string()))?;
                return Ok(IndexOutcome::Removed);
            }
            Err(e) => return Err(e.into()),
        };

        let chunks = chunk_note(&note);
        let hash = content_hash(&chunks);

        if let Some(existing) = self.lookup(rel)? {
            if existing.content_hash == hash {
                if existing.modified_at != note.modified_at {
                    let touched = existing.touched(note.modified_at);
                    self.apply(PathOp::Put(rel.to_string(), Arc::new(touched)))?;
                }
                return Ok(IndexOutcome::Unchanged);
            }
        }

        let texts: Vec<String> = chunks.iter().map(embedding_input).collect();
        let vectors = embed_checked(self.embedder.as_ref(), &texts)?;
        let count = chunks.len();

        self.upsert(rel, chunks, vectors)?;
        log::debug!("indexed {rel} ({count} chunks)");
        Ok(IndexOutcome::Indexed { chunks: count })
    }

    /// `index_file` for callers whose own work must not fail because of the
    /// index (write-path tools, the coordinator). Failures are logged and
    /// recorded in health.
    pub fn sync_path(&self, vault: &Vault, rel: &str) {
        // failures were already logged by `track`
        match self.index_file(vault, rel) {
            Ok(outcome) => log::debug!("index sync {rel}: {outcome:?}"),
            Err(e) => log::debug!("index sync {rel} not applied: {e}"),
        }
    }

    /// Drop a path that no longer exists.
    pub fn remove_file(&self, rel: &str) -> Result<(), IndexError> {
        let result = self.delete(rel);
        self.track(rel, &result);
        result
    }

    fn track<T>(&self, rel: &str, result: &Result<T, IndexError>) {
        let Ok(mut failures) = self.failures.lock() else {
            return;
        };
        match result {
            Ok(_) => {
                failures.remove(rel);
                if let Ok(mut last) = self.last_success.lock() {
                    *last = Some(Utc::now());
                }
            }
            // nothing to track while the whole index is unavailable
            Err(IndexError::Unavailable(_)) => {}
            Err(e) => {
                log::warn!("failed to index {rel}: {e}");
                failures.insert(rel.to_string(), e.to_string());
            }
        }
    }

    /// Re-chunk and re-embed every note of the vault into a new generation
    /// and publish it atomically. The previous generation stays live until
    /// then, and stays live if the rebuild fails or is cancelled.
    pub fn rebuild_all(
        &self,
        vault: &Vault,
        cancel: &CancelToken,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<RebuildStats, IndexError> {
        if let Some(reason) = &self.disabled {
            return Err(IndexError::Unavailable(reason.clone()));
        }

        let _guard = match self.rebuild_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(IndexError::RebuildInProgress),
            Err(TryLockError::Poisoned(_)) => return Err(IndexError::Poisoned),
        };

        let started = Instant::now();
        let restore = {
            let mut journal = self.journal.lock().map_err(|_| IndexError::Poisoned)?;
            let mut state = self.state.write().map_err(|_| IndexError::Poisoned)?;
            let previous = state.readable();
            *journal = Some(Vec::new());
            std::mem::replace(&mut *state, IndexState::Building { previous })
        };

        log::info!("Index rebuild started");
        let result = self.build_generation(vault, cancel, progress);

        let mut journal = self.journal.lock().map_err(|_| IndexError::Poisoned)?;
        let mut state = self.state.write().map_err(|_| IndexError::Poisoned)?;
        let pending = journal.take().unwrap_or_default();

        let (generation, skipped) = match result {
            Ok(built) => built,
            Err(e) => {
                *state = restore;
                log::warn!("Index rebuild failed, keeping previous state ({}): {e}", state.label());
                return Err(e);
            }
        };

        let replayed = pending.len();
        for op in &pending {
            op.apply_to(&generation);
        }

        let generation = Arc::new(generation);
        *state = IndexState::Ready(generation.clone());
        drop(state);
        drop(journal);

        self.dirty.store(true, Ordering::SeqCst);
        let persisted = match self.persist() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Rebuilt index is live but could not be saved: {e}");
                false
            }
        };

        if let Ok(mut failures) = self.failures.lock() {
            *failures = skipped
                .iter()
                .map(|s| (s.path.clone(), s.reason.clone()))
                .collect();
        }
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Utc::now());
        }

        let stats = RebuildStats {
            generation: generation.id.to_string(),
            notes_indexed: generation.note_count(),
            chunks_created: generation.chunk_count(),
            duration_ms: started.elapsed().as_millis() as u64,
            skipped,
            persisted,
        };

        log::info!(
            "Index rebuild finished: {} notes, {} chunks, {} skipped, {} replayed updates in {}ms",
            stats.notes_indexed,
            stats.chunks_created,
            stats.skipped.len(),
            replayed,
            stats.duration_ms
        );

        Ok(stats)
    }

    fn build_generation(
        &self,
        vault: &Vault,
        cancel: &CancelToken,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<(Generation, Vec<SkippedNote>), IndexError> {
        let files: Vec<_> = vault
            .notes()
            .into_iter()
            .filter(|f| vault.is_indexable(&f.rel_path))
            .collect();
        let total = files.len();
        let dimensions = self.embedder.dimensions();

        // file reads and chunking are independent per note
        let parsed: Vec<(String, Result<Vec<Chunk>, VaultError>)> = files
            .par_iter()
            .map(|file| {
                let chunks = vault.read_note(&file.rel_path).map(|note| chunk_note(&note));
                (file.rel_path.clone(), chunks)
            })
            .collect();

        let mut records = HashMap::with_capacity(total);
        let mut skipped = Vec::new();

        for (done, (path, chunks)) in parsed.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IndexError::RebuildInterrupted);
            }

            let chunks = match chunks {
                Ok(chunks) => chunks,
                Err(e) => {
                    log::warn!("skipping unreadable note {path}: {e}");
                    skipped.push(SkippedNote {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let texts: Vec<String> = chunks.iter().map(embedding_input).collect();
            let vectors = embed_checked(self.embedder.as_ref(), &texts)?;

            match NoteRecord::build(chunks, vectors, dimensions) {
                Ok(record) => {
                    records.insert(path, Arc::new(record));
                }
                Err(e) => {
                    log::warn!("skipping note {path}: {e}");
                    skipped.push(SkippedNote {
                        path,
                        reason: e.to_string(),
                    });
                }
            }

            progress(done + 1, total);
        }

        if cancel.is_cancelled() {
            return Err(IndexError::RebuildInterrupted);
        }

        Ok((Generation::with_records(dimensions, Utc::now(), records), skipped))
    }

    /// Rank notes for `query`: metadata filters first, then fused vector and
    /// keyword scores, aggregated per note.
    pub fn hybrid_query(&self, query: &SearchQuery) -> Result<Vec<RankedNote>, IndexError> {
        let generation = self.readable()?;
        if generation.is_empty() {
            return Err(IndexError::Unavailable("index is empty".to_string()));
        }

        let query_vector = normalize(self.embedder.embed(&query.text)?, generation.dimensions)?;
        let terms = tokenize(&query.text);
        let filter = QueryFilter::new(query);

        let snapshot = generation.snapshot();
        let scores: Vec<ChunkScore<'_>> = snapshot
            .iter()
            .filter(|(_, record)| filter.matches(record))
            .flat_map(|(_, record)| record.entries.iter())
            .map(|entry| ChunkScore {
                note_path: &entry.chunk.note_path,
                title: &entry.chunk.title,
                note_modified_at: entry.chunk.note_modified_at,
                chunk_index: entry.chunk.chunk_index,
                text: &entry.chunk.text,
                score: fuse(
                    cosine(&query_vector, &entry.vector),
                    score_chunk(&terms, &entry.chunk),
                    self.settings.semantic_weight,
                ),
            })
            .collect();

        Ok(rank_notes(scores, self.settings.min_score, query.limit))
    }

    /// Modification time recorded for `path`, for staleness checks.
    pub fn recorded_modified_at(&self, path: &str) -> Option<i64> {
        self.readable().ok()?.recorded_modified_at(path)
    }

    pub fn recorded_paths(&self) -> Vec<String> {
        self.readable().map(|g| g.paths()).unwrap_or_default()
    }

    pub fn health(&self) -> IndexHealth {
        let (label, reason, generation) = match self.state.read() {
            Ok(state) => {
                let reason = match &*state {
                    IndexState::Unavailable { reason } => Some(reason.clone()),
                    _ => None,
                };
                (state.label(), reason, state.readable())
            }
            Err(_) => ("unavailable", Some("index lock poisoned".to_string()), None),
        };

        IndexHealth {
            state: label,
            reason,
            model: self.embedder.model_id().to_string(),
            generation: generation.as_ref().map(|g| g.id.to_string()),
            built_at: generation.as_ref().map(|g| g.built_at),
            notes: generation.as_ref().map(|g| g.note_count()).unwrap_or(0),
            chunks: generation.as_ref().map(|g| g.chunk_count()).unwrap_or(0),
            failures: self.failures.lock().map(|f| f.clone()).unwrap_or_default(),
            last_success: self.last_success.lock().ok().and_then(|l| *l),
        }
    }

    /// Save the live generation. Only a `Ready` generation is written; a
    /// rebuild in progress saves its own result when it publishes.
    pub fn persist(&self) -> Result<(), IndexError> {
        let _guard = self.persist_lock.lock().map_err(|_| IndexError::Poisoned)?;

        let generation = {
            let state = self.state.read().map_err(|_| IndexError::Poisoned)?;
            match &*state {
                IndexState::Ready(generation) => generation.clone(),
                other => return Err(IndexError::Unavailable(other.unavailable_reason())),
            }
        };

        self.dirty.store(false, Ordering::SeqCst);
        if let Err(e) = self.storage.save(&generation, &self.model_hash) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        log::debug!("saved index to {}", self.storage.path().display());
        Ok(())
    }

    /// Persist if anything changed since the last save.
    pub fn persist_if_dirty(&self) -> Result<bool, IndexError> {
        if !self.dirty.load(Ordering::SeqCst) || !self.state_label().eq("ready") {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }
}

/// Metadata filters of a query, normalized once.
struct QueryFilter {
    directory: Option<String>,
    tags: Vec<String>,
    since: Option<i64>,
}

impl QueryFilter {
    fn new(query: &SearchQuery) -> Self {
        Self {
            directory: query
                .directory
                .as_deref()
                .map(|d| d.trim().trim_matches('/').to_string())
                .filter(|d| !d.is_empty()),
            tags: query
                .tags
                .iter()
                .map(|t| t.trim().trim_start_matches('#').to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            since: query.since,
        }
    }

    fn matches(&self, record: &NoteRecord) -> bool {
        let Some(first) = record.entries.first() else {
            return false;
        };
        let chunk = &first.chunk;

        if let Some(directory) = &self.directory {
            let prefix = format!("{directory}/");
            if chunk.directory != *directory && !chunk.note_path.starts_with(&prefix) {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let note_tags: Vec<String> = chunk.tags.iter().map(|t| t.to_lowercase()).collect();
            if !self.tags.iter().all(|t| note_tags.contains(t)) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if record.modified_at < since {
                return false;
            }
        }

        true
    }
}
