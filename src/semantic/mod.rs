//! Semantic index over vault notes.
//!
//! # Architecture
//!
//! - `chunker`: Splits notes into section chunks carrying note metadata
//! - `embeddings`: The `Embedder` seam, fastembed-backed by default
//! - `index`: Note records and in-memory generations
//! - `lexical`: Keyword scoring of chunks
//! - `hybrid`: Score fusion and per-note ranking
//! - `storage`: Binary file I/O for the persisted generation
//! - `store`: `IndexStore`, the state machine tying the above together

pub mod chunker;
pub mod embeddings;
pub mod hybrid;
pub mod index;
pub mod lexical;
mod storage;
mod store;

pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel, TimeoutEmbedder};
pub use hybrid::{RankedNote, DEFAULT_SEMANTIC_WEIGHT};
pub use storage::{VectorStorage, VectorStorageError};
pub use store::{
    CancelToken, IndexError, IndexHealth, IndexOutcome, IndexState, IndexStore, MetadataUpdate,
    RebuildStats, SearchQuery, SearchSettings, SkippedNote,
};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "bge-small-en-v1.5";
