//! Section chunking for embedding.
//!
//! A note body is cut at every `## ` header (outside code fences). Text
//! before the first header becomes the first chunk; a body without headers
//! is a single chunk. Every chunk carries the note's metadata so query-time
//! filters never have to go back to the file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::vault::markdown;
use crate::vault::Note;

/// Maximum embedding input length (characters, not tokens)
const MAX_EMBED_LENGTH: usize = 2000;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub note_path: String,
    pub title: String,
    pub tags: Vec<String>,
    pub directory: String,
    pub note_modified_at: i64,
    pub chunk_index: u32,
    pub text: String,
}

/// Split a parsed note into its chunks.
pub fn chunk_note(note: &Note) -> Vec<Chunk> {
    let body = note.body();
    let make = |idx: usize, text: &str| Chunk {
        note_path: note.path.clone(),
        title: note.title.clone(),
        tags: note.tags.clone(),
        directory: note.directory.clone(),
        note_modified_at: note.modified_at,
        chunk_index: idx as u32,
        text: text.trim().to_string(),
    };

    let sections = markdown::sections(body);
    if sections.is_empty() {
        return vec![make(0, body)];
    }

    let mut pieces: Vec<&str> = Vec::with_capacity(sections.len() + 1);
    let preamble = &body[..sections[0].start];
    if !preamble.trim().is_empty() {
        pieces.push(preamble);
    }
    for section in &sections {
        pieces.push(&body[section.start..section.end]);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(idx, text)| make(idx, text))
        .collect()
}

/// Text handed to the embedder for a chunk: title plus chunk text,
/// truncated.
pub fn embedding_input(chunk: &Chunk) -> String {
    let content = if chunk.text.is_empty() {
        chunk.title.clone()
    } else {
        format!("{}\n\n{}", chunk.title, chunk.text)
    };
    truncate_content(&content)
}

fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_EMBED_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_EMBED_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Hash of everything that goes into the embeddings and filters of a note.
/// Stable across runs and builds since it is persisted with the index.
pub fn content_hash(chunks: &[Chunk]) -> u64 {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.title.as_bytes());
        hasher.update([0]);
        hasher.update(chunk.directory.as_bytes());
        hasher.update([0]);
        for tag in &chunk.tags {
            hasher.update(tag.as_bytes());
            hasher.update([1]);
        }
        hasher.update(chunk.text.as_bytes());
        hasher.update([2]);
    }

    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
