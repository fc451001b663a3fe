//! Hybrid ranking combining semantic and lexical scores.
//!
//! Per chunk: `score = w * max(0, cos) + (1 - w) * lex`, where `w` is the
//! semantic weight:
//! - w=1.0: pure vector similarity
//! - w=0.6: 60% semantic, 40% lexical (default)
//! - w=0.0: pure keyword match
//!
//! Chunks are then aggregated per note: the best chunk decides the note's
//! score and provides its excerpt.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

/// Default semantic weight for hybrid search.
pub const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.6;

/// Fuse one chunk's cosine similarity and lexical score into [0, 1].
pub fn fuse(cosine: f32, lexical: f32, semantic_weight: f32) -> f32 {
    let w = semantic_weight.clamp(0.0, 1.0);
    let semantic = cosine.clamp(0.0, 1.0);
    let lexical = lexical.clamp(0.0, 1.0);
    (w * semantic + (1.0 - w) * lexical).clamp(0.0, 1.0)
}

/// A scored chunk, before aggregation.
#[derive(Debug, Clone)]
pub struct ChunkScore<'a> {
    pub note_path: &'a str,
    pub title: &'a str,
    pub note_modified_at: i64,
    pub chunk_index: u32,
    pub text: &'a str,
    pub score: f32,
}

/// One note in a ranked result list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedNote {
    pub path: String,
    pub title: String,
    pub excerpt: String,
    pub score: f32,
    pub modified_at: i64,
    /// Chunk the excerpt was taken from
    pub chunk_index: u32,
}

/// Aggregate chunk scores per note and order them.
///
/// Order: score descending, then more recently modified first, then path
/// ascending, so equal inputs always rank the same way.
pub fn rank_notes(scores: Vec<ChunkScore<'_>>, min_score: f32, limit: usize) -> Vec<RankedNote> {
    let mut best: HashMap<&str, ChunkScore<'_>> = HashMap::new();

    for candidate in scores {
        match best.get(candidate.note_path) {
            Some(current) if !beats(&candidate, current) => {}
            _ => {
                best.insert(candidate.note_path, candidate);
            }
        }
    }

    let mut ranked: Vec<RankedNote> = best
        .into_values()
        .filter(|c| c.score >= min_score)
        .map(|c| RankedNote {
            path: c.note_path.to_string(),
            title: c.title.to_string(),
            excerpt: crate::vault::markdown::excerpt(c.text),
            score: c.score,
            modified_at: c.note_modified_at,
            chunk_index: c.chunk_index,
        })
        .collect();

    ranked.sort_by(compare_ranked);
    ranked.truncate(limit);
    ranked
}

/// Higher score wins; on a tie the earlier chunk does.
fn beats(candidate: &ChunkScore<'_>, current: &ChunkScore<'_>) -> bool {
    match candidate.score.partial_cmp(&current.score) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Equal) => candidate.chunk_index < current.chunk_index,
        _ => false,
    }
}

pub fn compare_ranked(a: &RankedNote, b: &RankedNote) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.modified_at.cmp(&a.modified_at))
        .then_with(|| a.path.cmp(&b.path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score<'a>(path: &'a str, idx: u32, modified: i64, s: f32) -> ChunkScore<'a> {
        ChunkScore {
            note_path: path,
            title: path,
            note_modified_at: modified,
            chunk_index: idx,
            text: "text",
            score: s,
        }
    }

    #[test]
    fn test_fuse_weights() {
        assert!((fuse(1.0, 0.0, 0.6) - 0.6).abs() < 1e-6);
        assert!((fuse(0.0, 1.0, 0.6) - 0.4).abs() < 1e-6);
        assert!((fuse(0.5, 0.5, 1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fuse_clamps_negative_cosine() {
        assert_eq!(fuse(-0.8, 0.0, 0.6), 0.0);
        assert!((fuse(-0.8, 1.0, 0.6) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_fuse_weight_out_of_range_is_clamped() {
        assert!((fuse(1.0, 0.0, 1.5) - 1.0).abs() < 1e-6);
        assert_eq!(fuse(1.0, 0.0, -1.0), 0.0);
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank_notes(vec![], 0.0, 10).is_empty());
    }

    #[test]
    fn test_best_chunk_per_note() {
        let ranked = rank_notes(
            vec![
                score("a.md", 0, 1, 0.2),
                score("a.md", 1, 1, 0.9),
                score("b.md", 0, 1, 0.5),
            ],
            0.0,
            10,
        );

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].path, "a.md");
        assert_eq!(ranked[0].chunk_index, 1);
        assert!((ranked[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_recent_then_path() {
        let ranked = rank_notes(
            vec![
                score("c.md", 0, 10, 0.5),
                score("b.md", 0, 20, 0.5),
                score("a.md", 0, 10, 0.5),
            ],
            0.0,
            10,
        );

        let paths: Vec<&str> = ranked.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "a.md", "c.md"]);
    }

    #[test]
    fn test_min_score_and_limit() {
        let ranked = rank_notes(
            vec![
                score("a.md", 0, 0, 0.9),
                score("b.md", 0, 0, 0.8),
                score("c.md", 0, 0, 0.1),
            ],
            0.3,
            1,
        );

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].path, "a.md");
    }
}
