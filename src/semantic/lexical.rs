//! Lexical (keyword) scoring for hybrid search.
//!
//! Scores one chunk against the query terms: the fraction of terms found in
//! the chunk text, with a bonus for terms hitting the note title or a tag.
//!
//! Length normalization: text matches are weighted inversely to text length
//! so long sections do not win just by having more surface area.

use crate::semantic::chunker::Chunk;

/// Bonus per query term found in the title
const TITLE_BONUS: f32 = 0.25;
/// Bonus per query term equal to a tag (or a `term/...` tag prefix)
const TAG_BONUS: f32 = 0.35;

/// Baseline chunk length for normalization (characters).
/// Chunks at or below this length get full weight.
const TEXT_LENGTH_BASELINE: f32 = 600.0;

/// Tokenize query into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
pub fn tokenize(query: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
        "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
        "and", "or", "but", "not", "no", "so", "if", "then",
    ];

    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Logarithmic decay of text match weight with length.
///
/// - 600 chars or less: 1.0 (full weight)
/// - ~1600 chars: ~0.5
fn text_length_weight(len: usize) -> f32 {
    if len <= TEXT_LENGTH_BASELINE as usize {
        return 1.0;
    }
    1.0 / (1.0 + (len as f32 / TEXT_LENGTH_BASELINE).ln())
}

/// Keyword score of a chunk in [0, 1]. Zero when nothing matched.
pub fn score_chunk(terms: &[String], chunk: &Chunk) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }

    let text_lower = chunk.text.to_lowercase();
    let title_lower = chunk.title.to_lowercase();
    let tags_lower: Vec<String> = chunk.tags.iter().map(|t| t.to_lowercase()).collect();
    let text_weight = text_length_weight(chunk.text.len());

    let mut total: f32 = 0.0;
    for term in terms {
        let mut term_score: f32 = 0.0;

        if text_lower.contains(term.as_str()) {
            term_score += text_weight;
        }

        if title_lower.contains(term.as_str()) {
            term_score = term_score.max(0.5) + TITLE_BONUS;
        }

        if tags_lower
            .iter()
            .any(|tag| tag == term || tag.starts_with(&format!("{}/", term)))
        {
            term_score = term_score.max(0.5) + TAG_BONUS;
        }

        total += term_score.min(1.0);
    }

    (total / terms.len() as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(title: &str, text: &str, tags: &[&str]) -> Chunk {
        Chunk {
            note_path: "a.md".to_string(),
            title: title.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            directory: String::new(),
            note_modified_at: 0,
            chunk_index: 0,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_tokenize_basic() {
        let tokens = tokenize("machine learning guide");
        assert_eq!(tokens, vec!["machine", "learning", "guide"]);
    }

    #[test]
    fn test_tokenize_filters_stop_words() {
        let tokens = tokenize("the quick brown fox");
        assert_eq!(tokens, vec!["quick", "brown", "fox"]);
    }

    #[test]
    fn test_tokenize_handles_punctuation_and_duplicates() {
        let tokens = tokenize("rust-lang, Rust python/django");
        assert_eq!(tokens, vec!["rust", "lang", "python", "django"]);
    }

    #[test]
    fn test_no_terms_no_score() {
        assert_eq!(score_chunk(&[], &chunk("T", "text", &[])), 0.0);
        assert_eq!(score_chunk(&tokenize("the a"), &chunk("T", "text", &[])), 0.0);
    }

    #[test]
    fn test_partial_match_is_fraction() {
        let terms = tokenize("kubernetes pods");
        let score = score_chunk(&terms, &chunk("Notes", "all about kubernetes", &[]));
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_title_and_tag_boost() {
        let terms = tokenize("kubernetes");
        let plain = score_chunk(&terms, &chunk("Notes", "short kubernetes text", &[]));
        let long_text = format!("kubernetes {}", "filler ".repeat(400));
        let long_plain = score_chunk(&terms, &chunk("Notes", &long_text, &[]));
        let titled = score_chunk(&terms, &chunk("Kubernetes", &long_text, &[]));
        let tagged = score_chunk(&terms, &chunk("Notes", &long_text, &["kubernetes/ops"]));

        assert!((plain - 1.0).abs() < 1e-6);
        assert!(long_plain < plain);
        assert!(titled > long_plain);
        assert!(tagged > long_plain);
        assert!(titled <= 1.0 && tagged <= 1.0);
    }

    #[test]
    fn test_no_match() {
        let terms = tokenize("programming rust");
        assert_eq!(score_chunk(&terms, &chunk("Cooking", "Food and meals", &[])), 0.0);
    }
}
