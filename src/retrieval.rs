//! Retrieval Façade: one `search` entry point over two engines.
//!
//! A warm index answers with hybrid scores. Otherwise the graph engine's
//! keyword search answers, and results carry no score at all so callers can
//! tell "ranked by meaning" from "ranked by presence".

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use serde::Serialize;

use crate::graph::{GraphEngine, GraphError, KeywordQuery};
use crate::semantic::{IndexError, IndexStore, SearchQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub title: String,
    pub excerpt: String,
    /// `None` when the result came from keyword search
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub mode: SearchMode,
    /// Why the index was not used, for keyword results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub hits: Vec<SearchHit>,
}

/// Parse a `since` filter: RFC 3339 or a plain `YYYY-MM-DD` (midnight UTC).
/// Returns unix millis.
pub fn parse_since(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.timestamp_millis());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc().timestamp_millis())
}

pub struct Retrieval {
    index: Arc<IndexStore>,
    graph: Arc<dyn GraphEngine>,
}

impl Retrieval {
    pub fn new(index: Arc<IndexStore>, graph: Arc<dyn GraphEngine>) -> Self {
        Self { index, graph }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<SearchResults, GraphError> {
        let reason = match self.index.hybrid_query(query) {
            Ok(ranked) => {
                return Ok(SearchResults {
                    mode: SearchMode::Hybrid,
                    fallback_reason: None,
                    hits: ranked
                        .into_iter()
                        .map(|r| SearchHit {
                            path: r.path,
                            title: r.title,
                            excerpt: r.excerpt,
                            score: Some(r.score),
                        })
                        .collect(),
                })
            }
            Err(IndexError::Unavailable(reason)) => reason,
            Err(e) => {
                log::warn!("hybrid search failed, using keyword search: {e}");
                e.to_string()
            }
        };

        log::debug!("keyword fallback: {reason}");
        self.keyword(query, reason)
    }

    fn keyword(&self, query: &SearchQuery, reason: String) -> Result<SearchResults, GraphError> {
        let hits = self.graph.keyword_search(&KeywordQuery {
            text: query.text.clone(),
            directory: query.directory.clone(),
            tags: query.tags.clone(),
            since: query.since,
            limit: query.limit,
        })?;

        Ok(SearchResults {
            mode: SearchMode::Keyword,
            fallback_reason: Some(reason),
            hits: hits
                .into_iter()
                .map(|hit| SearchHit {
                    path: hit.path,
                    title: hit.title,
                    excerpt: hit.excerpt,
                    score: None,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since("1970-01-02"), Some(86_400_000));
        assert_eq!(parse_since("1970-01-01T00:00:01Z"), Some(1_000));
        assert_eq!(parse_since(" 1970-01-01T01:00:00+01:00 "), Some(0));
        assert_eq!(parse_since("last week"), None);
    }
}
