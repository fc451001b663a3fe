//! Reference Resolver: who points at a note.
//!
//! Structural references come from the graph engine. Textual mentions are
//! opt-in and found by scanning note bodies, never inside code.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::graph::{GraphEngine, GraphError};
use crate::vault::markdown::{line_excerpt, text_mentions, wikilinks};
use crate::vault::{Note, NoteIdentity, Vault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Structural,
    Textual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub source_path: String,
    pub link_kind: LinkKind,
    pub excerpt: String,
}

pub struct ReferenceResolver {
    vault: Arc<Vault>,
    graph: Arc<dyn GraphEngine>,
}

impl ReferenceResolver {
    pub fn new(vault: Arc<Vault>, graph: Arc<dyn GraphEngine>) -> Self {
        Self { vault, graph }
    }

    /// References to the note titled `title`. An unknown title, or a note
    /// nobody links to, yields an empty list.
    pub fn find_references(
        &self,
        title: &str,
        include_text_mentions: bool,
    ) -> Result<Vec<Reference>, GraphError> {
        let target = self.vault.find_by_title(title);

        let mut refs = match &target {
            Some(note) => self.structural(note)?,
            None => vec![],
        };

        if include_text_mentions {
            let seen: HashSet<String> = refs.iter().map(|r| r.source_path.clone()).collect();
            let own_path = target.as_ref().map(|n| n.path.as_str());
            let needle = target.as_ref().map(|n| n.title.as_str()).unwrap_or(title);
            refs.extend(self.textual(needle, own_path, &seen));
        }

        Ok(refs)
    }

    /// Notes the graph engine reports as linking to `note`, each with the
    /// line of its first matching link.
    pub fn structural(&self, note: &Note) -> Result<Vec<Reference>, GraphError> {
        let identity = note.identity();

        let mut refs = Vec::new();
        for source in self.graph.linked_by(&note.path)? {
            let excerpt = match self.vault.read_note(&source.path) {
                Ok(source_note) => link_excerpt(&source_note, &identity),
                Err(e) => {
                    log::debug!("cannot read referencing note {}: {e}", source.path);
                    String::new()
                }
            };
            refs.push(Reference {
                source_path: source.path,
                link_kind: LinkKind::Structural,
                excerpt,
            });
        }

        refs.sort_by(|a, b| a.source_path.cmp(&b.source_path));
        refs.dedup_by(|a, b| a.source_path == b.source_path);
        Ok(refs)
    }

    /// Source paths of structural references to `note`.
    pub fn sources(&self, note: &Note) -> Result<Vec<String>, GraphError> {
        Ok(self
            .structural(note)?
            .into_iter()
            .map(|r| r.source_path)
            .collect())
    }

    fn textual(&self, needle: &str, own_path: Option<&str>, seen: &HashSet<String>) -> Vec<Reference> {
        let mut refs = Vec::new();

        for file in self.vault.notes() {
            if Some(file.rel_path.as_str()) == own_path || seen.contains(&file.rel_path) {
                continue;
            }
            let Ok(note) = self.vault.read_note(&file.rel_path) else {
                continue;
            };

            if let Some(mention) = text_mentions(note.body(), needle).into_iter().next() {
                refs.push(Reference {
                    source_path: file.rel_path,
                    link_kind: LinkKind::Textual,
                    excerpt: mention.excerpt,
                });
            }
        }

        refs
    }
}

fn link_excerpt(source: &Note, identity: &NoteIdentity) -> String {
    wikilinks(&source.content)
        .into_iter()
        .find(|link| identity.classify(&link.target).is_some())
        .map(|link| line_excerpt(&source.content, link.span.start))
        .unwrap_or_default()
}
