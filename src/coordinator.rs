//! Consistency Coordinator: structural mutations that keep links intact.
//!
//! Move and rename run as one logical unit: resolve referencing notes under
//! the old identity, relocate the file, rewrite each reference, then patch the
//! index. A failed reference rewrite does not roll back the move; the caller
//! gets the exact lists of updated and failed files instead. Rewrites are
//! plain target substitutions, so running them again is harmless.

use std::sync::Arc;

use serde::Serialize;

use crate::graph::{GraphEngine, GraphError};
use crate::references::ReferenceResolver;
use crate::semantic::{IndexError, IndexStore, MetadataUpdate};
use crate::vault::markdown::{rewrite_wikilinks, set_frontmatter_field, slugify};
use crate::vault::{join_rel, LinkForm, NoteIdentity, Vault, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("graph engine: {0}")]
    Graph(#[from] GraphError),

    #[error("a note already exists at the destination: {existing}")]
    RenameConflict { existing: String },

    #[error("note moved to {moved_to}, but {} of {} referencing notes could not be rewritten", failed.len(), failed.len() + updated.len())]
    ReferenceRewritePartial {
        moved_to: String,
        updated: Vec<String>,
        failed: Vec<FailedRewrite>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRewrite {
    pub path: String,
    pub error: String,
}

/// Result of a move or rename.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuralChange {
    pub old_path: String,
    pub new_path: String,
    /// Every file whose content changed, the moved note included when its
    /// own text was touched
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedNote {
    pub old_path: String,
    pub archived_to: String,
}

/// What the identity change looks like to a link rewriter.
struct IdentityChange {
    old: NoteIdentity,
    /// Replacement for title and stem links; `None` leaves them alone
    new_title: Option<String>,
    new_path_key: String,
}

impl IdentityChange {
    fn rewrite(&self, target: &str) -> Option<String> {
        match self.old.classify(target)? {
            LinkForm::Title | LinkForm::Stem => self.new_title.clone(),
            LinkForm::Path => Some(self.new_path_key.clone()),
        }
    }
}

pub struct Coordinator {
    vault: Arc<Vault>,
    graph: Arc<dyn GraphEngine>,
    resolver: ReferenceResolver,
    index: Arc<IndexStore>,
}

impl Coordinator {
    pub fn new(vault: Arc<Vault>, graph: Arc<dyn GraphEngine>, index: Arc<IndexStore>) -> Self {
        Self {
            resolver: ReferenceResolver::new(vault.clone(), graph.clone()),
            vault,
            graph,
            index,
        }
    }

    /// Move a note into `new_directory`. Title and stem links keep working;
    /// path-style links are rewritten.
    pub fn move_note(
        &self,
        path: &str,
        new_directory: &str,
    ) -> Result<StructuralChange, CoordinatorError> {
        let note = self.vault.read_note(path)?;
        let directory = self.vault.check_directory(new_directory)?;
        if self.vault.is_archived(&join_rel(&directory, "x.md")) {
            return Err(VaultError::InvalidArgument(
                "use delete to move a note into the archive".to_string(),
            )
            .into());
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        let new_path = join_rel(&directory, file_name);
        if new_path == path {
            return Err(VaultError::InvalidArgument(format!(
                "{path} is already in '{directory}'"
            ))
            .into());
        }
        if self.vault.exists(&new_path) {
            return Err(CoordinatorError::RenameConflict { existing: new_path });
        }

        let change = IdentityChange {
            old: note.identity(),
            new_title: None,
            new_path_key: NoteIdentity::new(&new_path, &note.title).path_key,
        };

        self.refresh_graph();
        let sources = self.resolver.sources(&note)?;

        self.vault
            .locks()
            .with_lock(path, || self.vault.rename_raw(path, &new_path))?;
        log::info!("moved {path} -> {new_path}");

        let update = MetadataUpdate {
            new_path: Some(new_path.clone()),
            ..Default::default()
        };
        self.finish(path, &new_path, &change, sources, update, vec![])
    }

    /// Retitle a note: frontmatter title, file name and every reference.
    /// A collision with an existing note is rejected before anything changes.
    pub fn rename_note(
        &self,
        path: &str,
        new_title: &str,
    ) -> Result<StructuralChange, CoordinatorError> {
        let new_title = new_title.trim();
        let slug = slugify(new_title);
        if new_title.is_empty() || slug.is_empty() {
            return Err(VaultError::InvalidArgument(format!(
                "title '{new_title}' does not produce a valid file name"
            ))
            .into());
        }

        let note = self.vault.read_note(path)?;
        let new_path = join_rel(parent_of(path), &format!("{slug}.md"));

        if new_path != path && self.vault.exists(&new_path) {
            return Err(CoordinatorError::RenameConflict { existing: new_path });
        }
        if let Some(existing) = self.vault.find_by_title(new_title) {
            if existing.path != path {
                return Err(CoordinatorError::RenameConflict {
                    existing: existing.path,
                });
            }
        }

        let change = IdentityChange {
            old: note.identity(),
            new_title: Some(new_title.to_string()),
            new_path_key: NoteIdentity::new(&new_path, new_title).path_key,
        };

        self.refresh_graph();
        let sources = self.resolver.sources(&note)?;

        self.vault.modify(path, |content| {
            Ok(Some(set_frontmatter_field(content, "title", new_title)))
        })?;
        if new_path != path {
            self.vault
                .locks()
                .with_lock(path, || self.vault.rename_raw(path, &new_path))?;
        }
        log::info!("renamed {path} -> {new_path} ('{}' -> '{new_title}')", note.title);

        let update = MetadataUpdate {
            new_path: Some(new_path.clone()),
            new_title: Some(new_title.to_string()),
            new_tags: None,
        };
        self.finish(path, &new_path, &change, sources, update, vec![new_path.clone()])
    }

    /// Rewrite references, patch the index and report.
    fn finish(
        &self,
        old_path: &str,
        new_path: &str,
        change: &IdentityChange,
        sources: Vec<String>,
        update: MetadataUpdate,
        mut modified: Vec<String>,
    ) -> Result<StructuralChange, CoordinatorError> {
        self.patch_index(old_path, new_path, &update);

        let mut updated = Vec::new();
        let mut failed = Vec::new();

        for source in sources {
            // a self-link lives in the file that just moved
            let source = if source == old_path {
                new_path.to_string()
            } else {
                source
            };

            let result = self
                .vault
                .modify(&source, |content| Ok(rewrite_wikilinks(content, |t| change.rewrite(t))));

            match result {
                Ok(true) => {
                    self.index.sync_path(&self.vault, &source);
                    updated.push(source);
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("failed to rewrite links in {source}: {e}");
                    failed.push(FailedRewrite {
                        path: source,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.refresh_graph();

        if !failed.is_empty() {
            return Err(CoordinatorError::ReferenceRewritePartial {
                moved_to: new_path.to_string(),
                updated,
                failed,
            });
        }

        for path in updated {
            if !modified.contains(&path) {
                modified.push(path);
            }
        }

        Ok(StructuralChange {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            modified,
        })
    }

    /// Move index entries to the new identity without re-embedding; fall back
    /// to a fresh index of the new path when nothing was stored.
    fn patch_index(&self, old_path: &str, new_path: &str, update: &MetadataUpdate) {
        match self.index.update_metadata(old_path, update) {
            // after a metadata move this only refreshes the modification
            // time, since the content hash already matches
            Ok(true) => self.index.sync_path(&self.vault, new_path),
            // a first build may already have read the old file; the removal
            // is journalled and replayed over what it built
            Ok(false) => {
                if let Err(e) = self.index.remove_file(old_path) {
                    log::debug!("dropping entries for {old_path}: {e}");
                }
                self.index.sync_path(&self.vault, new_path);
            }
            Err(IndexError::Unavailable(_)) => {}
            Err(e) => {
                log::warn!("index metadata update for {old_path} failed: {e}");
                if let Err(e) = self.index.remove_file(old_path) {
                    log::debug!("dropping stale entries for {old_path}: {e}");
                }
                self.index.sync_path(&self.vault, new_path);
            }
        }
    }

    /// Soft delete into the archive directory and drop index entries.
    pub fn delete_note(
        &self,
        path: &str,
        reason: Option<&str>,
    ) -> Result<ArchivedNote, CoordinatorError> {
        let archived_to = self.vault.archive_note(path, reason)?;
        log::info!("archived {path} -> {archived_to}");

        match self.index.remove_file(path) {
            Ok(()) | Err(IndexError::Unavailable(_)) => {}
            Err(e) => log::warn!("failed to drop index entries for {path}: {e}"),
        }
        self.refresh_graph();

        Ok(ArchivedNote {
            old_path: path.to_string(),
            archived_to,
        })
    }

    fn refresh_graph(&self) {
        if let Err(e) = self.graph.refresh() {
            log::warn!("graph engine refresh failed, link data may be stale: {e}");
        }
    }
}

fn parent_of(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}
