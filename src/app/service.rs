use std::sync::{Arc, RwLock};

use crate::{
    app::errors::AppError,
    coordinator::{ArchivedNote, Coordinator, StructuralChange},
    graph::{GraphEngine, GraphNote, ListQuery, NoteListing, TagCount},
    references::{Reference, ReferenceResolver},
    retrieval::{Retrieval, SearchResults},
    semantic::{CancelToken, IndexHealth, IndexStore, RebuildStats, SearchQuery},
    stats::{self, VaultStats},
    vault::{CreateNote, ExtractedSection, Note, Vault},
    watcher::{IndexCommand, IndexSender},
};

/// Every tool the vault exposes, over one vault, graph engine and index.
///
/// Write-path tools mutate the file tree first; the index update that
/// follows is best-effort and never fails the tool.
pub struct AppService {
    vault: Arc<Vault>,
    graph: Arc<dyn GraphEngine>,
    index: Arc<IndexStore>,
    coordinator: Coordinator,
    resolver: ReferenceResolver,
    retrieval: Retrieval,
    /// Set while an index worker runs; updates are queued to it
    worker: RwLock<Option<IndexSender>>,
}

impl AppService {
    pub fn new(vault: Arc<Vault>, graph: Arc<dyn GraphEngine>, index: Arc<IndexStore>) -> Self {
        Self {
            coordinator: Coordinator::new(vault.clone(), graph.clone(), index.clone()),
            resolver: ReferenceResolver::new(vault.clone(), graph.clone()),
            retrieval: Retrieval::new(index.clone(), graph.clone()),
            vault,
            graph,
            index,
            worker: RwLock::new(None),
        }
    }

    pub fn attach_worker(&self, sender: Option<IndexSender>) {
        if let Ok(mut worker) = self.worker.write() {
            *worker = sender;
        }
    }

    /// Hand an index update to the worker, or apply it inline when there is
    /// no worker or its queue is full.
    fn push_index(&self, path: &str) {
        let worker = self.worker.read().ok().and_then(|w| w.clone());
        if let Some(sender) = worker {
            if sender.send(IndexCommand::Index(path.to_string())) {
                return;
            }
        }
        self.index.sync_path(&self.vault, path);
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn get_note(&self, path: &str) -> Result<Note, AppError> {
        Ok(self.vault.get_note(path)?)
    }

    pub fn create_note(&self, req: &CreateNote) -> Result<String, AppError> {
        let path = self.vault.create_note(req)?;
        log::info!("created {path}");
        self.push_index(&path);
        Ok(path)
    }

    pub fn append_to_note(&self, path: &str, text: &str) -> Result<(), AppError> {
        self.vault.append_to_note(path, text)?;
        self.push_index(path);
        Ok(())
    }

    pub fn update_tags(&self, path: &str, add: &[String], remove: &[String]) -> Result<bool, AppError> {
        let changed = self.vault.update_tags(path, add, remove)?;
        if changed {
            self.push_index(path);
        }
        Ok(changed)
    }

    pub fn replace_section(&self, path: &str, section: &str, content: &str) -> Result<(), AppError> {
        self.vault.replace_section(path, section, content)?;
        self.push_index(path);
        Ok(())
    }

    pub fn extract_section(
        &self,
        source: &str,
        section: &str,
        new_title: &str,
        new_directory: &str,
    ) -> Result<ExtractedSection, AppError> {
        let extracted = self
            .vault
            .extract_section(source, section, new_title, new_directory)?;
        self.push_index(&extracted.new_path);
        self.push_index(&extracted.source);
        Ok(extracted)
    }

    pub fn move_note(&self, path: &str, new_directory: &str) -> Result<StructuralChange, AppError> {
        Ok(self.coordinator.move_note(path, new_directory)?)
    }

    pub fn rename_note(&self, path: &str, new_title: &str) -> Result<StructuralChange, AppError> {
        Ok(self.coordinator.rename_note(path, new_title)?)
    }

    pub fn delete_note(&self, path: &str, reason: Option<&str>) -> Result<ArchivedNote, AppError> {
        Ok(self.coordinator.delete_note(path, reason)?)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<SearchResults, AppError> {
        if query.text.trim().is_empty() {
            return Err(AppError::InvalidArgument("query is empty".to_string()));
        }
        Ok(self.retrieval.search(query)?)
    }

    pub fn find_references(
        &self,
        title: &str,
        include_text_mentions: bool,
    ) -> Result<Vec<Reference>, AppError> {
        Ok(self.resolver.find_references(title, include_text_mentions)?)
    }

    pub fn backlinks(&self, path: &str) -> Result<Vec<GraphNote>, AppError> {
        self.vault.resolve(path)?;
        Ok(self.graph.linked_by(path)?)
    }

    pub fn links(&self, path: &str) -> Result<Vec<GraphNote>, AppError> {
        self.vault.resolve(path)?;
        Ok(self.graph.links_to(path)?)
    }

    /// Notes known to the graph engine, narrowed by directory and tag.
    pub fn list_notes(&self, query: &ListQuery) -> Result<Vec<NoteListing>, AppError> {
        if query.limit == 0 {
            return Err(AppError::InvalidArgument("limit must be at least 1".to_string()));
        }

        let directory = match query.directory.as_deref() {
            Some(dir) => Some(self.vault.check_directory(dir)?).filter(|d| !d.is_empty()),
            None => None,
        };
        let tag = query
            .tag
            .as_deref()
            .map(|t| t.trim().trim_start_matches('#').to_lowercase())
            .filter(|t| !t.is_empty());

        Ok(self.graph.list_notes(&ListQuery {
            directory,
            tag,
            limit: query.limit,
        })?)
    }

    pub fn tags(&self) -> Result<Vec<TagCount>, AppError> {
        Ok(self.graph.tags()?)
    }

    pub fn stats(&self) -> VaultStats {
        stats::collect(&self.vault, &self.index.health())
    }

    pub fn index_status(&self) -> IndexHealth {
        self.index.health()
    }

    pub fn rebuild_index(
        &self,
        cancel: &CancelToken,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<RebuildStats, AppError> {
        Ok(self.index.rebuild_all(&self.vault, cancel, progress)?)
    }
}
