//! Crate-level tests over isolated temp vaults.
//!
//! Everything runs in-process: the embedder is a deterministic hashing
//! bag-of-words and the graph engine scans the temp vault with the same
//! link grammar the coordinator rewrites with.

mod web;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::app::AppService;
use crate::config::Config;
use crate::graph::{
    GraphEngine, GraphError, GraphNote, KeywordHit, KeywordQuery, ListQuery, NoteListing, TagCount,
};
use crate::semantic::{CancelToken, Embedder, EmbeddingError, IndexStore, SearchSettings};
use crate::vault::markdown::{line_excerpt, wikilinks};
use crate::vault::{Note, Vault};

pub const DIMS: usize = 32;
pub const MODEL: &str = "test-hash";

fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Bag-of-words vector: one bucket per hashed word plus a small constant
/// component so no text embeds to zero.
pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMS];
    vector[0] = 0.05;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
    {
        let bucket = 1 + (fnv1a(&word.to_lowercase()) % (DIMS as u64 - 1)) as usize;
        vector[bucket] += 1.0;
    }
    vector
}

pub struct HashEmbedder {
    model: String,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::named(MODEL)
    }

    pub fn named(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

/// Same identity as `HashEmbedder`, but every call fails.
pub struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn model_id(&self) -> &str {
        MODEL
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("provider down".to_string()))
    }
}

/// Holds its first call until `release`; later calls pass straight through.
pub struct GatedEmbedder {
    first: AtomicBool,
    entered: AtomicBool,
    open: Mutex<bool>,
    cv: Condvar,
}

impl GatedEmbedder {
    pub fn new() -> Self {
        Self {
            first: AtomicBool::new(true),
            entered: AtomicBool::new(false),
            open: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn wait_entered(&self) {
        while !self.entered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

impl Embedder for GatedEmbedder {
    fn model_id(&self) -> &str {
        MODEL
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.first.swap(false, Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

/// Graph engine answering from the files of the temp vault.
pub struct VaultGraph {
    vault: Arc<Vault>,
    pub refreshes: AtomicUsize,
    /// Extra sources reported for every `linked_by`, e.g. files that vanished
    pub phantoms: Mutex<Vec<GraphNote>>,
}

impl VaultGraph {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            refreshes: AtomicUsize::new(0),
            phantoms: Mutex::new(vec![]),
        }
    }

    fn all_notes(&self) -> Vec<Note> {
        self.vault
            .notes()
            .into_iter()
            .filter_map(|f| self.vault.read_note(&f.rel_path).ok())
            .collect()
    }
}

impl GraphEngine for VaultGraph {
    fn linked_by(&self, path: &str) -> Result<Vec<GraphNote>, GraphError> {
        let target = self
            .vault
            .read_note(path)
            .map_err(|e| GraphError::Failed(e.to_string()))?;
        let identity = target.identity();

        let mut sources: Vec<GraphNote> = self
            .all_notes()
            .into_iter()
            .filter(|note| {
                wikilinks(&note.content)
                    .iter()
                    .any(|link| identity.classify(&link.target).is_some())
            })
            .map(|note| GraphNote {
                path: note.path,
                title: note.title,
            })
            .collect();
        sources.extend(self.phantoms.lock().unwrap().iter().cloned());
        Ok(sources)
    }

    fn links_to(&self, path: &str) -> Result<Vec<GraphNote>, GraphError> {
        let note = self
            .vault
            .read_note(path)
            .map_err(|e| GraphError::Failed(e.to_string()))?;
        let others = self.all_notes();

        let mut targets = Vec::new();
        for link in wikilinks(&note.content) {
            if let Some(target) = others
                .iter()
                .find(|other| other.identity().classify(&link.target).is_some())
            {
                targets.push(GraphNote {
                    path: target.path.clone(),
                    title: target.title.clone(),
                });
            }
        }
        Ok(targets)
    }

    fn keyword_search(&self, query: &KeywordQuery) -> Result<Vec<KeywordHit>, GraphError> {
        let needle = query.text.to_lowercase();
        Ok(self
            .all_notes()
            .into_iter()
            .filter(|note| match &query.directory {
                Some(dir) => note.path.starts_with(&format!("{dir}/")),
                None => true,
            })
            .filter(|note| query.tags.iter().all(|t| note.tags.contains(t)))
            .filter_map(|note| {
                let at = note.content.to_lowercase().find(&needle)?;
                Some(KeywordHit {
                    excerpt: line_excerpt(&note.content, at),
                    path: note.path,
                    title: note.title,
                })
            })
            .take(query.limit)
            .collect())
    }

    fn list_notes(&self, query: &ListQuery) -> Result<Vec<NoteListing>, GraphError> {
        let mut notes: Vec<Note> = self
            .all_notes()
            .into_iter()
            .filter(|note| match &query.directory {
                Some(dir) => note.path.starts_with(&format!("{dir}/")),
                None => true,
            })
            .filter(|note| match &query.tag {
                Some(tag) => note.tags.contains(tag),
                None => true,
            })
            .collect();
        notes.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(notes
            .into_iter()
            .take(query.limit)
            .map(|note| NoteListing {
                path: note.path,
                title: note.title,
                date: note.date.unwrap_or_default(),
                tags: note.tags,
            })
            .collect())
    }

    fn tags(&self) -> Result<Vec<TagCount>, GraphError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for note in self.all_notes() {
            for tag in note.tags {
                *counts.entry(tag).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(name, notes)| TagCount { name, notes })
            .collect())
    }

    fn refresh(&self) -> Result<(), GraphError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn write_note(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).unwrap()
}

/// Push a file's modification time into the future so it reads as changed.
pub fn touch_later(root: &Path, rel: &str) {
    let file = std::fs::File::options()
        .write(true)
        .open(root.join(rel))
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

pub fn create_vault(notes: &[(&str, &str)]) -> (tempfile::TempDir, Arc<Vault>) {
    create_vault_with(notes, &Config::default())
}

pub fn create_vault_with(
    notes: &[(&str, &str)],
    config: &Config,
) -> (tempfile::TempDir, Arc<Vault>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    for (rel, content) in notes {
        write_note(dir.path(), rel, content);
    }
    let vault = Arc::new(Vault::new(dir.path(), config).unwrap());
    (dir, vault)
}

pub fn open_store(vault: &Vault, embedder: Arc<dyn Embedder>) -> Arc<IndexStore> {
    Arc::new(IndexStore::open(
        embedder,
        Config::index_path(vault.root()),
        SearchSettings::default(),
    ))
}

pub fn rebuild(store: &IndexStore, vault: &Vault) {
    store
        .rebuild_all(vault, &CancelToken::new(), &|_: usize, _: usize| {})
        .expect("rebuild failed");
}

/// A service over a temp vault with a hashing embedder and a vault-scanning
/// graph engine. The index is built when `built` is set.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub vault: Arc<Vault>,
    pub graph: Arc<VaultGraph>,
    pub index: Arc<IndexStore>,
    pub service: Arc<AppService>,
}

impl Harness {
    pub fn new(notes: &[(&str, &str)], built: bool) -> Self {
        let harness = Self::with_embedder(notes, Arc::new(HashEmbedder::new()));
        if built {
            rebuild(&harness.index, &harness.vault);
        }
        harness
    }

    /// Unbuilt index over the given embedder.
    pub fn with_embedder(notes: &[(&str, &str)], embedder: Arc<dyn Embedder>) -> Self {
        let (dir, vault) = create_vault(notes);
        let graph = Arc::new(VaultGraph::new(vault.clone()));
        let index = open_store(&vault, embedder);

        let service = Arc::new(AppService::new(vault.clone(), graph.clone(), index.clone()));
        Self {
            dir,
            vault,
            graph,
            index,
            service,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}
