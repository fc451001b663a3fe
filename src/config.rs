use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::{DEFAULT_MODEL, DEFAULT_SEMANTIC_WEIGHT};
use crate::storage::atomic_write;

/// Reserved directory inside the vault holding config, models and the index
pub const STATE_DIR: &str = ".vaultd";

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 60;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_DEBOUNCE_MS: u64 = 2000;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_NOTE_BYTES: u64 = 2 * 1024 * 1024;

const DEFAULT_GRAPH_COMMAND: &str = "zk";
const DEFAULT_GRAPH_TIMEOUT_SECS: u64 = 30;

const DEFAULT_ARCHIVE_DIR: &str = "archives";
const DEFAULT_LISTEN: &str = "127.0.0.1:8337";

/// Semantic index settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Embedding model name (e.g. "bge-small-en-v1.5")
    #[serde(default = "default_model")]
    pub model: String,

    /// Weight of vector similarity vs keyword match, [0.0, 1.0]
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,

    /// Results scoring below this are dropped
    #[serde(default)]
    pub min_score: f32,

    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            min_score: 0.0,
            embed_timeout_secs: DEFAULT_EMBED_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

/// File watcher settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period before a changed file is re-indexed
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound for the startup reconciliation pass
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,

    /// Directory names never watched nor treated as notes
    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,

    /// Drop folder for raw ingestion inputs, never chunked directly
    #[serde(default = "default_ingest_dir")]
    pub ingest_dir: String,

    #[serde(default = "default_max_note_bytes")]
    pub max_note_bytes: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            ignored_dirs: default_ignored_dirs(),
            ingest_dir: default_ingest_dir(),
            max_note_bytes: DEFAULT_MAX_NOTE_BYTES,
        }
    }
}

/// External note-graph engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_command")]
    pub command: String,

    #[serde(default = "default_graph_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            command: default_graph_command(),
            timeout_secs: DEFAULT_GRAPH_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Soft-deleted notes are moved here
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,

    /// Known top-level note directories. Empty means any directory is allowed.
    #[serde(default)]
    pub directories: Vec<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            directories: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_semantic_weight() -> f32 {
    DEFAULT_SEMANTIC_WEIGHT
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_reconcile_timeout_secs() -> u64 {
    DEFAULT_RECONCILE_TIMEOUT_SECS
}

fn default_ignored_dirs() -> Vec<String> {
    [".git", ".zk", STATE_DIR, ".venv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ingest_dir() -> String {
    "raw".to_string()
}

fn default_max_note_bytes() -> u64 {
    DEFAULT_MAX_NOTE_BYTES
}

fn default_graph_command() -> String {
    DEFAULT_GRAPH_COMMAND.to_string()
}

fn default_graph_timeout_secs() -> u64 {
    DEFAULT_GRAPH_TIMEOUT_SECS
}

fn default_archive_dir() -> String {
    DEFAULT_ARCHIVE_DIR.to_string()
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let index = &self.index;
        if !(0.0..=1.0).contains(&index.semantic_weight) {
            bail!(
                "index.semantic_weight must be between 0.0 and 1.0, got {}",
                index.semantic_weight
            );
        }
        if !(0.0..=1.0).contains(&index.min_score) {
            bail!(
                "index.min_score must be between 0.0 and 1.0, got {}",
                index.min_score
            );
        }
        if index.embed_timeout_secs == 0 {
            bail!("index.embed_timeout_secs must be greater than 0");
        }
        if index.download_timeout_secs == 0 {
            bail!("index.download_timeout_secs must be greater than 0");
        }

        let watch = &self.watch;
        if watch.queue_capacity == 0 {
            bail!("watch.queue_capacity must be greater than 0");
        }
        if watch.reconcile_timeout_secs == 0 {
            bail!("watch.reconcile_timeout_secs must be greater than 0");
        }
        if watch.ingest_dir.contains('/') {
            bail!("watch.ingest_dir must be a top-level directory name");
        }

        if self.graph.command.trim().is_empty() {
            bail!("graph.command must not be empty");
        }

        let archive = self.vault.archive_dir.trim_matches('/');
        if archive.is_empty() || archive.contains("..") {
            bail!("vault.archive_dir must be a relative directory inside the vault");
        }

        Ok(())
    }

    /// Directory holding config, models and the index for `vault_root`.
    pub fn state_dir(vault_root: &Path) -> PathBuf {
        vault_root.join(STATE_DIR)
    }

    pub fn models_dir(vault_root: &Path) -> PathBuf {
        Self::state_dir(vault_root).join("models")
    }

    pub fn index_path(vault_root: &Path) -> PathBuf {
        Self::state_dir(vault_root).join("index").join("notes.bin")
    }

    /// Load `config.yaml` from the vault's state directory, creating it with
    /// defaults if it does not exist.
    pub fn load_with(vault_root: &Path) -> anyhow::Result<Self> {
        let state_dir = Self::state_dir(vault_root);
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;

        let path = state_dir.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            atomic_write(&path, defaults.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("config {} is malformed", path.display()))?;

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save(vault_root)?;
        }

        Ok(config)
    }

    pub fn save(&self, vault_root: &Path) -> anyhow::Result<()> {
        let path = Self::state_dir(vault_root).join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;
        atomic_write(&path, config_str.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
