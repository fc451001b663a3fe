//! The vault: a directory of Markdown notes.
//!
//! Every path handed in from outside goes through [`Vault::resolve`] first,
//! which rejects anything that would land outside the root before any I/O
//! happens. Paths are exchanged as vault-relative strings with `/`
//! separators (`"projects/kubernetes.md"`).

pub mod markdown;
mod write;

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Config;
use crate::storage::{atomic_write, is_temp_file, PathLocks};

pub use write::{CreateNote, ExtractedSection};

const NOTE_EXTENSION: &str = "md";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("path is outside the vault: {0}")]
    OutsideVault(String),

    #[error("note not found: {0}")]
    NotFound(String),

    #[error("note already exists: {0}")]
    AlreadyExists(String),

    #[error("section '{section}' not found in {path}")]
    SectionNotFound { path: String, section: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl VaultError {
    fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return VaultError::NotFound(path.to_string());
        }
        VaultError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// A note file on disk, without its content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteFile {
    pub rel_path: String,
    #[serde(skip)]
    pub abs_path: PathBuf,
    /// Modification time, milliseconds since the unix epoch
    pub modified_at: i64,
    pub bytes: u64,
}

/// A parsed note.
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub path: String,
    pub title: String,
    pub date: Option<String>,
    pub tags: Vec<String>,
    /// First path component, "" for notes at the root
    pub directory: String,
    pub modified_at: i64,
    pub content: String,
    #[serde(skip)]
    pub body_start: usize,
}

impl Note {
    pub fn body(&self) -> &str {
        &self.content[self.body_start..]
    }

    pub fn identity(&self) -> NoteIdentity {
        NoteIdentity::new(&self.path, &self.title)
    }
}

/// Which part of a note's identity a link target names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkForm {
    Title,
    Stem,
    Path,
}

/// The strings a wikilink may use to point at a note.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteIdentity {
    pub title: String,
    pub stem: String,
    /// Vault-relative path without the `.md` extension
    pub path_key: String,
}

impl NoteIdentity {
    pub fn new(rel_path: &str, title: &str) -> Self {
        let path_key = rel_path
            .strip_suffix(".md")
            .unwrap_or(rel_path)
            .to_string();
        let stem = path_key.rsplit('/').next().unwrap_or(&path_key).to_string();

        Self {
            title: title.to_string(),
            stem,
            path_key,
        }
    }

    /// Classify a link target against this identity. Matching is
    /// case-insensitive and ignores a trailing `.md`.
    pub fn classify(&self, target: &str) -> Option<LinkForm> {
        let target = normalize_target(target);
        if target.is_empty() {
            return None;
        }

        if target.contains('/') {
            return (target == self.path_key.to_lowercase()).then_some(LinkForm::Path);
        }
        if target == self.title.trim().to_lowercase() {
            return Some(LinkForm::Title);
        }
        if target == self.stem.to_lowercase() {
            return Some(LinkForm::Stem);
        }
        None
    }
}

fn normalize_target(target: &str) -> String {
    let target = target.trim().to_lowercase();
    target
        .strip_suffix(".md")
        .map(|t| t.to_string())
        .unwrap_or(target)
}

pub struct Vault {
    root: PathBuf,
    ignored_dirs: Vec<String>,
    ingest_dir: String,
    max_note_bytes: u64,
    archive_dir: String,
    directories: Vec<String>,
    locks: PathLocks,
}

impl Vault {
    pub fn new(root: &Path, config: &Config) -> Result<Self, VaultError> {
        let root = root
            .canonicalize()
            .map_err(|e| VaultError::io(&root.display().to_string(), e))?;

        if !root.is_dir() {
            return Err(VaultError::InvalidArgument(format!(
                "vault root is not a directory: {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            ignored_dirs: config.watch.ignored_dirs.clone(),
            ingest_dir: config.watch.ingest_dir.clone(),
            max_note_bytes: config.watch.max_note_bytes,
            archive_dir: config.vault.archive_dir.trim_matches('/').to_string(),
            directories: config.vault.directories.clone(),
            locks: PathLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> &str {
        &self.archive_dir
    }

    pub fn ingest_dir(&self) -> &str {
        &self.ingest_dir
    }

    /// Per-path locks guarding read-modify-write cycles on note files.
    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    /// Resolve a vault-relative path to an absolute one.
    ///
    /// Rejects absolute paths, `..` that climbs above the root and symlinks
    /// pointing outside the root. The target itself does not need to exist.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, VaultError> {
        let rel = rel.trim();
        if rel.is_empty() {
            return Err(VaultError::InvalidArgument("path is empty".to_string()));
        }

        let candidate = Path::new(rel);
        if candidate.is_absolute() {
            return Err(VaultError::OutsideVault(rel.to_string()));
        }

        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(VaultError::OutsideVault(rel.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(VaultError::OutsideVault(rel.to_string()));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(VaultError::InvalidArgument(format!("not a file path: {rel}")));
        }

        let absolute = self.root.join(&normalized);

        // follow symlinks through the deepest existing ancestor
        let mut existing = absolute.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        if let Ok(real) = existing.canonicalize() {
            if !real.starts_with(&self.root) {
                return Err(VaultError::OutsideVault(rel.to_string()));
            }
        }

        Ok(absolute)
    }

    /// Vault-relative `/`-separated form of an absolute path inside the root.
    pub fn relative(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Is this relative path something that should be indexed as a note?
    pub fn is_note_path(&self, rel: &str) -> bool {
        let path = Path::new(rel);
        if path.extension().and_then(|e| e.to_str()) != Some(NOTE_EXTENSION) {
            return false;
        }
        if is_temp_file(path) {
            return false;
        }
        if self.is_ignored(rel) || self.is_ingest(rel) {
            return false;
        }
        true
    }

    /// Inside one of the ignored directories (at any depth).
    pub fn is_ignored(&self, rel: &str) -> bool {
        let mut parts: Vec<&str> = rel.split('/').collect();
        parts.pop();
        parts
            .iter()
            .any(|part| self.ignored_dirs.iter().any(|d| d == part))
    }

    /// Inside the raw-ingestion drop folder.
    pub fn is_ingest(&self, rel: &str) -> bool {
        rel.split('/').next() == Some(self.ingest_dir.as_str()) && rel.contains('/')
    }

    pub fn is_archived(&self, rel: &str) -> bool {
        rel.starts_with(&format!("{}/", self.archive_dir))
    }

    /// Notes that belong in the semantic index: archived notes stay
    /// readable but are no longer searched by meaning.
    pub fn is_indexable(&self, rel: &str) -> bool {
        self.is_note_path(rel) && !self.is_archived(rel)
    }

    /// Every note under the root, sorted by path.
    pub fn notes(&self) -> Vec<NoteFile> {
        let mut notes: Vec<NoteFile> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                let skip = self.ignored_dirs.iter().any(|d| *d == name)
                    || (entry.depth() == 1 && name == self.ingest_dir.as_str());
                !skip
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = self.relative(entry.path())?;
                if !self.is_note_path(&rel) {
                    return None;
                }

                let metadata = entry.metadata().ok()?;
                let file = NoteFile {
                    rel_path: rel,
                    abs_path: entry.path().to_path_buf(),
                    modified_at: modified_millis(&metadata),
                    bytes: metadata.len(),
                };
                if self.is_oversized(&file) {
                    log::debug!("skipping oversized note {} ({} bytes)", file.rel_path, file.bytes);
                    return None;
                }
                Some(file)
            })
            .collect();

        notes.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        notes
    }

    /// Stat a single note.
    pub fn note_file(&self, rel: &str) -> Result<NoteFile, VaultError> {
        let abs = self.resolve(rel)?;
        let metadata = std::fs::metadata(&abs).map_err(|e| VaultError::io(rel, e))?;
        if !metadata.is_file() {
            return Err(VaultError::NotFound(rel.to_string()));
        }

        Ok(NoteFile {
            rel_path: rel.to_string(),
            abs_path: abs,
            modified_at: modified_millis(&metadata),
            bytes: metadata.len(),
        })
    }

    /// Larger than `watch.max_note_bytes`: such files are kept out of the
    /// index however they are reached.
    pub fn is_oversized(&self, file: &NoteFile) -> bool {
        file.bytes > self.max_note_bytes
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read_note(&self, rel: &str) -> Result<Note, VaultError> {
        let file = self.note_file(rel)?;
        self.read_file(&file)
    }

    /// Read and parse a note that was already stat'ed.
    pub fn read_file(&self, file: &NoteFile) -> Result<Note, VaultError> {
        let rel = file.rel_path.as_str();
        let content =
            std::fs::read_to_string(&file.abs_path).map_err(|e| VaultError::io(rel, e))?;
        Ok(parse(rel, content, file.modified_at))
    }

    /// Find a note by title (or file stem), case-insensitively.
    pub fn find_by_title(&self, title: &str) -> Option<Note> {
        let wanted = normalize_target(title);
        if wanted.is_empty() {
            return None;
        }

        let mut stem_match = None;
        for file in self.notes() {
            let Ok(note) = self.read_note(&file.rel_path) else {
                continue;
            };
            if note.title.trim().to_lowercase() == wanted {
                return Some(note);
            }
            if stem_match.is_none() && note.identity().stem.to_lowercase() == wanted {
                stem_match = Some(note);
            }
        }

        stem_match
    }

    /// Validate a target directory for new or moved notes.
    pub fn check_directory(&self, directory: &str) -> Result<String, VaultError> {
        let directory = directory.trim().trim_matches('/').to_string();
        if directory.is_empty() {
            return Ok(directory);
        }

        // resolving a placeholder file validates traversal and symlinks
        self.resolve(&format!("{directory}/placeholder.md"))?;

        if self.is_ignored(&format!("{directory}/x")) || self.is_ingest(&format!("{directory}/x"))
        {
            return Err(VaultError::InvalidArgument(format!(
                "directory is reserved: {directory}"
            )));
        }

        let top = directory.split('/').next().unwrap_or_default();
        if !self.directories.is_empty()
            && top != self.archive_dir
            && !self.directories.iter().any(|d| d == top)
        {
            return Err(VaultError::InvalidArgument(format!(
                "unknown directory '{directory}', expected one of: {}",
                self.directories.join(", ")
            )));
        }

        Ok(directory)
    }

    /// Write a note atomically, creating parent directories.
    pub(crate) fn write_raw(&self, rel: &str, content: &str) -> Result<(), VaultError> {
        let abs = self.resolve(rel)?;
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(rel, e))?;
        }
        atomic_write(&abs, content.as_bytes()).map_err(|e| VaultError::io(rel, e))
    }

    /// Rename a file inside the vault. Fails if the destination exists.
    pub(crate) fn rename_raw(&self, from: &str, to: &str) -> Result<(), VaultError> {
        let from_abs = self.resolve(from)?;
        let to_abs = self.resolve(to)?;

        if !from_abs.is_file() {
            return Err(VaultError::NotFound(from.to_string()));
        }
        if to_abs.exists() {
            return Err(VaultError::AlreadyExists(to.to_string()));
        }

        if let Some(parent) = to_abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(to, e))?;
        }
        std::fs::rename(&from_abs, &to_abs).map_err(|e| VaultError::io(from, e))
    }
}

/// Join a directory and file name into a vault-relative path.
pub fn join_rel(directory: &str, file_name: &str) -> String {
    let directory = directory.trim_matches('/');
    if directory.is_empty() {
        file_name.to_string()
    } else {
        format!("{directory}/{file_name}")
    }
}

/// First path component of a relative path, "" for root-level notes.
pub fn directory_of(rel: &str) -> String {
    match rel.split_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn file_stem(rel: &str) -> String {
    NoteIdentity::new(rel, "").stem
}

fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse note content read from `rel`.
pub fn parse(rel: &str, content: String, modified_at: i64) -> Note {
    let parsed = markdown::parse_note(&content);
    let title = parsed.title.unwrap_or_else(|| file_stem(rel));

    Note {
        path: rel.to_string(),
        title,
        date: parsed.date,
        tags: parsed.tags,
        directory: directory_of(rel),
        modified_at,
        content,
        body_start: parsed.body_start,
    }
}
