//! Vault overview: notes per directory, most used tags and index coverage.

use std::collections::HashMap;

use serde::Serialize;

use crate::graph::TagCount;
use crate::semantic::IndexHealth;
use crate::vault::{directory_of, Vault};

/// How many tags the overview lists
const TOP_TAGS: usize = 15;

/// Directory label for notes at the vault root
pub const ROOT_DIRECTORY: &str = "(root)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryCount {
    pub directory: String,
    pub notes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStats {
    pub notes: usize,
    /// Most notes first
    pub directories: Vec<DirectoryCount>,
    pub top_tags: Vec<TagCount>,
    pub index_state: &'static str,
    pub indexed_notes: usize,
    pub indexed_chunks: usize,
}

pub fn collect(vault: &Vault, health: &IndexHealth) -> VaultStats {
    let files = vault.notes();
    let mut directories: HashMap<String, usize> = HashMap::new();
    let mut tags: HashMap<String, usize> = HashMap::new();

    for file in &files {
        let directory = match directory_of(&file.rel_path) {
            dir if dir.is_empty() => ROOT_DIRECTORY.to_string(),
            dir => dir,
        };
        *directories.entry(directory).or_default() += 1;

        match vault.read_file(file) {
            Ok(note) => {
                for tag in note.tags {
                    *tags.entry(tag).or_default() += 1;
                }
            }
            Err(e) => log::debug!("no tags counted for {}: {e}", file.rel_path),
        }
    }

    VaultStats {
        notes: files.len(),
        directories: by_count(directories)
            .into_iter()
            .map(|(directory, notes)| DirectoryCount { directory, notes })
            .collect(),
        top_tags: by_count(tags)
            .into_iter()
            .take(TOP_TAGS)
            .map(|(name, notes)| TagCount { name, notes })
            .collect(),
        index_state: health.state,
        indexed_notes: health.notes,
        indexed_chunks: health.chunks,
    }
}

/// Highest count first, ties by name.
fn by_count(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_count_orders_ties_by_name() {
        let counts = HashMap::from([
            ("rust".to_string(), 2),
            ("infra".to_string(), 2),
            ("food".to_string(), 5),
        ]);

        assert_eq!(
            by_count(counts),
            vec![
                ("food".to_string(), 5),
                ("infra".to_string(), 2),
                ("rust".to_string(), 2)
            ]
        );
    }
}
