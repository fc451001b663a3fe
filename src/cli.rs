use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Vault root directory.
    /// Falls back to ZK_NOTEBOOK_DIR.
    #[clap(long, global = true, env = "VAULTD_VAULT")]
    pub vault: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn vault_root(&self) -> anyhow::Result<PathBuf> {
        let root = match &self.vault {
            Some(root) => root.clone(),
            None => match std::env::var_os("ZK_NOTEBOOK_DIR") {
                Some(root) => PathBuf::from(root),
                None => bail!("no vault given: pass --vault or set VAULTD_VAULT"),
            },
        };

        if !root.is_dir() {
            bail!("vault {} does not exist", root.display());
        }
        Ok(root)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the vault tools over HTTP and keep the index fresh.
    Serve {},

    /// Search notes by meaning, or by keyword when the index is unavailable
    Search {
        query: String,

        /// Only notes under this directory
        #[clap(short, long)]
        directory: Option<String>,

        /// Only notes carrying all of these tags (comma separated)
        #[clap(short = 'g', long)]
        tags: Option<String>,

        /// Only notes modified since (YYYY-MM-DD or RFC 3339)
        #[clap(short, long)]
        since: Option<String>,

        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Rebuild the semantic index from scratch
    Reindex {},

    /// List notes that reference a note title
    References {
        title: String,

        /// Include plain-text mentions of the title
        #[clap(long, default_value = "false")]
        text_mentions: bool,
    },

    /// Move a note to another directory, rewriting path links to it
    Move { path: String, directory: String },

    /// Retitle a note, renaming its file and rewriting links to it
    Rename { path: String, title: String },

    /// Archive a note
    Delete {
        path: String,

        #[clap(short, long)]
        reason: Option<String>,
    },

    /// List notes by path, optionally within a directory or tag
    List {
        #[clap(short, long)]
        directory: Option<String>,

        #[clap(short = 'g', long)]
        tag: Option<String>,

        #[clap(short, long, default_value = "50")]
        limit: usize,
    },

    /// List tags with how many notes carry each
    Tags {},

    /// Summarise the vault and its index
    Stats {},

    /// Show index health
    Status {},
}

pub fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.trim_start_matches('#').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("Rust, #infra k8s"), vec!["rust", "infra", "k8s"]);
        assert!(parse_tags(" , ").is_empty());
    }

    #[test]
    fn test_parse_search_args() {
        let args = Args::try_parse_from([
            "vaultd", "--vault", "/tmp", "search", "pods", "-g", "infra", "-l", "3",
        ])
        .unwrap();

        match args.command {
            Command::Search {
                query, tags, limit, ..
            } => {
                assert_eq!(query, "pods");
                assert_eq!(tags.as_deref(), Some("infra"));
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_list_args() {
        let args = Args::try_parse_from(["vaultd", "list", "-d", "projects"]).unwrap();

        match args.command {
            Command::List {
                directory,
                tag,
                limit,
            } => {
                assert_eq!(directory.as_deref(), Some("projects"));
                assert_eq!(tag, None);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
