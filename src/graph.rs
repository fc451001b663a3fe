//! Boundary to the authoritative note-graph engine.
//!
//! Structural link detection and keyword search belong to the engine; this
//! crate never parses links on its own to answer "who links here". The
//! default engine is the `zk` CLI run inside the vault.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::config::GraphConfig;
use crate::vault::markdown::excerpt;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("invalid {param} value '{value}': must not start with '-'")]
    FlagLike { param: &'static str, value: String },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("{0}")]
    Failed(String),
}

/// A note as reported by the graph engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNote {
    pub path: String,
    pub title: String,
}

/// A keyword match with the engine's best snippet, possibly empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordHit {
    pub path: String,
    pub title: String,
    pub excerpt: String,
}

/// One row of a note listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteListing {
    pub path: String,
    pub title: String,
    /// Creation date as the engine formats it, may be empty
    pub date: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub directory: Option<String>,
    pub tag: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub name: String,
    pub notes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordQuery {
    pub text: String,
    pub directory: Option<String>,
    pub tags: Vec<String>,
    /// Unix millis
    pub since: Option<i64>,
    pub limit: usize,
}

pub trait GraphEngine: Send + Sync {
    /// Notes containing a structural link to `path`.
    fn linked_by(&self, path: &str) -> Result<Vec<GraphNote>, GraphError>;

    /// Notes `path` links to.
    fn links_to(&self, path: &str) -> Result<Vec<GraphNote>, GraphError>;

    fn keyword_search(&self, query: &KeywordQuery) -> Result<Vec<KeywordHit>, GraphError>;

    /// Notes ordered by path, optionally narrowed to a directory or tag.
    fn list_notes(&self, query: &ListQuery) -> Result<Vec<NoteListing>, GraphError>;

    /// Every tag in the vault with the number of notes carrying it.
    fn tags(&self) -> Result<Vec<TagCount>, GraphError>;

    /// Ask the engine to pick up file changes made behind its back.
    fn refresh(&self) -> Result<(), GraphError>;
}

pub struct ZkCli {
    command: String,
    root: PathBuf,
    timeout: Duration,
}

impl ZkCli {
    pub fn new(root: &Path, config: &GraphConfig) -> Self {
        Self {
            command: config.command.clone(),
            root: root.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, GraphError> {
        log::debug!("Running: {} {}", self.command, args.join(" "));

        let mut child = Command::new(&self.command)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| GraphError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // drain pipes on their own threads so a chatty child can't block on
        // a full pipe while we poll for its exit
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::warn!("{} timed out", self.command);
                    return Err(GraphError::Timeout {
                        command: self.command.clone(),
                        secs: self.timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(source) => {
                    return Err(GraphError::Spawn {
                        command: self.command.clone(),
                        source,
                    })
                }
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            let msg = match stderr.trim() {
                "" => format!("{} exited with {}", self.command, status),
                msg => msg.to_string(),
            };
            log::warn!("{} command failed: {msg}", self.command);
            return Err(GraphError::Failed(msg));
        }

        Ok(stdout.trim().to_string())
    }

    fn list_links(&self, flag: &str, path: &str) -> Result<Vec<GraphNote>, GraphError> {
        let path = reject_flag(path, "path")?;
        let raw = self.run(&[
            "list".into(),
            flag.into(),
            path.into(),
            "--format".into(),
            "{{path}}\t{{title}}".into(),
            "--quiet".into(),
        ])?;

        Ok(parse_rows::<2>(&raw)
            .map(|cols| GraphNote {
                path: cols[0].to_string(),
                title: cols[1].to_string(),
            })
            .collect())
    }
}

impl GraphEngine for ZkCli {
    fn linked_by(&self, path: &str) -> Result<Vec<GraphNote>, GraphError> {
        self.list_links("--link-to", path)
    }

    fn links_to(&self, path: &str) -> Result<Vec<GraphNote>, GraphError> {
        self.list_links("--linked-by", path)
    }

    fn keyword_search(&self, query: &KeywordQuery) -> Result<Vec<KeywordHit>, GraphError> {
        let mut args: Vec<String> = vec![
            "list".into(),
            "--match".into(),
            reject_flag(&query.text, "query")?.into(),
            "--format".into(),
            "{{path}}\t{{title}}\t{{json snippets}}".into(),
            "--limit".into(),
            query.limit.to_string(),
            "--quiet".into(),
        ];

        for tag in &query.tags {
            args.push("--tag".into());
            args.push(reject_flag(tag, "tag")?.into());
        }
        if let Some(since) = query.since.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            args.push("--modified-after".into());
            args.push(since.format("%Y-%m-%d %H:%M:%S").to_string());
        }
        if let Some(directory) = &query.directory {
            args.push(reject_flag(directory, "directory")?.into());
        }

        Ok(parse_rows::<3>(&self.run(&args)?)
            .map(|cols| KeywordHit {
                path: cols[0].to_string(),
                title: cols[1].to_string(),
                excerpt: first_snippet(cols[2]),
            })
            .collect())
    }

    fn list_notes(&self, query: &ListQuery) -> Result<Vec<NoteListing>, GraphError> {
        let mut args: Vec<String> = vec![
            "list".into(),
            "--format".into(),
            "{{path}}\t{{title}}\t{{date created \"%Y-%m-%d\"}}\t{{join tags \",\"}}".into(),
            "--sort".into(),
            "path".into(),
            "--limit".into(),
            query.limit.to_string(),
            "--quiet".into(),
        ];

        if let Some(tag) = &query.tag {
            args.push("--tag".into());
            args.push(reject_flag(tag, "tag")?.into());
        }
        if let Some(directory) = &query.directory {
            args.push(reject_flag(directory, "directory")?.into());
        }

        Ok(parse_rows::<4>(&self.run(&args)?)
            .map(|cols| NoteListing {
                path: cols[0].to_string(),
                title: cols[1].to_string(),
                date: cols[2].to_string(),
                tags: split_tags(cols[3]),
            })
            .collect())
    }

    fn tags(&self) -> Result<Vec<TagCount>, GraphError> {
        let raw = self.run(&[
            "tag".into(),
            "list".into(),
            "--format".into(),
            "{{name}}\t{{note-count}}".into(),
            "--quiet".into(),
        ])?;

        Ok(parse_rows::<2>(&raw)
            .map(|cols| TagCount {
                name: cols[0].to_string(),
                notes: cols[1].trim().parse().unwrap_or(0),
            })
            .collect())
    }

    fn refresh(&self) -> Result<(), GraphError> {
        self.run(&["index".into(), "--quiet".into()]).map(|_| ())
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

/// User-supplied values must never land in the engine's option namespace.
pub fn reject_flag<'a>(value: &'a str, param: &'static str) -> Result<&'a str, GraphError> {
    if value.starts_with('-') {
        return Err(GraphError::FlagLike {
            param,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// First entry of a JSON snippet list, flattened to one line.
fn first_snippet(raw: &str) -> String {
    serde_json::from_str::<Vec<String>>(raw)
        .ok()
        .and_then(|snippets| snippets.into_iter().next())
        .map(|s| excerpt(&s))
        .unwrap_or_default()
}

/// Tab-separated rows, padded to `N` columns.
fn parse_rows<const N: usize>(raw: &str) -> impl Iterator<Item = [&str; N]> {
    raw.lines().filter(|l| !l.trim().is_empty()).map(|line| {
        let mut parts = line.split('\t');
        std::array::from_fn(|_| parts.next().unwrap_or_default())
    })
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().trim_start_matches('#'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_flag() {
        assert!(reject_flag("kubernetes", "query").is_ok());
        assert!(matches!(
            reject_flag("--exec", "query"),
            Err(GraphError::FlagLike { param: "query", .. })
        ));
    }

    #[test]
    fn test_parse_rows_pads_missing_columns() {
        let rows: Vec<[&str; 3]> = parse_rows("a.md\tA\t2024-01-01\nb.md\tB\n\n").collect();
        assert_eq!(rows, vec![["a.md", "A", "2024-01-01"], ["b.md", "B", ""]]);

        let rows: Vec<[&str; 2]> = parse_rows("rust\t4\textra\n").collect();
        assert_eq!(rows, vec![["rust", "4"]]);
    }

    #[test]
    fn test_split_tags() {
        assert_eq!(split_tags("rust, #infra,,k8s"), vec!["rust", "infra", "k8s"]);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn test_first_snippet() {
        assert_eq!(first_snippet(r#"["about <b>k8s</b>\n pods", "x"]"#), "about <b>k8s</b> pods");
        assert_eq!(first_snippet("[]"), "");
        assert_eq!(first_snippet("not json"), "");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let zk = ZkCli::new(
            dir.path(),
            &GraphConfig {
                command: "vaultd-no-such-binary".to_string(),
                timeout_secs: 1,
            },
        );
        assert!(matches!(zk.linked_by("a.md"), Err(GraphError::Spawn { .. })));
    }

    #[test]
    fn test_flag_like_query_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let zk = ZkCli::new(
            dir.path(),
            &GraphConfig {
                command: "vaultd-no-such-binary".to_string(),
                timeout_secs: 1,
            },
        );
        let query = KeywordQuery {
            text: "-rf".to_string(),
            limit: 5,
            ..Default::default()
        };
        assert!(matches!(zk.keyword_search(&query), Err(GraphError::FlagLike { .. })));

        let listing = ListQuery {
            tag: Some("--sort".to_string()),
            limit: 5,
            ..Default::default()
        };
        assert!(matches!(
            zk.list_notes(&listing),
            Err(GraphError::FlagLike { param: "tag", .. })
        ));
    }
}
