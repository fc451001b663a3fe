//! File-level write-path tools. Each read-modify-write runs under the
//! note's path lock and lands through `atomic_write`. Index maintenance is
//! layered on top by the application service.

use serde::{Deserialize, Serialize};

use super::markdown::{self, find_section, sections, set_frontmatter_field, slugify};
use super::{join_rel, Note, Vault, VaultError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateNote {
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedSection {
    pub source: String,
    pub new_path: String,
}

impl Vault {
    pub fn get_note(&self, rel: &str) -> Result<Note, VaultError> {
        self.read_note(rel)
    }

    /// Create a note named after the slug of its title. Returns its path.
    pub fn create_note(&self, req: &CreateNote) -> Result<String, VaultError> {
        let title = req.title.trim();
        let slug = slugify(title);
        if slug.is_empty() {
            return Err(VaultError::InvalidArgument(format!(
                "title '{}' has no usable characters",
                req.title
            )));
        }

        let directory = self.check_directory(&req.directory)?;
        let rel = join_rel(&directory, &format!("{slug}.md"));

        let tags: Vec<String> = req
            .tags
            .iter()
            .map(|t| t.trim().trim_start_matches('#').to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let mut content = format!(
            "---\ntitle: {title}\ndate: {}\n---\n",
            chrono::Local::now().format("%Y-%m-%d")
        );
        if !tags.is_empty() {
            let line: Vec<String> = tags.iter().map(|t| format!("#{t}")).collect();
            content.push_str(&line.join(" "));
            content.push_str("\n\n");
        }
        if !req.body.is_empty() {
            content.push_str(req.body.trim_end());
            content.push('\n');
        }

        self.locks().with_lock(&rel, || {
            if self.exists(&rel) {
                return Err(VaultError::AlreadyExists(rel.clone()));
            }
            self.write_raw(&rel, &content)
        })?;

        Ok(rel)
    }

    pub fn append_to_note(&self, rel: &str, text: &str) -> Result<(), VaultError> {
        self.modify(rel, |content| {
            let separator = if content.ends_with('\n') { "\n" } else { "\n\n" };
            Ok(Some(format!("{content}{separator}{}\n", text.trim_end())))
        })
        .map(|_| ())
    }

    /// Add and remove inline tags on the note's tag line. Returns whether the
    /// file changed.
    pub fn update_tags(
        &self,
        rel: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<bool, VaultError> {
        let clean = |tags: &[String]| -> Vec<String> {
            tags.iter()
                .map(|t| t.trim().trim_start_matches('#').to_string())
                .filter(|t| !t.is_empty())
                .collect()
        };
        let add = clean(add);
        let remove = clean(remove);

        self.modify(rel, |content| {
            let (_, body_start) = markdown::split_frontmatter(content);
            let head = &content[..body_start];
            let body = &content[body_start..];

            let mut lines: Vec<String> = body.lines().map(|l| l.to_string()).collect();
            let tag_idx = markdown::tag_line_index(body);

            let existing: Vec<String> = tag_idx
                .map(|idx| {
                    lines[idx]
                        .split_whitespace()
                        .map(|t| t.trim_start_matches('#').to_string())
                        .collect()
                })
                .unwrap_or_default();

            let mut updated = existing.clone();
            for tag in &add {
                if !updated.contains(tag) {
                    updated.push(tag.clone());
                }
            }
            updated.retain(|t| !remove.contains(t));

            if updated == existing {
                return Ok(None);
            }

            let tag_line = updated
                .iter()
                .map(|t| format!("#{t}"))
                .collect::<Vec<_>>()
                .join(" ");

            match (tag_idx, tag_line.is_empty()) {
                (Some(idx), true) => {
                    lines.remove(idx);
                }
                (Some(idx), false) => lines[idx] = tag_line,
                (None, _) => lines.insert(0, tag_line),
            }

            Ok(Some(format!("{head}{}\n", lines.join("\n"))))
        })
    }

    /// Replace the content of a `## ` section, keeping its header.
    pub fn replace_section(
        &self,
        rel: &str,
        section: &str,
        new_content: &str,
    ) -> Result<(), VaultError> {
        self.modify(rel, |content| {
            replace_section_text(content, section, new_content)
                .map(Some)
                .ok_or_else(|| VaultError::SectionNotFound {
                    path: rel.to_string(),
                    section: section.to_string(),
                })
        })
        .map(|_| ())
    }

    /// Move a section's content into a new note and leave a link to it in
    /// the section.
    pub fn extract_section(
        &self,
        source: &str,
        section: &str,
        new_title: &str,
        new_directory: &str,
    ) -> Result<ExtractedSection, VaultError> {
        let note = self.read_note(source)?;
        let body = note.body();
        let secs = sections(body);
        let found = find_section(&secs, section).ok_or_else(|| VaultError::SectionNotFound {
            path: source.to_string(),
            section: section.to_string(),
        })?;

        let extracted = body[found.content_start..found.end].trim().to_string();
        let new_path = self.create_note(&CreateNote {
            title: new_title.to_string(),
            directory: new_directory.to_string(),
            tags: vec![],
            body: extracted,
        })?;

        self.replace_section(source, section, &format!("[[{}]]", new_title.trim()))?;

        Ok(ExtractedSection {
            source: source.to_string(),
            new_path,
        })
    }

    /// Soft delete: stamp `archived_reason` and move the note under the
    /// archive directory. Returns the archived path.
    pub fn archive_note(&self, rel: &str, reason: Option<&str>) -> Result<String, VaultError> {
        if self.is_archived(rel) {
            return Err(VaultError::InvalidArgument(format!(
                "note is already archived: {rel}"
            )));
        }
        if !self.exists(rel) {
            return Err(VaultError::NotFound(rel.to_string()));
        }

        if let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) {
            self.modify(rel, |content| {
                Ok(Some(set_frontmatter_field(content, "archived_reason", reason)))
            })?;
        }

        let file_name = rel.rsplit('/').next().unwrap_or(rel);
        let dest = self.free_path(self.archive_dir(), file_name);
        self.locks()
            .with_lock(rel, || self.rename_raw(rel, &dest))?;

        Ok(dest)
    }

    /// First path in `directory` named `file_name`, `stem-2.md`, `stem-3.md`...
    /// that does not exist yet.
    pub(crate) fn free_path(&self, directory: &str, file_name: &str) -> String {
        let candidate = join_rel(directory, file_name);
        if !self.exists(&candidate) {
            return candidate;
        }

        let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
        (2..)
            .map(|n| join_rel(directory, &format!("{stem}-{n}.md")))
            .find(|p| !self.exists(p))
            .unwrap_or(candidate)
    }

    /// Read-modify-write under the path lock. `f` returns `None` to leave the
    /// file untouched. Returns whether a write happened.
    pub(crate) fn modify<F>(&self, rel: &str, f: F) -> Result<bool, VaultError>
    where
        F: FnOnce(&str) -> Result<Option<String>, VaultError>,
    {
        self.locks().with_lock(rel, || {
            let abs = self.resolve(rel)?;
            let content = std::fs::read_to_string(&abs).map_err(|e| VaultError::io(rel, e))?;

            match f(&content)? {
                Some(updated) if updated != content => {
                    self.write_raw(rel, &updated)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

/// Swap the content of `section` inside a whole note. `None` if the section
/// does not exist.
fn replace_section_text(content: &str, section: &str, new_content: &str) -> Option<String> {
    let (_, body_start) = markdown::split_frontmatter(content);
    let body = &content[body_start..];
    let secs = sections(body);
    let found = find_section(&secs, section)?;

    let before = &content[..body_start + found.content_start];
    let after = &content[body_start + found.end..];

    let mut out = String::with_capacity(content.len() + new_content.len());
    out.push_str(before);
    out.push_str(new_content.trim_end());
    out.push('\n');
    if !after.is_empty() {
        out.push('\n');
        out.push_str(after);
    }
    Some(out)
}
