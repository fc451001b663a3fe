//! Small Markdown grammar used by chunking, reference rewriting and the
//! structural edit tools.
//!
//! Everything here is a pure function over `&str`. Fenced code blocks and
//! inline code spans are opaque: no headers, links, tags or mentions are
//! recognised inside them.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static WIKILINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]\n]+?)\]\]").expect("valid wikilink regex"));

static HASHTAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(])#([\p{L}\p{N}_][\p{L}\p{N}_/-]*)").expect("valid hashtag regex")
});

static TAG_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#[\w][\w/-]* ?)+$").expect("valid tag line regex"));

static TITLE_LINE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^title:\s*(.+?)\s*$").expect("valid title regex"));

/// Maximum excerpt length (characters).
const EXCERPT_LENGTH: usize = 160;

/// A note split into its parts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedNote {
    /// `title:` from the frontmatter, if any
    pub title: Option<String>,
    /// `date:` from the frontmatter, if any
    pub date: Option<String>,
    /// Frontmatter tags followed by inline `#tags`, deduplicated, lowercase
    pub tags: Vec<String>,
    /// Byte offset where the body starts (after the frontmatter block)
    pub body_start: usize,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    date: Option<serde_yml::Value>,
    #[serde(default)]
    tags: Option<serde_yml::Value>,
}

/// A `## ` section of a body.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Header text without the `## ` marker
    pub header: String,
    /// Byte offset of the header line
    pub start: usize,
    /// Byte offset just after the header line
    pub content_start: usize,
    /// Byte offset of the next `## ` header or end of text
    pub end: usize,
}

/// A `[[target#heading|alias]]` occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct WikiLink {
    /// Span of the whole `[[...]]`
    pub span: Range<usize>,
    /// Span of the target part only
    pub target_span: Range<usize>,
    pub target: String,
}

/// A plain-text occurrence of a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub offset: usize,
    /// The line the mention sits on, trimmed and shortened
    pub excerpt: String,
}

/// Split off a leading `---` frontmatter block. Returns the block contents
/// (without fences) and the byte offset where the body starts.
pub fn split_frontmatter(content: &str) -> (Option<&str>, usize) {
    let first_line_end = match content.find('\n') {
        Some(idx) => idx + 1,
        None => return (None, 0),
    };
    if content[..first_line_end].trim_end() != "---" {
        return (None, 0);
    }

    let mut offset = first_line_end;
    for line in content[first_line_end..].split_inclusive('\n') {
        if line.trim_end() == "---" {
            let block = &content[first_line_end..offset];
            return (Some(block), offset + line.len());
        }
        offset += line.len();
    }

    (None, 0)
}

/// Parse frontmatter and tags of a note.
pub fn parse_note(content: &str) -> ParsedNote {
    let (block, body_start) = split_frontmatter(content);

    let mut note = ParsedNote {
        body_start,
        ..Default::default()
    };

    if let Some(block) = block {
        match serde_yml::from_str::<FrontMatter>(block) {
            Ok(fm) => {
                note.title = fm.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
                note.date = fm.date.and_then(|d| yaml_scalar(&d));
                note.tags = fm.tags.map(|t| yaml_tags(&t)).unwrap_or_default();
            }
            Err(err) => {
                log::debug!("frontmatter is not valid yaml, falling back to line scan: {err}");
                note.title = TITLE_LINE_REGEX
                    .captures(block)
                    .map(|c| c[1].to_string());
            }
        }
    }

    for tag in hashtags(&content[body_start..]) {
        if !note.tags.contains(&tag) {
            note.tags.push(tag);
        }
    }

    note
}

fn yaml_scalar(value: &serde_yml::Value) -> Option<String> {
    match value {
        serde_yml::Value::String(s) => Some(s.clone()),
        serde_yml::Value::Number(n) => Some(n.to_string()),
        serde_yml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_tags(value: &serde_yml::Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        serde_yml::Value::Sequence(items) => items.iter().filter_map(yaml_scalar).collect(),
        serde_yml::Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|s| s.to_string())
            .collect(),
        _ => vec![],
    };

    let mut tags = Vec::new();
    for tag in raw {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Inline `#tags` outside code, lowercase, in order of first appearance.
pub fn hashtags(text: &str) -> Vec<String> {
    let opaque = opaque_regions(text);
    let mut tags = Vec::new();

    for caps in HASHTAG_REGEX.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        if is_opaque(&opaque, m.start()) {
            continue;
        }
        let tag = m.as_str().trim_end_matches(['/', '-']).to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    tags
}

/// Byte ranges of fenced code blocks and inline code spans.
pub fn opaque_regions(text: &str) -> Vec<Range<usize>> {
    let mut regions = Vec::new();
    let mut fence: Option<&'static str> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_start();

        if let Some(marker) = fence {
            regions.push(start..offset);
            if trimmed.starts_with(marker) {
                fence = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(trimmed) {
            fence = Some(marker);
            regions.push(start..offset);
            continue;
        }

        inline_code_spans(line, start, &mut regions);
    }

    regions
}

fn fence_marker(trimmed: &str) -> Option<&'static str> {
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn inline_code_spans(line: &str, base: usize, out: &mut Vec<Range<usize>>) {
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }

        let run_start = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let run = i - run_start;

        // closing run must have the same length
        let mut j = i;
        let mut closed = None;
        while j < bytes.len() {
            if bytes[j] == b'`' {
                let s = j;
                while j < bytes.len() && bytes[j] == b'`' {
                    j += 1;
                }
                if j - s == run {
                    closed = Some(j);
                    break;
                }
            } else {
                j += 1;
            }
        }

        if let Some(end) = closed {
            out.push(base + run_start..base + end);
            i = end;
        }
    }
}

pub fn is_opaque(regions: &[Range<usize>], pos: usize) -> bool {
    regions.iter().any(|r| r.contains(&pos))
}

/// Level-2 sections of `text`, in order.
pub fn sections(text: &str) -> Vec<Section> {
    let opaque = opaque_regions(text);
    let mut headers: Vec<(String, usize, usize)> = Vec::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        if line.starts_with("## ") && !is_opaque(&opaque, start) {
            let header = line[3..].trim().to_string();
            headers.push((header, start, offset));
        }
    }

    let mut result = Vec::with_capacity(headers.len());
    for (idx, (header, start, content_start)) in headers.iter().enumerate() {
        let end = headers
            .get(idx + 1)
            .map(|(_, next, _)| *next)
            .unwrap_or(text.len());
        result.push(Section {
            header: header.clone(),
            start: *start,
            content_start: *content_start,
            end,
        });
    }

    result
}

/// Find a section by header, case-insensitively.
pub fn find_section<'a>(sections: &'a [Section], header: &str) -> Option<&'a Section> {
    let header = header.trim().trim_start_matches("## ").trim().to_lowercase();
    sections.iter().find(|s| s.header.to_lowercase() == header)
}

/// Wikilinks outside code, in order.
pub fn wikilinks(text: &str) -> Vec<WikiLink> {
    let opaque = opaque_regions(text);
    let mut links = Vec::new();

    for caps in WIKILINK_REGEX.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if is_opaque(&opaque, whole.start()) {
            continue;
        }

        let inner_str = inner.as_str();
        let target_len = inner_str
            .find(['|', '#'])
            .unwrap_or(inner_str.len());
        let raw_target = &inner_str[..target_len];

        // keep surrounding whitespace out of the replaceable span
        let lead = raw_target.len() - raw_target.trim_start().len();
        let target = raw_target.trim();
        let target_start = inner.start() + lead;

        if target.is_empty() {
            continue;
        }

        links.push(WikiLink {
            span: whole.range(),
            target_span: target_start..target_start + target.len(),
            target: target.to_string(),
        });
    }

    links
}

/// Replace link targets for which `rewrite` returns a new value.
///
/// Aliases and heading anchors are preserved. Returns `None` when the text
/// would not change, so re-running a rewrite that was already applied is a
/// no-op.
pub fn rewrite_wikilinks<F>(text: &str, mut rewrite: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut changed = false;

    for link in wikilinks(text) {
        let Some(new_target) = rewrite(&link.target) else {
            continue;
        };
        if new_target == link.target {
            continue;
        }

        out.push_str(&text[last..link.target_span.start]);
        out.push_str(&new_target);
        last = link.target_span.end;
        changed = true;
    }

    if !changed {
        return None;
    }

    out.push_str(&text[last..]);
    Some(out)
}

/// Case-insensitive whole-word occurrences of `needle` outside code and
/// outside wikilinks.
pub fn text_mentions(text: &str, needle: &str) -> Vec<Mention> {
    let needle = needle.trim();
    if needle.is_empty() {
        return vec![];
    }

    // whole words only where the needle starts or ends with one
    let edge = |c: Option<char>| match c {
        Some(c) if c.is_alphanumeric() || c == '_' => r"\b",
        _ => "",
    };
    let pattern = format!(
        "(?i){}{}{}",
        edge(needle.chars().next()),
        regex::escape(needle),
        edge(needle.chars().last())
    );
    let Ok(pattern) = Regex::new(&pattern) else {
        return vec![];
    };

    let opaque = opaque_regions(text);
    let links: Vec<Range<usize>> = wikilinks(text).into_iter().map(|l| l.span).collect();

    pattern
        .find_iter(text)
        .filter(|m| !is_opaque(&opaque, m.start()) && !is_opaque(&links, m.start()))
        .map(|m| Mention {
            offset: m.start(),
            excerpt: line_excerpt(text, m.start()),
        })
        .collect()
}

/// The line containing `offset`, trimmed and shortened.
pub fn line_excerpt(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(text.len());
    excerpt(&text[start..end])
}

/// Collapse whitespace and shorten to a display excerpt.
pub fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_LENGTH {
        return collapsed;
    }

    let truncated: String = collapsed.chars().take(EXCERPT_LENGTH - 3).collect();
    format!("{truncated}...")
}

/// Set `key: value` inside the frontmatter, creating the block if needed.
pub fn set_frontmatter_field(content: &str, key: &str, value: &str) -> String {
    let field = format!("{key}: {value}");
    let (block, body_start) = split_frontmatter(content);

    let Some(block) = block else {
        return format!("---\n{field}\n---\n{content}");
    };

    let prefix = format!("{key}:");
    let mut lines: Vec<String> = block.lines().map(|l| l.to_string()).collect();
    match lines.iter().position(|l| l.starts_with(&prefix)) {
        Some(idx) => lines[idx] = field,
        None => lines.push(field),
    }

    format!("---\n{}\n---\n{}", lines.join("\n"), &content[body_start..])
}

/// Index of the inline tag line (first non-empty body line made only of
/// `#tags`), if any. Indices are into `body.lines()`.
pub fn tag_line_index(body: &str) -> Option<usize> {
    for (idx, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return TAG_LINE_REGEX.is_match(line).then_some(idx);
    }
    None
}

/// Filename-safe slug of a title.
pub fn slugify(title: &str) -> String {
    static STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
    static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s_]+").expect("valid regex"));

    let slug = title.trim().to_lowercase();
    let slug = STRIP.replace_all(&slug, "");
    SPACES.replace_all(&slug, "-").trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "---\ntitle: Kubernetes Basics\ndate: 2024-05-01\ntags: [infra, K8s]\n---\n#devops #infra\n\nIntro text.\n\n## Pods\nPods link to [[Containers]].\n\n```\n## not a header\n[[Not A Link]] #nottag\n```\n\n## Services\nSee `[[inline]]` and [[Networking|the network]].\n";

    #[test]
    fn test_parse_note_frontmatter_and_tags() {
        let note = parse_note(NOTE);
        assert_eq!(note.title.as_deref(), Some("Kubernetes Basics"));
        assert_eq!(note.date.as_deref(), Some("2024-05-01"));
        assert_eq!(note.tags, vec!["infra", "k8s", "devops"]);
        assert!(NOTE[note.body_start..].starts_with("#devops"));
    }

    #[test]
    fn test_parse_note_without_frontmatter() {
        let note = parse_note("Just text with #idea\n");
        assert_eq!(note.title, None);
        assert_eq!(note.body_start, 0);
        assert_eq!(note.tags, vec!["idea"]);
    }

    #[test]
    fn test_invalid_yaml_falls_back_to_title_line() {
        let note = parse_note("---\ntitle: A: B: C\n  - broken: [\n---\nbody\n");
        assert_eq!(note.title.as_deref(), Some("A: B: C"));
    }

    #[test]
    fn test_unterminated_frontmatter_is_body() {
        let (block, start) = split_frontmatter("---\ntitle: x\nno closing\n");
        assert!(block.is_none());
        assert_eq!(start, 0);
    }

    #[test]
    fn test_sections_skip_fenced_headers() {
        let secs = sections(NOTE);
        let headers: Vec<&str> = secs.iter().map(|s| s.header.as_str()).collect();
        assert_eq!(headers, vec!["Pods", "Services"]);
        assert_eq!(secs[0].end, secs[1].start);
        assert_eq!(secs[1].end, NOTE.len());
        assert!(NOTE[secs[0].content_start..].starts_with("Pods link"));
    }

    #[test]
    fn test_level_three_headers_are_not_sections() {
        let secs = sections("### Small\ntext\n## Big\n");
        assert_eq!(secs.len(), 1);
        assert_eq!(secs[0].header, "Big");
    }

    #[test]
    fn test_wikilinks_outside_code_only() {
        let targets: Vec<String> = wikilinks(NOTE).into_iter().map(|l| l.target).collect();
        assert_eq!(targets, vec!["Containers", "Networking"]);
    }

    #[test]
    fn test_wikilink_target_span() {
        let text = "a [[ Target#Head|Alias ]] b";
        let links = wikilinks(text);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, "Target");
        assert_eq!(&text[links[0].target_span.clone()], "Target");
    }

    #[test]
    fn test_rewrite_preserves_alias_and_heading() {
        let text = "[[B]] and [[B|bee]] and [[B#Intro]] and [[C]]";
        let out = rewrite_wikilinks(text, |t| (t == "B").then(|| "B2".to_string())).unwrap();
        assert_eq!(out, "[[B2]] and [[B2|bee]] and [[B2#Intro]] and [[C]]");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let text = "[[B]] here";
        let once = rewrite_wikilinks(text, |t| (t == "B").then(|| "B2".to_string())).unwrap();
        let twice = rewrite_wikilinks(&once, |t| (t == "B").then(|| "B2".to_string()));
        assert!(twice.is_none());
    }

    #[test]
    fn test_rewrite_leaves_code_alone() {
        let text = "```\n[[B]]\n```\n`[[B]]`\n";
        assert!(rewrite_wikilinks(text, |_| Some("X".to_string())).is_none());
    }

    #[test]
    fn test_text_mentions_exclude_code_and_links() {
        let text = "Kubernetes is great.\n`Kubernetes` in code\n```\nkubernetes\n```\n[[Kubernetes]] link\nlearn KUBERNETES";
        let mentions = text_mentions(text, "kubernetes");
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].excerpt, "Kubernetes is great.");
        assert_eq!(mentions[1].excerpt, "learn KUBERNETES");
    }

    #[test]
    fn test_text_mentions_whole_words() {
        let mentions = text_mentions("About B and b-trees.\nbb is not it.", "B");
        let offsets: Vec<usize> = mentions.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![6, 12]);

        assert_eq!(text_mentions("see C++ docs", "c++").len(), 1);
    }

    #[test]
    fn test_hashtags_ignore_headers_and_code() {
        let tags = hashtags("## Header\n#one and (#two) `#three`\nissue#4");
        assert_eq!(tags, vec!["one", "two"]);
    }

    #[test]
    fn test_set_frontmatter_field_replace_insert_create() {
        let replaced = set_frontmatter_field("---\ntitle: Old\n---\nbody\n", "title", "New");
        assert_eq!(replaced, "---\ntitle: New\n---\nbody\n");

        let inserted = set_frontmatter_field("---\ntitle: T\n---\nbody\n", "archived_reason", "dup");
        assert_eq!(inserted, "---\ntitle: T\narchived_reason: dup\n---\nbody\n");

        let created = set_frontmatter_field("body\n", "title", "T");
        assert_eq!(created, "---\ntitle: T\n---\nbody\n");
    }

    #[test]
    fn test_tag_line_index() {
        assert_eq!(tag_line_index("\n#a #b\n\ntext"), Some(1));
        assert_eq!(tag_line_index("text\n#a"), None);
        assert_eq!(tag_line_index(""), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("  Rust: The Book! "), "rust-the-book");
        assert_eq!(slugify("snake_case title"), "snake-case-title");
        assert_eq!(slugify("B2"), "b2");
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "word ".repeat(100);
        let ex = excerpt(&long);
        assert!(ex.chars().count() <= EXCERPT_LENGTH);
        assert!(ex.ends_with("..."));
    }
}
