/// Context bundle (files the user attached to the conversation) and the
/// prompt template that serialises them ahead of a question.
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::suggestion::Delimiters;

/// Upper bound for a single attached file. Larger files are refused.
const MAX_FILE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub identifier: String,
    pub content: String,
}

/// Ordered (identifier, content) pairs. Adding an identifier twice replaces
/// the content but keeps its original position.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    entries: Vec<ContextEntry>,
}

impl ContextBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: impl Into<String>, content: impl Into<String>) {
        let identifier = identifier.into();
        let content = content.into();
        match self.entries.iter_mut().find(|e| e.identifier == identifier) {
            Some(existing) => existing.content = content,
            None => self.entries.push(ContextEntry { identifier, content }),
        }
    }

    /// Read `path` (relative to `root` unless absolute) and add it under the
    /// identifier the user typed.
    pub fn add_file(&mut self, root: &Path, path: &str) -> Result<()> {
        let full = root.join(path);
        let meta = fs::metadata(&full)
            .with_context(|| format!("cannot stat '{}'", full.display()))?;
        if !meta.is_file() {
            anyhow::bail!("'{path}' is not a regular file");
        }
        if meta.len() > MAX_FILE_BYTES {
            anyhow::bail!("'{path}' is {} KiB; the limit is {} KiB", meta.len() / 1024, MAX_FILE_BYTES / 1024);
        }
        let content = fs::read_to_string(&full)
            .with_context(|| format!("cannot read '{}'", full.display()))?;
        self.insert(path.trim_start_matches("./"), content);
        tracing::info!(file = path, "added to context bundle");
        Ok(())
    }

    pub fn remove(&mut self, identifier: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.identifier != identifier.trim_start_matches("./"));
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Prompt template ───────────────────────────────────────────────────────────

/// Serialise the bundle and the user's message into one prompt.
///
/// With an empty bundle the message is sent as-is. Otherwise the files come
/// first, then the instructions for proposing a change, then the question.
pub fn build_prompt(bundle: &ContextBundle, delimiters: Option<&Delimiters>, message: &str) -> String {
    if bundle.is_empty() {
        return message.to_string();
    }

    let mut out = String::from("You are helping with the following files.\n\n");
    for entry in bundle.entries() {
        let _ = write!(out, "### FILE: {}\n```\n{}", entry.identifier, entry.content);
        if !entry.content.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n\n");
    }

    out.push_str(
        "If you propose a change to one of these files, include exactly one block \
         in this format, copying the BEFORE text verbatim from the file:\n\n",
    );
    if let Some(d) = delimiters {
        out.push_str(&d.open);
        out.push('\n');
    }
    out.push_str("FILE: <path>\nBEFORE:\n```\n<existing code>\n```\nAFTER:\n```\n<replacement code>\n```\n");
    if let Some(d) = delimiters {
        out.push_str(&d.close);
        out.push('\n');
    }

    let _ = write!(out, "\nQuestion: {message}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bundle_passes_message_through() {
        let bundle = ContextBundle::new();
        assert_eq!(build_prompt(&bundle, None, "hello"), "hello");
    }

    #[test]
    fn test_prompt_lists_files_in_order() {
        let mut bundle = ContextBundle::new();
        bundle.insert("b.rs", "fn b() {}\n");
        bundle.insert("a.rs", "fn a() {}");
        let d = Delimiters::new("<<<S", "S>>>");
        let prompt = build_prompt(&bundle, Some(&d), "rename a");

        let b_at = prompt.find("### FILE: b.rs").unwrap();
        let a_at = prompt.find("### FILE: a.rs").unwrap();
        assert!(b_at < a_at);
        assert!(prompt.contains("```\nfn a() {}\n```"));
        assert!(prompt.contains("<<<S\nFILE: <path>"));
        assert!(prompt.contains("```\nS>>>\n"));
        assert!(prompt.ends_with("Question: rename a"));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut bundle = ContextBundle::new();
        bundle.insert("a", "1");
        bundle.insert("b", "2");
        bundle.insert("a", "3");
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.entries()[0].content, "3");
        assert!(bundle.remove("./a"));
        assert!(!bundle.remove("a"));
    }

    #[test]
    fn test_add_file_reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
        let mut bundle = ContextBundle::new();
        bundle.add_file(dir.path(), "./main.rs").unwrap();
        assert_eq!(bundle.entries()[0].identifier, "main.rs");
        assert!(bundle.add_file(dir.path(), "missing.rs").is_err());
        assert!(bundle.add_file(dir.path(), ".").is_err());
    }
}
