/// Applying a suggestion to its target document.
///
/// Matching is exact and case-sensitive: the first occurrence of the BEFORE
/// text is replaced with the AFTER text. There is no fuzzy fallback. A
/// suggestion whose BEFORE text is gone (the file changed since the reply was
/// generated) fails with `TextNotFound` and the document is left as it was.
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

use super::Suggestion;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("cannot find '{0}' in the project")]
    TargetNotFound(String),
    #[error("the BEFORE text no longer appears in '{0}'")]
    TextNotFound(String),
    #[error("cannot write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ── Collaborator traits ───────────────────────────────────────────────────────

pub trait Document {
    fn full_text(&self) -> &str;
    /// Replace the byte range `span` with `text`. On error the document is unchanged.
    fn replace(&mut self, span: Range<usize>, text: &str) -> Result<(), ApplyError>;
}

pub trait DocumentProvider {
    type Doc: Document;
    /// An already-open document.
    fn find(&mut self, identifier: &str) -> Option<&mut Self::Doc>;
    /// Open a document that is not open yet.
    fn open(&mut self, identifier: &str) -> Result<&mut Self::Doc, ApplyError>;
}

/// Where a suggestion landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub target: String,
    /// Byte span the BEFORE text occupied.
    pub span: Range<usize>,
    /// 1-based line of the start of the span.
    pub line: usize,
}

pub fn apply<P: DocumentProvider>(provider: &mut P, suggestion: &Suggestion) -> Result<Applied, ApplyError> {
    let target = suggestion.target.as_str();
    if suggestion.before.is_empty() {
        return Err(ApplyError::TextNotFound(target.to_string()));
    }
    let doc = resolve(provider, target)?;

    let text = doc.full_text();
    let start = text
        .find(&suggestion.before)
        .ok_or_else(|| ApplyError::TextNotFound(target.to_string()))?;
    let span = start..start + suggestion.before.len();
    let line = text[..start].matches('\n').count() + 1;

    doc.replace(span.clone(), &suggestion.after)?;
    tracing::info!(file = target, line, "applied suggestion");
    Ok(Applied {
        target: target.to_string(),
        span,
        line,
    })
}

fn resolve<'p, P: DocumentProvider>(provider: &'p mut P, identifier: &str) -> Result<&'p mut P::Doc, ApplyError> {
    if provider.find(identifier).is_none() {
        return provider.open(identifier);
    }
    provider
        .find(identifier)
        .ok_or_else(|| ApplyError::TargetNotFound(identifier.to_string()))
}

// ── File-backed implementation ────────────────────────────────────────────────

#[derive(Debug)]
pub struct FileDocument {
    path: PathBuf,
    text: String,
    modified: Option<SystemTime>,
}

impl FileDocument {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path: path.to_path_buf(),
            text,
            modified,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file if it changed on disk since it was loaded.
    fn sync(&mut self) -> std::io::Result<()> {
        let on_disk = fs::metadata(&self.path)?.modified().ok();
        if on_disk != self.modified {
            *self = Self::load(&self.path)?;
        }
        Ok(())
    }
}

impl Document for FileDocument {
    fn full_text(&self) -> &str {
        &self.text
    }

    fn replace(&mut self, span: Range<usize>, text: &str) -> Result<(), ApplyError> {
        let mut updated = String::with_capacity(self.text.len() + text.len());
        updated.push_str(&self.text[..span.start]);
        updated.push_str(text);
        updated.push_str(&self.text[span.end..]);

        fs::write(&self.path, &updated).map_err(|source| ApplyError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        self.text = updated;
        self.modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        Ok(())
    }
}

/// Documents under one project root, opened on demand and kept open.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    open: HashMap<String, FileDocument>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            open: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical path for `identifier`, refusing anything outside the root.
    fn locate(&self, identifier: &str) -> Option<PathBuf> {
        let path = self.root.join(identifier).canonicalize().ok()?;
        (path.starts_with(&self.root) && path.is_file()).then_some(path)
    }
}

fn normalise(identifier: &str) -> &str {
    identifier.trim().trim_start_matches("./")
}

impl DocumentProvider for Workspace {
    type Doc = FileDocument;

    fn find(&mut self, identifier: &str) -> Option<&mut FileDocument> {
        let key = normalise(identifier);
        let stale = match self.open.get_mut(key) {
            Some(doc) => doc.sync().is_err(),
            None => return None,
        };
        if stale {
            tracing::debug!(identifier = key, "open document vanished from disk");
            self.open.remove(key);
            return None;
        }
        self.open.get_mut(key)
    }

    fn open(&mut self, identifier: &str) -> Result<&mut FileDocument, ApplyError> {
        let key = normalise(identifier);
        let not_found = || ApplyError::TargetNotFound(key.to_string());
        let path = self.locate(key).ok_or_else(not_found)?;
        let doc = FileDocument::load(&path).map_err(|_| not_found())?;
        tracing::debug!(identifier = key, path = %doc.path().display(), "opened document");
        Ok(self.open.entry(key.to_string()).or_insert(doc))
    }
}
