/// Code-change suggestions embedded in assistant replies.
///
/// A reply may carry one `FILE:` / `BEFORE:` / `AFTER:` block. [`Extractor`]
/// finds it; [`apply`] substitutes it into the named document.
pub mod apply;
pub mod extract;

pub use apply::{Applied, ApplyError, Workspace, apply};
pub use extract::Extractor;

/// One proposed substitution. Lives until it is applied or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub target: String,
    pub before: String,
    pub after: String,
}

impl Suggestion {
    /// Diff-style rendering: a `---` header line, then `-` and `+` lines.
    pub fn preview(&self) -> Vec<String> {
        let mut lines = vec![format!("--- {}", self.target)];
        lines.extend(self.before.lines().map(|l| format!("- {l}")));
        lines.extend(self.after.lines().map(|l| format!("+ {l}")));
        lines
    }
}

/// Optional outer markers wrapping a suggestion block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub open: String,
    pub close: String,
}

impl Delimiters {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}
