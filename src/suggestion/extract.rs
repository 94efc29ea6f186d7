/// Suggestion extraction from finished assistant text.
///
/// Grammar, with optional outer delimiters around the whole block:
///
/// ```text
/// FILE: <identifier>
/// BEFORE:
/// ```[lang]
/// <verbatim source>
/// ```
/// AFTER:
/// ```[lang]
/// <verbatim source>
/// ```
/// ```
///
/// Only one block per reply is used: the first delimited one when delimiters
/// are configured and present, otherwise the first one anywhere.
use regex::Regex;
use std::sync::LazyLock;

use super::{Delimiters, Suggestion};

const BLOCK_PATTERN: &str = concat!(
    r"(?ms)^[ \t]*FILE:[ \t]*(?P<file>[^\r\n]+)\r?\n",
    r"\s*BEFORE:[ \t]*\r?\n[ \t]*```[^\r\n]*\r?\n(?P<before>.*?)^[ \t]*```[ \t]*\r?\n",
    r"\s*AFTER:[ \t]*\r?\n[ \t]*```[^\r\n]*\r?\n(?P<after>.*?)^[ \t]*```",
);

static BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(BLOCK_PATTERN).expect("Invalid suggestion block regex"));

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    delimiters: Option<Delimiters>,
}

impl Extractor {
    pub fn new(delimiters: Option<Delimiters>) -> Self {
        Self { delimiters }
    }

    pub fn delimiters(&self) -> Option<&Delimiters> {
        self.delimiters.as_ref()
    }

    /// The first suggestion in `text`, or `None` for a purely conversational reply.
    ///
    /// With delimiters configured, a block inside the first delimited region
    /// wins even when an undelimited block appears earlier in the reply. The
    /// whole text is searched only when no delimited region holds a block.
    pub fn extract(&self, text: &str) -> Option<Suggestion> {
        if let Some(inner) = self.delimited(text) {
            if let Some(s) = self.first_block(inner) {
                return Some(s);
            }
        }
        self.first_block(text)
    }

    fn delimited<'t>(&self, text: &'t str) -> Option<&'t str> {
        let d = self.delimiters.as_ref()?;
        if d.open.is_empty() || d.close.is_empty() {
            return None;
        }
        let start = text.find(&d.open)? + d.open.len();
        let len = text[start..].find(&d.close)?;
        Some(&text[start..start + len])
    }

    fn first_block(&self, text: &str) -> Option<Suggestion> {
        let caps = BLOCK.captures(text)?;
        let target = caps["file"].trim().trim_matches('`').trim().to_string();
        if target.is_empty() {
            return None;
        }
        let suggestion = Suggestion {
            target,
            before: caps["before"].trim().to_string(),
            after: caps["after"].trim().to_string(),
        };
        tracing::debug!(file = %suggestion.target, "extracted suggestion");
        Some(suggestion)
    }
}
