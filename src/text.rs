//! Text preparation applied before embedding.
//!
//! [`normalize`] is the full cleaning pass (lowercase, strip punctuation other
//! than `,.-_`, collapse whitespace). [`collapse_whitespace`] is the minimal pass
//! the local backend always applies. Both are pure and idempotent.

use std::collections::HashSet;

use serde::Serialize;

/// One row of an input or target dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextItem {
    /// 0-based index into the source sequence.
    pub row_id: usize,
    pub raw_text: String,
    /// Present only when normalization is enabled for the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned_text: Option<String>,
}

impl TextItem {
    pub fn new(row_id: usize, raw_text: impl Into<String>, normalize_text: bool) -> Self {
        let raw_text = raw_text.into();
        let cleaned_text = normalize_text.then(|| normalize(&raw_text));
        Self {
            row_id,
            raw_text,
            cleaned_text,
        }
    }

    /// The text that is actually sent to an embedding backend.
    pub fn embedding_text(&self) -> &str {
        self.cleaned_text.as_deref().unwrap_or(&self.raw_text)
    }
}

/// Lowercase, keep only word characters, whitespace and `,.-`, collapse
/// whitespace runs into a single space and trim.
pub fn normalize(text: &str) -> String {
    let filtered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| is_kept(*c))
        .collect();
    collapse_whitespace(&filtered)
}

fn is_kept(c: char) -> bool {
    c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | ',' | '.' | '-')
}

/// Trim and collapse every whitespace run into a single space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turn a raw column into [`TextItem`]s with stable row ids.
pub fn prepare<S: AsRef<str>>(texts: &[S], normalize_text: bool) -> Vec<TextItem> {
    texts
        .iter()
        .enumerate()
        .map(|(row_id, text)| TextItem::new(row_id, text.as_ref(), normalize_text))
        .collect()
}

/// Keep the first occurrence of every distinct embedding text.
///
/// Order and original row ids are preserved, so the surviving item for a group
/// of duplicates is always the one with the lowest row id.
pub fn dedup_targets(items: Vec<TextItem>) -> Vec<TextItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.embedding_text().to_owned()))
        .collect()
}
