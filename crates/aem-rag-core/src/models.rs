//! Core data models shared by the crawler, the indexer and the retriever.
//!
//! A crawl produces an insertion-ordered list of [`FlatRecord`]s (the corpus).
//! The indexer embeds them and tracks how far it got with a [`Checkpoint`].

use serde::{Deserialize, Serialize};

/// A nested key/value node from the content repository.
///
/// There is no fixed schema: any key may hold a string, a number, a nested
/// object or an ordered list of nodes.
pub type ContentNode = serde_json::Value;

/// Identifying metadata carried alongside each record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Full hierarchical path of the record (same as [`FlatRecord::path`]).
    #[serde(default)]
    pub path: String,
    /// Last path segment, e.g. `jcr:content` or `items[2]`.
    #[serde(default)]
    pub name: String,
    /// The node's `jcr:primaryType`, when it had one.
    #[serde(
        rename = "primaryType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_type: Option<String>,
}

impl RecordMetadata {
    /// Derive metadata from a record path.
    pub fn from_path(path: &str, primary_type: Option<String>) -> Self {
        Self {
            path: path.to_string(),
            name: last_segment(path).to_string(),
            primary_type,
        }
    }
}

/// One retrievable text record extracted from a single content node.
///
/// `content` holds newline-joined `key: value` lines taken from the node's own
/// properties (never from its descendants).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl FlatRecord {
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        primary_type: Option<String>,
    ) -> Self {
        let path = path.into();
        let metadata = RecordMetadata::from_path(&path, primary_type);
        Self {
            path,
            content: content.into(),
            metadata,
        }
    }

    /// Fill in metadata that older corpus files did not carry.
    ///
    /// Records written before metadata existed only have `path` and
    /// `content`; the path is enough to rebuild `path` and `name`.
    pub fn normalize(mut self) -> Self {
        if self.metadata.path.is_empty() {
            self.metadata.path = self.path.clone();
        }
        if self.metadata.name.is_empty() {
            self.metadata.name = last_segment(&self.path).to_string();
        }
        self
    }

    /// Whether this record carries any text worth embedding.
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Durable progress marker for the embedding pipeline.
///
/// `processed` is a cursor into the corpus: every record before it has been
/// either embedded into the persisted index, skipped for having no text, or
/// dropped with its batch (see `dropped`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed: usize,
    pub total: usize,
    /// Number of vector/metadata entries this checkpoint covers.
    ///
    /// `None` for checkpoints written by older runs; the loader then falls
    /// back to the shorter of the two persisted files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
    /// SHA-256 of the corpus the checkpoint was taken against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_fingerprint: Option<String>,
    /// Record ranges whose batch failed and was skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<BatchGap>,
}

impl Checkpoint {
    /// Build a checkpoint, clamping `processed` so it never exceeds `total`.
    pub fn new(processed: usize, total: usize, entries: usize) -> Self {
        Self {
            processed: processed.min(total),
            total,
            entries: Some(entries),
            corpus_fingerprint: None,
            dropped: Vec::new(),
        }
    }

    /// A checkpoint for a corpus nothing has been embedded from yet.
    pub fn fresh(total: usize) -> Self {
        Self::new(0, total, 0)
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Half-open range `[start, end)` of corpus positions whose batch was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchGap {
    pub start: usize,
    pub end: usize,
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
