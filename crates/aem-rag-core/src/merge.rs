//! Hybrid merge of dense and sparse retrieval results.
//!
//! The merge is a plain concatenation: dense hits in their own ranking order,
//! then sparse hits in theirs. There is no score normalization across the two
//! branches and no deduplication, so a record found by both branches appears
//! twice in the context handed to answer generation.

use serde::Serialize;

use crate::models::FlatRecord;

/// Which retriever produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Dense,
    Sparse,
}

/// One retrieved record with its rank inside its own branch (0 = best).
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedDoc {
    pub branch: Branch,
    pub rank: usize,
    pub record: FlatRecord,
}

impl RetrievedDoc {
    pub fn new(branch: Branch, rank: usize, record: FlatRecord) -> Self {
        Self {
            branch,
            rank,
            record,
        }
    }
}

/// Concatenate dense results followed by sparse results.
pub fn merge(dense: Vec<RetrievedDoc>, sparse: Vec<RetrievedDoc>) -> Vec<RetrievedDoc> {
    let mut merged = dense;
    merged.extend(sparse);
    merged
}

/// Join each result's content with a blank line, in merge order.
///
/// This exact string is the context given to the answer generator.
pub fn format_context(docs: &[RetrievedDoc]) -> String {
    docs.iter()
        .map(|d| d.record.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
