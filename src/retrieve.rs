//! Hybrid retrieval: dense vectors plus keyword scoring.
//!
//! The same question goes to both branches. Dense hits come first, sparse
//! hits follow, each in its own ranking order; see
//! [`aem_rag_core::merge`] for the merge rules.
//!
//! Neither branch can fail a query. An embedding error empties the dense
//! branch and a missing keyword corpus disables the sparse one.

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;

use aem_rag_core::merge::{merge, Branch, RetrievedDoc};
use aem_rag_core::models::FlatRecord;
use aem_rag_core::vector_index::FlatIndex;

use crate::config::Config;
use crate::crawl::read_corpus;
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::index_store::IndexStore;
use crate::keyword::KeywordIndex;

/// Nearest-neighbor search over the persisted vector index.
pub struct DenseRetriever {
    embedder: Arc<dyn Embedder>,
    index: FlatIndex,
    metadata: Vec<FlatRecord>,
    k: usize,
}

impl DenseRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: FlatIndex,
        metadata: Vec<FlatRecord>,
        k: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            metadata,
            k,
        }
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDoc>> {
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        Ok(self
            .index
            .search(&vector, self.k)
            .into_iter()
            .filter_map(|hit| self.metadata.get(hit.position))
            .enumerate()
            .map(|(rank, record)| RetrievedDoc::new(Branch::Dense, rank, record.clone()))
            .collect())
    }
}

/// Keyword search over a corpus file.
pub struct SparseRetriever {
    index: KeywordIndex,
    records: Vec<FlatRecord>,
    k: usize,
}

impl SparseRetriever {
    pub async fn build(records: Vec<FlatRecord>, k: usize) -> Result<Self> {
        let index = KeywordIndex::build(&records).await?;
        Ok(Self { index, records, k })
    }

    /// Build from a corpus file. A missing file yields `None`.
    pub async fn open(path: &Path, k: usize) -> Result<Option<Self>> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no keyword corpus; sparse retrieval disabled");
            return Ok(None);
        }
        let records = read_corpus(path)?;
        Ok(Some(Self::build(records, k).await?))
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDoc>> {
        Ok(self
            .index
            .search(query, self.k)
            .await?
            .into_iter()
            .filter_map(|position| self.records.get(position))
            .enumerate()
            .map(|(rank, record)| RetrievedDoc::new(Branch::Sparse, rank, record.clone()))
            .collect())
    }
}

pub struct HybridRetriever {
    dense: DenseRetriever,
    sparse: Option<SparseRetriever>,
}

impl HybridRetriever {
    pub fn new(dense: DenseRetriever, sparse: Option<SparseRetriever>) -> Self {
        Self { dense, sparse }
    }

    /// Load the persisted index and, when present, the keyword corpus.
    pub async fn open(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let store = IndexStore::load(&config.storage)?;
        if store.checkpoint.is_none() {
            bail!(
                "No index found at {}. Run `aemrag index build` first.",
                config.storage.index_path.display()
            );
        }
        tracing::info!(
            entries = store.len(),
            model = embedder.model_name(),
            "vector index loaded"
        );
        let dense = DenseRetriever::new(
            embedder,
            store.index,
            store.metadata,
            config.retrieval.k_dense,
        );

        let keyword_path = config.storage.keyword_corpus();
        let sparse = match SparseRetriever::open(keyword_path, config.retrieval.k_sparse).await {
            Ok(sparse) => sparse,
            Err(e) => {
                tracing::warn!(
                    path = %keyword_path.display(),
                    error = %e,
                    "keyword corpus unusable; sparse retrieval disabled"
                );
                None
            }
        };

        Ok(Self::new(dense, sparse))
    }

    pub fn has_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    pub fn dense_len(&self) -> usize {
        self.dense.len()
    }

    /// Dense results followed by sparse results.
    pub async fn retrieve(&self, query: &str) -> Vec<RetrievedDoc> {
        let dense = match self.dense.retrieve(query).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(error = %e, "dense retrieval failed; continuing without it");
                Vec::new()
            }
        };

        let sparse = match &self.sparse {
            Some(sparse) => match sparse.retrieve(query).await {
                Ok(docs) => docs,
                Err(e) => {
                    tracing::warn!(error = %e, "keyword retrieval failed; continuing without it");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        merge(dense, sparse)
    }
}

/// `aemrag search`: print merged retrieval results for a query.
pub async fn run_search(config: &Config, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let credential = config.resolve_credential(true, false)?;
    let embedder = create_embedder(&config.embedding, credential)?;
    let retriever = HybridRetriever::open(config, embedder).await?;
    if !retriever.has_sparse() {
        println!("(keyword corpus not found; dense results only)");
    }

    let docs = retriever.retrieve(query).await;
    if docs.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for doc in &docs {
        let branch = match doc.branch {
            Branch::Dense => "dense",
            Branch::Sparse => "sparse",
        };
        println!("{} #{}  {}", branch, doc.rank + 1, doc.record.path);
        for line in doc.record.content.lines().take(3) {
            println!("    {}", excerpt(line, 120));
        }
    }
    Ok(())
}

fn excerpt(line: &str, max: usize) -> String {
    match line.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;

    #[tokio::test]
    async fn failing_embedder_leaves_sparse_results() {
        let records = vec![
            FlatRecord::new("/a", "text: spring collection", None),
            FlatRecord::new("/b", "text: winter boots", None),
        ];
        let mut index = FlatIndex::new(2);
        index.add(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let dense = DenseRetriever::new(Arc::new(DisabledEmbedder), index, records.clone(), 8);
        let sparse = SparseRetriever::build(records, 4).await.unwrap();

        let retriever = HybridRetriever::new(dense, Some(sparse));
        let docs = retriever.retrieve("winter").await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].branch, Branch::Sparse);
        assert_eq!(docs[0].record.path, "/b");
    }

    #[test]
    fn excerpt_truncates_long_lines() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij", 4), "abcd...");
    }

    #[tokio::test]
    async fn missing_keyword_file_is_none() {
        let sparse = SparseRetriever::open(Path::new("/nonexistent/meta.json"), 4)
            .await
            .unwrap();
        assert!(sparse.is_none());
    }
}
