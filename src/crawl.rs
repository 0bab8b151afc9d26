//! Tree crawler and corpus file I/O.
//!
//! The crawler walks the content tree depth-first from a list of root paths.
//! For every node it fetches the full subtree (`.infinity.json`), flattens it,
//! then lists the node's children (`.1.json`) and descends into each one that
//! is not reserved (`jcr:*`, `rep:*` by default).
//!
//! Because each child is fetched again on its own after appearing inside its
//! parent's subtree, the same path is flattened more than once. The
//! [`Corpus`] keeps the first record for every path and counts the rest.
//!
//! Failures never abort a crawl: a node that cannot be fetched is logged and
//! contributes nothing, and the walk continues with its children and siblings.

use anyhow::{bail, Context, Result};
use globset::GlobSet;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aem_rag_core::flatten::{flatten, join_path, FlattenOptions};
use aem_rag_core::models::{ContentNode, FlatRecord};

use crate::config::{Config, CrawlConfig};
use crate::content_source::{ContentSource, FetchError, FetchOutcome, HttpContentSource};
use crate::index_store::write_atomic;
use crate::progress::{ProgressEvent, ProgressReporter};

/// Insertion-ordered records with unique paths.
#[derive(Debug, Default, Clone)]
pub struct Corpus {
    records: Vec<FlatRecord>,
    positions: HashMap<String, usize>,
    duplicates: usize,
}

/// What [`Corpus::merge`] changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub replaced: usize,
    pub appended: usize,
    pub unchanged: usize,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a corpus from records, keeping the first record per path.
    pub fn from_records(records: impl IntoIterator<Item = FlatRecord>) -> Self {
        let mut corpus = Self::new();
        corpus.extend(records);
        corpus
    }

    /// Append a record unless its path is already present.
    pub fn push(&mut self, record: FlatRecord) -> bool {
        if self.positions.contains_key(&record.path) {
            self.duplicates += 1;
            return false;
        }
        self.positions
            .insert(record.path.clone(), self.records.len());
        self.records.push(record);
        true
    }

    /// Append records in order; returns how many were new.
    pub fn extend(&mut self, records: impl IntoIterator<Item = FlatRecord>) -> usize {
        let mut added = 0;
        for record in records {
            if self.push(record) {
                added += 1;
            }
        }
        added
    }

    /// Merge a newer crawl into this corpus by path.
    ///
    /// Existing order is kept. A path present in both takes the newer
    /// content in place; new paths are appended in their crawl order.
    pub fn merge(&mut self, newer: Corpus) -> MergeStats {
        let mut stats = MergeStats::default();
        for record in newer.records {
            match self.positions.get(&record.path) {
                Some(&pos) if self.records[pos] == record => stats.unchanged += 1,
                Some(&pos) => {
                    self.records[pos] = record;
                    stats.replaced += 1;
                }
                None => {
                    self.positions
                        .insert(record.path.clone(), self.records.len());
                    self.records.push(record);
                    stats.appended += 1;
                }
            }
        }
        stats
    }

    pub fn records(&self) -> &[FlatRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FlatRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records dropped because their path was already present.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

/// Outcome of a crawl run.
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub corpus: Corpus,
    /// Nodes whose subtree fetch was attempted.
    pub visited: usize,
    /// Nodes whose subtree could not be fetched.
    pub failed: usize,
    /// Nodes whose children could not be listed.
    pub listing_failures: usize,
}

/// Depth-first walker over a [`ContentSource`].
pub struct Crawler {
    source: Arc<dyn ContentSource>,
    reserved: GlobSet,
    options: FlattenOptions,
}

impl Crawler {
    pub fn new(source: Arc<dyn ContentSource>, config: &CrawlConfig) -> Result<Self> {
        Ok(Self {
            source,
            reserved: config.reserved_set()?,
            options: config.flatten_options(),
        })
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved.is_match(name)
    }

    /// Root paths found by listing `discovery_root`.
    pub async fn discover_roots(&self, discovery_root: &str) -> Result<Vec<String>> {
        let root = normalize_path(discovery_root);
        let names = self
            .source
            .list_children(&root)
            .await
            .with_context(|| format!("Failed to list discovery root {}", root))?;
        let roots: Vec<String> = names
            .iter()
            .filter(|n| !self.is_reserved(n))
            .map(|n| join_path(&root, n))
            .collect();
        tracing::info!(discovery_root = %root, roots = roots.len(), "discovered crawl roots");
        Ok(roots)
    }

    /// Fetch the full subtree at `path`, reassembling paginated fragments.
    pub async fn fetch_node(&self, path: &str) -> Result<ContentNode, FetchError> {
        match self.source.fetch_subtree(path).await {
            FetchOutcome::Node(node) => Ok(node),
            FetchOutcome::FragmentList(pointers) => self.fetch_fragments(path, &pointers).await,
            FetchOutcome::Unavailable(e) => Err(e),
        }
    }

    async fn fetch_fragments(
        &self,
        path: &str,
        pointers: &[String],
    ) -> Result<ContentNode, FetchError> {
        tracing::debug!(path, fragments = pointers.len(), "node is paginated");
        let mut fragments = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            match self.source.fetch_fragment(pointer).await {
                FetchOutcome::Node(Value::Object(map)) => fragments.push(map),
                FetchOutcome::Node(_) => {
                    tracing::warn!(path, fragment = %pointer, "fragment is not an object, skipping")
                }
                FetchOutcome::FragmentList(_) => {
                    tracing::warn!(path, fragment = %pointer, "fragment is paginated again, skipping")
                }
                FetchOutcome::Unavailable(e) => {
                    tracing::warn!(path, fragment = %pointer, error = %e, "fragment unavailable, skipping")
                }
            }
        }

        if fragments.is_empty() {
            return Err(FetchError::Malformed {
                url: path.to_string(),
                message: format!("none of {} fragments could be fetched", pointers.len()),
            });
        }
        Ok(merge_fragments(fragments))
    }

    /// Crawl every root in order and return the assembled corpus.
    pub async fn crawl(&self, roots: &[String], progress: &dyn ProgressReporter) -> CrawlReport {
        let mut report = CrawlReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, usize)> =
            roots.iter().rev().map(|r| (normalize_path(r), 0)).collect();

        while let Some((path, depth)) = stack.pop() {
            if depth > self.options.max_depth || !seen.insert(path.clone()) {
                continue;
            }
            report.visited += 1;

            match self.fetch_node(&path).await {
                Ok(node) => {
                    let records = flatten(&node, &path, &self.options);
                    let added = report.corpus.extend(records);
                    progress.report(ProgressEvent::CrawlNode {
                        path: path.clone(),
                        depth,
                        records: added,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(path = %path, error = %e, "node has no content, continuing");
                }
            }

            if depth >= self.options.max_depth {
                continue;
            }

            match self.source.list_children(&path).await {
                Ok(names) => {
                    for name in names.iter().rev() {
                        if !self.is_reserved(name) {
                            stack.push((join_path(&path, name), depth + 1));
                        }
                    }
                }
                Err(e) => {
                    report.listing_failures += 1;
                    tracing::warn!(path = %path, error = %e, "could not list children");
                }
            }
        }

        progress.report(ProgressEvent::CrawlFinished {
            visited: report.visited,
            failed: report.failed,
            records: report.corpus.len(),
        });
        report
    }
}

/// Merge fragment objects into one node. Later fragments win on key clashes.
pub fn merge_fragments(fragments: impl IntoIterator<Item = Map<String, Value>>) -> ContentNode {
    let mut merged = Map::new();
    for fragment in fragments {
        for (key, value) in fragment {
            merged.insert(key, value);
        }
    }
    Value::Object(merged)
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Read a corpus file written as JSON Lines or as one JSON array.
pub fn read_corpus(path: &Path) -> Result<Vec<FlatRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;

    let records: Vec<FlatRecord> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON array in {}", path.display()))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid record at {}:{}", path.display(), i + 1))
            })
            .collect::<Result<_>>()?
    };

    Ok(records.into_iter().map(FlatRecord::normalize).collect())
}

/// Write records as JSON Lines, replacing the file atomically.
pub fn write_corpus(path: &Path, records: &[FlatRecord]) -> Result<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
        .with_context(|| format!("Failed to write corpus file: {}", path.display()))
}

/// `aemrag crawl`: crawl the repository and write the corpus file.
pub async fn run_crawl(
    config: &Config,
    roots: Vec<String>,
    output: Option<PathBuf>,
    merge: bool,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let source = Arc::new(HttpContentSource::new(&config.source)?);
    let crawler = Crawler::new(source, &config.crawl)?;

    let roots = if !roots.is_empty() {
        roots
    } else if !config.source.roots.is_empty() {
        config.source.roots.clone()
    } else {
        crawler.discover_roots(&config.source.discovery_root).await?
    };
    if roots.is_empty() {
        bail!("No crawl roots configured and none discovered");
    }

    let report = crawler.crawl(&roots, progress).await;
    let CrawlReport {
        corpus,
        visited,
        failed,
        listing_failures,
    } = report;
    let duplicates = corpus.duplicates();

    let output = output.unwrap_or_else(|| config.storage.corpus_path.clone());
    let corpus = if merge && output.exists() {
        let mut existing = Corpus::from_records(read_corpus(&output)?);
        let stats = existing.merge(corpus);
        println!(
            "merged: {} replaced, {} appended, {} unchanged",
            stats.replaced, stats.appended, stats.unchanged
        );
        existing
    } else {
        corpus
    };
    write_corpus(&output, corpus.records())?;

    println!("roots: {}", roots.len());
    println!("visited: {}", visited);
    println!("failed: {}", failed);
    println!("listing_failures: {}", listing_failures);
    println!("duplicates: {}", duplicates);
    println!("records: {}", corpus.len());
    println!("output: {}", output.display());
    Ok(())
}

/// `aemrag flatten`: flatten a saved JSON export and print JSON Lines.
pub fn run_flatten(config: &Config, file: &Path, path: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let node: ContentNode = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", file.display()))?;

    let path = path.unwrap_or_else(|| "/".to_string());
    let records = flatten(&node, &normalize_path(&path), &config.crawl.flatten_options());
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}
