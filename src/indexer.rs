//! Checkpointed, resumable embedding of a corpus.
//!
//! The indexer walks the corpus in fixed-size batches starting at the last
//! persisted checkpoint, embeds each batch, and appends vectors and metadata
//! in lockstep. Every `save_every_batches` batches, embedded or skipped, the
//! whole (vectors, metadata, checkpoint) triple is persisted; a crash loses at
//! most that much embedding work and never duplicates records on resume.
//!
//! ```text
//! NotStarted → Running ⇄ Checkpointing → Completed
//! ```
//!
//! A batch whose embedding call fails is dropped: the pre-batch state is
//! persisted, the range is recorded in the checkpoint's `dropped` list, and
//! the run continues after a short pause. The next run re-embeds every
//! recorded gap before continuing from the cursor, and clears the gaps that
//! succeed.
//!
//! `processed` advances by the number of *input* records of a batch, including
//! records without text, which are never embedded.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aem_rag_core::models::{BatchGap, Checkpoint, FlatRecord};

use crate::config::{Config, EmbeddingConfig, StorageConfig};
use crate::crawl::read_corpus;
use crate::embedding::{create_embedder, Embedder};
use crate::index_store::{corpus_fingerprint, IndexStore, RunLock};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Where the indexer is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    NotStarted,
    Running,
    Checkpointing,
    Completed,
}

/// Batch and checkpoint tuning for one run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub batch_size: usize,
    pub save_every_batches: usize,
    /// Pause after a failed batch.
    pub retry_pause: Duration,
    /// Ignore any existing checkpoint and rebuild from record 0.
    pub restart: bool,
}

impl IndexOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            save_every_batches: config.save_every_batches.max(1),
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            restart: false,
        }
    }
}

/// Outcome of an indexer run.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub total: usize,
    /// Cursor the run started from.
    pub resumed_from: usize,
    pub processed: usize,
    /// Vector/metadata entries in the final index.
    pub entries: usize,
    pub embedded_batches: usize,
    pub skipped_batches: usize,
    pub dropped_batches: usize,
    /// Gaps from earlier runs that were embedded in this one.
    pub recovered_batches: usize,
    pub checkpoints: usize,
    pub elapsed: Duration,
}

pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    storage: StorageConfig,
    options: IndexOptions,
    phase: IndexPhase,
}

impl Indexer {
    pub fn new(embedder: Arc<dyn Embedder>, storage: &StorageConfig, options: IndexOptions) -> Self {
        Self {
            embedder,
            storage: storage.clone(),
            options,
            phase: IndexPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> IndexPhase {
        self.phase
    }

    fn transition(&mut self, next: IndexPhase) {
        if self.phase != next {
            tracing::debug!(from = ?self.phase, to = ?next, "index phase");
            self.phase = next;
        }
    }

    /// Embed `corpus` into the configured storage, resuming if possible.
    ///
    /// The corpus must be identical to the one the existing checkpoint was
    /// taken against; otherwise the run fails unless `restart` is set.
    pub async fn run(
        &mut self,
        corpus: &[FlatRecord],
        progress: &dyn ProgressReporter,
    ) -> Result<IndexReport> {
        let _lock = RunLock::acquire(&self.storage.lock_file())?;

        let total = corpus.len();
        let fingerprint = corpus_fingerprint(corpus);
        let expected_dims = self.embedder.dims();

        let mut store = if self.options.restart {
            tracing::info!("restart requested; ignoring existing index");
            IndexStore::empty(expected_dims.unwrap_or(0))
        } else {
            IndexStore::load(&self.storage)?
        };

        if let Some(dims) = expected_dims {
            if !store.index.is_empty() && store.index.dims() != dims {
                bail!(
                    "Existing index has {} dimensions but {} produces {}. Re-run with --restart.",
                    store.index.dims(),
                    self.embedder.model_name(),
                    dims
                );
            }
        }

        let mut checkpoint = match store.checkpoint.take() {
            Some(cp) => {
                if cp.total != total {
                    bail!(
                        "Checkpoint was taken against a corpus of {} records, this corpus has {}. \
                         Re-run with --restart to rebuild the index.",
                        cp.total,
                        total
                    );
                }
                if let Some(previous) = &cp.corpus_fingerprint {
                    if previous != &fingerprint {
                        bail!(
                            "Corpus changed since the last checkpoint. \
                             Re-run with --restart to rebuild the index."
                        );
                    }
                }
                cp
            }
            None => Checkpoint::fresh(total),
        };
        checkpoint.corpus_fingerprint = Some(fingerprint);
        checkpoint.entries = Some(store.len());

        let resumed_from = checkpoint.processed;
        if resumed_from > 0 {
            tracing::info!(processed = resumed_from, total, "resuming from checkpoint");
            progress.report(ProgressEvent::IndexResumed {
                processed: resumed_from,
                total,
            });
        }

        let mut report = IndexReport {
            total,
            resumed_from,
            ..IndexReport::default()
        };
        let started = Instant::now();
        let mut since_save = 0usize;
        let mut cursor = resumed_from;

        self.transition(IndexPhase::Running);

        let gaps = std::mem::take(&mut checkpoint.dropped);
        if !gaps.is_empty() {
            self.retry_gaps(corpus, gaps, &mut store, &mut checkpoint, &mut report)
                .await?;
        }

        while cursor < total {
            let end = (cursor + self.options.batch_size).min(total);
            let batch: Vec<&FlatRecord> = corpus[cursor..end]
                .iter()
                .filter(|r| r.has_content())
                .collect();

            if batch.is_empty() {
                report.skipped_batches += 1;
                cursor = end;
            } else if let Err(e) = self.embed_into(&mut store, &batch).await {
                tracing::warn!(
                    start = cursor,
                    end,
                    error = %e,
                    "embedding batch failed; dropping it"
                );
                self.save(&store, &mut checkpoint, cursor)?;
                report.checkpoints += 1;
                since_save = 0;
                checkpoint.dropped.push(BatchGap { start: cursor, end });
                report.dropped_batches += 1;
                progress.report(ProgressEvent::BatchDropped {
                    start: cursor,
                    end,
                    error: e.to_string(),
                });

                cursor = end;
                if !self.options.retry_pause.is_zero() {
                    tokio::time::sleep(self.options.retry_pause).await;
                }
                continue;
            } else {
                report.embedded_batches += 1;
                cursor = end;
            }

            since_save += 1;
            if since_save >= self.options.save_every_batches {
                self.save(&store, &mut checkpoint, cursor)?;
                report.checkpoints += 1;
                since_save = 0;
                progress.report(saved_event(cursor, total, resumed_from, started.elapsed()));
            }
        }

        self.save(&store, &mut checkpoint, total)?;
        report.checkpoints += 1;
        self.transition(IndexPhase::Completed);

        report.processed = checkpoint.processed;
        report.entries = store.len();
        report.elapsed = started.elapsed();

        tracing::info!(
            processed = report.processed,
            entries = report.entries,
            dropped = report.dropped_batches,
            "indexing complete"
        );
        progress.report(ProgressEvent::IndexCompleted {
            processed: report.processed,
            total,
            entries: report.entries,
        });
        Ok(report)
    }

    /// Embed `batch` and append vectors and metadata together.
    async fn embed_into(&self, store: &mut IndexStore, batch: &[&FlatRecord]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            bail!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            );
        }
        store.index.add(&vectors)?;
        store.metadata.extend(batch.iter().map(|r| (*r).clone()));
        Ok(())
    }

    /// Re-embed gaps left by earlier runs. Gaps that fail again stay recorded.
    async fn retry_gaps(
        &mut self,
        corpus: &[FlatRecord],
        gaps: Vec<BatchGap>,
        store: &mut IndexStore,
        checkpoint: &mut Checkpoint,
        report: &mut IndexReport,
    ) -> Result<()> {
        let mut indexed: HashSet<String> =
            store.metadata.iter().map(|r| r.path.clone()).collect();
        let mut remaining = Vec::new();

        for gap in gaps {
            // Beyond the cursor the main loop covers it again.
            if gap.start >= gap.end || gap.end > checkpoint.processed || gap.end > corpus.len() {
                continue;
            }
            let batch: Vec<&FlatRecord> = corpus[gap.start..gap.end]
                .iter()
                .filter(|r| r.has_content() && !indexed.contains(&r.path))
                .collect();
            if batch.is_empty() {
                report.recovered_batches += 1;
                continue;
            }

            match self.embed_into(store, &batch).await {
                Ok(()) => {
                    tracing::info!(start = gap.start, end = gap.end, "recovered dropped batch");
                    indexed.extend(batch.iter().map(|r| r.path.clone()));
                    report.recovered_batches += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        start = gap.start,
                        end = gap.end,
                        error = %e,
                        "dropped batch failed again; keeping it recorded"
                    );
                    remaining.push(gap);
                    if !self.options.retry_pause.is_zero() {
                        tokio::time::sleep(self.options.retry_pause).await;
                    }
                }
            }
        }

        checkpoint.dropped = remaining;
        let processed = checkpoint.processed;
        self.save(store, checkpoint, processed)?;
        report.checkpoints += 1;
        Ok(())
    }

    fn save(
        &mut self,
        store: &IndexStore,
        checkpoint: &mut Checkpoint,
        processed: usize,
    ) -> Result<()> {
        self.transition(IndexPhase::Checkpointing);
        checkpoint.processed = processed.min(checkpoint.total).max(checkpoint.processed);
        checkpoint.entries = Some(store.len());
        store.persist(&self.storage, checkpoint)?;
        self.transition(IndexPhase::Running);
        Ok(())
    }
}

fn saved_event(processed: usize, total: usize, resumed_from: usize, elapsed: Duration) -> ProgressEvent {
    let elapsed_secs = elapsed.as_secs_f64();
    let done = processed.saturating_sub(resumed_from) as f64;
    let rate = if elapsed_secs > 0.0 { done / elapsed_secs } else { 0.0 };
    let eta_secs = if rate > 0.0 {
        Some(total.saturating_sub(processed) as f64 / rate)
    } else {
        None
    };
    ProgressEvent::IndexSaved {
        processed,
        total,
        elapsed_secs,
        rate,
        eta_secs,
    }
}

/// `aemrag index build`: embed the corpus file into the configured storage.
pub async fn run_index_build(
    config: &Config,
    restart: bool,
    break_lock: bool,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled; set [embedding] provider to build an index");
    }
    let credential = config.resolve_credential(true, false)?;
    let embedder = create_embedder(&config.embedding, credential)?;
    let corpus = read_corpus(&config.storage.corpus_path)?;

    if break_lock {
        RunLock::break_lock(&config.storage.lock_file())?;
    }

    let mut options = IndexOptions::from_config(&config.embedding);
    options.restart = restart;
    let mut indexer = Indexer::new(embedder, &config.storage, options);
    // Dropping the run on Ctrl-C releases the lock; the last checkpoint stands.
    let report = tokio::select! {
        report = indexer.run(&corpus, progress) => report?,
        _ = tokio::signal::ctrl_c() => {
            bail!("Interrupted; rerun `aemrag index build` to resume from the last checkpoint")
        }
    };

    println!("records: {}", report.total);
    println!("resumed_from: {}", report.resumed_from);
    println!("processed: {}", report.processed);
    println!("entries: {}", report.entries);
    println!("embedded_batches: {}", report.embedded_batches);
    println!("skipped_batches: {}", report.skipped_batches);
    println!("dropped_batches: {}", report.dropped_batches);
    println!("recovered_batches: {}", report.recovered_batches);
    println!("elapsed_secs: {:.1}", report.elapsed.as_secs_f64());
    Ok(())
}
