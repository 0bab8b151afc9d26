//! On-disk index artifacts: vectors, metadata and checkpoint.
//!
//! The three files are only meaningful together. The i-th vector belongs to
//! the i-th metadata entry, and the checkpoint says how far through the corpus
//! both have been taken.
//!
//! # Commit order
//!
//! [`IndexStore::persist`] writes each file to a temporary sibling and renames
//! it into place, in this order:
//!
//! 1. vector index (`aem_index.vec`)
//! 2. metadata list (`aem_index_meta.json`)
//! 3. checkpoint (`index_state.json`)
//!
//! The checkpoint is the commit record. It carries the number of entries it
//! covers, and [`IndexStore::load`] truncates both data files to that count.
//! A crash after step 1 or 2 therefore leaves extra tail entries that are
//! discarded on the next load, and the checkpoint never claims vectors that
//! are not on disk.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use aem_rag_core::models::{Checkpoint, FlatRecord};
use aem_rag_core::vector_index::FlatIndex;

use crate::config::{Config, StorageConfig};

/// The persisted (vectors, metadata, checkpoint) triple, in memory.
#[derive(Debug, Default)]
pub struct IndexStore {
    pub index: FlatIndex,
    pub metadata: Vec<FlatRecord>,
    /// `None` when no checkpoint was found (or it could not be trusted).
    pub checkpoint: Option<Checkpoint>,
}

impl IndexStore {
    /// An empty store for a fresh build.
    pub fn empty(dims: usize) -> Self {
        Self {
            index: FlatIndex::new(dims),
            metadata: Vec::new(),
            checkpoint: None,
        }
    }

    /// Number of aligned entries.
    pub fn len(&self) -> usize {
        self.index.len().min(self.metadata.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the triple, cut back to what the checkpoint covers.
    ///
    /// Without a checkpoint any vectors or metadata on disk are unclaimed
    /// and the store starts empty. If the data files hold fewer entries than
    /// the checkpoint covers, the checkpoint cannot be trusted and the store
    /// also starts empty.
    pub fn load(storage: &StorageConfig) -> Result<Self> {
        let Some(checkpoint) = Self::load_checkpoint(&storage.checkpoint_path)? else {
            if storage.index_path.exists() || storage.metadata_path.exists() {
                tracing::warn!(
                    index = %storage.index_path.display(),
                    "index files without a checkpoint; starting from scratch"
                );
            }
            return Ok(Self::default());
        };

        let mut index = read_vectors(&storage.index_path)?;
        let mut metadata = read_metadata(&storage.metadata_path)?;

        let on_disk = index.len().min(metadata.len());
        let entries = checkpoint.entries.unwrap_or(on_disk);
        if index.len() < entries || metadata.len() < entries {
            tracing::warn!(
                entries,
                vectors = index.len(),
                metadata = metadata.len(),
                "checkpoint covers more entries than are on disk; starting from scratch"
            );
            return Ok(Self::default());
        }

        if index.len() > entries || metadata.len() > entries {
            tracing::info!(
                entries,
                vectors = index.len(),
                metadata = metadata.len(),
                "discarding entries written after the last checkpoint"
            );
        }
        index.truncate(entries);
        metadata.truncate(entries);

        Ok(Self {
            index,
            metadata,
            checkpoint: Some(checkpoint),
        })
    }

    /// Read just the checkpoint file. A missing file is `None`.
    pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Invalid checkpoint: {}", path.display()))?;
        if checkpoint.processed > checkpoint.total {
            bail!(
                "Invalid checkpoint {}: processed {} exceeds total {}",
                path.display(),
                checkpoint.processed,
                checkpoint.total
            );
        }
        Ok(Some(checkpoint))
    }

    /// Write vectors, then metadata, then `checkpoint`.
    pub fn persist(&self, storage: &StorageConfig, checkpoint: &Checkpoint) -> Result<()> {
        if self.index.len() != self.metadata.len() {
            bail!(
                "refusing to persist misaligned index: {} vectors, {} metadata entries",
                self.index.len(),
                self.metadata.len()
            );
        }

        write_atomic(&storage.index_path, &self.index.to_bytes())
            .with_context(|| format!("Failed to write {}", storage.index_path.display()))?;
        write_atomic(
            &storage.metadata_path,
            &serde_json::to_vec(&self.metadata)?,
        )
        .with_context(|| format!("Failed to write {}", storage.metadata_path.display()))?;
        write_atomic(
            &storage.checkpoint_path,
            &serde_json::to_vec_pretty(checkpoint)?,
        )
        .with_context(|| format!("Failed to write {}", storage.checkpoint_path.display()))?;

        tracing::debug!(
            processed = checkpoint.processed,
            total = checkpoint.total,
            entries = self.metadata.len(),
            "checkpoint persisted"
        );
        Ok(())
    }
}

fn read_vectors(path: &Path) -> Result<FlatIndex> {
    if !path.exists() {
        return Ok(FlatIndex::new(0));
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    FlatIndex::from_bytes(&bytes).with_context(|| format!("Corrupt vector index {}", path.display()))
}

/// Read a metadata file (JSON array of records).
pub fn read_metadata(path: &Path) -> Result<Vec<FlatRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let records: Vec<FlatRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid metadata file {}", path.display()))?;
    Ok(records.into_iter().map(FlatRecord::normalize).collect())
}

/// Write `bytes` to a temporary sibling of `path`, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// SHA-256 over every record's path and content, in corpus order.
pub fn corpus_fingerprint(records: &[FlatRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(record.content.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Advisory lock held for the duration of an indexer run.
///
/// The lock file is created exclusively and removed on drop. It records the
/// holder's pid and start time so a stale lock can be recognized.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "pid={}", std::process::id())?;
                writeln!(file, "started={}", chrono::Utc::now().to_rfc3339())?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                bail!(
                    "Index is locked by another run ({}): {}. \
                     If that run is gone, retry with --break-lock.",
                    path.display(),
                    holder.split_whitespace().collect::<Vec<_>>().join(" ")
                )
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create lock file {}", path.display()))
            }
        }
    }

    /// Remove a leftover lock file. Returns whether one existed.
    pub fn break_lock(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::warn!(lock = %path.display(), "removed existing index lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove lock {}", path.display())),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Summary of the artifacts on disk, for `aemrag index status`.
#[derive(Debug)]
pub struct IndexStatus {
    pub checkpoint: Option<Checkpoint>,
    pub vectors: usize,
    pub dims: usize,
    pub metadata: usize,
    pub locked: bool,
}

pub fn index_status(storage: &StorageConfig) -> Result<IndexStatus> {
    let index = read_vectors(&storage.index_path)?;
    Ok(IndexStatus {
        checkpoint: IndexStore::load_checkpoint(&storage.checkpoint_path)?,
        vectors: index.len(),
        dims: index.dims(),
        metadata: read_metadata(&storage.metadata_path)?.len(),
        locked: storage.lock_file().exists(),
    })
}

/// `aemrag index status`: print checkpoint and artifact counts.
pub fn run_index_status(config: &Config) -> Result<()> {
    let status = index_status(&config.storage)?;
    match &status.checkpoint {
        Some(cp) => {
            println!("processed: {}", cp.processed);
            println!("total: {}", cp.total);
            println!("complete: {}", cp.is_complete());
            if let Some(entries) = cp.entries {
                println!("entries: {}", entries);
            }
            if let Some(fp) = &cp.corpus_fingerprint {
                println!("corpus_fingerprint: {}", fp);
            }
            for gap in &cp.dropped {
                println!("dropped: {}..{}", gap.start, gap.end);
            }
        }
        None => println!("checkpoint: none"),
    }
    println!("vectors: {}", status.vectors);
    println!("dims: {}", status.dims);
    println!("metadata: {}", status.metadata);
    println!("locked: {}", status.locked);
    Ok(())
}
