//! Crawl and index progress reporting.
//!
//! Reports observable progress during `aemrag crawl` and `aemrag index build`
//! so users can see which node is being walked, how far embedding has come,
//! and roughly how long is left. Progress is emitted on **stderr** so stdout
//! stays parseable for scripts.
//!
//! Diagnostics (warnings about skipped nodes, dropped batches) go through
//! `tracing`; this module only carries the user-facing progress lines.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A node was fetched and flattened.
    CrawlNode {
        path: String,
        depth: usize,
        records: usize,
    },
    /// The crawl walked every reachable node.
    CrawlFinished {
        visited: usize,
        failed: usize,
        records: usize,
    },
    /// Indexing picked up from a checkpoint.
    IndexResumed { processed: usize, total: usize },
    /// A checkpoint was written.
    IndexSaved {
        processed: usize,
        total: usize,
        elapsed_secs: f64,
        /// Records per second over this run.
        rate: f64,
        eta_secs: Option<f64>,
    },
    /// A batch failed and its records were skipped.
    BatchDropped {
        start: usize,
        end: usize,
        error: String,
    },
    /// Every record was processed.
    IndexCompleted {
        processed: usize,
        total: usize,
        entries: usize,
    },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the crawl and index pipelines.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "index  saved  1,200 / 5,000 records ...".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::CrawlNode {
                path,
                depth,
                records,
            } => format!("crawl  {}  depth {}  {} records\n", path, depth, records),
            ProgressEvent::CrawlFinished {
                visited,
                failed,
                records,
            } => format!(
                "crawl  done  {} nodes ({} failed)  {} records\n",
                format_number(*visited as u64),
                format_number(*failed as u64),
                format_number(*records as u64)
            ),
            ProgressEvent::IndexResumed { processed, total } => format!(
                "index  resuming at {} / {} records\n",
                format_number(*processed as u64),
                format_number(*total as u64)
            ),
            ProgressEvent::IndexSaved {
                processed,
                total,
                elapsed_secs,
                rate,
                eta_secs,
            } => format!(
                "index  saved  {} / {} records  {:.0}s elapsed  {:.1} rec/s  eta {}\n",
                format_number(*processed as u64),
                format_number(*total as u64),
                elapsed_secs,
                rate,
                eta_secs.map(format_eta).unwrap_or_else(|| "unknown".to_string())
            ),
            ProgressEvent::BatchDropped { start, end, error } => {
                format!("index  dropped records {}..{}  {}\n", start, end, error)
            }
            ProgressEvent::IndexCompleted {
                processed,
                total,
                entries,
            } => format!(
                "index  complete  {} / {} records  {} vectors\n",
                format_number(*processed as u64),
                format_number(*total as u64),
                format_number(*entries as u64)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::CrawlNode {
                path,
                depth,
                records,
            } => serde_json::json!({
                "event": "crawl_node",
                "path": path,
                "depth": depth,
                "records": records
            }),
            ProgressEvent::CrawlFinished {
                visited,
                failed,
                records,
            } => serde_json::json!({
                "event": "crawl_finished",
                "visited": visited,
                "failed": failed,
                "records": records
            }),
            ProgressEvent::IndexResumed { processed, total } => serde_json::json!({
                "event": "index_resumed",
                "processed": processed,
                "total": total
            }),
            ProgressEvent::IndexSaved {
                processed,
                total,
                elapsed_secs,
                rate,
                eta_secs,
            } => serde_json::json!({
                "event": "index_saved",
                "processed": processed,
                "total": total,
                "elapsed_secs": elapsed_secs,
                "rate": rate,
                "eta_secs": eta_secs
            }),
            ProgressEvent::BatchDropped { start, end, error } => serde_json::json!({
                "event": "batch_dropped",
                "start": start,
                "end": end,
                "error": error
            }),
            ProgressEvent::IndexCompleted {
                processed,
                total,
                entries,
            } => serde_json::json!({
                "event": "index_completed",
                "processed": processed,
                "total": total,
                "entries": entries
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Render an ETA in seconds as `1h02m`, `4m05s` or `12s`.
pub fn format_eta(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "unknown".to_string();
    }
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{:02}m", h, m)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
