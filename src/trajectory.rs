//! Trajectory persistence.
//!
//! Step records are copied into `TrajectoryEntry` values and handed to a
//! background writer that batches them (100 entries or 10 seconds, whichever
//! first) before appending to a sink. Persistence never blocks the request
//! path: a full queue drops the entry with a metric and a log line.
//!
//! The bundled sink writes day-partitioned JSONL files and sweeps partitions
//! older than the retention window. A no-op sink is selected when
//! persistence is disabled.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};

use crate::clock::Clock;
use crate::metrics::TRAJECTORY_WRITE_ERRORS;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Persisted form of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub session_id: String,
    pub step: u64,
    pub name: String,
    /// Serialized step request, exactly as received
    pub action: String,
    /// Serialized step output
    pub observation: String,
    pub snapshot_id: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Write contract of the backing store. Batches arrive in per-session step
/// order; ordering across sessions is not guaranteed.
pub trait TrajectorySink: Send + Sync {
    fn append(&self, entries: &[TrajectoryEntry]) -> Result<()>;
}

/// Selected when persistence is disabled.
pub struct NoopSink;

impl TrajectorySink for NoopSink {
    fn append(&self, _entries: &[TrajectoryEntry]) -> Result<()> {
        Ok(())
    }
}

/// Day-partitioned JSONL directory: one `trajectory-YYYY-MM-DD.jsonl` per
/// UTC day of write, partitions older than the retention window removed.
pub struct JsonlSink {
    dir: PathBuf,
    retention_days: i64,
    clock: Arc<dyn Clock>,
    last_partition: Mutex<Option<String>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>, retention_days: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            retention_days,
            clock,
            last_partition: Mutex::new(None),
        }
    }

    fn partition_name(date: NaiveDate) -> String {
        format!("trajectory-{}.jsonl", date.format("%Y-%m-%d"))
    }

    fn partition_date(file_name: &str) -> Option<NaiveDate> {
        let date = file_name
            .strip_prefix("trajectory-")?
            .strip_suffix(".jsonl")?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Remove partitions older than the retention window.
    pub fn sweep(&self) -> Result<()> {
        let cutoff = self.clock.now().date_naive() - chrono::Duration::days(self.retention_days);
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(date) = Self::partition_date(name) {
                if date < cutoff {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}

impl TrajectorySink for JsonlSink {
    fn append(&self, entries: &[TrajectoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;

        let partition = Self::partition_name(self.clock.now().date_naive());
        {
            let mut last = self.last_partition.lock().unwrap();
            if last.as_deref() != Some(partition.as_str()) {
                *last = Some(partition.clone());
                drop(last);
                // Day rolled over (or first write): drop expired partitions.
                self.sweep()?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(&partition))?;
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Handle for enqueueing entries; flushing happens on a background task.
#[derive(Clone)]
pub struct TrajectoryWriter {
    tx: mpsc::Sender<TrajectoryEntry>,
}

impl TrajectoryWriter {
    pub fn spawn(sink: Arc<dyn TrajectorySink>, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(run_writer(sink, rx, batch_size, flush_interval));
        Self { tx }
    }

    /// Enqueue without waiting. A full queue drops the entry rather than
    /// stalling step execution.
    pub fn write(&self, entry: TrajectoryEntry) {
        if let Err(e) = self.tx.try_send(entry) {
            metrics::counter!(TRAJECTORY_WRITE_ERRORS).increment(1);
            tracing::warn!(error = %e, "trajectory queue full, dropping entry");
        }
    }
}

async fn run_writer(
    sink: Arc<dyn TrajectorySink>,
    mut rx: mpsc::Receiver<TrajectoryEntry>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<TrajectoryEntry> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(entry) => {
                    buffer.push(entry);
                    if buffer.len() >= batch_size {
                        flush(&sink, &mut buffer);
                    }
                }
                None => {
                    flush(&sink, &mut buffer);
                    return;
                }
            },
            _ = tick.tick() => flush(&sink, &mut buffer),
        }
    }
}

fn flush(sink: &Arc<dyn TrajectorySink>, buffer: &mut Vec<TrajectoryEntry>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = sink.append(buffer) {
        metrics::counter!(TRAJECTORY_WRITE_ERRORS).increment(1);
        tracing::warn!(error = %e, entries = buffer.len(), "trajectory write failed");
    }
    buffer.clear();
}
