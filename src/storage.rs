//! File-backed event log: one JSON-lines file per aggregate instance.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::EventLogError;
use crate::event::{CommittedEvent, UncommittedEvent};
use crate::event_log::{BatchStream, EventLog, into_batches};
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId};

/// Namespace for deriving stream file names from event source ids.
const STREAM_FILE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x02, 0xd4, 0x18, 0x3a, 0x95, 0x4c, 0x61, 0x9e, 0x4b, 0x27, 0xc8, 0x50, 0xfa, 0x1d, 0x83,
]);

/// Default number of events per fetched batch.
const DEFAULT_MAX_BATCH_SIZE: usize = 128;

/// Manages the on-disk directory layout for aggregate event streams.
///
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate root id>/
///             <uuid v5 of event source>.jsonl   -- one committed event per line
///     meta/
///         streams.jsonl                         -- stream registry
/// ```
///
/// Event source ids are arbitrary strings, so stream files are named by a
/// UUID v5 of the id; the registry maps them back.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk
    /// until a stream is first written.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns `<base_dir>/streams/<aggregate root id>`.
    pub fn aggregate_dir(&self, aggregate_root: &AggregateRootId) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(aggregate_root.id.to_string())
    }

    /// Returns the stream file of one aggregate instance.
    pub fn stream_file(
        &self,
        aggregate_root: &AggregateRootId,
        event_source: &EventSourceId,
    ) -> PathBuf {
        let name = Uuid::new_v5(&STREAM_FILE_NAMESPACE, event_source.as_str().as_bytes());
        self.aggregate_dir(aggregate_root)
            .join(format!("{name}.jsonl"))
    }

    /// Returns `<base_dir>/meta`.
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    fn registry_file(&self) -> PathBuf {
        self.meta_dir().join("streams.jsonl")
    }

    /// Ensure the stream's directory and registry entry exist.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if directory creation or file I/O fails.
    pub async fn ensure_stream(
        &self,
        aggregate_root: &AggregateRootId,
        event_source: &EventSourceId,
    ) -> std::io::Result<PathBuf> {
        fs::create_dir_all(self.aggregate_dir(aggregate_root)).await?;
        fs::create_dir_all(self.meta_dir()).await?;

        let root = aggregate_root.id.to_string();
        let already_registered = self
            .registry_entries()
            .await?
            .iter()
            .any(|(r, s)| *r == root && s == event_source.as_str());

        if !already_registered {
            let ts = SystemTime::UNIX_EPOCH
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let entry = serde_json::json!({
                "aggregate_root": root,
                "event_source": event_source.as_str(),
                "ts": ts,
            });
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.registry_file())
                .await?;
            file.write_all(format!("{entry}\n").as_bytes()).await?;
        }

        Ok(self.stream_file(aggregate_root, event_source))
    }

    /// Lists the event sources written for one aggregate root type, sorted.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the registry cannot be read.
    pub async fn list_streams(
        &self,
        aggregate_root: &AggregateRootId,
    ) -> std::io::Result<Vec<EventSourceId>> {
        let root = aggregate_root.id.to_string();
        let mut sources: Vec<_> = self
            .registry_entries()
            .await?
            .into_iter()
            .filter(|(r, _)| *r == root)
            .map(|(_, s)| EventSourceId::new(s))
            .collect();
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    async fn registry_entries(&self) -> std::io::Result<Vec<(String, String)>> {
        let contents = match fs::read_to_string(self.registry_file()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let entry: serde_json::Value = serde_json::from_str(line).ok()?;
                let root = entry.get("aggregate_root")?.as_str()?.to_owned();
                let source = entry.get("event_source")?.as_str()?.to_owned();
                Some((root, source))
            })
            .collect())
    }
}

/// [`EventLog`] storing each stream as a JSON-lines file.
///
/// Commits are serialized through one writer lock, so a single
/// `JsonlEventLog` per directory per process is assumed.
#[derive(Debug)]
pub struct JsonlEventLog {
    layout: StreamLayout,
    max_batch_size: usize,
    versions: Mutex<HashMap<PathBuf, AggregateRootVersion>>,
}

impl JsonlEventLog {
    /// Open a log rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of events per fetched batch. Defaults to 128.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    /// Returns the directory layout.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    async fn read_stream(path: &Path) -> Result<Vec<CommittedEvent>, EventLogError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(EventLogError::from))
            .collect()
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn fetch_history(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
    ) -> Result<BatchStream, EventLogError> {
        let path = self.layout.stream_file(&aggregate_root, event_source);
        let events = Self::read_stream(&path).await?;
        let batches = into_batches(aggregate_root, event_source, events, self.max_batch_size);
        Ok(tokio_stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn commit(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
        expected_version: AggregateRootVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<AggregateRootVersion, EventLogError> {
        let path = self.layout.stream_file(&aggregate_root, event_source);
        let mut versions = self.versions.lock().await;

        let current = match versions.get(&path) {
            Some(version) => *version,
            None => {
                let existing = Self::read_stream(&path).await?;
                AggregateRootVersion::new(existing.len() as u64)
            }
        };
        if current != expected_version {
            return Err(EventLogError::WrongExpectedVersion {
                event_source: event_source.clone(),
                expected: expected_version,
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(current);
        }

        let mut version = current;
        let mut buf = String::new();
        for event in events {
            let line = serde_json::to_string(&event.into_committed(version))?;
            buf.push_str(&line);
            buf.push('\n');
            version = version.next();
        }

        self.layout
            .ensure_stream(&aggregate_root, event_source)
            .await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // One write per commit keeps a commit's lines contiguous.
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        versions.insert(path, version);
        tracing::debug!(
            aggregate_root = %aggregate_root,
            event_source = %event_source,
            version = %version,
            "events committed"
        );
        Ok(version)
    }
}
