//! The event log seam and an in-memory implementation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::EventLogError;
use crate::event::{CommittedEvent, CommittedEventBatch, UncommittedEvent};
use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId};

/// Stream of committed batches, oldest first.
pub type BatchStream = BoxStream<'static, Result<CommittedEventBatch, EventLogError>>;

/// Append-only store of committed events, one stream per aggregate instance.
///
/// # Contract
///
/// - [`fetch_history`](EventLog::fetch_history) yields at least one batch.
///   A stream that was never written yields a single empty batch at
///   version [`INITIAL`](AggregateRootVersion::INITIAL).
/// - Every batch is tagged with the requested aggregate root and event
///   source.
/// - [`commit`](EventLog::commit) is all-or-nothing and rejects a write
///   whose expected version is not the stream's current version.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Read the full history of one aggregate instance.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError`] if the read cannot be started. Failures
    /// while streaming are yielded as stream items.
    async fn fetch_history(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
    ) -> Result<BatchStream, EventLogError>;

    /// Append `events` to a stream currently at `expected_version`.
    ///
    /// Returns the stream's version after the append.
    ///
    /// # Errors
    ///
    /// * [`EventLogError::WrongExpectedVersion`] on a concurrency conflict.
    /// * Any other [`EventLogError`] for storage failures.
    async fn commit(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
        expected_version: AggregateRootVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<AggregateRootVersion, EventLogError>;
}

/// Split committed events into batches of at most `max` events each.
///
/// Returns a single empty batch when `events` is empty.
pub(crate) fn into_batches(
    aggregate_root: AggregateRootId,
    event_source: &EventSourceId,
    events: Vec<CommittedEvent>,
    max: usize,
) -> Vec<CommittedEventBatch> {
    if events.is_empty() {
        return vec![CommittedEventBatch::empty(
            aggregate_root,
            event_source.clone(),
        )];
    }
    let max = max.max(1);
    let mut batches = Vec::with_capacity(events.len().div_ceil(max));
    let mut events = events.into_iter().peekable();
    while events.peek().is_some() {
        let chunk: Vec<_> = events.by_ref().take(max).collect();
        let version = chunk
            .last()
            .map(|e| e.aggregate_root_version.next())
            .unwrap_or_default();
        batches.push(CommittedEventBatch {
            aggregate_root,
            event_source: event_source.clone(),
            version,
            events: chunk,
        });
    }
    batches
}

/// One stream: events grouped by the commit that wrote them.
type Commits = Vec<Vec<CommittedEvent>>;

/// In-memory [`EventLog`].
///
/// Each commit is returned as its own batch on fetch, further split when
/// a maximum batch size is set.
#[derive(Default)]
pub struct InMemoryEventLog {
    streams: Mutex<HashMap<(Uuid, EventSourceId), Commits>>,
    max_batch_size: Option<usize>,
    fetches: AtomicUsize,
}

impl fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("max_batch_size", &self.max_batch_size)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of events per fetched batch.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max.max(1));
        self
    }

    /// Number of `fetch_history` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// All committed events of one stream, in order.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Unavailable`] if the log's lock is poisoned.
    pub fn events(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
    ) -> Result<Vec<CommittedEvent>, EventLogError> {
        let streams = self.lock()?;
        Ok(streams
            .get(&(aggregate_root.id, event_source.clone()))
            .map(|commits| commits.iter().flatten().cloned().collect())
            .unwrap_or_default())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(Uuid, EventSourceId), Commits>>, EventLogError>
    {
        self.streams
            .lock()
            .map_err(|_| EventLogError::Unavailable("in-memory event log lock poisoned".into()))
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn fetch_history(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
    ) -> Result<BatchStream, EventLogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let commits = {
            let streams = self.lock()?;
            streams
                .get(&(aggregate_root.id, event_source.clone()))
                .cloned()
                .unwrap_or_default()
        };

        let max = self.max_batch_size.unwrap_or(usize::MAX);
        let batches: Vec<_> = if commits.is_empty() {
            into_batches(aggregate_root, event_source, Vec::new(), max)
        } else {
            commits
                .into_iter()
                .flat_map(|commit| into_batches(aggregate_root, event_source, commit, max))
                .collect()
        };
        Ok(tokio_stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn commit(
        &self,
        aggregate_root: AggregateRootId,
        event_source: &EventSourceId,
        expected_version: AggregateRootVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<AggregateRootVersion, EventLogError> {
        let mut streams = self.lock()?;
        let commits = streams
            .entry((aggregate_root.id, event_source.clone()))
            .or_default();
        let current = AggregateRootVersion::new(commits.iter().map(Vec::len).sum::<usize>() as u64);
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
        let committed: Vec<_> = events
            .into_iter()
            .map(|event| {
                let stamped = event.into_committed(version);
                version = version.next();
                stamped
            })
            .collect();
        commits.push(committed);
        Ok(version)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::{BatchStream, EventLog};
    use crate::error::EventLogError;
    use crate::event::{CommittedEventBatch, UncommittedEvent};
    use crate::ids::{AggregateRootId, AggregateRootVersion, EventSourceId};

    /// Replays a fixed list of batches regardless of the requested stream.
    pub(crate) struct ScriptedEventLog {
        batches: Mutex<Vec<CommittedEventBatch>>,
    }

    impl ScriptedEventLog {
        pub(crate) fn new(batches: Vec<CommittedEventBatch>) -> Self {
            Self {
                batches: Mutex::new(batches),
            }
        }
    }

    #[async_trait]
    impl EventLog for ScriptedEventLog {
        async fn fetch_history(
            &self,
            _: AggregateRootId,
            _: &EventSourceId,
        ) -> Result<BatchStream, EventLogError> {
            let batches = self.batches.lock().expect("not poisoned").clone();
            Ok(tokio_stream::iter(batches.into_iter().map(Ok)).boxed())
        }

        async fn commit(
            &self,
            _: AggregateRootId,
            _: &EventSourceId,
            _: AggregateRootVersion,
            _: Vec<UncommittedEvent>,
        ) -> Result<AggregateRootVersion, EventLogError> {
            Err(EventLogError::Unavailable("scripted log is read-only".into()))
        }
    }
}
