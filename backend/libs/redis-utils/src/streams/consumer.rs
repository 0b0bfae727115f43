use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::backend::{ReadGroup, StreamBackend};
use super::cursor::Cursor;
use super::StreamMessage;
use crate::error::{Result, StreamError};

/// Consumer group identity and read tuning.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group: String,
    pub consumer: String,
    pub streams: Vec<String>,
    pub count: usize,
    pub block: Option<Duration>,
}

impl ConsumerOptions {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            streams: Vec::new(),
            count: 10,
            block: Some(Duration::from_secs(2)),
        }
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.streams.push(stream.into());
        self
    }

    pub fn streams<I, S>(mut self, streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.streams.extend(streams.into_iter().map(Into::into));
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// `None` makes reads return immediately when nothing is available.
    pub fn block(mut self, block: Option<Duration>) -> Self {
        self.block = block;
        self
    }
}

/// Reads a fixed set of streams as one member of a consumer group.
///
/// Every stream is first drained of the entries already delivered to this
/// consumer but never acknowledged, then follows the live tail. Streams make
/// that transition independently.
pub struct Consumer<B> {
    backend: B,
    options: ConsumerOptions,
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl<B: StreamBackend> Consumer<B> {
    pub fn new(backend: B, options: ConsumerOptions) -> Self {
        let cursors = options
            .streams
            .iter()
            .map(|stream| (stream.clone(), Cursor::start()))
            .collect();

        Self {
            backend,
            options,
            cursors: Mutex::new(cursors),
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Create the consumer group on every stream that lacks it. New groups
    /// start at the stream tail so history produced before first boot is not
    /// replayed.
    pub async fn ensure_groups(&self) -> Result<()> {
        if self.options.group.is_empty() {
            return Err(StreamError::Configuration(
                "consumer group name is empty".to_string(),
            ));
        }

        for stream in &self.options.streams {
            let groups = self.backend.group_names(stream).await?;
            if groups.iter().any(|name| name == &self.options.group) {
                continue;
            }

            info!(stream = %stream, group = %self.options.group, "creating consumer group");
            self.backend
                .create_group(stream, &self.options.group)
                .await?;
        }

        Ok(())
    }

    /// Fetch the next batch of messages across all streams.
    ///
    /// Returns an empty batch only when every stream follows the live tail
    /// and nothing new arrived, or when the read is non-blocking and the
    /// server had no data.
    pub async fn read(&self) -> Result<Vec<StreamMessage>> {
        let mut cursors = self.cursors.lock().await;

        loop {
            let request = ReadGroup {
                group: self.options.group.clone(),
                consumer: self.options.consumer.clone(),
                keys: self.options.streams.clone(),
                ids: self
                    .options
                    .streams
                    .iter()
                    .map(|stream| {
                        cursors
                            .get(stream)
                            .map(Cursor::as_id)
                            .unwrap_or(Cursor::BACKLOG_START)
                            .to_string()
                    })
                    .collect(),
                count: self.options.count,
                block: self.options.block,
            };

            let batches = match self.backend.read_group(&request).await? {
                Some(batches) => batches,
                None if self.options.block.is_some() => continue,
                None => return Ok(Vec::new()),
            };

            // Taken before applying the reply: a stream that only now
            // finished its backlog must not produce an empty return.
            let all_live = cursors.values().all(Cursor::is_live);

            let mut messages = Vec::new();
            for batch in batches {
                let cursor = cursors.entry(batch.stream.clone()).or_default();

                if batch.entries.is_empty() {
                    if !cursor.is_live() {
                        debug!(stream = %batch.stream, "backlog drained, following live tail");
                    }
                    *cursor = Cursor::LiveTail;
                    continue;
                }

                for entry in batch.entries {
                    if !cursor.is_live() {
                        *cursor = Cursor::Backlog(entry.id.clone());
                    }
                    messages.push(StreamMessage {
                        stream: batch.stream.clone(),
                        id: entry.id,
                        fields: entry.fields,
                    });
                }
            }

            if !messages.is_empty() || all_live {
                return Ok(messages);
            }
        }
    }

    /// Acknowledge `(stream, id)` pairs. Several ids are grouped per stream
    /// and sent in one pipeline.
    pub async fn ack(&self, entries: &[(&str, &str)]) -> Result<()> {
        match entries {
            [] => Ok(()),
            [(stream, id)] => {
                self.backend
                    .ack(&self.options.group, stream, &[id.to_string()])
                    .await
            }
            _ => {
                let mut batches: Vec<(String, Vec<String>)> = Vec::new();
                for (stream, id) in entries {
                    match batches.iter_mut().find(|(name, _)| name == stream) {
                        Some((_, ids)) => ids.push(id.to_string()),
                        None => batches.push((stream.to_string(), vec![id.to_string()])),
                    }
                }
                self.backend
                    .ack_batches(&self.options.group, &batches)
                    .await
            }
        }
    }

    /// Snapshot of the cursor for `stream`.
    pub async fn cursor(&self, stream: &str) -> Option<Cursor> {
        self.cursors.lock().await.get(stream).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::memory::MemoryBackend;
    use crate::streams::FieldValue;
    use tokio_test::assert_ok;

    fn options(streams: &[&str]) -> ConsumerOptions {
        ConsumerOptions::new("canal", "worker-1")
            .streams(streams.iter().copied())
            .block(None)
    }

    fn values(messages: &[StreamMessage], field: &str) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| m.field(field).and_then(FieldValue::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Leaves `n` entries delivered-but-unacknowledged for the `canal` group.
    async fn leave_pending(backend: &MemoryBackend, stream: &str, n: usize) {
        let crashed = Consumer::new(backend.clone(), options(&[stream]));
        assert_ok!(crashed.ensure_groups().await);
        for i in 0..n {
            backend.append(stream, &[("value", &format!("old-{i}"))]);
        }
        // First read drains the (empty) backlog, second reads the new entries.
        let mut delivered = 0;
        while delivered < n {
            delivered += crashed.read().await.expect("read").len();
        }
    }

    #[tokio::test]
    async fn test_ensure_groups_creates_missing_groups_at_tail() {
        let backend = MemoryBackend::new();
        backend.append("chii_subjects", &[("value", "before-group")]);

        let consumer = Consumer::new(backend.clone(), options(&["chii_subjects", "chii_members"]));
        assert_ok!(consumer.ensure_groups().await);

        assert_eq!(backend.group_names_of("chii_subjects"), vec!["canal"]);
        assert_eq!(backend.group_names_of("chii_members"), vec!["canal"]);

        // Entries older than the group are never delivered.
        let batch = consumer.read().await.expect("read");
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_groups_is_idempotent() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(backend.clone(), options(&["chii_members"]));

        assert_ok!(consumer.ensure_groups().await);
        assert_ok!(consumer.ensure_groups().await);

        assert_eq!(backend.create_group_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_group_name_is_rejected() {
        let consumer = Consumer::new(
            MemoryBackend::new(),
            ConsumerOptions::new("", "worker-1").stream("chii_members"),
        );
        assert!(matches!(
            consumer.ensure_groups().await,
            Err(StreamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_backlog_is_drained_before_live_tail() {
        let backend = MemoryBackend::new();
        leave_pending(&backend, "chii_subjects", 3).await;

        let consumer = Consumer::new(
            backend.clone(),
            options(&["chii_subjects"]).count(2),
        );

        let first = consumer.read().await.expect("read");
        assert_eq!(values(&first, "value"), vec!["old-0", "old-1"]);
        assert_eq!(
            consumer.cursor("chii_subjects").await,
            Some(Cursor::Backlog(first[1].id.clone()))
        );

        let second = consumer.read().await.expect("read");
        assert_eq!(values(&second, "value"), vec!["old-2"]);

        // Backlog exhausted and nothing new: the stream goes live and the
        // non-blocking read comes back empty.
        let third = consumer.read().await.expect("read");
        assert!(third.is_empty());
        assert_eq!(consumer.cursor("chii_subjects").await, Some(Cursor::LiveTail));

        backend.append("chii_subjects", &[("value", "new-0")]);
        let fourth = consumer.read().await.expect("read");
        assert_eq!(values(&fourth, "value"), vec!["new-0"]);
        assert_eq!(consumer.cursor("chii_subjects").await, Some(Cursor::LiveTail));
    }

    #[tokio::test]
    async fn test_partial_catch_up_does_not_return_empty_batch() {
        let backend = MemoryBackend::new();
        leave_pending(&backend, "chii_subjects", 1).await;

        let consumer = Consumer::new(
            backend.clone(),
            ConsumerOptions::new("canal", "worker-1")
                .streams(["chii_subjects", "chii_members"])
                .block(None),
        );
        assert_ok!(consumer.ensure_groups().await);

        // chii_members has no backlog and goes live in the same round that
        // returns the pending subject entry.
        let first = consumer.read().await.expect("read");
        assert_eq!(values(&first, "value"), vec!["old-0"]);
        assert_eq!(consumer.cursor("chii_members").await, Some(Cursor::LiveTail));

        // chii_subjects still needs one more round to find its backlog empty.
        // That round yields nothing, so the consumer keeps reading until all
        // streams are live before returning empty.
        let second = consumer.read().await.expect("read");
        assert!(second.is_empty());
        assert_eq!(consumer.cursor("chii_subjects").await, Some(Cursor::LiveTail));
        assert!(backend.read_calls() >= 3);
    }

    #[tokio::test]
    async fn test_live_entries_across_streams() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(
            backend.clone(),
            options(&["chii_subjects", "chii_members"]),
        );
        assert_ok!(consumer.ensure_groups().await);
        assert!(consumer.read().await.expect("read").is_empty());

        backend.append("chii_members", &[("value", "m1")]);
        backend.append("chii_subjects", &[("value", "s1")]);

        let batch = consumer.read().await.expect("read");
        let mut got = values(&batch, "value");
        got.sort();
        assert_eq!(got, vec!["m1", "s1"]);
    }

    #[tokio::test]
    async fn test_read_error_is_returned_unchanged() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(backend.clone(), options(&["chii_members"]));
        assert_ok!(consumer.ensure_groups().await);

        backend.fail_next_read();
        assert!(matches!(consumer.read().await, Err(StreamError::Redis(_))));
    }

    #[tokio::test]
    async fn test_single_ack_uses_plain_xack() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(backend.clone(), options(&["chii_members"]));
        assert_ok!(consumer.ensure_groups().await);
        backend.append("chii_members", &[("value", "v")]);
        let batch = consumer.read().await.expect("read");
        assert_eq!(batch.len(), 1);
        let id = batch[0].id.clone();

        assert_ok!(consumer.ack(&[("chii_members", id.as_str())]).await);
        assert_eq!(backend.pending_ids("chii_members"), Vec::<String>::new());
        assert_eq!(backend.pipelined_acks(), 0);
    }

    #[tokio::test]
    async fn test_batch_ack_groups_ids_by_stream() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(
            backend.clone(),
            options(&["chii_subjects", "chii_members"]),
        );
        assert_ok!(consumer.ensure_groups().await);
        assert!(consumer.read().await.expect("read").is_empty());

        backend.append("chii_subjects", &[("value", "s1")]);
        backend.append("chii_members", &[("value", "m1")]);
        backend.append("chii_subjects", &[("value", "s2")]);
        let batch = consumer.read().await.expect("read");
        assert_eq!(batch.len(), 3);

        let entries: Vec<(&str, &str)> = batch
            .iter()
            .map(|m| (m.stream.as_str(), m.id.as_str()))
            .collect();
        assert_ok!(consumer.ack(&entries).await);

        assert_eq!(backend.pipelined_acks(), 1);
        assert!(backend.pending_ids("chii_subjects").is_empty());
        assert!(backend.pending_ids("chii_members").is_empty());
    }

    #[tokio::test]
    async fn test_ack_of_nothing_is_a_noop() {
        let backend = MemoryBackend::new();
        let consumer = Consumer::new(backend.clone(), options(&["chii_members"]));
        assert_ok!(consumer.ack(&[]).await);
        assert_eq!(backend.pipelined_acks(), 0);
    }
}
