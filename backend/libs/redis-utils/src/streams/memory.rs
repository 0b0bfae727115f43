//! In-memory [`StreamBackend`] with consumer-group bookkeeping close enough
//! to Redis for exercising the consumer without a server: groups track the
//! last delivered id and a pending set, `>` reads deliver new entries, and
//! explicit-id reads return pending entries after that id.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::backend::{ReadGroup, StreamBackend};
use super::{FieldValue, StreamBatch, StreamEntry};
use crate::error::{Result, StreamError};

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeSet<u64>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(u64, HashMap<String, FieldValue>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    next_seq: u64,
    read_calls: usize,
    create_group_calls: usize,
    pipelined_acks: usize,
    fail_next_read: bool,
    acked: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry with string fields and return its id.
    pub fn append(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        self.append_fields(
            stream,
            fields
                .iter()
                .map(|(name, value)| (name.to_string(), FieldValue::from(*value)))
                .collect(),
        )
    }

    pub fn append_fields(&self, stream: &str, fields: HashMap<String, FieldValue>) -> String {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((seq, fields));
        entry_id(seq)
    }

    /// Make the next `read_group` call fail with a connection error.
    pub fn fail_next_read(&self) {
        self.lock().fail_next_read = true;
    }

    pub fn group_names_of(&self, stream: &str) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .streams
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Pending ids on `stream` across all groups.
    pub fn pending_ids(&self, stream: &str) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<u64> = state
            .streams
            .get(stream)
            .map(|s| {
                s.groups
                    .values()
                    .flat_map(|g| g.pending.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids.into_iter().map(entry_id).collect()
    }

    /// Every `(stream, id)` acknowledged so far, in order.
    pub fn acked(&self) -> Vec<(String, String)> {
        self.lock().acked.clone()
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    pub fn create_group_calls(&self) -> usize {
        self.lock().create_group_calls
    }

    pub fn pipelined_acks(&self) -> usize {
        self.lock().pipelined_acks
    }

    fn ack_locked(state: &mut State, group: &str, stream: &str, ids: &[String]) {
        for id in ids {
            let removed = state
                .streams
                .get_mut(stream)
                .and_then(|s| s.groups.get_mut(group))
                .zip(parse_seq(id))
                .map(|(g, seq)| g.pending.remove(&seq))
                .unwrap_or(false);
            if removed {
                state.acked.push((stream.to_string(), id.clone()));
            }
        }
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn group_names(&self, stream: &str) -> Result<Vec<String>> {
        Ok(self.group_names_of(stream))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.lock();
        state.create_group_calls += 1;
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let tail = stream_state.entries.last().map(|(seq, _)| *seq).unwrap_or(0);
        stream_state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: tail,
                pending: BTreeSet::new(),
            });
        Ok(())
    }

    async fn read_group(&self, request: &ReadGroup) -> Result<Option<Vec<StreamBatch>>> {
        let batches = {
            let mut state = self.lock();
            state.read_calls += 1;
            if std::mem::take(&mut state.fail_next_read) {
                return Err(StreamError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection reset by peer",
                ))));
            }

            let mut batches = Vec::new();
            for (key, id) in request.keys.iter().zip(&request.ids) {
                let no_group = || StreamError::NoGroup {
                    stream: key.clone(),
                    group: request.group.clone(),
                };
                let stream = state.streams.get_mut(key).ok_or_else(no_group)?;
                let group = stream.groups.get_mut(&request.group).ok_or_else(no_group)?;

                if id == ">" {
                    let fresh: Vec<StreamEntry> = stream
                        .entries
                        .iter()
                        .filter(|(seq, _)| *seq > group.last_delivered)
                        .take(request.count)
                        .map(|(seq, fields)| StreamEntry {
                            id: entry_id(*seq),
                            fields: fields.clone(),
                        })
                        .collect();
                    if fresh.is_empty() {
                        continue;
                    }
                    for entry in &fresh {
                        if let Some(seq) = parse_seq(&entry.id) {
                            group.last_delivered = seq;
                            group.pending.insert(seq);
                        }
                    }
                    batches.push(StreamBatch {
                        stream: key.clone(),
                        entries: fresh,
                    });
                } else {
                    let after = parse_seq(id).unwrap_or(0);
                    let pending: Vec<StreamEntry> = group
                        .pending
                        .range(after + 1..)
                        .take(request.count)
                        .filter_map(|seq| {
                            stream
                                .entries
                                .iter()
                                .find(|(s, _)| s == seq)
                                .map(|(s, fields)| StreamEntry {
                                    id: entry_id(*s),
                                    fields: fields.clone(),
                                })
                        })
                        .collect();
                    batches.push(StreamBatch {
                        stream: key.clone(),
                        entries: pending,
                    });
                }
            }
            batches
        };

        if !batches.is_empty() {
            return Ok(Some(batches));
        }
        if let Some(block) = request.block {
            tokio::time::sleep(block).await;
        }
        Ok(None)
    }

    async fn ack(&self, group: &str, stream: &str, ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        Self::ack_locked(&mut state, group, stream, ids);
        Ok(())
    }

    async fn ack_batches(&self, group: &str, batches: &[(String, Vec<String>)]) -> Result<()> {
        let mut state = self.lock();
        state.pipelined_acks += 1;
        for (stream, ids) in batches {
            Self::ack_locked(&mut state, group, stream, ids);
        }
        Ok(())
    }
}
