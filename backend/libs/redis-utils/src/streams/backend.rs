use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamInfoGroupsReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::debug;

use super::{FieldValue, StreamBatch, StreamEntry};
use crate::error::Result;

/// One batched `XREADGROUP` request. `keys` and `ids` are parallel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadGroup {
    pub group: String,
    pub consumer: String,
    pub keys: Vec<String>,
    pub ids: Vec<String>,
    pub count: usize,
    /// `None` issues a non-blocking read.
    pub block: Option<Duration>,
}

/// The stream commands the consumer needs.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Names of the consumer groups on `stream`. A missing stream has none.
    async fn group_names(&self, stream: &str) -> Result<Vec<String>>;

    /// Create `group` on `stream` anchored at the current tail, creating the
    /// stream if needed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Returns `None` when the server replied with nil (no data).
    async fn read_group(&self, request: &ReadGroup) -> Result<Option<Vec<StreamBatch>>>;

    async fn ack(&self, group: &str, stream: &str, ids: &[String]) -> Result<()>;

    /// Acknowledge several streams in one round trip.
    async fn ack_batches(&self, group: &str, batches: &[(String, Vec<String>)]) -> Result<()>;
}

/// [`StreamBackend`] over a Redis connection manager.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn group_names(&self, stream: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        match conn
            .xinfo_groups::<_, StreamInfoGroupsReply>(stream)
            .await
        {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            Err(err) if err.to_string().contains("no such key") => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "$")
            .await
        {
            Ok(()) => Ok(()),
            // Another consumer created it between XINFO and XGROUP CREATE.
            Err(err) if err.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(&self, request: &ReadGroup) -> Result<Option<Vec<StreamBatch>>> {
        let mut options = StreamReadOptions::default()
            .group(&request.group, &request.consumer)
            .count(request.count);
        if let Some(block) = request.block {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&request.keys, &request.ids, &options)
            .await?;

        Ok(reply.map(|reply| {
            reply
                .keys
                .into_iter()
                .map(|key| StreamBatch {
                    stream: key.key,
                    entries: key
                        .ids
                        .into_iter()
                        .map(|entry| StreamEntry {
                            id: entry.id,
                            fields: entry
                                .map
                                .iter()
                                .map(|(name, value)| (name.clone(), FieldValue::from_redis(value)))
                                .collect(),
                        })
                        .collect(),
                })
                .collect()
        }))
    }

    async fn ack(&self, group: &str, stream: &str, ids: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, i64>(stream, group, ids).await?;
        Ok(())
    }

    async fn ack_batches(&self, group: &str, batches: &[(String, Vec<String>)]) -> Result<()> {
        let mut pipe = redis::pipe();
        for (stream, ids) in batches {
            pipe.xack(stream, group, ids).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
