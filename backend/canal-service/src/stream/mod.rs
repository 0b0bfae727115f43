//! Transport abstraction over the change stream.
//!
//! Both transports deliver [`Message`]s to a [`MessageHandler`] one at a time
//! and acknowledge a message only after the handler returned. A handler error
//! is fatal to the read loop: the in-flight message is acknowledged on a
//! best-effort basis and the error is returned to the caller.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

pub mod kafka;
pub mod redis_stream;

pub use self::kafka::{FetchError, FetchedRecord, KafkaStream, PartitionLog, RdKafkaLog};
pub use self::redis_stream::RedisStream;

/// Transport position of a message, used for acknowledgment and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageId {
    /// Partition offset in a partitioned log.
    Offset { partition: i32, offset: i64 },
    /// Entry id in a stream.
    Entry(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Offset { partition, offset } => write!(f, "{}@{}", partition, offset),
            MessageId::Entry(id) => write!(f, "{}", id),
        }
    }
}

/// A raw change event as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    /// Topic or stream name the message arrived on.
    pub stream: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Callback invoked for every delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait Stream: Send + Sync {
    /// Deliver messages to `handler` until the stream is closed or the
    /// handler fails.
    async fn read(&self, handler: &dyn MessageHandler) -> Result<()>;

    /// Acknowledge `message`. Acknowledging twice is not an error.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Stop the read loop and release the transport. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Resolves once `shutdown` carries `true`.
pub(crate) async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Sleep for `interval` unless the stream is closed first.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, interval: Duration) {
    if interval.is_zero() {
        tokio::task::yield_now().await;
        return;
    }
    tokio::select! {
        _ = closed(shutdown) => {}
        _ = tokio::time::sleep(interval) => {}
    }
}
