//! Redis helpers shared by canal services.
//!
//! - [`connect`] builds the auto-reconnecting [`ConnectionManager`] used for
//!   plain commands (pub/sub publishing, cache deletes).
//! - [`streams`] implements a consumer-group reader that fans in any number
//!   of streams through a single batched `XREADGROUP`, draining each stream's
//!   pending backlog before switching it to the live tail.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};
use tracing::info;

mod error;
pub mod streams;

pub use error::StreamError;
pub use streams::{
    Consumer, ConsumerOptions, Cursor, FieldValue, ReadGroup, RedisBackend, StreamBackend,
    StreamBatch, StreamEntry, StreamMessage,
};

/// Open a connection manager for `redis_url`.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let info: ConnectionInfo = redis_url
        .into_connection_info()
        .context("failed to parse REDIS_URL connection string")?;

    let client = Client::open(info).context("failed to construct Redis client")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("failed to initialize Redis connection manager")?;

    info!("Redis connection manager ready");
    Ok(manager)
}
