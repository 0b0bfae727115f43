//! Change data capture consumer.
//!
//! Reads Debezium row change events from Kafka or Redis Streams and turns
//! them into search index notifications, session revocations, pub/sub
//! events and avatar cache cleanup.

pub mod app;
pub mod cdc;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod stream;

pub use config::CanalConfig;
pub use error::{CanalError, Result};
