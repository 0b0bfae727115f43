use thiserror::Error;

/// Errors raised by the stream consumer and its backends.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The consumer group is missing on a stream that is being read
    #[error("consumer group {group} does not exist on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// A stream was configured without any group name
    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
