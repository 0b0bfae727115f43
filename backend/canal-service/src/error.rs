use thiserror::Error;

pub type Result<T> = std::result::Result<T, CanalError>;

#[derive(Debug, Error)]
pub enum CanalError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to decode {table} key: {source}")]
    KeyDecode {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{table} update has no {image} image")]
    MissingImage { table: String, image: &'static str },

    #[error("failed to decode {image} image of {table}: {source}")]
    ImageDecode {
        table: String,
        image: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Stream error: {0}")]
    Stream(#[from] redis_utils::StreamError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Object storage error: {0}")]
    ObjectStore(#[from] s3_utils::S3Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rdkafka::error::KafkaError> for CanalError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        CanalError::Kafka(err.to_string())
    }
}

impl From<reqwest::Error> for CanalError {
    fn from(err: reqwest::Error) -> Self {
        CanalError::Search(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CanalError::MissingImage {
            table: "chii_members".to_string(),
            image: "before",
        };
        assert_eq!(err.to_string(), "chii_members update has no before image");

        let err = CanalError::Kafka("broker down".to_string());
        assert_eq!(err.to_string(), "Kafka error: broker down");
    }

    #[test]
    fn test_key_decode_keeps_source() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = CanalError::KeyDecode {
            table: "chii_subjects".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("failed to decode chii_subjects key"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
