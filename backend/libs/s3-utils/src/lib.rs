/// Shared S3 utilities for canal services
///
/// Provides the AWS S3 client setup and the listing/deletion operations
/// used for derived-image cache cleanup.
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use std::sync::Arc;

pub mod config;
mod error;
pub mod operations;

pub use config::S3Config;
pub use error::{Result, S3Error};
pub use operations::{DeleteFailure, ObjectPage, MAX_DELETE_BATCH};

/// Shared S3 client wrapper
#[derive(Clone)]
pub struct S3Client {
    client: Arc<Client>,
}

impl S3Client {
    /// Create new S3 client with custom configuration
    pub async fn with_config(config: S3Config) -> Self {
        let shared = aws_config::load_from_env().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        tracing::info!(
            region = %config.region,
            endpoint = ?config.endpoint,
            "S3 client configured"
        );

        Self {
            client: Arc::new(Client::from_conf(builder.build())),
        }
    }

    /// Get reference to underlying AWS S3 client
    pub fn client(&self) -> &Client {
        &self.client
    }
}
