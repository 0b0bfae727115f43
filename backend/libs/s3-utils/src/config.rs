/// S3 configuration shared across services
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible storage (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Whether to use path-style URLs (false = virtual-hosted-style)
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            path_style: false,
        }
    }
}

impl S3Config {
    /// Load S3 configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| default_region()),
            endpoint: std::env::var("S3_ENDPOINT")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            path_style: std::env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(false),
        }
    }
}
