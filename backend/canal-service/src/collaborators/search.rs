use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::SearchTarget;
use crate::error::{CanalError, Result};

/// Full-text search indexer notifications.
///
/// Notifying about an entity that no longer exists is not an error.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn notify_added(&self, id: u32, target: SearchTarget) -> Result<()>;
    async fn notify_updated(&self, id: u32, target: SearchTarget) -> Result<()>;
    async fn notify_removed(&self, id: u32, target: SearchTarget) -> Result<()>;
}

/// Used when no indexer is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopSearchClient;

#[async_trait]
impl SearchClient for NoopSearchClient {
    async fn notify_added(&self, id: u32, target: SearchTarget) -> Result<()> {
        debug!(id, %target, "search disabled, skipping add");
        Ok(())
    }

    async fn notify_updated(&self, id: u32, target: SearchTarget) -> Result<()> {
        debug!(id, %target, "search disabled, skipping update");
        Ok(())
    }

    async fn notify_removed(&self, id: u32, target: SearchTarget) -> Result<()> {
        debug!(id, %target, "search disabled, skipping remove");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum SearchEvent {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Serialize)]
struct SearchNotification {
    id: u32,
    target: SearchTarget,
    event: SearchEvent,
}

/// Posts change notifications to the indexer's `/events` endpoint.
pub struct HttpSearchClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSearchClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/events", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    async fn send(&self, id: u32, target: SearchTarget, event: SearchEvent) -> Result<()> {
        let notification = SearchNotification { id, target, event };
        debug!(id, %target, event = ?event, "notifying search indexer");

        let mut request = self.client.post(&self.endpoint).json(&notification);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(CanalError::Search(format!(
            "indexer returned {} for {} {}: {}",
            status, target, id, body
        )))
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn notify_added(&self, id: u32, target: SearchTarget) -> Result<()> {
        self.send(id, target, SearchEvent::Added).await
    }

    async fn notify_updated(&self, id: u32, target: SearchTarget) -> Result<()> {
        self.send(id, target, SearchEvent::Updated).await
    }

    async fn notify_removed(&self, id: u32, target: SearchTarget) -> Result<()> {
        self.send(id, target, SearchEvent::Removed).await
    }
}
