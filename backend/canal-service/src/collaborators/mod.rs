//! Downstream services the entity handlers emit side effects into.
//!
//! Every collaborator is shared by all handlers and may be called from
//! detached tasks, so implementations must be `Send + Sync`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;

pub mod object_store;
pub mod publisher;
pub mod search;
pub mod session;

pub use object_store::ObjectStore;
pub use publisher::{Publisher, RedisPublisher};
pub use search::{HttpSearchClient, NoopSearchClient, SearchClient};
pub use session::{SessionManager, SqlSessionManager};

/// Entity type a search notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTarget {
    Subject,
    Character,
    Person,
}

impl SearchTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchTarget::Subject => "subject",
            SearchTarget::Character => "character",
            SearchTarget::Person => "person",
        }
    }
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles to every collaborator, cloned into the route table.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchClient>,
    pub sessions: Arc<dyn SessionManager>,
    pub publisher: Arc<dyn Publisher>,
    /// Avatar cache cleanup is skipped when unset.
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub image_resize_bucket: String,
}
