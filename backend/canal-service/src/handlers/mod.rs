//! Per-table change handlers.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::cdc::{ChangeEnvelope, Operation, TableHandler};
use crate::collaborators::{SearchClient, SearchTarget};
use crate::error::{CanalError, Result};

pub mod avatar;
pub mod user;

pub use user::{UserHandler, UserKey};

/// Minimal projection of a row key onto the entity id.
pub trait EntityKey: DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> u32;
}

/// Decode `key` as `K`, failing the message when the entity is unknown.
pub fn decode_entity_key<K: DeserializeOwned>(table: &str, key: &Value) -> Result<K> {
    K::deserialize(key).map_err(|source| {
        error!(table, error = %source, "failed to decode event key");
        CanalError::KeyDecode {
            table: table.to_string(),
            source,
        }
    })
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SubjectKey {
    pub subject_id: u32,
}

impl EntityKey for SubjectKey {
    fn id(&self) -> u32 {
        self.subject_id
    }
}

/// Subject field rows are keyed by the subject they belong to.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SubjectFieldKey {
    pub field_sid: u32,
}

impl EntityKey for SubjectFieldKey {
    fn id(&self) -> u32 {
        self.field_sid
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CharacterKey {
    pub crt_id: u32,
}

impl EntityKey for CharacterKey {
    fn id(&self) -> u32 {
        self.crt_id
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PersonKey {
    pub prsn_id: u32,
}

impl EntityKey for PersonKey {
    fn id(&self) -> u32 {
        self.prsn_id
    }
}

/// Forwards create/update/delete of a searchable entity to the indexer.
///
/// Snapshot reads are ignored. Indexer failures are logged and do not fail
/// the message.
pub struct SearchEntityHandler<K> {
    search: Arc<dyn SearchClient>,
    target: SearchTarget,
    _key: PhantomData<fn() -> K>,
}

impl<K: EntityKey> SearchEntityHandler<K> {
    pub fn new(search: Arc<dyn SearchClient>, target: SearchTarget) -> Self {
        Self {
            search,
            target,
            _key: PhantomData,
        }
    }
}

#[async_trait]
impl<K: EntityKey> TableHandler for SearchEntityHandler<K> {
    async fn handle(&self, key: &Value, envelope: &ChangeEnvelope) -> Result<()> {
        let id = decode_entity_key::<K>(envelope.table(), key)?.id();
        let target = self.target;

        let result = match &envelope.op {
            Operation::Create => self.search.notify_added(id, target).await,
            Operation::Update => self.search.notify_updated(id, target).await,
            Operation::Delete => self.search.notify_removed(id, target).await,
            Operation::Snapshot => {
                debug!(id, %target, "ignoring snapshot event");
                Ok(())
            }
            Operation::Unknown(op) => {
                warn!(id, %target, op = %op, "unexpected operation");
                Ok(())
            }
        };

        if let Err(err) = result {
            error!(id, %target, op = %envelope.op, error = %err, "failed to notify search");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cdc::envelope::decode_envelope;
    use crate::collaborators::testing::{RecordingSearch, SearchCall};

    fn envelope(table: &str, op: &str) -> ChangeEnvelope {
        decode_envelope(
            json!({"before": null, "after": null, "source": {"table": table}, "op": op})
                .to_string()
                .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_character_lifecycle() {
        let search = Arc::new(RecordingSearch::default());
        let handler = SearchEntityHandler::<CharacterKey>::new(search.clone(), SearchTarget::Character);
        let key = json!({"crt_id": 17});

        for op in ["c", "u", "d"] {
            tokio_test::assert_ok!(handler.handle(&key, &envelope("chii_characters", op)).await);
        }

        assert_eq!(
            search.calls(),
            vec![
                SearchCall::Added(17, SearchTarget::Character),
                SearchCall::Updated(17, SearchTarget::Character),
                SearchCall::Removed(17, SearchTarget::Character),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_and_unknown_ops_are_ignored() {
        let search = Arc::new(RecordingSearch::default());
        let handler = SearchEntityHandler::<PersonKey>::new(search.clone(), SearchTarget::Person);
        let key = json!({"prsn_id": 2});

        tokio_test::assert_ok!(handler.handle(&key, &envelope("chii_persons", "r")).await);
        tokio_test::assert_ok!(handler.handle(&key, &envelope("chii_persons", "t")).await);
        assert!(search.calls().is_empty());
    }

    #[tokio::test]
    async fn test_search_failure_is_swallowed() {
        let search = Arc::new(RecordingSearch::failing());
        let handler = SearchEntityHandler::<SubjectKey>::new(search.clone(), SearchTarget::Subject);

        tokio_test::assert_ok!(
            handler
                .handle(&json!({"subject_id": 1}), &envelope("chii_subjects", "u"))
                .await
        );
        assert_eq!(search.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_key_without_id_is_an_error() {
        let search = Arc::new(RecordingSearch::default());
        let handler = SearchEntityHandler::<SubjectKey>::new(search.clone(), SearchTarget::Subject);

        let result = handler
            .handle(&json!({"id": 1}), &envelope("chii_subjects", "c"))
            .await;
        assert!(matches!(result, Err(CanalError::KeyDecode { .. })));
        assert!(search.calls().is_empty());
    }
}
