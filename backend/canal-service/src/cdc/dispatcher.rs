use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::envelope::{decode_envelope, decode_key, ChangeEnvelope};
use crate::collaborators::{Collaborators, SearchTarget};
use crate::error::Result;
use crate::handlers::{
    CharacterKey, PersonKey, SearchEntityHandler, SubjectFieldKey, SubjectKey, UserHandler,
};
use crate::metrics::metrics;
use crate::stream::{Message, MessageHandler};

/// Source tables consumed by the standard route table.
pub const SUBJECTS_TABLE: &str = "chii_subjects";
pub const SUBJECT_FIELDS_TABLE: &str = "chii_subject_fields";
pub const MEMBERS_TABLE: &str = "chii_members";
pub const CHARACTERS_TABLE: &str = "chii_characters";
pub const PERSONS_TABLE: &str = "chii_persons";

/// Handles the change events of one source table.
#[async_trait]
pub trait TableHandler: Send + Sync {
    /// `key` is the unwrapped key document of the changed row.
    async fn handle(&self, key: &Value, envelope: &ChangeEnvelope) -> Result<()>;
}

/// Exact table name to handler mapping.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn TableHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes for every table the service consumes.
    pub fn standard(collaborators: &Collaborators) -> Self {
        let search = &collaborators.search;
        Self::new()
            .route(
                SUBJECTS_TABLE,
                SearchEntityHandler::<SubjectKey>::new(search.clone(), SearchTarget::Subject),
            )
            .route(
                SUBJECT_FIELDS_TABLE,
                SearchEntityHandler::<SubjectFieldKey>::new(search.clone(), SearchTarget::Subject),
            )
            .route(
                CHARACTERS_TABLE,
                SearchEntityHandler::<CharacterKey>::new(search.clone(), SearchTarget::Character),
            )
            .route(
                PERSONS_TABLE,
                SearchEntityHandler::<PersonKey>::new(search.clone(), SearchTarget::Person),
            )
            .route(MEMBERS_TABLE, UserHandler::new(collaborators.clone()))
    }

    pub fn route(mut self, table: impl Into<String>, handler: impl TableHandler + 'static) -> Self {
        self.routes.insert(table.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, table: &str) -> Option<&Arc<dyn TableHandler>> {
        self.routes.get(table)
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }
}

/// Decodes raw messages and routes them by source table.
///
/// Tombstones, undecodable JSON and tables without a route are accepted
/// without side effects. Only handler errors are returned.
pub struct Dispatcher {
    routes: RouteTable,
}

impl Dispatcher {
    pub fn new(routes: RouteTable) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn dispatch(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            debug!("tombstone event, skipping");
            return Ok(());
        }

        let key = match decode_key(key) {
            Ok(key) => key,
            Err(err) => {
                debug!(error = %err, "ignoring event with malformed key");
                return Ok(());
            }
        };

        let envelope = match decode_envelope(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "ignoring event with malformed payload");
                return Ok(());
            }
        };

        let Some(handler) = self.routes.get(envelope.table()) else {
            debug!(table = envelope.table(), "no handler for table");
            return Ok(());
        };

        debug!(table = envelope.table(), op = %envelope.op, "dispatching change event");
        metrics()
            .change_events_total
            .with_label_values(&[envelope.table(), envelope.op.metric_label()])
            .inc();

        handler.handle(&key, &envelope).await
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn on_message(&self, message: &Message) -> Result<()> {
        self.dispatch(&message.key, &message.value).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::collaborators::testing::{
        RecordingPublisher, RecordingSearch, RecordingSessions, SearchCall,
    };
    use crate::error::CanalError;

    struct Fixture {
        search: Arc<RecordingSearch>,
        sessions: Arc<RecordingSessions>,
        publisher: Arc<RecordingPublisher>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let search = Arc::new(RecordingSearch::default());
        let sessions = Arc::new(RecordingSessions::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let collaborators = Collaborators {
            search: search.clone(),
            sessions: sessions.clone(),
            publisher: publisher.clone(),
            object_store: None,
            image_resize_bucket: "img-resize".to_string(),
        };
        Fixture {
            search,
            sessions,
            publisher,
            dispatcher: Dispatcher::new(RouteTable::standard(&collaborators)),
        }
    }

    fn event(table: &str, op: &str, before: Value, after: Value) -> Vec<u8> {
        json!({
            "schema": {},
            "payload": {"before": before, "after": after, "source": {"table": table}, "op": op}
        })
        .to_string()
        .into_bytes()
    }

    fn no_side_effects(f: &Fixture) -> bool {
        f.search.calls().is_empty() && f.sessions.revoked().is_empty() && f.publisher.published().is_empty()
    }

    #[test]
    fn test_standard_routes() {
        let f = fixture();
        assert_eq!(
            f.dispatcher.routes().tables(),
            vec![
                CHARACTERS_TABLE,
                MEMBERS_TABLE,
                PERSONS_TABLE,
                SUBJECT_FIELDS_TABLE,
                SUBJECTS_TABLE
            ]
        );
    }

    #[tokio::test]
    async fn test_tombstone_has_no_side_effects() {
        let f = fixture();
        tokio_test::assert_ok!(f.dispatcher.dispatch(br#"{"subject_id":1}"#, b"").await);
        assert!(no_side_effects(&f));
    }

    #[tokio::test]
    async fn test_malformed_json_is_accepted() {
        let f = fixture();
        let value = event(SUBJECTS_TABLE, "c", Value::Null, json!({}));

        tokio_test::assert_ok!(f.dispatcher.dispatch(b"{not json", &value).await);
        tokio_test::assert_ok!(f.dispatcher.dispatch(br#"{"subject_id":1}"#, b"{\"op\":").await);
        assert!(no_side_effects(&f));
    }

    #[tokio::test]
    async fn test_unroutable_table() {
        let f = fixture();
        let value = event("chii_episodes", "u", json!({}), json!({}));
        tokio_test::assert_ok!(f.dispatcher.dispatch(br#"{"ep_id":1}"#, &value).await);
        assert!(no_side_effects(&f));
    }

    #[tokio::test]
    async fn test_subject_routing_by_op() {
        let f = fixture();
        let key = br#"{"schema":{},"payload":{"subject_id":42}}"#;

        for op in ["c", "u", "d", "r"] {
            let value = event(SUBJECTS_TABLE, op, json!({}), json!({}));
            tokio_test::assert_ok!(f.dispatcher.dispatch(key, &value).await);
        }

        assert_eq!(
            f.search.calls(),
            vec![
                SearchCall::Added(42, SearchTarget::Subject),
                SearchCall::Updated(42, SearchTarget::Subject),
                SearchCall::Removed(42, SearchTarget::Subject),
            ]
        );
    }

    #[tokio::test]
    async fn test_subject_field_routes_to_subject() {
        let f = fixture();
        let value = event(SUBJECT_FIELDS_TABLE, "u", json!({}), json!({}));
        tokio_test::assert_ok!(f.dispatcher.dispatch(br#"{"field_sid":9}"#, &value).await);
        assert_eq!(f.search.calls(), vec![SearchCall::Updated(9, SearchTarget::Subject)]);
    }

    #[tokio::test]
    async fn test_replay_produces_same_side_effects() {
        let f = fixture();
        let key = br#"{"uid":3}"#;
        let value = event(
            MEMBERS_TABLE,
            "u",
            json!({"password_crypt": "a", "new_notify": 0}),
            json!({"password_crypt": "b", "new_notify": 1}),
        );

        tokio_test::assert_ok!(f.dispatcher.dispatch(key, &value).await);
        let first = (f.sessions.revoked(), f.publisher.published());
        tokio_test::assert_ok!(f.dispatcher.dispatch(key, &value).await);

        assert_eq!(f.sessions.revoked(), vec![3, 3]);
        assert_eq!(f.publisher.published().len(), 2);
        assert_eq!(f.publisher.published()[1], first.1[0]);
    }

    #[tokio::test]
    async fn test_undecodable_entity_key_is_an_error() {
        let f = fixture();
        let value = event(PERSONS_TABLE, "c", Value::Null, json!({}));
        let result = f.dispatcher.dispatch(br#"{"prsn_id":"x"}"#, &value).await;
        assert!(matches!(result, Err(CanalError::KeyDecode { .. })));
    }

    #[tokio::test]
    async fn test_custom_route() {
        struct Counting(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl TableHandler for Counting {
            async fn handle(&self, _key: &Value, envelope: &ChangeEnvelope) -> Result<()> {
                self.0.lock().unwrap().push(envelope.op.to_string());
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(RouteTable::new().route("chii_episodes", Counting(seen.clone())));
        let message = Message {
            id: crate::stream::MessageId::Entry("1-0".to_string()),
            stream: "chii_episodes".to_string(),
            key: br#"{"ep_id":1}"#.to_vec(),
            value: event("chii_episodes", "x", Value::Null, Value::Null),
        };

        tokio_test::assert_ok!(dispatcher.on_message(&message).await);
        assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_ops_share_one_metric_label() {
        let dispatcher = Dispatcher::new(RouteTable::new().route("chii_index", NoopHandler));
        let value = event("chii_index", "op-from-payload", Value::Null, Value::Null);
        tokio_test::assert_ok!(dispatcher.dispatch(br#"{"idx_id":1}"#, &value).await);

        let families = prometheus::default_registry().gather();
        let ops: Vec<String> = families
            .iter()
            .filter(|family| family.get_name() == "canal_change_events_total")
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == "table" && l.get_value() == "chii_index")
            })
            .flat_map(|metric| metric.get_label().iter())
            .filter(|l| l.get_name() == "op")
            .map(|l| l.get_value().to_string())
            .collect();
        assert_eq!(ops, vec!["unknown".to_string()]);
    }

    struct NoopHandler;

    #[async_trait]
    impl TableHandler for NoopHandler {
        async fn handle(&self, _key: &Value, _envelope: &ChangeEnvelope) -> Result<()> {
            Ok(())
        }
    }
}
