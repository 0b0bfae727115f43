use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::avatar::spawn_clear_image_cache;
use super::decode_entity_key;
use crate::cdc::{ChangeEnvelope, Operation, TableHandler};
use crate::collaborators::Collaborators;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UserKey {
    pub uid: u32,
}

/// Columns of `chii_members` that trigger side effects.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserChange {
    #[serde(default)]
    pub password_crypt: String,
    #[serde(default)]
    pub new_notify: u16,
    #[serde(default)]
    pub avatar: String,
}

/// Payload published on [`notify_channel`] when the unread count changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyCountChanged {
    pub user_id: u32,
    pub new_notify: u16,
}

pub fn notify_channel(user_id: u32) -> String {
    format!("event-user-notify-{}", user_id)
}

/// Reacts to member row updates: password changes revoke sessions,
/// notification count changes are published and avatar changes clear the
/// resized image cache in the background.
pub struct UserHandler {
    collaborators: Collaborators,
}

impl UserHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    async fn on_update(&self, user_id: u32, envelope: &ChangeEnvelope) -> Result<()> {
        let before: UserChange = envelope.before_as()?;
        let after: UserChange = envelope.after_as()?;

        if before.password_crypt != after.password_crypt {
            info!(user_id, "user changed password");
            if let Err(err) = self.collaborators.sessions.revoke_all_sessions(user_id).await {
                error!(user_id, error = %err, "failed to revoke user sessions");
            }
        }

        if before.new_notify != after.new_notify {
            self.publish_notify_count(user_id, after.new_notify).await;
        }

        if before.avatar != after.avatar {
            self.clear_avatar_cache(user_id, &before.avatar);
        }

        Ok(())
    }

    async fn publish_notify_count(&self, user_id: u32, new_notify: u16) {
        let payload = NotifyCountChanged {
            user_id,
            new_notify,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(err) => {
                error!(user_id, error = %err, "failed to encode notify event");
                return;
            }
        };

        if let Err(err) = self
            .collaborators
            .publisher
            .publish(&notify_channel(user_id), &body)
            .await
        {
            error!(user_id, error = %err, "failed to publish notify event");
        }
    }

    fn clear_avatar_cache(&self, user_id: u32, old_avatar: &str) {
        let Some(store) = &self.collaborators.object_store else {
            return;
        };
        if old_avatar.is_empty() {
            return;
        }

        debug!(user_id, avatar = old_avatar, "clear user avatar cache");
        spawn_clear_image_cache(
            store.clone(),
            self.collaborators.image_resize_bucket.clone(),
            old_avatar.to_string(),
        );
    }
}

#[async_trait]
impl TableHandler for UserHandler {
    async fn handle(&self, key: &Value, envelope: &ChangeEnvelope) -> Result<()> {
        let user_id = decode_entity_key::<UserKey>(envelope.table(), key)?.uid;

        match &envelope.op {
            Operation::Update => self.on_update(user_id, envelope).await,
            Operation::Create | Operation::Delete | Operation::Snapshot => Ok(()),
            Operation::Unknown(op) => {
                warn!(user_id, op = %op, "unexpected operation");
                Ok(())
            }
        }
    }
}
