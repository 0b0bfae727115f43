use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::MySqlPool;
use tracing::{debug, info};

use crate::error::Result;

/// Cache key prefix of a web session.
pub const SESSION_KEY_PREFIX: &str = "chii:web:session:";

#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Expire every session of `user_id` and drop their cached copies.
    async fn revoke_all_sessions(&self, user_id: u32) -> Result<()>;
}

/// Sessions stored in `chii_os_web_sessions`, cached in Redis.
pub struct SqlSessionManager {
    db: MySqlPool,
    cache: ConnectionManager,
}

impl SqlSessionManager {
    pub fn new(db: MySqlPool, cache: ConnectionManager) -> Self {
        Self { db, cache }
    }
}

pub(crate) fn cache_keys(session_keys: &[String]) -> Vec<String> {
    session_keys
        .iter()
        .map(|key| format!("{}{}", SESSION_KEY_PREFIX, key))
        .collect()
}

#[async_trait]
impl SessionManager for SqlSessionManager {
    async fn revoke_all_sessions(&self, user_id: u32) -> Result<()> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT `key` FROM chii_os_web_sessions WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.db)
                .await?;

        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE chii_os_web_sessions SET expired_at = ? WHERE user_id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&self.db)
            .await?;

        info!(user_id, sessions = keys.len(), "revoked user sessions");

        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.cache.clone();
        let removed: usize = conn.del(cache_keys(&keys)).await?;
        debug!(user_id, removed, "dropped cached sessions");
        Ok(())
    }
}
