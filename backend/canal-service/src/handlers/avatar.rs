//! Derived avatar image cleanup.
//!
//! Resized variants of an avatar live under a key prefix computed from the
//! stored avatar value. Cleanup runs detached from the message handler and
//! only ever logs failures.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::collaborators::ObjectStore;

const RESIZED_AVATAR_PREFIX: &str = "/pic/user/l/";
const HD_PREFIX: &str = "/hd";
const HD_MARKER: &str = "hd=1";

pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Key prefix of every resized variant of `avatar`.
///
/// `000/00/01/1.jpg?r=1&hd=1` maps to `/hd/pic/user/l/000/00/01/1.jpg`.
pub fn cache_prefix(avatar: &str) -> String {
    let (path, query) = avatar.split_once('?').unwrap_or((avatar, ""));

    let prefix = format!("{}{}", RESIZED_AVATAR_PREFIX, path);
    if query.contains(HD_MARKER) {
        format!("{}{}", HD_PREFIX, prefix)
    } else {
        prefix
    }
}

/// Delete every object under the cache prefix of `avatar`, page by page.
pub async fn clear_image_cache(store: &dyn ObjectStore, bucket: &str, avatar: &str) {
    let prefix = cache_prefix(avatar);
    debug!(avatar, prefix = %prefix, "clearing image cache");

    let mut token = None;
    loop {
        let page = match store.list_objects_page(bucket, &prefix, token.take()).await {
            Ok(page) => page,
            Err(err) => {
                error!(bucket, prefix = %prefix, error = %err, "failed to list cached images");
                return;
            }
        };

        if page.keys.is_empty() {
            return;
        }

        match store.remove_objects(bucket, &page.keys).await {
            Ok(failures) => {
                for failure in failures {
                    error!(
                        bucket,
                        key = %failure.key,
                        code = %failure.code,
                        "failed to clear cached image: {}",
                        failure.message
                    );
                }
            }
            Err(err) => error!(bucket, prefix = %prefix, error = %err, "failed to clear cached images"),
        }

        match page.next_token {
            Some(next) => token = Some(next),
            None => return,
        }
    }
}

/// Run [`clear_image_cache`] on a detached task bounded by [`CLEANUP_TIMEOUT`].
pub fn spawn_clear_image_cache(
    store: Arc<dyn ObjectStore>,
    bucket: String,
    avatar: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cleanup = clear_image_cache(store.as_ref(), &bucket, &avatar);
        if tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await.is_err() {
            warn!(bucket = %bucket, avatar = %avatar, "image cache cleanup timed out");
        }
    })
}
