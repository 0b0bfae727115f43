use async_trait::async_trait;
use s3_utils::{DeleteFailure, ObjectPage, S3Client};

use crate::error::Result;

/// Prefix listing and batch deletion in a bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage>;

    /// Delete `keys`, returning the per-object failures.
    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>>;
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage> {
        Ok(S3Client::list_objects_page(self, bucket, prefix, continuation_token).await?)
    }

    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        Ok(self.delete_objects(bucket, keys).await?)
    }
}
