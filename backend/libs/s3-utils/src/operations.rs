/// Listing and batch deletion of objects under a key prefix
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use tracing::debug;

use crate::error::{Result, S3Error};
use crate::S3Client;

/// `DeleteObjects` accepts at most this many keys per request.
pub const MAX_DELETE_BATCH: usize = 1000;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub next_token: Option<String>,
}

/// A key the server refused to delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

impl S3Client {
    /// List one page of keys under `prefix`.
    pub async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage> {
        let response = self
            .client()
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(S3Error::request)?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(|k| k.to_string()))
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { keys, next_token })
    }

    /// Delete `keys` in batches of [`MAX_DELETE_BATCH`], returning the keys
    /// the server reported as failed.
    pub async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut failures = Vec::new();

        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            let delete = Delete::builder()
                .set_objects(Some(object_identifiers(chunk)?))
                .quiet(true)
                .build()?;

            let output = self
                .client()
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(S3Error::request)?;

            debug!(bucket, count = chunk.len(), "deleted object batch");

            failures.extend(output.errors().iter().map(|err| DeleteFailure {
                key: err.key().unwrap_or_default().to_string(),
                code: err.code().unwrap_or_default().to_string(),
                message: err.message().unwrap_or_default().to_string(),
            }));
        }

        Ok(failures)
    }
}

fn object_identifiers(keys: &[String]) -> Result<Vec<ObjectIdentifier>> {
    keys.iter()
        .map(|key| {
            ObjectIdentifier::builder()
                .key(key)
                .build()
                .map_err(S3Error::from)
        })
        .collect()
}
