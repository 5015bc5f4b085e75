//! S3-compatible `ObjectStore` backend. Talks to AWS S3 itself or any
//! S3-compatible provider (DigitalOcean Spaces, Backblaze B2's S3 gateway)
//! by pointing `storage_endpoint` at the provider's endpoint — the wire
//! protocol is identical, only the host differs.

use async_trait::async_trait;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;

use super::{validate_key, ObjectStore, StorageError, StorageResult};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        let config = aws_sdk_s3::Config::builder()
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            // S3-compatible providers generally require path-style addressing
            // rather than AWS's default virtual-hosted-style buckets.
            .force_path_style(true)
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();

        S3ObjectStore {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }

    fn classify_sdk_error<E: std::fmt::Display>(e: E, key: &str) -> StorageError {
        // The AWS SDK's error types don't expose a clean "is this transient"
        // predicate across all operations, so we conservatively treat
        // everything except an explicit not-found as transient — retrying a
        // permanent error a bounded number of times is cheap compared to
        // mis-classifying a transient network blip as permanent and giving
        // up on an upload that would have succeeded on retry.
        StorageError::Transient(format!("s3 error for {key}: {e}"))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Self::classify_sdk_error(e, key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("NoSuchKey") {
                    StorageError::NotFound(key.to_string())
                } else {
                    Self::classify_sdk_error(e, key)
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Self::classify_sdk_error(e, key))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        // S3 DeleteObject is idempotent by design: deleting a missing key
        // returns success rather than an error.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::classify_sdk_error(e, key))?;
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        validate_key(key)?;
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Permanent(format!("invalid ttl: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| Self::classify_sdk_error(e, key))?;
        Ok(request.uri().to_string())
    }
}
