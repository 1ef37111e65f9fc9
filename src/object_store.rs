//! Bucket-addressed object store operations.
//!
//! Thin wrapper over the S3-style client for the operations the gateway
//! uses: artifact upload/download, existence checks, listing, deletion,
//! and presigned GET URLs. These paths are off the invoker's hot path
//! and carry the long artifact timeout from the profile.

use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use crate::{MimirError, Result};

/// One configured bucket and the client to reach it.
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload an object. Large payloads are permitted up to provider limits.
    pub async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("put_object {key}: {e}")))?;
        Ok(())
    }

    /// Download an object in full.
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("get_object {key}: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| MimirError::Transient(format!("get_object body {key}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    /// Whether an object exists, without fetching it.
    pub async fn head_object(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found())
                {
                    Ok(false)
                } else {
                    Err(MimirError::Transient(format!("head_object {key}: {err}")))
                }
            }
        }
    }

    /// Delete an object. Deleting a missing key succeeds.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("delete_object {key}: {e}")))?;
        Ok(())
    }

    /// List keys under a prefix, up to `max_keys`.
    pub async fn list_objects(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("list_objects {prefix}: {e}")))?;
        Ok(output
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect())
    }

    /// Presigned GET URL for sharing an object without credentials.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| MimirError::Client(format!("invalid presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| MimirError::Transient(format!("presign {key}: {e}")))?;
        Ok(request.uri().to_string())
    }
}
