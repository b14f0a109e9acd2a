//! AWS S3 storage implementation.
//!
//! Objects live under `{bucket}/{prefix}/{key}`. A single `PutObject` is
//! atomic for readers, which gives the same guarantee as the local
//! temp-and-rename write.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{AppError, Result};
use crate::storage::BlobStore;

/// S3-backed blob storage.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3 storage instance.
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Create S3 storage from environment configuration.
    pub async fn from_env() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);

        let bucket = std::env::var("DIGESTLINE_S3_BUCKET")
            .map_err(|_| AppError::config("DIGESTLINE_S3_BUCKET is not set"))?;
        let prefix = std::env::var("DIGESTLINE_S3_PREFIX").unwrap_or_else(|_| "digestline".into());

        Ok(Self::new(client, bucket, prefix))
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, object_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            object_key
        } else {
            object_key
                .strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(object_key)
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(AppError::storage(service_err))
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output.body.collect().await.map_err(AppError::storage)?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(AppError::storage(service_err))
                }
            }
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| AppError::storage(e.into_service_error()))?;

        log::debug!("Wrote s3://{}/{}", self.bucket, self.object_key(key));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        // Check-then-put; two racing writers can both succeed here.
        if self.exists(key).await? {
            return Ok(false);
        }
        self.put(key, bytes).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| AppError::storage(e.into_service_error()))?;

        log::debug!("Deleted s3://{}/{}", self.bucket, self.object_key(key));
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.object_key(prefix))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| AppError::storage(e.into_service_error()))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(self.strip_prefix(key).to_string());
                }
            }

            match output.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(key))
    }
}
