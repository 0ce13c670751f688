//! Media object storage: presigned write/read URLs and cleanup.
//!
//! Devices never hold storage credentials. The lifecycle mints a PUT URL
//! scoped to exactly one object key, and later a GET URL for readers.

use crate::config::S3Config;
use crate::models::WriteTarget;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to presign {key}: {reason}")]
    Presign { key: String, reason: String },

    #[error("Object storage request failed: {0}")]
    Request(String),
}

/// Presigned URL with its expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Mint a PUT URL valid for `expiry`, scoped to `key`.
    async fn presign_put(&self, key: &str, expiry: Duration) -> Result<WriteTarget, StorageError>;

    /// Mint a GET URL valid for `expiry`.
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<ReadUrl, StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

/// Object key for an event's snapshot.
/// Format: snapshots/{date}/{device_id}/{event_id}.jpg
pub fn snapshot_key(device_id: &str, event_id: Uuid, created_at: DateTime<Utc>) -> String {
    format!(
        "snapshots/{date}/{device_id}/{event_id}.jpg",
        date = created_at.format("%Y-%m-%d"),
        device_id = sanitize_path_component(device_id),
        event_id = event_id,
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn expires_at(expiry: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::zero())
}

/// S3/MinIO storage.
///
/// URLs are signed by a second client configured with the public endpoint
/// when one is set; the signature covers the host, so it cannot be rewritten
/// after signing.
pub struct S3ObjectStorage {
    client: S3Client,
    presign_client: S3Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let build_client = |endpoint: Option<&String>| {
            let mut builder = S3ConfigBuilder::from(&aws_config);
            if let Some(endpoint_url) = endpoint {
                builder = builder.endpoint_url(endpoint_url);
            }
            // MinIO needs path-style addressing
            if config.force_path_style {
                builder = builder.force_path_style(true);
            }
            S3Client::from_conf(builder.build())
        };

        let client = build_client(config.endpoint_url.as_ref());
        let presign_client = build_client(
            config
                .public_endpoint_url
                .as_ref()
                .or(config.endpoint_url.as_ref()),
        );

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_endpoint = ?config.public_endpoint_url,
            "S3 object storage initialized"
        );

        Ok(Self {
            client,
            presign_client,
            bucket: config.bucket.clone(),
        })
    }

    /// Create the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                Ok(())
            }
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if !not_found {
                    return Err(e).context("Failed to check bucket");
                }

                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .context("Failed to create bucket")?;

                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    #[instrument(skip(self))]
    async fn presign_put(&self, key: &str, expiry: Duration) -> Result<WriteTarget, StorageError> {
        let presigning_config =
            PresigningConfig::expires_in(expiry).map_err(|e| StorageError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let presigned = self
            .presign_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(WriteTarget {
            url: presigned.uri().to_string(),
            object_key: key.to_string(),
            expires_at: expires_at(expiry),
        })
    }

    #[instrument(skip(self))]
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<ReadUrl, StorageError> {
        let presigning_config =
            PresigningConfig::expires_in(expiry).map_err(|e| StorageError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let presigned = self
            .presign_client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(ReadUrl {
            url: presigned.uri().to_string(),
            expires_at: expires_at(expiry),
        })
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to delete object");
                StorageError::Request(e.to_string())
            })?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryObjectStorage;

#[cfg(any(test, feature = "test-support"))]
mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Storage that keeps objects in a map. URLs look like
    /// `memory://{bucket}/{key}`.
    pub struct MemoryObjectStorage {
        bucket: String,
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryObjectStorage {
        pub fn new(bucket: impl Into<String>) -> Self {
            Self {
                bucket: bucket.into(),
                objects: Mutex::new(HashMap::new()),
            }
        }

        /// Store an object as a device PUT to a write target would.
        pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
            self.objects.lock().insert(key.to_string(), data.into());
        }

        pub fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.objects.lock().get(key).cloned()
        }

        /// Key addressed by a URL this storage minted.
        pub fn key_for_url<'a>(&self, url: &'a str) -> Option<&'a str> {
            url.strip_prefix("memory://")?
                .strip_prefix(self.bucket.as_str())?
                .strip_prefix('/')
        }

        fn url(&self, key: &str) -> String {
            format!("memory://{}/{}", self.bucket, key)
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryObjectStorage {
        async fn presign_put(
            &self,
            key: &str,
            expiry: Duration,
        ) -> Result<WriteTarget, StorageError> {
            Ok(WriteTarget {
                url: self.url(key),
                object_key: key.to_string(),
                expires_at: expires_at(expiry),
            })
        }

        async fn presign_get(&self, key: &str, expiry: Duration) -> Result<ReadUrl, StorageError> {
            Ok(ReadUrl {
                url: self.url(key),
                expires_at: expires_at(expiry),
            })
        }

        async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
            self.objects.lock().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_key_format() {
        let event_id = Uuid::nil();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(
            snapshot_key("front-door", event_id, at),
            "snapshots/2024-03-09/front-door/00000000-0000-0000-0000-000000000000.jpg"
        );
    }

    #[test]
    fn test_snapshot_key_sanitizes_device() {
        let key = snapshot_key("../../etc", Uuid::nil(), Utc::now());
        assert!(key.contains("/______etc/"));
        assert!(!key.contains(".."));
    }

    #[tokio::test]
    async fn test_memory_storage_urls() {
        let storage = MemoryObjectStorage::new("media");
        let target = storage
            .presign_put("snapshots/a.jpg", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(target.url, "memory://media/snapshots/a.jpg");
        assert_eq!(storage.key_for_url(&target.url), Some("snapshots/a.jpg"));
        assert!(target.expires_at > Utc::now());

        storage.put("snapshots/a.jpg", b"jpeg".to_vec());
        storage.delete_object("snapshots/a.jpg").await.unwrap();
        assert!(storage.get("snapshots/a.jpg").is_none());
    }
}
