//! Blob storage capability.
//!
//! The pipelines only ever `put` on upload, `get` during ingestion, and
//! `exists` during orphan cleanup; everything else about the blob store is
//! someone else's problem. The production adapter speaks the S3 REST API
//! directly with SigV4 signing ([`crate::aws`]) and supports custom
//! endpoints for S3-compatible services (MinIO, LocalStack). The
//! in-memory adapter backs the test suite.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::aws::{self, AwsCredentials, SigningRequest};
use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage request timed out")]
    Timeout,
    #[error("storage service error: {0}")]
    Service(String),
    #[error("storage auth error: {0}")]
    Auth(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store bytes under `key`; returns the location reference
    /// (the key itself for both adapters).
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Fetch the bytes at `location`.
    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    /// Whether an object exists at `location`. Maintenance path only
    /// (orphan cleanup); the hot paths never call it.
    async fn exists(&self, location: &str) -> Result<bool, StorageError>;

    /// Connectivity probe for health reporting. Never writes.
    async fn ping(&self) -> bool;
}

// ============ In-memory adapter ============

/// In-memory storage for tests: a guarded map from key to bytes.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an object, simulating out-of-band deletion (used by cleanup
    /// and crash-redelivery tests).
    pub fn remove(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        self.objects.write().unwrap().insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(location.to_string()))
    }

    async fn exists(&self, location: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().unwrap().contains_key(location))
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ============ S3 adapter ============

/// Production storage adapter: S3 REST API with SigV4 signing.
pub struct S3Storage {
    config: StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let creds = AwsCredentials::from_env().map_err(|e| StorageError::Auth(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::Service(e.to_string()))?;

        Ok(Self {
            config: config.clone(),
            creds,
            client,
        })
    }

    /// Resolve (host for signing, full URL, canonical URI) for an object.
    ///
    /// AWS proper uses virtual-hosted style; custom endpoints use
    /// path-style (`/{bucket}/{key}`), which is what MinIO and LocalStack
    /// expect.
    fn object_target(&self, key: &str) -> (String, String, String) {
        let encoded_key: String = key
            .split('/')
            .map(aws::uri_encode)
            .collect::<Vec<_>>()
            .join("/");

        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let host = base
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let canonical_uri = format!("/{}/{}", self.config.bucket, encoded_key);
                let url = format!("{}{}", base, canonical_uri);
                (host, url, canonical_uri)
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                );
                let canonical_uri = format!("/{}", encoded_key);
                let url = format!("https://{}{}", host, canonical_uri);
                (host, url, canonical_uri)
            }
        }
    }

    fn signed(&self, method: &str, key: &str, payload: &[u8]) -> (String, Vec<(String, String)>) {
        let (host, url, canonical_uri) = self.object_target(key);
        let headers = aws::sign(
            &self.creds,
            &SigningRequest {
                method,
                host: &host,
                canonical_uri: &canonical_uri,
                canonical_query: "",
                extra_headers: &[],
                payload,
                region: &self.config.region,
                service: "s3",
            },
        );
        (url, headers)
    }

    fn map_err(e: reqwest::Error) -> StorageError {
        if e.is_timeout() {
            StorageError::Timeout
        } else {
            StorageError::Service(e.to_string())
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let (url, headers) = self.signed("PUT", key, &bytes);

        let mut req = self
            .client
            .put(&url)
            .header("content-type", content_type)
            .body(bytes);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(Self::map_err)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Service(format!(
                "PutObject failed (HTTP {}): {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        Ok(key.to_string())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        let (url, headers) = self.signed("GET", location, b"");

        let mut req = self.client.get(&url);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(Self::map_err)?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(StorageError::NotFound(location.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Service(format!(
                "GetObject failed (HTTP {}) for key '{}'",
                status, location
            )));
        }

        let bytes = resp.bytes().await.map_err(Self::map_err)?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, location: &str) -> Result<bool, StorageError> {
        let (url, headers) = self.signed("HEAD", location, b"");

        let mut req = self.client.head(&url);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(Self::map_err)?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(StorageError::Service(format!(
                "HeadObject failed (HTTP {}) for key '{}'",
                status, location
            )));
        }
        Ok(true)
    }

    async fn ping(&self) -> bool {
        // A signed HEAD against a probe key proves reachability and auth;
        // a clean 404 is as good as a hit.
        self.exists("__ragpipe_ping__").await.is_ok()
    }
}

/// Deterministic storage key for a document: prefix, document id, then the
/// original filename. Keeping the id in the key makes re-uploads of the
/// same name distinct while cleanup can still find a document's blob.
pub fn storage_key(prefix: &str, document_id: uuid::Uuid, filename: &str) -> String {
    format!("{}/{}/{}", prefix.trim_end_matches('/'), document_id, filename)
}
