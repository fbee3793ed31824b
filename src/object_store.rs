//! Object-Store Client.
//!
//! Grounded on `original_source/domain/aws_engine.py::S3Bucket` for the
//! transport shape, and on the `DataSource` trait in
//! `examples/other_examples/229b27f3_metno-rove__lustre_netatmo-src-lib.rs.rs`
//! for making the client an async trait the pipeline is generic over.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use bytes::Bytes;

use crate::error::{IngestError, Result};
use crate::model::ArchiveKey;

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);

/// Bucket/access/secret triple, acquired once per fetch. No caching is
/// assumed — mirrors the source's `load_credentials.py` contract, though
/// parsing the on-disk credentials file is out of scope for this crate.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Credentials {
    pub fn new(bucket: impl Into<String>, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            // Fixed to eu-west-1 unless overridden.
            region: "eu-west-1".to_string(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// The common case: credentials already resolved in memory.
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Error taxonomy the transport classifies into, before the retry loop in
/// `fetch` turns `Transient` into either a retried attempt or (on success)
/// a `Bytes` result.
enum FetchOutcome {
    Ok(Bytes),
    NotFound,
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// The calling worker awaits this future to completion, including
    /// any internal retry loop, before moving on to the next key.
    async fn fetch(&self, key: &ArchiveKey) -> Result<Bytes>;
}

pub struct S3ObjectStore<P: CredentialsProvider> {
    credentials: P,
}

impl<P: CredentialsProvider> S3ObjectStore<P> {
    pub fn new(credentials: P) -> Self {
        Self { credentials }
    }

    async fn client_for(&self, credentials: &Credentials) -> aws_sdk_s3::Client {
        let creds = aws_credential_types::Credentials::new(
            credentials.access_key.clone(),
            credentials.secret_key.clone(),
            None,
            None,
            "netatmo-archive-ingest",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(credentials.region.clone()))
            .credentials_provider(creds)
            .load()
            .await;
        aws_sdk_s3::Client::new(&config)
    }

    async fn try_fetch(&self, key: &ArchiveKey) -> FetchOutcome {
        let credentials = match self.credentials.credentials().await {
            Ok(c) => c,
            Err(err) => return FetchOutcome::Fatal(anyhow::anyhow!(err)),
        };
        let client = self.client_for(&credentials).await;

        match client
            .get_object()
            .bucket(&credentials.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(output) => match output.body.collect().await {
                Ok(body) => FetchOutcome::Ok(body.into_bytes()),
                Err(err) => FetchOutcome::Transient(anyhow::anyhow!(err)),
            },
            Err(SdkError::ServiceError(service_err)) => match service_err.err() {
                GetObjectError::NoSuchKey(_) => FetchOutcome::NotFound,
                other => FetchOutcome::Fatal(anyhow::anyhow!(other.to_string())),
            },
            Err(err @ SdkError::TimeoutError(_))
            | Err(err @ SdkError::DispatchFailure(_))
            | Err(err @ SdkError::ConstructionFailure(_)) => {
                FetchOutcome::Transient(anyhow::anyhow!(err.to_string()))
            }
            Err(err) => FetchOutcome::Fatal(anyhow::anyhow!(err.to_string())),
        }
    }
}

#[async_trait]
impl<P: CredentialsProvider> ObjectStoreClient for S3ObjectStore<P> {
    async fn fetch(&self, key: &ArchiveKey) -> Result<Bytes> {
        loop {
            match self.try_fetch(key).await {
                FetchOutcome::Ok(bytes) => return Ok(bytes),
                FetchOutcome::NotFound => {
                    return Err(IngestError::NotFound { key: key.clone() });
                }
                FetchOutcome::Transient(source) => {
                    tracing::warn!(key = %key, error = %source, "transient object store error, trying again in 10 seconds");
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
                FetchOutcome::Fatal(source) => {
                    return Err(IngestError::Fatal(source));
                }
            }
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fake used by codec/pipeline tests. Not part of the public API.
    pub struct FakeObjectStore {
        objects: HashMap<String, Bytes>,
        /// Number of Transient errors to return for a key before succeeding.
        transient_then_ok: Mutex<HashMap<String, u32>>,
    }

    impl FakeObjectStore {
        pub fn new() -> Self {
            Self {
                objects: HashMap::new(),
                transient_then_ok: Mutex::new(HashMap::new()),
            }
        }

        pub fn with_object(mut self, key: &str, bytes: Bytes) -> Self {
            self.objects.insert(key.to_string(), bytes);
            self
        }

        pub fn fail_transiently(mut self, key: &str, times: u32) -> Self {
            self.transient_then_ok
                .lock()
                .unwrap()
                .insert(key.to_string(), times);
            self
        }
    }

    #[async_trait]
    impl ObjectStoreClient for FakeObjectStore {
        async fn fetch(&self, key: &ArchiveKey) -> Result<Bytes> {
            loop {
                let owed = {
                    let mut guard = self.transient_then_ok.lock().unwrap();
                    match guard.get_mut(key.as_str()) {
                        Some(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if !owed {
                    break;
                }
                tracing::warn!(key = %key, "transient object store error, trying again in 10 seconds");
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }

            match self.objects.get(key.as_str()) {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(IngestError::NotFound { key: key.clone() }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeObjectStore;
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn s6_transient_failures_retry_then_succeed() {
        let key = ArchiveKey::from_instant("2016-04-01T00:00:00Z".parse().unwrap());
        let store = Arc::new(
            FakeObjectStore::new()
                .with_object(key.as_str(), Bytes::from_static(b"payload"))
                .fail_transiently(key.as_str(), 2),
        );

        let store_for_task = store.clone();
        let key_for_task = key.clone();
        let handle = tokio::spawn(async move { store_for_task.fetch(&key_for_task).await });

        // Two transient failures are owed before the object resolves; each
        // is separated by a full backoff sleep.
        tokio::time::advance(TRANSIENT_BACKOFF).await;
        tokio::time::advance(TRANSIENT_BACKOFF).await;

        let bytes = handle.await.unwrap().unwrap();
        assert_eq!(bytes, Bytes::from_static(b"payload"));
    }
}
