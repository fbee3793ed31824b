//! Integration coverage for the pipeline's concurrency and drain properties.
//! Exercises the public `run_ingestion` entry point against the in-memory
//! fakes gated behind the `test-support` feature.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use netatmo_archive_ingest::object_store::test_support::FakeObjectStore;
use netatmo_archive_ingest::store::test_support::FakeDocumentStore;
use netatmo_archive_ingest::{
    ArchiveKey, Config, DataRequest, DocumentStore, ObjectStoreClient, Result, StationMap,
};

fn gzip_json(value: &serde_json::Value) -> Bytes {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(value.to_string().as_bytes()).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

fn config(store_concurrency: usize, db_concurrency: usize) -> Config {
    Config {
        s3_bucket: "bucket".into(),
        s3_access_key: "key".into(),
        s3_secret_key: "secret".into(),
        s3_region: "eu-west-1".into(),
        mongo_uri: "mongodb://localhost:27017".into(),
        mongo_database: "netatmo".into(),
        mongo_write_concern_w: 1,
        file_workers: 4,
        json_workers: 4,
        store_concurrency,
        db_concurrency,
        min_chunk_size: 1,
        json_queue_capacity: 8,
        region: None,
    }
}

fn request(start: &str, end: &str) -> DataRequest {
    DataRequest::new(start.parse().unwrap(), end.parse().unwrap(), 10, None).unwrap()
}

/// Wraps an `ObjectStoreClient`, tracking the maximum number of fetches
/// observed in flight at once and sleeping briefly inside each call so
/// concurrent callers actually overlap.
struct CountingObjectStore<C> {
    inner: C,
    in_flight: AtomicUsize,
    max_seen: AtomicUsize,
}

impl<C> CountingObjectStore<C> {
    fn new(inner: C) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<C: ObjectStoreClient> ObjectStoreClient for CountingObjectStore<C> {
    async fn fetch(&self, key: &ArchiveKey) -> Result<Bytes> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.fetch(key).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Same shape for the document-store side of the pipeline.
struct CountingDocumentStore<D> {
    inner: D,
    in_flight: AtomicUsize,
    max_seen: AtomicUsize,
}

impl<D> CountingDocumentStore<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<D: DocumentStore> DocumentStore for CountingDocumentStore<D> {
    async fn upsert_stations(
        &self,
        chunk: &StationMap,
    ) -> Result<netatmo_archive_ingest::store::UpsertReport> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.upsert_stations(chunk).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn fetch_and_write_concurrency_stay_within_configured_caps() {
    let store_concurrency = 2;
    let db_concurrency = 2;

    let mut object_store = FakeObjectStore::new();
    let mut instant: chrono::DateTime<chrono::Utc> = "2016-04-01T00:00:00Z".parse().unwrap();
    for i in 0..12 {
        let key = ArchiveKey::from_instant(instant);
        let archive = serde_json::json!([
            {"_id": format!("station-{i}"), "location": [5.0, 52.0], "data": {"time_utc": instant.timestamp()}}
        ]);
        object_store = object_store.with_object(key.as_str(), gzip_json(&archive));
        instant += chrono::Duration::minutes(10);
    }

    let object_store = Arc::new(CountingObjectStore::new(object_store));
    let document_store = Arc::new(CountingDocumentStore::new(FakeDocumentStore::new()));

    let report = netatmo_archive_ingest::run_ingestion(
        &request("2016-04-01T00:00:00Z", "2016-04-01T01:50:00Z"),
        object_store.clone(),
        document_store.clone(),
        &config(store_concurrency, db_concurrency),
    )
    .await
    .unwrap();

    assert_eq!(report.keys_enumerated, 12);
    assert_eq!(report.keys_fetched, 12);
    assert!(report.errors.is_empty());

    assert!(
        object_store.max_seen.load(Ordering::SeqCst) <= store_concurrency,
        "fetch concurrency exceeded store_concurrency"
    );
    assert!(
        document_store.max_seen.load(Ordering::SeqCst) <= db_concurrency,
        "write concurrency exceeded db_concurrency"
    );
}

#[tokio::test]
async fn drains_every_key_regardless_of_worker_count() {
    let mut object_store = FakeObjectStore::new();
    let mut instant: chrono::DateTime<chrono::Utc> = "2016-04-01T00:00:00Z".parse().unwrap();
    for i in 0..30 {
        let key = ArchiveKey::from_instant(instant);
        let archive = serde_json::json!([
            {"_id": format!("station-{i}"), "location": [5.0, 52.0], "data": {"time_utc": instant.timestamp()}}
        ]);
        object_store = object_store.with_object(key.as_str(), gzip_json(&archive));
        instant += chrono::Duration::minutes(10);
    }
    let document_store = Arc::new(FakeDocumentStore::new());

    let mut cfg = config(3, 3);
    cfg.file_workers = 2;
    cfg.json_workers = 2;

    let report = netatmo_archive_ingest::run_ingestion(
        &request("2016-04-01T00:00:00Z", "2016-04-01T04:50:00Z"),
        Arc::new(object_store),
        document_store.clone(),
        &cfg,
    )
    .await
    .unwrap();

    assert_eq!(report.keys_enumerated, 30);
    assert_eq!(report.keys_fetched, 30);
    assert_eq!(report.stations_upserted, 30);
    assert_eq!(document_store.documents.lock().unwrap().len(), 30);
}
