//! Ingestion Pipeline orchestrator.
//!
//! Bounded two-stage producer/consumer pipeline: file workers fetch and
//! decode archives then shard the resulting per-station map onto a bounded
//! queue; DB workers drain that queue and upsert each shard. Grounded on
//! `original_source/domain/ingestion_service.py::MultiProcessingTest.run`
//! for the two-semaphore, two-queue shape. The worker-loop / atomics-for-stats
//! idiom follows this crate's ancestor's worker loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::codec::decode_and_parse;
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::model::{ArchiveKey, DataRequest, ParseStats, Region, StationMap};
use crate::object_store::ObjectStoreClient;
use crate::planner::plan_keys;
use crate::store::DocumentStore;

/// Running counters, readable from another task while a run is in flight.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub keys_fetched: AtomicU64,
    pub not_found: AtomicU64,
    pub stations_upserted: AtomicU64,
    pub stations_skipped: AtomicU64,
}

/// Final tally returned once every worker has drained and exited.
#[derive(Debug, Default)]
pub struct IngestionReport {
    pub keys_enumerated: usize,
    pub keys_fetched: usize,
    pub not_found: usize,
    pub parse_stats: Vec<(ArchiveKey, ParseStats)>,
    pub stations_upserted: u64,
    pub stations_skipped: u64,
    pub errors: Vec<IngestError>,
}

/// Split a file worker's output into chunks of `max(ceil(len/json_workers),
/// min_chunk_size)` stations each, so no single upsert call grows unbounded
/// on a large archive.
fn shard(stations: StationMap, json_workers: usize, min_chunk_size: usize) -> Vec<StationMap> {
    if stations.is_empty() {
        return Vec::new();
    }
    let chunk_len = stations
        .len()
        .div_ceil(json_workers.max(1))
        .max(min_chunk_size.max(1));

    let mut chunks = Vec::new();
    let mut current: StationMap = HashMap::new();
    for (id, station) in stations {
        current.insert(id, station);
        if current.len() >= chunk_len {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[allow(clippy::too_many_arguments)]
async fn run_file_worker(
    keys: Arc<Mutex<mpsc::UnboundedReceiver<ArchiveKey>>>,
    json_tx: mpsc::Sender<StationMap>,
    error_tx: mpsc::UnboundedSender<IngestError>,
    parse_stats_tx: mpsc::UnboundedSender<(ArchiveKey, ParseStats)>,
    store_sem: Arc<Semaphore>,
    object_store: Arc<dyn ObjectStoreClient>,
    region: Option<Region>,
    json_workers: usize,
    min_chunk_size: usize,
    stats: Arc<IngestStats>,
) {
    loop {
        let key = {
            let mut guard = keys.lock().await;
            guard.recv().await
        };
        let Some(key) = key else { break };

        let fetched = {
            let _permit = store_sem.acquire().await.expect("store semaphore never closes");
            object_store.fetch(&key).await
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                if matches!(err, IngestError::NotFound { .. }) {
                    stats.not_found.fetch_add(1, Ordering::Relaxed);
                }
                tracing::error!(key = %key, error = %err, "failed to fetch archive");
                let _ = error_tx.send(err);
                continue;
            }
        };
        stats.keys_fetched.fetch_add(1, Ordering::Relaxed);

        let (stations, parse_stats) = match decode_and_parse(&bytes, &key, region.as_ref()) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "failed to decode archive");
                let _ = error_tx.send(err);
                continue;
            }
        };
        let _ = parse_stats_tx.send((key, parse_stats));

        for chunk in shard(stations, json_workers, min_chunk_size) {
            if json_tx.send(chunk).await.is_err() {
                // DB workers have already exited; nothing left to drain into.
                return;
            }
        }
    }
}

async fn run_db_worker(
    json_rx: Arc<Mutex<mpsc::Receiver<StationMap>>>,
    error_tx: mpsc::UnboundedSender<IngestError>,
    db_sem: Arc<Semaphore>,
    document_store: Arc<dyn DocumentStore>,
    stats: Arc<IngestStats>,
) {
    loop {
        let chunk = {
            let mut guard = json_rx.lock().await;
            guard.recv().await
        };
        let Some(chunk) = chunk else { break };

        let _permit = db_sem.acquire().await.expect("db semaphore never closes");
        match document_store.upsert_stations(&chunk).await {
            Ok(report) => {
                stats.stations_upserted.fetch_add(report.upserted, Ordering::Relaxed);
                stats.stations_skipped.fetch_add(report.skipped, Ordering::Relaxed);
                if report.failed > 0 {
                    tracing::error!(failed = report.failed, "bulk upsert partially failed");
                    let _ = error_tx.send(IngestError::StoreWriteError {
                        source: anyhow::anyhow!(
                            "{} operation(s) failed in unordered bulk write",
                            report.failed
                        ),
                    });
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "bulk upsert failed");
                let _ = error_tx.send(err);
            }
        }
    }
}

/// Drive a full ingestion run: plan keys, fetch/decode/shard on
/// `config.file_workers` tasks, upsert on `config.json_workers` tasks, and
/// wait for every worker to drain before returning a summary. A failure on
/// one key or chunk is recorded and the run continues.
pub async fn run_ingestion(
    request: &DataRequest,
    object_store: Arc<dyn ObjectStoreClient>,
    document_store: Arc<dyn DocumentStore>,
    config: &Config,
) -> Result<IngestionReport> {
    let keys = plan_keys(request)?;
    let keys_enumerated = keys.len();
    tracing::info!(key_count = keys_enumerated, "planned archive keys");

    let (file_tx, file_rx) = mpsc::unbounded_channel();
    for key in keys {
        let _ = file_tx.send(key);
    }
    drop(file_tx);
    let file_rx = Arc::new(Mutex::new(file_rx));

    let (json_tx, json_rx) = mpsc::channel(config.json_queue_capacity.max(1));
    let json_rx = Arc::new(Mutex::new(json_rx));

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let (parse_stats_tx, mut parse_stats_rx) = mpsc::unbounded_channel();

    let store_sem = Arc::new(Semaphore::new(config.store_concurrency.max(1)));
    let db_sem = Arc::new(Semaphore::new(config.db_concurrency.max(1)));
    let stats = Arc::new(IngestStats::default());

    let mut file_handles: Vec<JoinHandle<()>> = Vec::with_capacity(config.file_workers.max(1));
    for _ in 0..config.file_workers.max(1) {
        file_handles.push(tokio::spawn(run_file_worker(
            file_rx.clone(),
            json_tx.clone(),
            error_tx.clone(),
            parse_stats_tx.clone(),
            store_sem.clone(),
            object_store.clone(),
            request.region,
            config.json_workers.max(1),
            config.min_chunk_size,
            stats.clone(),
        )));
    }
    // Each file worker holds its own clone; dropping this one lets the json
    // queue close once every file worker has exited.
    drop(json_tx);
    drop(parse_stats_tx);

    let mut db_handles: Vec<JoinHandle<()>> = Vec::with_capacity(config.json_workers.max(1));
    for _ in 0..config.json_workers.max(1) {
        db_handles.push(tokio::spawn(run_db_worker(
            json_rx.clone(),
            error_tx.clone(),
            db_sem.clone(),
            document_store.clone(),
            stats.clone(),
        )));
    }
    drop(error_tx);

    for handle in file_handles {
        handle
            .await
            .map_err(|err| IngestError::Fatal(anyhow::anyhow!(err)))?;
    }
    for handle in db_handles {
        handle
            .await
            .map_err(|err| IngestError::Fatal(anyhow::anyhow!(err)))?;
    }

    let mut errors = Vec::new();
    while let Some(err) = error_rx.recv().await {
        errors.push(err);
    }

    let mut parse_stats = Vec::new();
    while let Some(entry) = parse_stats_rx.recv().await {
        parse_stats.push(entry);
    }

    let report = IngestionReport {
        keys_enumerated,
        keys_fetched: stats.keys_fetched.load(Ordering::Relaxed) as usize,
        not_found: stats.not_found.load(Ordering::Relaxed) as usize,
        parse_stats,
        stations_upserted: stats.stations_upserted.load(Ordering::Relaxed),
        stations_skipped: stats.stations_skipped.load(Ordering::Relaxed),
        errors,
    };
    tracing::info!(
        keys_enumerated = report.keys_enumerated,
        keys_fetched = report.keys_fetched,
        not_found = report.not_found,
        stations_upserted = report.stations_upserted,
        error_count = report.errors.len(),
        "ingestion run complete"
    );
    Ok(report)
}
