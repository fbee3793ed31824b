use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::model::Region;

/// Tunables for a run, sourced from the environment with the same
/// `env::var().ok().and_then(parse).unwrap_or(default)` shape the rest of
/// this crate's ancestry uses for configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_region: String,

    pub mongo_uri: String,
    pub mongo_database: String,
    /// `w` value for the write concern used by bulk upserts.
    pub mongo_write_concern_w: u32,

    /// Worker count for the fetch+parse stage.
    pub file_workers: usize,
    /// Worker count for the upsert stage.
    pub json_workers: usize,
    /// Concurrent in-flight object-store fetches.
    pub store_concurrency: usize,
    /// Concurrent in-flight document-store writes.
    pub db_concurrency: usize,
    /// Lower bound on a sharded chunk's station count.
    pub min_chunk_size: usize,
    /// Capacity of the bounded queue between file workers and DB workers.
    pub json_queue_capacity: usize,

    pub region: Option<Region>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let s3_bucket = env::var("NETATMO_S3_BUCKET").context("NETATMO_S3_BUCKET is required")?;
        let s3_access_key =
            env::var("NETATMO_S3_ACCESS_KEY").context("NETATMO_S3_ACCESS_KEY is required")?;
        let s3_secret_key =
            env::var("NETATMO_S3_SECRET_KEY").context("NETATMO_S3_SECRET_KEY is required")?;
        let s3_region = env::var("NETATMO_S3_REGION").unwrap_or_else(|_| "eu-west-1".to_string());

        let mongo_uri =
            env::var("NETATMO_MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let mongo_database =
            env::var("NETATMO_MONGO_DATABASE").unwrap_or_else(|_| "netatmo".to_string());
        let mongo_write_concern_w = env::var("NETATMO_MONGO_WRITE_CONCERN_W")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        let cpus = num_cpus::get();
        let file_workers = env::var("NETATMO_FILE_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(2);
        let json_workers = env::var("NETATMO_JSON_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);
        let store_concurrency = env::var("NETATMO_STORE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(2);
        let db_concurrency = env::var("NETATMO_DB_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);
        let min_chunk_size = env::var("NETATMO_MIN_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(3000);
        let json_queue_capacity = env::var("NETATMO_JSON_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(|| (cpus * 2).max(1));

        let region = parse_region_env()?;

        Ok(Self {
            s3_bucket,
            s3_access_key,
            s3_secret_key,
            s3_region,
            mongo_uri,
            mongo_database,
            mongo_write_concern_w,
            file_workers,
            json_workers,
            store_concurrency,
            db_concurrency,
            min_chunk_size,
            json_queue_capacity,
            region,
        })
    }
}

/// `NETATMO_REGION="top_lat,left_lon,bottom_lat,right_lon"`, absent means worldwide.
fn parse_region_env() -> Result<Option<Region>> {
    let Some(raw) = env::var("NETATMO_REGION").ok().filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    let parts: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("NETATMO_REGION is not four comma-separated numbers: {raw}"))?;
    let [top_lat, left_lon, bottom_lat, right_lon]: [f64; 4] = parts
        .try_into()
        .map_err(|_| anyhow::anyhow!("NETATMO_REGION must have exactly four fields: {raw}"))?;
    Ok(Some(Region::new(top_lat, left_lon, bottom_lat, right_lon)?))
}
