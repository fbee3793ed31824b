//! # Example
//!
//! ```no_run
//! # async fn run() -> netatmo_archive_ingest::Result<()> {
//! tracing_subscriber::fmt::init();
//!
//! let config = netatmo_archive_ingest::Config::from_env().map_err(netatmo_archive_ingest::IngestError::Fatal)?;
//! let request = netatmo_archive_ingest::DataRequest::new(
//!     "2016-04-01T00:00:00Z".parse().unwrap(),
//!     "2016-04-01T00:10:00Z".parse().unwrap(),
//!     10,
//!     None,
//! )?;
//!
//! let report = netatmo_archive_ingest::ingest(&request, &config).await?;
//! println!("{} keys fetched", report.keys_fetched);
//! # Ok(())
//! # }
//! ```
//!
//! This library only depends on the `tracing` facade; installing a
//! subscriber (as shown above with `tracing-subscriber`, a dev-dependency
//! used here and in doc-tests) is left to the binary that embeds it.

pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod object_store;
pub mod planner;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use error::{IngestError, Result};
pub use model::{ArchiveKey, DataRequest, Region, Station, StationMap};
pub use object_store::{Credentials, CredentialsProvider, ObjectStoreClient, S3ObjectStore, StaticCredentials};
pub use pipeline::{run_ingestion, IngestionReport};
pub use store::{DocumentStore, MongoStore};

/// Build the object store and document store from `config`, then run a
/// request to completion. The thin wiring layer a binary entry point calls.
pub async fn ingest(request: &DataRequest, config: &Config) -> error::Result<IngestionReport> {
    let credentials = Credentials::new(
        config.s3_bucket.clone(),
        config.s3_access_key.clone(),
        config.s3_secret_key.clone(),
    )
    .with_region(config.s3_region.clone());
    let object_store: std::sync::Arc<dyn ObjectStoreClient> =
        std::sync::Arc::new(S3ObjectStore::new(StaticCredentials::new(credentials)));

    let document_store: std::sync::Arc<dyn DocumentStore> = std::sync::Arc::new(
        MongoStore::connect(&config.mongo_uri, &config.mongo_database, config.mongo_write_concern_w)
            .await
            .map_err(IngestError::Fatal)?,
    );

    run_ingestion(request, object_store, document_store, config).await
}
