//! Document Store Adapter.
//!
//! Builds, for each station in a chunk, a single upsert operation and
//! submits all of them in one unordered `Client::bulk_write` round-trip.
//! Grounded field-for-field on
//! `original_source/domain/mongodb_engine.py::MongoDBConnector.upsert_stations`
//! / `_construct_station_upsert_query`.

use async_trait::async_trait;
use bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{UpdateModifications, UpdateOneModel, WriteConcern, WriteModel};
use mongodb::{Client, Namespace};

use crate::error::{IngestError, Result};
use crate::model::{Station, StationMap};

/// Report for a single `upsert_stations` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub upserted: u64,
    /// Stations with neither a thermo nor an hourly-rain timestamp; they
    /// cannot be assigned a primary key and are dropped.
    pub skipped: u64,
    /// Individual operations the server reported as failed within an
    /// otherwise-successful unordered bulk write.
    pub failed: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_stations(&self, chunk: &StationMap) -> Result<UpsertReport>;
}

/// Calendar day (`YYYYMMDD`) of the station's first thermo timestamp, else
/// first hourly-rain timestamp. `None` if the station has neither.
fn calendar_day(station: &Station) -> Option<String> {
    station
        .thermo_module
        .valid_datetime
        .first()
        .or(station.hydro_module.time_hour_rain.first())
        .map(|ts| ts.format("%Y%m%d").to_string())
}

fn bson_datetimes(values: &[chrono::DateTime<chrono::Utc>]) -> Vec<Bson> {
    values
        .iter()
        .map(|v| Bson::DateTime(BsonDateTime::from_chrono(*v)))
        .collect()
}

fn bson_f64s(values: &[f64]) -> Vec<Bson> {
    values.iter().map(|v| Bson::Double(*v)).collect()
}

/// Build the `{_id, elevation, latitude, longitude}` set-on-insert document
/// plus the unordered per-module `$push`/`$each` appends, mirroring the
/// source's `_construct_station_upsert_query` one-to-one.
fn build_update(station: &Station, date: &str) -> Document {
    let mut set_on_insert = doc! {
        "elevation": station.elevation,
        "latitude": station.latitude,
        "longitude": station.longitude,
    };

    let mut push = Document::new();

    if station.has_hydro() {
        push.insert(
            "hydroModule.timeDayRain",
            doc! { "$each": bson_datetimes(&station.hydro_module.time_day_rain) },
        );
        push.insert(
            "hydroModule.timeHourRain",
            doc! { "$each": bson_datetimes(&station.hydro_module.time_hour_rain) },
        );
        push.insert(
            "hydroModule.dailyRainSum",
            doc! { "$each": bson_f64s(&station.hydro_module.daily_rain_sum) },
        );
        push.insert(
            "hydroModule.hourlyRainSum",
            doc! { "$each": bson_f64s(&station.hydro_module.hourly_rain_sum) },
        );
    } else {
        set_on_insert.insert("hydroModule", Bson::Null);
    }

    if station.has_thermo() {
        push.insert(
            "thermoModule.humidity",
            doc! { "$each": bson_f64s(&station.thermo_module.humidity) },
        );
        push.insert(
            "thermoModule.pressure",
            doc! { "$each": bson_f64s(&station.thermo_module.pressure) },
        );
        push.insert(
            "thermoModule.temperature",
            doc! { "$each": bson_f64s(&station.thermo_module.temperature) },
        );
        push.insert(
            "thermoModule.validDatetime",
            doc! { "$each": bson_datetimes(&station.thermo_module.valid_datetime) },
        );
    } else {
        set_on_insert.insert("thermoModule", Bson::Null);
    }

    set_on_insert.insert(
        "_id",
        doc! { "stationId": &station.station_id, "date": date },
    );

    let mut update = doc! { "$setOnInsert": set_on_insert };
    if !push.is_empty() {
        update.insert("$push", push);
    }
    update
}

pub struct MongoStore {
    client: Client,
    namespace: Namespace,
    write_concern: WriteConcern,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str, write_concern_w: u32) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let acknowledgment = mongodb::options::Acknowledgment::from(write_concern_w as i32);
        let write_concern = WriteConcern::builder().w(Some(acknowledgment)).build();
        let namespace = Namespace {
            db: database.to_string(),
            coll: "stations".to_string(),
        };
        Ok(Self {
            client,
            namespace,
            write_concern,
        })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn upsert_stations(&self, chunk: &StationMap) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let mut models = Vec::with_capacity(chunk.len());
        for station in chunk.values() {
            let Some(date) = calendar_day(station) else {
                report.skipped += 1;
                continue;
            };
            let filter = doc! { "_id": { "stationId": &station.station_id, "date": &date } };
            let update = build_update(station, &date);
            let model = UpdateOneModel::builder()
                .namespace(self.namespace.clone())
                .filter(filter)
                .update(UpdateModifications::Document(update))
                .upsert(true)
                .build();
            models.push(WriteModel::UpdateOne(model));
        }

        if models.is_empty() {
            return Ok(report);
        }
        let attempted = models.len() as u64;

        // A single unordered bulk write: every operation is attempted
        // regardless of whether an earlier one in the batch failed.
        match self
            .client
            .bulk_write(models)
            .ordered(false)
            .write_concern(self.write_concern.clone())
            .await
        {
            Ok(_) => {
                report.upserted += attempted;
                Ok(report)
            }
            Err(err) => match &*err.kind {
                ErrorKind::ClientBulkWrite(bulk_err) => {
                    let failed = bulk_err.write_errors.len() as u64;
                    for (index, write_error) in &bulk_err.write_errors {
                        tracing::warn!(
                            operation_index = index,
                            error = %write_error,
                            "bulk upsert operation failed"
                        );
                    }
                    report.failed += failed;
                    report.upserted += attempted.saturating_sub(failed);
                    Ok(report)
                }
                _ => Err(IngestError::StoreWriteError {
                    source: anyhow::anyhow!(err),
                }),
            },
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory fake store used by pipeline tests; avoids a live MongoDB
    /// dependency while exercising the same upsert/skip semantics.
    #[derive(Default)]
    pub struct FakeDocumentStore {
        pub documents: Mutex<HashMap<(String, String), Station>>,
    }

    impl FakeDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DocumentStore for FakeDocumentStore {
        async fn upsert_stations(&self, chunk: &StationMap) -> Result<UpsertReport> {
            let mut report = UpsertReport::default();
            let mut documents = self.documents.lock().unwrap();
            for station in chunk.values() {
                let Some(date) = calendar_day(station) else {
                    report.skipped += 1;
                    continue;
                };
                let key = (station.station_id.clone(), date);
                documents
                    .entry(key)
                    .and_modify(|existing| merge_station(existing, station))
                    .or_insert_with(|| station.clone());
                report.upserted += 1;
            }
            Ok(report)
        }
    }

    fn merge_station(existing: &mut Station, incoming: &Station) {
        if incoming.has_thermo() {
            existing.thermo_module.valid_datetime.extend(incoming.thermo_module.valid_datetime.iter().copied());
            existing.thermo_module.temperature.extend(incoming.thermo_module.temperature.iter().copied());
            existing.thermo_module.humidity.extend(incoming.thermo_module.humidity.iter().copied());
            existing.thermo_module.pressure.extend(incoming.thermo_module.pressure.iter().copied());
        }
        if incoming.has_hydro() {
            existing.hydro_module.time_day_rain.extend(incoming.hydro_module.time_day_rain.iter().copied());
            existing.hydro_module.time_hour_rain.extend(incoming.hydro_module.time_hour_rain.iter().copied());
            existing.hydro_module.daily_rain_sum.extend(incoming.hydro_module.daily_rain_sum.iter().copied());
            existing.hydro_module.hourly_rain_sum.extend(incoming.hydro_module.hourly_rain_sum.iter().copied());
        }
    }
}
