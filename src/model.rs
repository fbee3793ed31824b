//! Shared data contracts for the ingestion pipeline.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{IngestError, Result};

/// A lat/lon bounding box, edges inclusive. `top_lat >= bottom_lat` and
/// `left_lon <= right_lon`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub top_lat: f64,
    pub left_lon: f64,
    pub bottom_lat: f64,
    pub right_lon: f64,
}

impl Region {
    pub fn new(top_lat: f64, left_lon: f64, bottom_lat: f64, right_lon: f64) -> Result<Self> {
        if top_lat < bottom_lat || left_lon > right_lon {
            return Err(IngestError::InvalidRequest(format!(
                "region bounds are inverted: top_lat={top_lat} bottom_lat={bottom_lat} left_lon={left_lon} right_lon={right_lon}"
            )));
        }
        Ok(Self {
            top_lat,
            left_lon,
            bottom_lat,
            right_lon,
        })
    }

    /// Box test: `bottomLat <= lat <= topLat && leftLon <= lon <= rightLon`.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.bottom_lat <= lat && lat <= self.top_lat && self.left_lon <= lon && lon <= self.right_lon
    }
}

/// Immutable descriptor of a query.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Positive integer minutes; must evenly divide the archive cadence.
    pub step_minutes: i64,
    /// Absent means worldwide.
    pub region: Option<Region>,
}

impl DataRequest {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_minutes: i64,
        region: Option<Region>,
    ) -> Result<Self> {
        if step_minutes <= 0 {
            return Err(IngestError::InvalidRequest(
                "step must be a positive number of minutes".into(),
            ));
        }
        if end < start {
            return Err(IngestError::InvalidRequest(
                "end must not be earlier than start".into(),
            ));
        }
        Ok(Self {
            start,
            end,
            step_minutes,
            region,
        })
    }
}

/// A path of the form `netatmo_YYYYMMDD_HHMM.json.gz`, derived deterministically
/// from a UTC instant aligned to the request's step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        ArchiveKey(format!(
            "netatmo_{:04}{:02}{:02}_{:02}{:02}.json.gz",
            instant.format("%Y"),
            instant.format("%m"),
            instant.format("%d"),
            instant.format("%H"),
            instant.format("%M"),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column-oriented bundle of four equal-length sequences. Missing scalar
/// fields are recorded as NaN so the sequences stay aligned by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThermoModule {
    pub valid_datetime: Vec<DateTime<Utc>>,
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
    pub pressure: Vec<f64>,
}

impl ThermoModule {
    pub fn is_empty(&self) -> bool {
        self.valid_datetime.is_empty()
    }

    /// All four arrays must have identical length.
    pub fn is_consistent(&self) -> bool {
        let n = self.valid_datetime.len();
        self.temperature.len() == n && self.humidity.len() == n && self.pressure.len() == n
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydroModule {
    pub time_day_rain: Vec<DateTime<Utc>>,
    pub time_hour_rain: Vec<DateTime<Utc>>,
    pub daily_rain_sum: Vec<f64>,
    pub hourly_rain_sum: Vec<f64>,
}

impl HydroModule {
    pub fn is_empty(&self) -> bool {
        self.time_day_rain.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        let n = self.time_day_rain.len();
        self.time_hour_rain.len() == n
            && self.daily_rain_sum.len() == n
            && self.hourly_rain_sum.len() == n
    }
}

/// The observed entity. Exists only within a single file-worker's
/// output chunk; ownership transfers to a DB worker which
/// translates it into an upsert and discards it.
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub station_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Not set by the core; carried through for callers that augment it.
    pub elevation: Option<f64>,
    /// Sequential per-run alias, never populated by the ingestion path
    /// (see original_source/helpers/utils.py::add_alias). Query-path concern.
    pub alias: Option<u64>,
    pub thermo_module: ThermoModule,
    pub hydro_module: HydroModule,
}

impl Station {
    pub fn new(station_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            station_id: station_id.into(),
            latitude,
            longitude,
            elevation: None,
            alias: None,
            thermo_module: ThermoModule::default(),
            hydro_module: HydroModule::default(),
        }
    }

    pub fn has_thermo(&self) -> bool {
        !self.thermo_module.is_empty()
    }

    pub fn has_hydro(&self) -> bool {
        !self.hydro_module.is_empty()
    }
}

pub type StationMap = HashMap<String, Station>;

/// Per-archive counters, emitted to the log sink at DEBUG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub stations_in_file: usize,
    pub stations_out_of_region: usize,
    pub new_stations: usize,
    pub station_count: usize,
    pub station_thermo_contributions: usize,
    pub station_hydro_contributions: usize,
}
