//! Archive Codec.
//!
//! gzip-decode, decode UTF-8, parse structured records, sanitize, filter by
//! region, fold into per-station observation series. Grounded field-for-field
//! on `original_source/domain/json_parser.py`.

use std::io::Read;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::model::{ArchiveKey, ParseStats, Region, Station, StationMap};

/// One entry in the archive's record list. `location: [lon, lat]`, `_id`,
/// and `data` are the three mandatory top-level fields; records missing
/// any of them are dropped.
#[derive(Debug, Deserialize)]
struct RawRecord {
    location: Option<(f64, f64)>,
    #[serde(rename = "_id")]
    id: Option<String>,
    data: Option<serde_json::Map<String, Value>>,
}

fn as_f64(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(f64::NAN)
}

fn as_epoch_seconds(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

fn epoch_seconds_to_utc(epoch_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_seconds, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Attempt a thermo-module append. Requires `time_utc`. Duplicate
/// `validDatetime` (equal to the station's prior last entry) is silently
/// dropped — equality is on the timestamp only, not the scalars.
fn parse_thermo(data: &serde_json::Map<String, Value>, station: &mut Station) -> bool {
    let Some(time_utc) = as_epoch_seconds(data.get("time_utc")) else {
        return false;
    };
    let valid_datetime = epoch_seconds_to_utc(time_utc);

    if station
        .thermo_module
        .valid_datetime
        .last()
        .is_some_and(|last| *last == valid_datetime)
    {
        return false;
    }

    station.thermo_module.valid_datetime.push(valid_datetime);
    station.thermo_module.temperature.push(as_f64(data.get("Temperature")));
    station.thermo_module.humidity.push(as_f64(data.get("Humidity")));
    station.thermo_module.pressure.push(as_f64(data.get("Pressure")));
    true
}

/// Attempt a hydro-module append. Requires both `time_day_rain` and
/// `time_hour_rain`.
fn parse_hydro(data: &serde_json::Map<String, Value>, station: &mut Station) -> bool {
    let (Some(time_day_rain), Some(time_hour_rain)) = (
        as_epoch_seconds(data.get("time_day_rain")),
        as_epoch_seconds(data.get("time_hour_rain")),
    ) else {
        return false;
    };

    station
        .hydro_module
        .time_day_rain
        .push(epoch_seconds_to_utc(time_day_rain));
    station
        .hydro_module
        .time_hour_rain
        .push(epoch_seconds_to_utc(time_hour_rain));
    station.hydro_module.daily_rain_sum.push(as_f64(data.get("Rain")));
    station
        .hydro_module
        .hourly_rain_sum
        .push(as_f64(data.get("sum_rain_1")));
    true
}

/// Decode a fetched archive and fold it into a per-station observation map,
/// filtered by `region`.
pub fn decode_and_parse(
    bytes: &Bytes,
    key: &ArchiveKey,
    region: Option<&Region>,
) -> Result<(StationMap, ParseStats)> {
    let mut decoder = GzDecoder::new(bytes.as_ref());
    let mut text = String::new();
    decoder.read_to_string(&mut text).map_err(|err| IngestError::DecodeError {
        key: key.clone(),
        source: anyhow::anyhow!(err),
    })?;

    let records: Vec<RawRecord> = serde_json::from_str(&text).map_err(|err| IngestError::DecodeError {
        key: key.clone(),
        source: anyhow::anyhow!(err),
    })?;

    let mut stats = ParseStats {
        stations_in_file: records.len(),
        ..ParseStats::default()
    };
    let mut stations: StationMap = StationMap::new();

    for record in records {
        let (Some((lon, lat)), Some(station_id), Some(data)) =
            (record.location, record.id, record.data)
        else {
            continue;
        };

        if let Some(region) = region {
            if !region.contains(lat, lon) {
                stats.stations_out_of_region += 1;
                continue;
            }
        }

        let station = stations.entry(station_id.clone()).or_insert_with(|| {
            stats.new_stations += 1;
            Station::new(station_id, lat, lon)
        });

        if parse_thermo(&data, station) {
            stats.station_thermo_contributions += 1;
        }
        if parse_hydro(&data, station) {
            stats.station_hydro_contributions += 1;
        }
    }

    stats.station_count = stations.len();
    tracing::debug!(
        key = %key,
        station_count = stats.station_count,
        stations_in_file = stats.stations_in_file,
        stations_out_of_region = stats.stations_out_of_region,
        new_stations = stats.new_stations,
        thermo_contributions = stats.station_thermo_contributions,
        hydro_contributions = stats.station_hydro_contributions,
        "parsed archive"
    );

    Ok((stations, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip_json(value: &Value) -> Bytes {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(value.to_string().as_bytes()).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn key() -> ArchiveKey {
        ArchiveKey::from_instant("2016-04-01T00:00:00Z".parse().unwrap())
    }

    #[test]
    fn s2_single_thermo_record() {
        let archive = serde_json::json!([
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468800, "Temperature": 10.0}}
        ]);
        let region = Region::new(53.68, 2.865, 50.74, 7.323).unwrap();
        let (stations, stats) = decode_and_parse(&gzip_json(&archive), &key(), Some(&region)).unwrap();

        assert_eq!(stats.station_count, 1);
        assert_eq!(stats.station_thermo_contributions, 1);
        assert_eq!(stats.station_hydro_contributions, 0);

        let station = &stations["A"];
        assert_eq!(station.thermo_module.temperature, vec![10.0]);
        assert!(station.thermo_module.humidity[0].is_nan());
        assert!(station.thermo_module.pressure[0].is_nan());
        assert!(station.hydro_module.is_empty());
        assert_eq!(
            station.thermo_module.valid_datetime[0],
            "2016-04-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn s3_duplicate_timestamp_is_suppressed() {
        let archive = serde_json::json!([
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468800, "Temperature": 10.0}},
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468800, "Temperature": 11.0}},
        ]);
        let (stations, stats) = decode_and_parse(&gzip_json(&archive), &key(), None).unwrap();

        assert_eq!(stats.station_thermo_contributions, 1);
        assert_eq!(stations["A"].thermo_module.valid_datetime.len(), 1);
        assert_eq!(stations["A"].thermo_module.temperature, vec![10.0]);
    }

    #[test]
    fn s4_out_of_region_is_dropped() {
        let archive = serde_json::json!([
            {"_id": "A", "location": [0.0, 0.0], "data": {"time_utc": 1459468800}}
        ]);
        let region = Region::new(53.68, 2.865, 50.74, 7.323).unwrap();
        let (stations, stats) = decode_and_parse(&gzip_json(&archive), &key(), Some(&region)).unwrap();

        assert_eq!(stats.stations_out_of_region, 1);
        assert!(stations.is_empty());
    }

    #[test]
    fn s5_thermo_only_and_hydro_only_coexist() {
        let archive = serde_json::json!([
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468800}},
            {"_id": "B", "location": [5.0, 52.0], "data": {"time_day_rain": 1459468800, "time_hour_rain": 1459468800}},
        ]);
        let (stations, stats) = decode_and_parse(&gzip_json(&archive), &key(), None).unwrap();

        assert_eq!(stats.station_thermo_contributions, 1);
        assert_eq!(stats.station_hydro_contributions, 1);
        assert!(stations["A"].hydro_module.is_empty());
        assert!(!stations["A"].thermo_module.is_empty());
        assert!(stations["B"].thermo_module.is_empty());
        assert!(!stations["B"].hydro_module.is_empty());
    }

    #[test]
    fn drops_records_missing_mandatory_fields() {
        let archive = serde_json::json!([
            {"location": [5.0, 52.0], "data": {"time_utc": 1459468800}},
            {"_id": "B", "data": {"time_utc": 1459468800}},
            {"_id": "C", "location": [5.0, 52.0]},
        ]);
        let (stations, stats) = decode_and_parse(&gzip_json(&archive), &key(), None).unwrap();
        assert!(stations.is_empty());
        assert_eq!(stats.stations_in_file, 3);
        assert_eq!(stats.station_count, 0);
    }

    #[test]
    fn invariant_thermo_and_hydro_arrays_stay_aligned() {
        let archive = serde_json::json!([
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468800, "Humidity": 55.0}},
            {"_id": "A", "location": [5.0, 52.0], "data": {"time_utc": 1459468900, "Temperature": 11.0, "Pressure": 1013.0}},
        ]);
        let (stations, _) = decode_and_parse(&gzip_json(&archive), &key(), None).unwrap();
        let thermo = &stations["A"].thermo_module;
        assert!(thermo.is_consistent());
        assert!(thermo.valid_datetime[1] > thermo.valid_datetime[0]);
    }
}
