//! Time→Path Planner.
//!
//! Expands a time window at a fixed step into the ordered list of archive
//! object keys. Grounded on `original_source/domain/file_io.py::datetime_range`
//! + `datetime_to_file_name`.

use chrono::Duration;

use crate::error::{IngestError, Result};
use crate::model::{ArchiveKey, DataRequest};

/// Every instant `t` with `start <= t <= end` and `t = start + k*step`.
pub fn plan_keys(request: &DataRequest) -> Result<Vec<ArchiveKey>> {
    if request.step_minutes <= 0 {
        return Err(IngestError::InvalidRequest(
            "step must be a positive number of minutes".into(),
        ));
    }
    if request.end < request.start {
        return Err(IngestError::InvalidRequest(
            "end must not be earlier than start".into(),
        ));
    }

    let step = Duration::minutes(request.step_minutes);
    let mut keys = Vec::new();
    let mut instant = request.start;
    while instant <= request.end {
        keys.push(ArchiveKey::from_instant(instant));
        instant += step;
    }
    Ok(keys)
}
