//! Request/response envelopes.
//!
//! The structured records of the external contract: a `LocRequest` in, a
//! `LocResult` out, both camelCase on the wire. File and transport handling
//! belongs to callers; this module only defines the records and their
//! validation.

mod request;
mod response;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use request::{InputPick, LocRequest, PickSource, Site, SourceType};
pub use response::{EllipseAxisOut, ErrorEllipseOut, LocResult, SupportingPick};

/// Envelope-level failure.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad field: {0}")]
    BadField(String),
}

/// Convert a wire timestamp to engine seconds since the epoch.
pub fn datetime_to_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Convert engine seconds back to a wire timestamp. Out-of-range values
/// collapse to the epoch rather than panicking.
pub fn seconds_to_datetime(seconds: f64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis((seconds * 1000.0).round() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_round_trip() {
        let t = Utc.with_ymd_and_hms(2023, 2, 6, 1, 17, 34).unwrap();
        let seconds = datetime_to_seconds(t);
        assert!((seconds - 1_675_646_254.0).abs() < 1.0e-6);
        assert_eq!(seconds_to_datetime(seconds), t);
    }

    #[test]
    fn test_millisecond_precision_survives() {
        let seconds = 1_675_646_254.125;
        let t = seconds_to_datetime(seconds);
        assert!((datetime_to_seconds(t) - seconds).abs() < 1.0e-6);
    }
}
