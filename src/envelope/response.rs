//! Output envelope: the location result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::closeout::CloseoutSummary;
use crate::event::Event;
use crate::status::ExitCode;

use super::request::{LocRequest, PickSource, Site};
use super::{seconds_to_datetime, EnvelopeError};

/// One principal axis on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EllipseAxisOut {
    /// Semi-axis length (km).
    pub semi_len: f64,
    /// Azimuth (deg clockwise from north).
    pub azimuth: f64,
    /// Plunge below horizontal (deg).
    pub plunge: f64,
}

/// The error ellipsoid on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEllipseOut {
    pub e0: EllipseAxisOut,
    pub e1: EllipseAxisOut,
    pub e2: EllipseAxisOut,
    /// Largest horizontal projection (km).
    pub maximum_horizontal_projection: f64,
    /// Largest vertical projection (km).
    pub maximum_vertical_projection: f64,
    /// Equivalent horizontal radius (km).
    pub equivalent_horizontal_radius: f64,
}

/// One supporting pick mirroring the input, with location extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportingPick {
    pub id: String,
    pub site: Site,
    pub source: PickSource,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub picked_phase: Option<String>,
    #[serde(default)]
    pub associated_phase: Option<String>,
    /// Phase the locator settled on.
    pub located_phase: String,
    /// Travel-time residual (s).
    pub residual: f64,
    /// Epicentral distance (deg).
    pub distance: f64,
    /// Azimuth from the epicentre (deg).
    pub azimuth: f64,
    /// Final statistical weight.
    pub weight: f64,
    /// Data importance.
    pub importance: f64,
    /// Whether the pick was used in the final solution.
    pub used: bool,
}

/// The location result for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocResult {
    pub id: String,
    pub exit_code: ExitCode,

    pub origin_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: f64,

    /// 90 % marginal errors: origin time (s) and position (km).
    pub origin_time_error: f64,
    pub latitude_error: f64,
    pub longitude_error: f64,
    pub depth_error: f64,

    pub error_ellipse: ErrorEllipseOut,

    pub number_of_associated_stations: usize,
    pub number_of_associated_phases: usize,
    pub number_of_used_stations: usize,
    pub number_of_used_phases: usize,

    /// Azimuthal gap (deg).
    pub gap: f64,
    /// Robust azimuthal gap (deg).
    pub secondary_gap: f64,
    /// Minimum epicentral distance (deg).
    pub minimum_distance: f64,
    /// RMS of the used residuals (s).
    pub rms: f64,

    pub quality: String,

    /// Bayesian depth prior in force at close-out (km).
    pub bayesian_depth: f64,
    /// Prior range, three spreads (km).
    pub bayesian_range: f64,
    /// Importance of the depth prior.
    pub depth_importance: f64,

    pub supporting_data: Vec<SupportingPick>,
}

impl LocResult {
    /// Serialise to JSON text.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the result from a finished event.
    pub fn from_event(
        request: &LocRequest,
        event: &Event,
        summary: &CloseoutSummary,
        exit_code: ExitCode,
    ) -> Self {
        let ellipse = &summary.ellipse;
        let axis = |i: usize| EllipseAxisOut {
            semi_len: ellipse.axes[i].semi_len,
            azimuth: ellipse.axes[i].azimuth,
            plunge: ellipse.axes[i].plunge,
        };

        let supporting_data = request
            .input_data
            .iter()
            .map(|input| {
                let located = event
                    .picks
                    .iter()
                    .find(|p| p.external_id == input.id);
                let group = located.and_then(|p| {
                    event
                        .groups
                        .iter()
                        .find(|g| g.picks.iter().any(|&i| event.picks[i].external_id == p.external_id))
                });
                SupportingPick {
                    id: input.id.clone(),
                    site: input.site.clone(),
                    source: input.source.clone(),
                    time: input.time,
                    picked_phase: input.picked_phase.clone(),
                    associated_phase: input.associated_phase.clone(),
                    located_phase: located.map_or_else(String::new, |p| p.current_phase.clone()),
                    residual: located.map_or(0.0, |p| p.residual),
                    distance: group.map_or(0.0, |g| g.distance_deg),
                    azimuth: group.map_or(0.0, |g| g.azimuth_deg),
                    weight: located.map_or(0.0, |p| p.weight),
                    importance: located.map_or(0.0, |p| p.importance),
                    used: located.is_some_and(|p| p.is_used),
                }
            })
            .collect();

        let min_distance = event.minimum_distance();
        Self {
            id: request.id.clone(),
            exit_code,
            origin_time: seconds_to_datetime(event.hypocenter.origin_time),
            latitude: event.hypocenter.latitude,
            longitude: event.hypocenter.longitude,
            depth: event.hypocenter.depth,
            origin_time_error: summary.time_error,
            latitude_error: summary.latitude_error,
            longitude_error: summary.longitude_error,
            depth_error: summary.depth_error,
            error_ellipse: ErrorEllipseOut {
                e0: axis(0),
                e1: axis(1),
                e2: axis(2),
                maximum_horizontal_projection: ellipse.max_horizontal,
                maximum_vertical_projection: ellipse.max_vertical,
                equivalent_horizontal_radius: ellipse.equivalent_radius,
            },
            number_of_associated_stations: event.stations_associated(),
            number_of_associated_phases: event.picks_associated(),
            number_of_used_stations: event.stations_used(),
            number_of_used_phases: event.picks_used(),
            gap: summary.azimuthal_gap,
            secondary_gap: summary.robust_gap,
            minimum_distance: if min_distance.is_finite() {
                min_distance
            } else {
                0.0
            },
            rms: if summary.status.has_solution() {
                event.rms_residual()
            } else {
                0.0
            },
            quality: summary.quality.to_string(),
            bayesian_depth: event.hypocenter.bayes_depth,
            bayesian_range: 3.0 * event.hypocenter.bayes_spread,
            depth_importance: summary.bayes_importance,
            supporting_data,
        }
    }

    /// A terminal failure result that still echoes the input picks.
    pub fn failure(request: &LocRequest, exit_code: ExitCode) -> Self {
        let supporting_data = request
            .input_data
            .iter()
            .map(|input| SupportingPick {
                id: input.id.clone(),
                site: input.site.clone(),
                source: input.source.clone(),
                time: input.time,
                picked_phase: input.picked_phase.clone(),
                associated_phase: input.associated_phase.clone(),
                located_phase: String::new(),
                residual: 0.0,
                distance: 0.0,
                azimuth: 0.0,
                weight: 0.0,
                importance: 0.0,
                used: false,
            })
            .collect();
        Self {
            id: request.id.clone(),
            exit_code,
            origin_time: request.source_origin_time,
            latitude: request.source_latitude,
            longitude: request.source_longitude,
            depth: request.source_depth,
            origin_time_error: 0.0,
            latitude_error: 0.0,
            longitude_error: 0.0,
            depth_error: 0.0,
            error_ellipse: ErrorEllipseOut::default(),
            number_of_associated_stations: 0,
            number_of_associated_phases: request.input_data.len(),
            number_of_used_stations: 0,
            number_of_used_phases: 0,
            gap: 360.0,
            secondary_gap: 360.0,
            minimum_distance: 0.0,
            rms: 0.0,
            quality: "D".to_string(),
            bayesian_depth: 0.0,
            bayesian_range: 0.0,
            depth_importance: 0.0,
            supporting_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ExitCode;

    fn request() -> LocRequest {
        LocRequest::from_json(
            r#"{
                "id": "evt-2",
                "sourceOriginTime": "2024-01-01T00:00:00.000Z",
                "sourceLatitude": 10.0,
                "sourceLongitude": 20.0,
                "sourceDepth": 33.0,
                "inputData": [{
                    "id": "pk-1",
                    "site": {"station": "AAA", "channel": "BHZ", "network": "XX",
                             "latitude": 11.0, "longitude": 20.0, "elevation": 0.0},
                    "source": {"agencyID": "xx", "author": "a", "type": "LocalAutomatic"},
                    "time": "2024-01-01T00:00:25.000Z",
                    "pickedPhase": "Pg"
                }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_failure_echoes_input() {
        let req = request();
        let result = LocResult::failure(&req, ExitCode::NotEnoughData);
        assert_eq!(result.exit_code, ExitCode::NotEnoughData);
        assert_eq!(result.supporting_data.len(), 1);
        assert_eq!(result.supporting_data[0].id, "pk-1");
        assert!(!result.supporting_data[0].used);
        assert!((result.latitude - 10.0).abs() < f64::EPSILON);
        assert!((result.gap - 360.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_result_round_trips_through_json() {
        let req = request();
        let result = LocResult::failure(&req, ExitCode::BadInput);
        let text = result.to_json().unwrap();
        assert!(text.contains("\"exitCode\": \"BadInput\""));
        let back: LocResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.exit_code, ExitCode::BadInput);
        assert_eq!(back.supporting_data.len(), 1);
    }
}
