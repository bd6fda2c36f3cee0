//! Input envelope: one location request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EnvelopeError;

fn default_earth_model() -> String {
    "ak135".to_string()
}

fn default_slab_resolution() -> String {
    "2spd".to_string()
}

fn default_true() -> bool {
    true
}

/// A single event to locate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocRequest {
    /// Opaque event identifier, echoed in the result.
    pub id: String,

    /// Earth model name for the travel-time service.
    #[serde(default = "default_earth_model")]
    pub earth_model: String,

    /// Slab model resolution for the auxiliary data.
    #[serde(default = "default_slab_resolution")]
    pub slab_resolution: String,

    /// Starting origin time.
    pub source_origin_time: DateTime<Utc>,
    /// Starting latitude (deg).
    pub source_latitude: f64,
    /// Starting longitude (deg).
    pub source_longitude: f64,
    /// Starting depth (km).
    pub source_depth: f64,

    /// Hold the whole hypocenter fixed.
    #[serde(default)]
    pub is_location_held: bool,
    /// Hold the depth only.
    #[serde(default)]
    pub is_depth_held: bool,
    /// The analyst supplies the Bayesian depth prior.
    #[serde(default)]
    pub is_bayesian_depth: bool,
    /// Analyst Bayesian depth (km), meaningful when `is_bayesian_depth`.
    #[serde(default)]
    pub bayesian_depth: f64,
    /// Analyst Bayesian spread (km).
    #[serde(default)]
    pub bayesian_spread: f64,
    /// This is a fresh location rather than a refinement restart.
    #[serde(default = "default_true")]
    pub is_location_new: bool,
    /// Decorrelate residuals before estimation.
    #[serde(default)]
    pub use_svd: bool,

    /// The observed picks.
    pub input_data: Vec<InputPick>,
}

/// Where a pick was recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub station: String,
    pub channel: String,
    pub network: String,
    #[serde(default)]
    pub location: String,
    /// Station latitude (deg).
    pub latitude: f64,
    /// Station longitude (deg).
    pub longitude: f64,
    /// Station elevation (m).
    pub elevation: f64,
}

/// Wire form of the author classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SourceType {
    ContributedAutomatic,
    LocalAutomatic,
    ContributedHuman,
    LocalHuman,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Who produced a pick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickSource {
    #[serde(rename = "agencyID", default)]
    pub agency_id: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
}

/// One observed arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPick {
    pub id: String,
    pub site: Site,
    pub source: PickSource,
    /// Arrival time.
    pub time: DateTime<Utc>,
    /// Phase code as picked.
    #[serde(default)]
    pub picked_phase: Option<String>,
    /// Phase code assigned by prior association.
    #[serde(default)]
    pub associated_phase: Option<String>,
    /// The contributor wants this pick used.
    #[serde(rename = "use", default = "default_true")]
    pub use_flag: bool,
    /// Picker standard error (s).
    #[serde(default)]
    pub quality: f64,
    /// Phase affinity; 0 selects the author-type default.
    #[serde(default)]
    pub affinity: f64,
}

impl InputPick {
    /// The phase code the locator should start from.
    pub fn starting_phase(&self) -> String {
        self.associated_phase
            .clone()
            .or_else(|| self.picked_phase.clone())
            .unwrap_or_default()
    }
}

impl LocRequest {
    /// Parse a request from JSON text.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let request: Self = serde_json::from_str(text)?;
        request.validate()?;
        Ok(request)
    }

    /// Structural validation; engine-level invariants (depth range) are
    /// checked by the engine itself.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::BadField("id must not be empty".to_string()));
        }
        if !(-90.0..=90.0).contains(&self.source_latitude) {
            return Err(EnvelopeError::BadField(format!(
                "sourceLatitude out of range: {}",
                self.source_latitude
            )));
        }
        if !(-360.0..=360.0).contains(&self.source_longitude) {
            return Err(EnvelopeError::BadField(format!(
                "sourceLongitude out of range: {}",
                self.source_longitude
            )));
        }
        if !self.source_depth.is_finite() {
            return Err(EnvelopeError::BadField("sourceDepth is not finite".to_string()));
        }
        if self.input_data.is_empty() {
            return Err(EnvelopeError::BadField("inputData is empty".to_string()));
        }
        if self.is_bayesian_depth && self.bayesian_spread <= 0.0 {
            return Err(EnvelopeError::BadField(
                "bayesianSpread must be positive when isBayesianDepth".to_string(),
            ));
        }
        for pick in &self.input_data {
            if !(-90.0..=90.0).contains(&pick.site.latitude) {
                return Err(EnvelopeError::BadField(format!(
                    "pick {} station latitude out of range",
                    pick.id
                )));
            }
            if pick.quality < 0.0 {
                return Err(EnvelopeError::BadField(format!(
                    "pick {} quality is negative",
                    pick.id
                )));
            }
            if pick.affinity < 0.0 {
                return Err(EnvelopeError::BadField(format!(
                    "pick {} affinity is negative",
                    pick.id
                )));
            }
        }
        Ok(())
    }
}
