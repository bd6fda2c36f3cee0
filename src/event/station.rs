//! Seismic stations.

use serde::{Deserialize, Serialize};

/// Station identity: network, station code, and location code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StationId {
    pub network: String,
    pub station: String,
    pub location: String,
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.network, self.station, self.location)
    }
}

/// A station with its geographic position. Immutable for the life of an
/// event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    /// Geographic latitude (deg)
    pub latitude: f64,
    /// Longitude (deg)
    pub longitude: f64,
    /// Elevation above the geoid (m)
    pub elevation: f64,
}
