//! External collaborator interfaces.
//!
//! The engine consumes, but never implements, travel-time computation and
//! the auxiliary geographic tables (craton map, zone depth statistics, slab
//! model). Everything here is a pure-query trait: providers must be safe for
//! many concurrent readers and are never mutated by the engine.

use thiserror::Error;

/// Failure raised by a provider at the engine boundary.
///
/// Provider faults never surface inside the iteration; they are mapped to
/// `CouldNotReadTTData` / `CouldNotReadAuxData` exit codes by the service
/// facade.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("travel-time session failed: {0}")]
    TravelTime(String),

    #[error("auxiliary data unavailable: {0}")]
    Auxiliary(String),
}

// ============================================================================
// Travel times
// ============================================================================

/// One theoretical arrival returned by the travel-time service.
#[derive(Debug, Clone)]
pub struct TtArrival {
    /// Phase code, e.g. "Pn", "PKPdf", "Lg"
    pub phase_code: String,
    /// Phase group, e.g. "P", "S", "Reg"
    pub phase_group: String,
    /// Auxiliary group for the generic first-arrival family
    pub aux_group: Option<String>,
    /// Travel time from the source (s)
    pub travel_time: f64,
    /// Statistical spread of the residual model (s)
    pub spread: f64,
    /// Relative observability of this phase at this geometry
    pub observability: f64,
    /// Ray-parameter derivative dT/dDelta (s/deg)
    pub dtdd: f64,
    /// Depth derivative dT/dz (s/km)
    pub dtdz: f64,
    /// Whether the locator may use this phase at all
    pub can_use: bool,
    /// Whether the phase is disallowed at the current source depth
    pub is_disallowed: bool,
    /// Whether this is a regional crustal phase
    pub is_regional: bool,
    /// Half-width of the observability window around the arrival (s)
    pub window: f64,
}

impl TtArrival {
    /// P-versus-S classification from the leading letter of the phase group.
    pub fn is_p_type(&self) -> bool {
        self.phase_group.starts_with('P') || self.phase_group.starts_with('p')
    }
}

/// Source-side context for opening a travel-time session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Earth model name, e.g. "ak135"
    pub earth_model: String,
    /// Source depth (km)
    pub source_depth: f64,
    /// Source geographic latitude (deg)
    pub source_latitude: f64,
    /// Source longitude (deg)
    pub source_longitude: f64,
    /// Return all phases rather than the useful subset
    pub all_phases: bool,
    /// Return back branches of triplicated phases
    pub back_branches: bool,
    /// Source lies in a stable craton
    pub is_tectonic: bool,
    /// Prefer regional travel-time corrections
    pub use_regional: bool,
}

/// Receiver geometry handed to a session query.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverGeometry {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above the geoid (m)
    pub elevation: f64,
    /// Epicentral distance (deg)
    pub distance_deg: f64,
    /// Source-to-receiver azimuth (deg clockwise from north)
    pub azimuth_deg: f64,
}

/// A travel-time session opened for one source position and depth.
///
/// Sessions are re-opened by the phase identifier whenever the trial
/// hypocenter moves; they are cheap handles onto immutable tables.
pub trait TravelTimeSession {
    /// All theoretical arrivals at a receiver, ordered by travel time.
    fn arrivals(&self, receiver: &ReceiverGeometry) -> Vec<TtArrival>;

    /// Phase-group lookup for an observed phase code.
    fn find_group(&self, phase_code: &str, is_automatic: bool) -> Option<String>;
}

/// The travel-time service itself.
pub trait TravelTimeModel: Sync {
    /// Open a session for the given source context.
    fn new_session<'a>(
        &'a self,
        ctx: &SessionContext,
    ) -> Result<Box<dyn TravelTimeSession + 'a>, ProviderError>;
}

// ============================================================================
// Auxiliary geographic data
// ============================================================================

/// Classic zone depth statistics at an epicentre.
#[derive(Debug, Clone, Copy)]
pub struct ZoneStats {
    pub mean_depth: f64,
    pub min_depth: f64,
    pub max_depth: f64,
}

/// Revised zone depth statistics at an epicentre.
#[derive(Debug, Clone, Copy)]
pub struct NewZoneStats {
    pub mean_depth: f64,
    pub spread: f64,
}

/// One slab depth sample: central depth with lower and upper error bounds.
#[derive(Debug, Clone, Copy)]
pub struct SlabDepth {
    pub depth: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Craton map, zone statistics, and slab model queries.
pub trait AuxiliaryData: Sync {
    /// True when the point lies inside a stable craton.
    fn craton_contains(&self, latitude: f64, longitude: f64) -> bool;

    /// Classic zone statistics, if the cell has history.
    fn zone_stats(&self, latitude: f64, longitude: f64) -> Option<ZoneStats>;

    /// Revised zone statistics, if available.
    fn new_zone_stats(&self, latitude: f64, longitude: f64) -> Option<NewZoneStats>;

    /// Slab model depths under the point, shallowest first.
    fn slab_depths(&self, latitude: f64, longitude: f64) -> Option<Vec<SlabDepth>>;
}

// ============================================================================
// Inter-pick correlation model
// ============================================================================

/// The pick attributes the correlation kernel may depend on.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationContext {
    pub station_latitude: f64,
    pub station_longitude: f64,
    pub is_p_type: bool,
    /// Observability window of the identified phase (s)
    pub window: f64,
}

/// Empirical correlation between two picks' travel-time residuals.
///
/// Supplied by the travel-time ecosystem in production; the default model
/// below keeps the engine testable stand-alone.
pub trait CorrelationModel: Sync {
    /// Correlation coefficient in [0, 1]; the diagonal is handled by the
    /// decorrelator and is never requested here.
    fn correlation(&self, a: &CorrelationContext, b: &CorrelationContext) -> f64;
}

/// Distance-decay kernel: same-type picks decorrelate exponentially with
/// station separation, opposite types are uncorrelated.
#[derive(Debug, Clone)]
pub struct DistanceDecayCorrelation {
    /// E-folding station separation (deg)
    pub length_deg: f64,
}

impl DistanceDecayCorrelation {
    pub fn new(length_deg: f64) -> Self {
        Self { length_deg }
    }
}

impl CorrelationModel for DistanceDecayCorrelation {
    fn correlation(&self, a: &CorrelationContext, b: &CorrelationContext) -> f64 {
        if a.is_p_type != b.is_p_type {
            return 0.0;
        }
        let (sep, _) = crate::geo::distance_azimuth(
            a.station_latitude,
            a.station_longitude,
            b.station_latitude,
            b.station_longitude,
        );
        // Narrow observability windows decorrelate faster.
        let window_scale = (a.window.min(b.window) / a.window.max(b.window).max(1.0e-9)).sqrt();
        (-sep / self.length_deg.max(1.0e-6)).exp() * window_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(lat: f64, lon: f64, p: bool) -> CorrelationContext {
        CorrelationContext {
            station_latitude: lat,
            station_longitude: lon,
            is_p_type: p,
            window: 10.0,
        }
    }

    #[test]
    fn test_correlation_decays_with_separation() {
        let model = DistanceDecayCorrelation::new(5.0);
        let near = model.correlation(&ctx(0.0, 0.0, true), &ctx(0.0, 0.5, true));
        let far = model.correlation(&ctx(0.0, 0.0, true), &ctx(0.0, 20.0, true));
        assert!(near > far);
        assert!(near < 1.0);
        assert!(far >= 0.0);
    }

    #[test]
    fn test_cross_type_uncorrelated() {
        let model = DistanceDecayCorrelation::new(5.0);
        let c = model.correlation(&ctx(0.0, 0.0, true), &ctx(0.0, 0.1, false));
        assert!(c.abs() < f64::EPSILON);
    }

    #[test]
    fn test_colocated_same_type_near_unity() {
        let model = DistanceDecayCorrelation::new(5.0);
        let c = model.correlation(&ctx(10.0, 10.0, true), &ctx(10.0, 10.0, true));
        assert!((c - 1.0).abs() < 1.0e-9);
    }
}
