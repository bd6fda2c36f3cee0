//! Shared test fixtures: a self-consistent synthetic Earth and request
//! builders.
//!
//! The synthetic model is a homogeneous half-space with straight-ray P and
//! S phases. Its derivatives are the exact partials of its travel times, so
//! a pick set generated from a "true" hypocenter is exactly reproducible by
//! the locator.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Once;

use seisloc::envelope::{InputPick, LocRequest, PickSource, Site, SourceType};
use seisloc::geo::{self, KM_PER_DEG};
use seisloc::providers::{
    AuxiliaryData, NewZoneStats, ProviderError, ReceiverGeometry, SessionContext, SlabDepth,
    TravelTimeModel, TravelTimeSession, TtArrival, ZoneStats,
};

/// Install the test tracing subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Homogeneous half-space with body-wave speeds in km/s.
pub struct SyntheticEarth {
    pub vp: f64,
    pub vs: f64,
}

impl Default for SyntheticEarth {
    fn default() -> Self {
        Self { vp: 6.0, vs: 3.46 }
    }
}

/// Straight-ray travel time, distance derivative (s/deg), and depth
/// derivative (s/km) for one wave speed.
pub fn straight_ray(velocity: f64, distance_deg: f64, depth_km: f64) -> (f64, f64, f64) {
    let d_km = distance_deg * KM_PER_DEG;
    let r = (d_km * d_km + depth_km * depth_km).sqrt().max(1.0e-6);
    (
        r / velocity,
        d_km / (r * velocity) * KM_PER_DEG,
        depth_km / (r * velocity),
    )
}

pub struct SyntheticSession<'a> {
    model: &'a SyntheticEarth,
    depth: f64,
}

impl TravelTimeSession for SyntheticSession<'_> {
    fn arrivals(&self, receiver: &ReceiverGeometry) -> Vec<TtArrival> {
        let (tp, dtdd_p, dtdz_p) = straight_ray(self.model.vp, receiver.distance_deg, self.depth);
        let (ts, dtdd_s, dtdz_s) = straight_ray(self.model.vs, receiver.distance_deg, self.depth);
        vec![
            TtArrival {
                phase_code: "P".to_string(),
                phase_group: "P".to_string(),
                aux_group: None,
                travel_time: tp,
                spread: 1.0,
                observability: 10.0,
                dtdd: dtdd_p,
                dtdz: dtdz_p,
                can_use: true,
                is_disallowed: false,
                is_regional: false,
                window: 30.0,
            },
            TtArrival {
                phase_code: "S".to_string(),
                phase_group: "S".to_string(),
                aux_group: None,
                travel_time: ts,
                spread: 1.5,
                observability: 5.0,
                dtdd: dtdd_s,
                dtdz: dtdz_s,
                can_use: true,
                is_disallowed: false,
                is_regional: false,
                window: 30.0,
            },
        ]
    }

    fn find_group(&self, phase_code: &str, _is_automatic: bool) -> Option<String> {
        match phase_code.chars().next() {
            Some('P' | 'p') => Some("P".to_string()),
            Some('S' | 's') => Some("S".to_string()),
            Some('L') => Some("Reg".to_string()),
            _ => None,
        }
    }
}

impl TravelTimeModel for SyntheticEarth {
    fn new_session<'a>(
        &'a self,
        ctx: &SessionContext,
    ) -> Result<Box<dyn TravelTimeSession + 'a>, ProviderError> {
        Ok(Box::new(SyntheticSession {
            model: self,
            depth: ctx.source_depth,
        }))
    }
}

/// A travel-time service that always fails, for boundary-error tests.
pub struct BrokenEarth;

impl TravelTimeModel for BrokenEarth {
    fn new_session<'a>(
        &'a self,
        _ctx: &SessionContext,
    ) -> Result<Box<dyn TravelTimeSession + 'a>, ProviderError> {
        Err(ProviderError::TravelTime("table file missing".to_string()))
    }
}

/// Scriptable auxiliary data.
#[derive(Default)]
pub struct TestAux {
    pub craton: bool,
    pub slabs: Option<Vec<SlabDepth>>,
    pub new_zone: Option<NewZoneStats>,
    pub zone: Option<ZoneStats>,
}

impl AuxiliaryData for TestAux {
    fn craton_contains(&self, _latitude: f64, _longitude: f64) -> bool {
        self.craton
    }
    fn zone_stats(&self, _latitude: f64, _longitude: f64) -> Option<ZoneStats> {
        self.zone
    }
    fn new_zone_stats(&self, _latitude: f64, _longitude: f64) -> Option<NewZoneStats> {
        self.new_zone
    }
    fn slab_depths(&self, _latitude: f64, _longitude: f64) -> Option<Vec<SlabDepth>> {
        self.slabs.clone()
    }
}

/// The true source used to synthesise picks.
#[derive(Debug, Clone, Copy)]
pub struct TrueSource {
    pub origin: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: f64,
}

pub fn default_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 11, 4, 15, 0).unwrap()
}

/// Place a station at a given azimuth and distance from a point. The
/// placement is approximate; arrival times are always generated through
/// the same distance function the locator uses, so the data stay exactly
/// self-consistent.
pub fn station_at(lat: f64, lon: f64, azimuth_deg: f64, distance_deg: f64) -> (f64, f64) {
    let az = azimuth_deg.to_radians();
    let sta_lat = lat + distance_deg * az.cos();
    let sta_lon = lon + distance_deg * az.sin() / lat.to_radians().cos().max(0.2);
    (sta_lat, sta_lon)
}

/// Synthesise one P pick for a station.
pub fn p_pick(
    id: &str,
    source: &TrueSource,
    model: &SyntheticEarth,
    station_lat: f64,
    station_lon: f64,
    noise_s: f64,
) -> InputPick {
    let (distance, _) =
        geo::distance_azimuth(source.latitude, source.longitude, station_lat, station_lon);
    let (tp, _, _) = straight_ray(model.vp, distance, source.depth);
    let arrival = source.origin + Duration::milliseconds(((tp + noise_s) * 1000.0).round() as i64);
    InputPick {
        id: id.to_string(),
        site: Site {
            station: id.to_uppercase(),
            channel: "BHZ".to_string(),
            network: "SY".to_string(),
            location: "00".to_string(),
            latitude: station_lat,
            longitude: station_lon,
            elevation: 0.0,
        },
        source: PickSource {
            agency_id: "test".to_string(),
            author: "fixture".to_string(),
            source_type: SourceType::LocalHuman,
        },
        time: arrival,
        picked_phase: Some("P".to_string()),
        associated_phase: None,
        use_flag: true,
        quality: 0.3,
        affinity: 0.0,
    }
}

/// A request whose hypocenter starts at the given position with the given
/// pick set.
pub fn request_with_picks(
    id: &str,
    start: TrueSource,
    picks: Vec<InputPick>,
) -> LocRequest {
    LocRequest {
        id: id.to_string(),
        earth_model: "halfspace".to_string(),
        slab_resolution: "2spd".to_string(),
        source_origin_time: start.origin,
        source_latitude: start.latitude,
        source_longitude: start.longitude,
        source_depth: start.depth,
        is_location_held: false,
        is_depth_held: false,
        is_bayesian_depth: false,
        bayesian_depth: 0.0,
        bayesian_spread: 0.0,
        is_location_new: true,
        use_svd: false,
        input_data: picks,
    }
}

/// A ring of one-P-per-station picks around the true source.
pub fn ring_of_picks(
    source: &TrueSource,
    model: &SyntheticEarth,
    azimuths_and_distances: &[(f64, f64)],
) -> Vec<InputPick> {
    azimuths_and_distances
        .iter()
        .enumerate()
        .map(|(i, &(az, dist))| {
            let (sta_lat, sta_lon) = station_at(source.latitude, source.longitude, az, dist);
            p_pick(&format!("st{i:02}"), source, model, sta_lat, sta_lon, 0.0)
        })
        .collect()
}

/// Horizontal distance between the result and the true source (km).
pub fn epicentre_error_km(result_lat: f64, result_lon: f64, truth: &TrueSource) -> f64 {
    let (delta, _) = geo::distance_azimuth(truth.latitude, truth.longitude, result_lat, result_lon);
    delta * KM_PER_DEG
}
