//! Spherical geometry for source-receiver paths.
//!
//! All angles are in degrees at the API boundary. Latitudes are geographic;
//! they are converted to geocentric colatitude before any spherical-triangle
//! work because travel-time tables are indexed by geocentric distance.

/// Kilometres per degree of arc on the reference sphere.
pub const KM_PER_DEG: f64 = 111.19;

/// Squared complement of the Earth's flattening, `(1 - f)^2`.
///
/// Converts geographic to geocentric latitude: `tan(gc) = E2 * tan(gg)`.
const E2: f64 = 0.993_305_521;

/// Geocentric colatitude (degrees from the north pole) for a geographic
/// latitude in degrees.
pub fn colatitude(geographic_lat: f64) -> f64 {
    // Poles are fixed points of the conversion; atan is undefined there.
    if geographic_lat >= 90.0 {
        return 0.0;
    }
    if geographic_lat <= -90.0 {
        return 180.0;
    }
    90.0 - (E2 * geographic_lat.to_radians().tan()).atan().to_degrees()
}

/// Epicentral distance (degrees) and azimuth (degrees clockwise from north)
/// from a source to a receiver.
///
/// Inputs are geographic latitudes and longitudes in degrees. The azimuth is
/// measured at the source and normalised to [0, 360).
pub fn distance_azimuth(
    source_lat: f64,
    source_lon: f64,
    receiver_lat: f64,
    receiver_lon: f64,
) -> (f64, f64) {
    let c1 = colatitude(source_lat).to_radians();
    distance_azimuth_cached(c1.sin(), c1.cos(), source_lon, receiver_lat, receiver_lon)
}

/// Same as [`distance_azimuth`], with the source colatitude trigonometry
/// precomputed. The hypocenter caches these values so per-station geometry
/// refreshes skip the repeated conversion.
pub fn distance_azimuth_cached(
    source_sin_colat: f64,
    source_cos_colat: f64,
    source_lon: f64,
    receiver_lat: f64,
    receiver_lon: f64,
) -> (f64, f64) {
    let c2 = colatitude(receiver_lat).to_radians();
    let dlon = (receiver_lon - source_lon).to_radians();

    let cos_delta = source_cos_colat * c2.cos() + source_sin_colat * c2.sin() * dlon.cos();
    let delta = cos_delta.clamp(-1.0, 1.0).acos().to_degrees();

    let y = dlon.sin() * c2.sin();
    let x = source_sin_colat * c2.cos() - source_cos_colat * c2.sin() * dlon.cos();
    let mut azimuth = y.atan2(x).to_degrees();
    if azimuth < 0.0 {
        azimuth += 360.0;
    }

    (delta, azimuth)
}

/// Move a geographic point by a local Cartesian offset.
///
/// `north_km` and `east_km` are tangent-plane displacements; longitude change
/// degenerates near the poles, where the east component is dropped.
pub fn offset_position(lat: f64, lon: f64, north_km: f64, east_km: f64) -> (f64, f64) {
    let new_lat = (lat + north_km / KM_PER_DEG).clamp(-90.0, 90.0);
    let cos_lat = lat.to_radians().cos();
    let mut new_lon = if cos_lat > 1.0e-6 {
        lon + east_km / (KM_PER_DEG * cos_lat)
    } else {
        lon
    };
    if new_lon > 180.0 {
        new_lon -= 360.0;
    } else if new_lon < -180.0 {
        new_lon += 360.0;
    }
    (new_lat, new_lon)
}
