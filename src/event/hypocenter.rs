//! The trial hypocenter.

use crate::config::DepthConfig;
use crate::geo;

/// Origin time and position of the trial solution, with cached geocentric
/// trigonometry for the derivative rotations.
#[derive(Debug, Clone)]
pub struct Hypocenter {
    /// Origin time (s since epoch).
    pub origin_time: f64,
    /// Geographic latitude (deg).
    pub latitude: f64,
    /// Longitude (deg).
    pub longitude: f64,
    /// Depth below the geoid (km).
    pub depth: f64,

    /// Geocentric colatitude (deg) and its trig, cached.
    pub colatitude: f64,
    pub sin_colat: f64,
    pub cos_colat: f64,
    pub sin_lon: f64,
    pub cos_lon: f64,

    /// Spatial degrees of freedom: 3, or 2 when depth is held.
    pub degrees_of_freedom: usize,

    /// Bayesian depth prior currently in force (km) and its spread.
    pub bayes_depth: f64,
    pub bayes_spread: f64,
}

impl Hypocenter {
    pub fn new(origin_time: f64, latitude: f64, longitude: f64, depth: f64) -> Self {
        let mut h = Self {
            origin_time,
            latitude,
            longitude,
            depth,
            colatitude: 0.0,
            sin_colat: 0.0,
            cos_colat: 0.0,
            sin_lon: 0.0,
            cos_lon: 0.0,
            degrees_of_freedom: 3,
            bayes_depth: depth,
            bayes_spread: 0.0,
        };
        h.refresh_trig();
        h
    }

    /// Recompute the cached geocentric trigonometry after a position change.
    fn refresh_trig(&mut self) {
        self.colatitude = geo::colatitude(self.latitude);
        let colat_rad = self.colatitude.to_radians();
        self.sin_colat = colat_rad.sin();
        self.cos_colat = colat_rad.cos();
        let lon_rad = self.longitude.to_radians();
        self.sin_lon = lon_rad.sin();
        self.cos_lon = lon_rad.cos();
    }

    /// Set all four coordinates directly, clamping depth into range.
    pub fn set(&mut self, origin_time: f64, latitude: f64, longitude: f64, depth: f64, cfg: &DepthConfig) {
        self.origin_time = origin_time;
        self.latitude = latitude;
        self.longitude = longitude;
        self.depth = depth.clamp(cfg.depth_min_km, cfg.depth_max_km);
        self.refresh_trig();
    }

    /// Apply a step vector (north, east, down km) plus an origin-time shift.
    ///
    /// The depth component is ignored entirely when depth is held; otherwise
    /// the result is clamped into the model range.
    pub fn apply_step(&mut self, step: &[f64; 3], dt0: f64, cfg: &DepthConfig) {
        let (lat, lon) = geo::offset_position(self.latitude, self.longitude, step[0], step[1]);
        self.latitude = lat;
        self.longitude = lon;
        if self.degrees_of_freedom >= 3 {
            self.depth = (self.depth + step[2]).clamp(cfg.depth_min_km, cfg.depth_max_km);
        }
        self.origin_time += dt0;
        self.refresh_trig();
    }

    /// Update the Bayesian depth terms.
    pub fn set_bayes(&mut self, depth: f64, spread: f64) {
        self.bayes_depth = depth;
        self.bayes_spread = spread;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trig_cache_follows_position() {
        let mut h = Hypocenter::new(0.0, 0.0, 0.0, 10.0);
        assert!((h.colatitude - 90.0).abs() < 1.0e-9);
        assert!((h.sin_colat - 1.0).abs() < 1.0e-9);
        h.set(0.0, 45.0, 90.0, 10.0, &DepthConfig::default());
        assert!(h.cos_colat > 0.0);
        assert!((h.sin_lon - 1.0).abs() < 1.0e-9);
    }

    #[test]
    fn test_depth_clamped_on_step() {
        let cfg = DepthConfig::default();
        let mut h = Hypocenter::new(0.0, 10.0, 10.0, 5.0);
        h.apply_step(&[0.0, 0.0, -50.0], 0.0, &cfg);
        assert!((h.depth - cfg.depth_min_km).abs() < 1.0e-12);
        h.apply_step(&[0.0, 0.0, 1.0e4], 0.0, &cfg);
        assert!((h.depth - cfg.depth_max_km).abs() < 1.0e-12);
    }

    #[test]
    fn test_held_depth_never_moves() {
        let cfg = DepthConfig::default();
        let mut h = Hypocenter::new(0.0, 10.0, 10.0, 33.0);
        h.degrees_of_freedom = 2;
        h.apply_step(&[5.0, -3.0, 100.0], 1.5, &cfg);
        assert!((h.depth - 33.0).abs() < 1.0e-12);
        assert!((h.origin_time - 1.5).abs() < 1.0e-12);
        assert!(h.latitude > 10.0);
    }
}
