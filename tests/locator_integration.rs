//! End-to-end locator scenarios against the synthetic half-space Earth.
//!
//! Every scenario builds a pick set from a known true source with the same
//! travel-time function the locator consults, so the truth is exactly
//! recoverable and the assertions can be tight.

mod common;

use common::{
    default_origin, epicentre_error_km, init_tracing, p_pick, request_with_picks, ring_of_picks,
    station_at, BrokenEarth, SyntheticEarth, TestAux, TrueSource,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use seisloc::providers::SlabDepth;
use seisloc::{ExitCode, Locator, LocatorConfig};

fn locator<'a>(
    model: &'a SyntheticEarth,
    aux: &'a TestAux,
) -> Locator<'a> {
    Locator::new(model, aux, LocatorConfig::default())
}

// ============================================================================
// Held hypocenter
// ============================================================================

#[test]
fn held_hypocenter_is_echoed_exactly() {
    init_tracing();
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 36.0,
        longitude: 28.0,
        depth: 10.0,
    };

    let picks = ring_of_picks(&truth, &model, &[(0.0, 5.0), (120.0, 45.0), (240.0, 90.0)]);
    let mut request = request_with_picks("held-1", truth, picks);
    request.is_location_held = true;

    let result = locator(&model, &aux).locate(&request);

    assert_eq!(result.exit_code, ExitCode::Success);
    assert_eq!(result.quality, "G");
    assert!((result.latitude - truth.latitude).abs() < 1.0e-9);
    assert!((result.longitude - truth.longitude).abs() < 1.0e-9);
    assert!((result.depth - truth.depth).abs() < 1.0e-9);
    assert_eq!(result.origin_time, truth.origin);
    // Residuals of a perfectly consistent pick set vanish at the held
    // hypocenter.
    assert!(result.rms < 1.0e-3, "rms = {}", result.rms);
    assert_eq!(result.number_of_used_stations, 3);
    // Held locations still report a three-axis ellipsoid.
    assert!(result.error_ellipse.e2.semi_len >= 0.0);
    assert!(result.error_ellipse.e0.semi_len > 0.0);
}

// ============================================================================
// Insufficient data
// ============================================================================

#[test]
fn single_station_returns_not_enough_data() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 10.0,
        longitude: 10.0,
        depth: 12.0,
    };

    let (sta_lat, sta_lon) = station_at(truth.latitude, truth.longitude, 45.0, 3.0);
    let mut p = p_pick("only", &truth, &model, sta_lat, sta_lon, 0.0);
    let mut s = p.clone();
    s.id = "only-s".to_string();
    s.time += chrono::Duration::seconds(40);
    p.id = "only-p".to_string();
    let request = request_with_picks("lonely", truth, vec![p, s]);

    let result = locator(&model, &aux).locate(&request);

    assert_eq!(result.exit_code, ExitCode::NotEnoughData);
    assert!(result.rms.abs() < f64::EPSILON);
    assert!((result.gap - 360.0).abs() < f64::EPSILON);
    assert!(result.error_ellipse.e0.semi_len.abs() < f64::EPSILON);
    // Supporting picks are echoed, unused and unweighted.
    assert_eq!(result.supporting_data.len(), 2);
    for pick in &result.supporting_data {
        assert!(!pick.used);
        assert!(pick.weight.abs() < f64::EPSILON);
        assert!(pick.importance.abs() < f64::EPSILON);
    }
}

// ============================================================================
// Multi-stage convergence
// ============================================================================

#[test]
fn displaced_start_converges_on_ring() {
    init_tracing();
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 35.0,
        longitude: 25.0,
        depth: 15.0,
    };

    // Twelve stations evenly in azimuth, distances interleaved so the
    // geometry is not a pure ring.
    let geometry: Vec<(f64, f64)> = (0..12)
        .map(|i| {
            let az = i as f64 * 30.0;
            let dist = if i % 2 == 0 { 1.2 } else { 2.8 };
            (az, dist)
        })
        .collect();
    let picks = ring_of_picks(&truth, &model, &geometry);

    // Start displaced ~50 km north, depth held at the true value.
    let start = TrueSource {
        latitude: truth.latitude + 50.0 / 111.19,
        ..truth
    };
    let mut request = request_with_picks("ring-12", start, picks);
    request.is_depth_held = true;

    let result = locator(&model, &aux).locate(&request);

    assert_eq!(result.exit_code, ExitCode::Success, "result: {result:?}");
    let miss = epicentre_error_km(result.latitude, result.longitude, &truth);
    assert!(miss < 3.0, "epicentre missed truth by {miss:.2} km");
    assert!((result.depth - truth.depth).abs() < 1.0e-9, "depth was held");
    assert!(
        result.quality == "A" || result.quality == "B",
        "quality = {}",
        result.quality
    );
    assert_eq!(result.number_of_used_stations, 12);

    // Azimuthal gap properties on an even ring.
    assert!(result.gap >= 0.0 && result.gap <= 360.0);
    assert!(result.secondary_gap >= result.gap);
    assert!(result.gap < 65.0, "ring gap should be ~30 deg, got {}", result.gap);
}

#[test]
fn free_depth_convergence_recovers_epicentre() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: -12.0,
        longitude: 67.0,
        depth: 18.0,
    };

    let geometry: Vec<(f64, f64)> = (0..10)
        .map(|i| (i as f64 * 36.0, 0.8 + 0.25 * i as f64))
        .collect();
    let picks = ring_of_picks(&truth, &model, &geometry);

    let start = TrueSource {
        latitude: truth.latitude - 0.3,
        longitude: truth.longitude + 0.3,
        depth: 40.0,
        ..truth
    };
    let request = request_with_picks("free-depth", start, picks);

    let result = locator(&model, &aux).locate(&request);

    assert_eq!(result.exit_code, ExitCode::Success, "result: {result:?}");
    let miss = epicentre_error_km(result.latitude, result.longitude, &truth);
    assert!(miss < 10.0, "epicentre missed truth by {miss:.2} km");
    assert!(result.rms < 1.0, "rms = {}", result.rms);
}

// ============================================================================
// Bayesian depth
// ============================================================================

#[test]
fn bayesian_depth_prior_binds_deep_event() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: -20.0,
        longitude: -178.0,
        depth: 550.0,
    };

    let geometry: Vec<(f64, f64)> = (0..8)
        .map(|i| (i as f64 * 45.0, 28.0 + 1.5 * (i % 3) as f64))
        .collect();
    let picks = ring_of_picks(&truth, &model, &geometry);

    let start = TrueSource { depth: 10.0, ..truth };
    let mut request = request_with_picks("deep-1", start, picks);
    request.is_bayesian_depth = true;
    request.bayesian_depth = 550.0;
    request.bayesian_spread = 40.0;

    let result = locator(&model, &aux).locate(&request);

    assert!(
        (result.depth - 550.0).abs() <= 3.0,
        "depth should bind to the prior, got {:.1}",
        result.depth
    );
    assert!((result.bayesian_depth - 550.0).abs() < 1.0e-9);
    assert!((result.bayesian_range - 120.0).abs() < 1.0e-9);
    assert!(
        result.depth_importance > 0.05,
        "depth importance = {}",
        result.depth_importance
    );
}

// ============================================================================
// Slab-merge shallow prior
// ============================================================================

#[test]
fn shallow_slab_merges_into_interface_prior() {
    let model = SyntheticEarth::default();
    let aux = TestAux {
        slabs: Some(vec![SlabDepth {
            depth: 40.0,
            lower: 25.0,
            upper: 60.0,
        }]),
        ..TestAux::default()
    };
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 1.0,
        longitude: 98.0,
        depth: 10.0,
    };

    let geometry: Vec<(f64, f64)> = (0..8)
        .map(|i| (i as f64 * 45.0 + 10.0, 1.0 + 0.4 * i as f64))
        .collect();
    let picks = ring_of_picks(&truth, &model, &geometry);
    let start = TrueSource {
        latitude: truth.latitude + 0.15,
        ..truth
    };
    let request = request_with_picks("slab-1", start, picks);

    let result = locator(&model, &aux).locate(&request);

    // The assigned prior is the slab-interface merge: depth = upper/2,
    // spread = upper/6, range = 3 * spread.
    assert!(
        (result.bayesian_depth - 30.0).abs() < 1.0e-9,
        "bayesian depth = {}",
        result.bayesian_depth
    );
    assert!(
        (result.bayesian_range - 30.0).abs() < 1.0e-9,
        "bayesian range = {}",
        result.bayesian_range
    );
    assert_eq!(result.exit_code, ExitCode::Success);
}

// ============================================================================
// Robustness and boundaries
// ============================================================================

#[test]
fn noisy_picks_still_converge() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 61.0,
        longitude: -150.0,
        depth: 20.0,
    };

    // Gaussian-ish pick noise at the quality level of the synthetic spread.
    let mut rng = StdRng::seed_from_u64(7);
    let picks: Vec<_> = (0..12)
        .map(|i| {
            let az = i as f64 * 30.0 + 7.0;
            let dist = 0.8 + 0.2 * i as f64;
            let (sta_lat, sta_lon) = station_at(truth.latitude, truth.longitude, az, dist);
            let noise: f64 = rng.gen_range(-0.3..0.3);
            p_pick(&format!("ns{i:02}"), &truth, &model, sta_lat, sta_lon, noise)
        })
        .collect();

    let start = TrueSource {
        latitude: truth.latitude - 0.2,
        longitude: truth.longitude + 0.3,
        ..truth
    };
    let mut request = request_with_picks("noisy-1", start, picks);
    request.is_depth_held = true;

    let result = locator(&model, &aux).locate(&request);

    let miss = epicentre_error_km(result.latitude, result.longitude, &truth);
    assert!(
        miss < 10.0,
        "noisy network missed the truth by {miss:.2} km (exit {:?})",
        result.exit_code
    );
    assert!(result.rms < 1.0, "rms = {}", result.rms);
}

#[test]
fn rank_sum_shrugs_off_an_outlier() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 40.0,
        longitude: 15.0,
        depth: 8.0,
    };

    let geometry: Vec<(f64, f64)> = (0..10)
        .map(|i| (i as f64 * 36.0 + 5.0, 0.9 + 0.2 * i as f64))
        .collect();
    let mut picks = ring_of_picks(&truth, &model, &geometry);
    // One wildly late arrival.
    picks[3].time += chrono::Duration::seconds(25);

    let start = TrueSource {
        latitude: truth.latitude + 0.25,
        ..truth
    };
    let mut request = request_with_picks("outlier-1", start, picks);
    request.is_depth_held = true;

    let result = locator(&model, &aux).locate(&request);

    let miss = epicentre_error_km(result.latitude, result.longitude, &truth);
    assert!(
        miss < 8.0,
        "one outlier pulled the epicentre {miss:.2} km off"
    );
}

#[test]
fn broken_travel_time_provider_maps_to_exit_code() {
    let model = BrokenEarth;
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 0.0,
        longitude: 0.0,
        depth: 10.0,
    };
    let synth = SyntheticEarth::default();
    let picks = ring_of_picks(&truth, &synth, &[(0.0, 1.0), (120.0, 1.0), (240.0, 1.0)]);
    let request = request_with_picks("broken-1", truth, picks);

    let result = Locator::new(&model, &aux, LocatorConfig::default()).locate(&request);
    assert_eq!(result.exit_code, ExitCode::CouldNotReadTTData);
}

#[test]
fn bad_input_is_rejected_before_location() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 95.0, // invalid
        longitude: 0.0,
        depth: 10.0,
    };
    let picks = ring_of_picks(
        &TrueSource {
            latitude: 0.0,
            ..truth
        },
        &model,
        &[(0.0, 1.0), (120.0, 1.0), (240.0, 1.0)],
    );
    let request = request_with_picks("bad-lat", truth, picks);

    let result = locator(&model, &aux).locate(&request);
    assert_eq!(result.exit_code, ExitCode::BadInput);
}

#[test]
fn out_of_range_depth_is_bad_input() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 5.0,
        longitude: 5.0,
        depth: 2000.0,
    };
    let picks = ring_of_picks(&truth, &model, &[(0.0, 1.0), (120.0, 1.0), (240.0, 1.0)]);
    let request = request_with_picks("too-deep", truth, picks);

    let result = locator(&model, &aux).locate(&request);
    assert_eq!(result.exit_code, ExitCode::BadInput);
}

// ============================================================================
// Batch interface
// ============================================================================

#[test]
fn batch_location_matches_single_runs() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let engine = locator(&model, &aux);

    let mut requests = Vec::new();
    for k in 0..4 {
        let truth = TrueSource {
            origin: default_origin(),
            latitude: 10.0 + k as f64,
            longitude: 20.0 + k as f64,
            depth: 12.0,
        };
        let geometry: Vec<(f64, f64)> = (0..8)
            .map(|i| (i as f64 * 45.0, 1.0 + 0.3 * i as f64))
            .collect();
        let mut request =
            request_with_picks(&format!("batch-{k}"), truth, ring_of_picks(&truth, &model, &geometry));
        request.is_depth_held = true;
        requests.push(request);
    }

    let batch = engine.locate_all(&requests);
    assert_eq!(batch.len(), requests.len());
    for (request, result) in requests.iter().zip(&batch) {
        let single = engine.locate(request);
        assert_eq!(result.exit_code, single.exit_code);
        assert!((result.latitude - single.latitude).abs() < 1.0e-9);
        assert!((result.longitude - single.longitude).abs() < 1.0e-9);
        assert_eq!(result.id, single.id);
    }
}

// ============================================================================
// Decorrelation end to end
// ============================================================================

#[test]
fn decorrelated_location_still_converges() {
    let model = SyntheticEarth::default();
    let aux = TestAux::default();
    let truth = TrueSource {
        origin: default_origin(),
        latitude: 52.0,
        longitude: 6.0,
        depth: 14.0,
    };

    let geometry: Vec<(f64, f64)> = (0..10)
        .map(|i| (i as f64 * 36.0 + 12.0, 0.7 + 0.3 * i as f64))
        .collect();
    let picks = ring_of_picks(&truth, &model, &geometry);

    let start = TrueSource {
        latitude: truth.latitude - 0.25,
        longitude: truth.longitude - 0.2,
        ..truth
    };
    let mut request = request_with_picks("svd-1", start, picks);
    request.use_svd = true;
    request.is_depth_held = true;

    let result = locator(&model, &aux).locate(&request);

    let miss = epicentre_error_km(result.latitude, result.longitude, &truth);
    assert!(
        miss < 6.0,
        "decorrelated run missed the truth by {miss:.2} km (exit {:?})",
        result.exit_code
    );
}
