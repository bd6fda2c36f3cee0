//! One-shot pre-location phase heuristics.
//!
//! Before iterative location starts, first arrivals are accepted or
//! rejected per station, automatic picks are culled according to how
//! "complex" the event looks, and the origin time is pulled to the median
//! of the surviving residuals so the first real phase pass starts sane.

use tracing::{debug, info};

use crate::config::LocatorConfig;
use crate::event::Event;
use crate::providers::{ReceiverGeometry, TravelTimeSession, TtArrival};

use super::{identify, PhaseIdMode, PhaseIdOutcome};

/// Distance limit for the initial heuristics (deg).
const INITIAL_DISTANCE_LIMIT_DEG: f64 = 100.0;

/// Codes acceptable for automatic first arrivals in easy mode.
const EASY_AUTO_CODES: [&str; 4] = ["Pg", "Pb", "Pn", "P"];

/// True for phases the initial pass refuses to touch: deep-earth core
/// phases and secondary S phases.
fn is_excluded_phase(code: &str) -> bool {
    code.starts_with("PK")
        || code.starts_with("P'")
        || code.starts_with("Sc")
        || matches!(code, "Sg" | "Sb" | "Sn" | "Lg")
}

/// Run the initial pass. On a location restart the heuristics are skipped
/// and a full re-identification runs instead.
pub fn initial_pass(
    event: &mut Event,
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> PhaseIdOutcome {
    if event.is_location_restarted {
        debug!("location restarted, skipping initial heuristics");
        return identify(event, session, PhaseIdMode::Full, cfg);
    }

    let mut residuals: Vec<f64> = Vec::new();
    let mut disagreements = 0usize;
    // (pick, first-arrival) pairs eligible for forcing in complex mode.
    let mut first_arrival_autos: Vec<(usize, TtArrival)> = Vec::new();

    for group in event.groups.clone() {
        let station = &event.stations[group.station];
        if group.distance_deg > INITIAL_DISTANCE_LIMIT_DEG {
            continue;
        }
        let receiver = ReceiverGeometry {
            latitude: station.latitude,
            longitude: station.longitude,
            elevation: station.elevation,
            distance_deg: group.distance_deg,
            azimuth_deg: group.azimuth_deg,
        };
        let mut arrivals: Vec<TtArrival> = session
            .arrivals(&receiver)
            .into_iter()
            .filter(|a| a.can_use)
            .collect();
        arrivals.sort_by(|a, b| a.travel_time.total_cmp(&b.travel_time));
        let Some(first) = arrivals.first().cloned() else {
            continue;
        };

        for &p in &group.picks {
            let pick = &mut event.picks[p];
            if !pick.is_used || is_excluded_phase(&pick.current_phase) {
                continue;
            }

            if pick.is_automatic {
                // Automatic picks are measured against the first arrival.
                pick.residual = pick.travel_time - first.travel_time;
                pick.weight = 1.0 / first.spread.max(cfg.estimator.min_spread_s);
                residuals.push(pick.residual);
                if pick.current_phase != first.phase_code {
                    disagreements += 1;
                }
                first_arrival_autos.push((p, first.clone()));
            } else if let Some(matching) = arrivals
                .iter()
                .find(|a| a.phase_code == pick.current_phase)
            {
                pick.residual = pick.travel_time - matching.travel_time;
                pick.weight = 1.0 / matching.spread.max(cfg.estimator.min_spread_s);
                residuals.push(pick.residual);
            }
        }
    }

    let complex = disagreements as f64 >= cfg.phase_id.bad_ratio * event.stations_used() as f64
        && disagreements > 0;

    if complex {
        info!(
            disagreements,
            stations = event.stations_used(),
            "initial pass: complex event, forcing automatic first arrivals"
        );
        for (p, first) in &first_arrival_autos {
            let pick = &mut event.picks[*p];
            pick.current_phase = first.phase_code.clone();
            pick.residual = pick.travel_time - first.travel_time;
            pick.scratch.force_association = true;
        }
        disable_secondary_autos(event);
    } else {
        debug!(disagreements, "initial pass: easy event");
        for pick in &mut event.picks {
            if pick.is_automatic
                && pick.is_used
                && !EASY_AUTO_CODES.contains(&pick.current_phase.as_str())
            {
                pick.is_used = false;
                pick.weight = 0.0;
            }
        }
        disable_secondary_autos(event);
    }

    // One-shot origin correction from the residual median.
    if residuals.len() >= 2 {
        residuals.sort_by(f64::total_cmp);
        let n = residuals.len();
        let median = if n % 2 == 0 {
            0.5 * (residuals[n / 2 - 1] + residuals[n / 2])
        } else {
            residuals[n / 2]
        };
        info!(median, "initial pass: shifting origin time");
        event.update_origin_time(median);
    }

    PhaseIdOutcome { changed: false }
}

/// Automatic picks that are not the first pick of their group lose their
/// use flag before location starts.
fn disable_secondary_autos(event: &mut Event) {
    for group in event.groups.clone() {
        for &p in group.picks.iter().skip(1) {
            let pick = &mut event.picks[p];
            if pick.is_automatic && pick.is_used {
                pick.is_used = false;
                pick.weight = 0.0;
            }
        }
    }
}
