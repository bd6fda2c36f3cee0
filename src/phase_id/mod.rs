//! Phase identification.
//!
//! Each station's observed picks are matched against the theoretical
//! arrivals for the current source geometry. Arrivals whose observability
//! windows overlap form clusters; within a cluster every injective pairing
//! of picks and arrivals is scored with a cumulative figure of merit
//! (observability-based amplitude times residual likelihood), and each pick
//! remembers its best statistical and best alternative candidate. Winners
//! are merged, deduplicated, and forced into arrival-order monotonicity
//! before the weighted-residual rows are rebuilt.

pub mod initial;

use statrs::distribution::{Cauchy, Continuous, Normal};
use tracing::{debug, trace};

use crate::config::LocatorConfig;
use crate::event::{phase_is_surface_wave, phase_type_is_p, Event};
use crate::geo::KM_PER_DEG;
use crate::providers::{ReceiverGeometry, TravelTimeSession, TtArrival};
use crate::residual::WeightedResidual;

/// Slight preference factor for the alternate candidate on a group's first
/// theoretical arrival.
const ALT_FIRST_BONUS: f64 = 1.05;

/// Hard cap on enumerated pairing cells regardless of cluster width.
const MAX_PERMUTATION_CELLS: u64 = 500_000;

/// How a phase-identification pass treats existing identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseIdMode {
    /// Full re-identification through cluster permutations.
    Full,
    /// Re-anchor each pick to the nearest arrival with the same code (or
    /// group) without changing identities; falls back to `Full` when any
    /// pick cannot be re-anchored within tolerance.
    NoReId,
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseIdOutcome {
    /// At least one used pick changed phase identity.
    pub changed: bool,
}

/// Long-tailed travel-time residual likelihood: a Gaussian core with a
/// Cauchy tail so distant outliers retain a usable gradient.
pub fn residual_likelihood(residual: f64, spread: f64) -> f64 {
    let sigma = spread.max(1.0e-6);
    match (Normal::new(0.0, sigma), Cauchy::new(0.0, 2.0 * sigma)) {
        (Ok(core), Ok(tail)) => 0.9 * core.pdf(residual) + 0.1 * tail.pdf(residual),
        _ => 0.0,
    }
}

/// Residual magnitude beyond which an identification is suspect.
fn validity_limit(spread: f64, cfg: &LocatorConfig) -> f64 {
    cfg.phase_id.validity_sigma * spread.max(cfg.estimator.min_spread_s)
}

/// Spatial travel-time derivatives (s/km, north/east/down) for an arrival
/// seen at the given azimuth.
fn derivatives(arrival: &TtArrival, azimuth_deg: f64) -> [f64; 3] {
    let az = azimuth_deg.to_radians();
    let dtdd_km = arrival.dtdd / KM_PER_DEG;
    [-az.cos() * dtdd_km, -az.sin() * dtdd_km, arrival.dtdz]
}

/// Identify phases for every group and rebuild the weighted residuals.
///
/// Returns whether any used pick changed identity.
pub fn identify(
    event: &mut Event,
    session: &dyn TravelTimeSession,
    mode: PhaseIdMode,
    cfg: &LocatorConfig,
) -> PhaseIdOutcome {
    match mode {
        PhaseIdMode::Full => identify_full(event, session, cfg),
        PhaseIdMode::NoReId => identify_no_reid(event, session, cfg),
    }
}

// ============================================================================
// Full re-identification
// ============================================================================

/// One pick-to-arrival pairing chosen for a group.
#[derive(Debug, Clone)]
struct Assignment {
    pick: usize,
    arrival: TtArrival,
    fom: f64,
}

fn identify_full(
    event: &mut Event,
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> PhaseIdOutcome {
    let before: Vec<String> = event.picks.iter().map(|p| p.current_phase.clone()).collect();
    let mut assignments: Vec<Assignment> = Vec::new();

    for g in 0..event.groups.len() {
        let group_assignments = identify_group(event, g, session, cfg);
        assignments.extend(group_assignments);
    }

    apply_assignments(event, &assignments, cfg);
    rebuild_residuals(event);

    // The forced associations from the initial pass have now had their say.
    for pick in &mut event.picks {
        pick.scratch.force_association = false;
    }

    let changed = event
        .picks
        .iter()
        .enumerate()
        .any(|(i, p)| p.is_used && p.current_phase != before[i]);
    if changed {
        debug!("phase identification changed at least one used pick");
    }
    PhaseIdOutcome { changed }
}

/// Identify one group. Returns the surviving assignments.
fn identify_group(
    event: &mut Event,
    group_idx: usize,
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> Vec<Assignment> {
    let group = event.groups[group_idx].clone();
    let station = &event.stations[group.station];
    let receiver = ReceiverGeometry {
        latitude: station.latitude,
        longitude: station.longitude,
        elevation: station.elevation,
        distance_deg: group.distance_deg,
        azimuth_deg: group.azimuth_deg,
    };

    let mut all_arrivals: Vec<TtArrival> = session
        .arrivals(&receiver)
        .into_iter()
        .filter(|a| a.can_use)
        .collect();
    all_arrivals.sort_by(|a, b| a.travel_time.total_cmp(&b.travel_time));
    let arrivals: Vec<TtArrival> = all_arrivals
        .iter()
        .filter(|a| a.observability >= cfg.phase_id.observability_min)
        .cloned()
        .collect();
    if arrivals.is_empty() {
        for &p in &group.picks {
            event.picks[p].scratch.initialize();
        }
        return Vec::new();
    }
    let first_arrival_code = arrivals[0].phase_code.clone();

    // Reset scratch and pre-freeze surface waves.
    let mut candidates: Vec<usize> = Vec::new();
    for &p in &group.picks {
        let pick = &mut event.picks[p];
        pick.scratch.initialize();
        if pick.is_triage {
            continue;
        }
        if phase_is_surface_wave(&pick.current_phase) && !pick.is_automatic {
            pick.is_surface_wave = true;
            // Frozen phase: anchor to the matching surface-wave arrival if
            // the model provides one, otherwise sit out this iteration.
            let anchor = all_arrivals
                .iter()
                .find(|a| a.phase_code == pick.current_phase)
                .cloned();
            match anchor {
                Some(arrival) => {
                    pick.residual = pick.travel_time - arrival.travel_time;
                    pick.weight = 1.0 / arrival.spread.max(cfg.estimator.min_spread_s);
                    pick.is_used = pick.external_use;
                    pick.scratch.assigned = Some(arrival);
                }
                None => {
                    pick.weight = 0.0;
                    pick.is_used = false;
                }
            }
            continue;
        }
        // Negative-travel-time guard: never associate before the origin.
        if pick.travel_time < -cfg.phase_id.max_neg_residual_s {
            continue;
        }
        candidates.push(p);
    }

    // Split arrivals into clusters of overlapping observability windows.
    let clusters = split_clusters(&arrivals);

    let mut group_fom = 0.0;
    for cluster in &clusters {
        let window_start = arrivals[cluster.clone()]
            .iter()
            .map(|a| a.travel_time - a.window)
            .fold(f64::INFINITY, f64::min);
        let window_end = arrivals[cluster.clone()]
            .iter()
            .map(|a| a.travel_time + a.window)
            .fold(f64::NEG_INFINITY, f64::max);

        let cluster_picks: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&p| {
                let tt = event.picks[p].travel_time;
                tt >= window_start && tt <= window_end
            })
            .collect();
        if cluster_picks.is_empty() {
            continue;
        }
        let cluster_arrivals: Vec<TtArrival> = arrivals[cluster.clone()].to_vec();
        group_fom += score_cluster(event, &cluster_picks, &cluster_arrivals, session, cfg);
    }
    event.groups[group_idx].fom = group_fom;

    // Merge statistical and alternative winners per pick.
    let mut chosen: Vec<Assignment> = Vec::new();
    for &p in &candidates {
        if let Some(assignment) =
            merge_winners(event, p, &first_arrival_code, group.distance_deg, cfg)
        {
            chosen.push(assignment);
        }
    }

    dedup_assignments(&mut chosen, event);
    enforce_monotonicity(&mut chosen, event);
    chosen
}

/// Close a cluster when the next arrival's window no longer touches the
/// running window. Returns index ranges into the arrivals slice.
fn split_clusters(arrivals: &[TtArrival]) -> Vec<std::ops::Range<usize>> {
    let mut clusters = Vec::new();
    if arrivals.is_empty() {
        return clusters;
    }
    let mut start = 0;
    let mut window_end = arrivals[0].travel_time + arrivals[0].window;
    for (i, arrival) in arrivals.iter().enumerate().skip(1) {
        if arrival.travel_time - arrival.window <= window_end {
            window_end = window_end.max(arrival.travel_time + arrival.window);
        } else {
            clusters.push(start..i);
            start = i;
            window_end = arrival.travel_time + arrival.window;
        }
    }
    clusters.push(start..arrivals.len());
    clusters
}

/// Figure of merit for pairing one pick with one arrival.
fn pair_merit(
    event: &Event,
    pick_idx: usize,
    arrival: &TtArrival,
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> f64 {
    let pick = &event.picks[pick_idx];
    let residual = pick.travel_time - arrival.travel_time;
    let prob = residual_likelihood(residual, arrival.spread);

    let mut amp = arrival.observability;
    if arrival.is_disallowed {
        amp *= cfg.phase_id.down_weight;
    }

    let observed_group = session.find_group(&pick.current_phase, pick.is_automatic);
    let group_matches = observed_group.as_deref() == Some(arrival.phase_group.as_str())
        || (observed_group.is_some() && observed_group.as_deref() == arrival.aux_group.as_deref());
    if group_matches {
        amp *= cfg.phase_id.group_weight;
    } else {
        amp *= cfg.phase_id.other_weight;
        let type_disagrees =
            phase_type_is_p(&pick.current_phase) != phase_type_is_p(&arrival.phase_code);
        if type_disagrees && !pick.is_automatic {
            amp *= cfg.phase_id.type_weight;
        }
    }
    if pick.original_phase == arrival.phase_code {
        amp *= pick.affinity;
    }
    if pick.current_phase == arrival.phase_code {
        amp *= cfg.phase_id.sticky_weight;
    }

    amp * prob
}

/// Score every pairing in a cluster, updating each pick's statistical and
/// alternative winners. Returns the best cumulative figure of merit.
fn score_cluster(
    event: &mut Event,
    picks: &[usize],
    arrivals: &[TtArrival],
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> f64 {
    // Alternative winner: smallest affinity-weighted absolute residual.
    for &p in picks {
        for arrival in arrivals {
            let pick = &event.picks[p];
            let residual = (pick.travel_time - arrival.travel_time).abs();
            let merit = if pick.original_phase == arrival.phase_code {
                residual / pick.affinity
            } else {
                residual
            };
            if merit < event.picks[p].scratch.alt_merit() {
                event.picks[p].scratch.best_alt = Some((arrival.clone(), merit));
            }
        }
    }

    // Pairwise merit table, picks x arrivals.
    let np = picks.len();
    let na = arrivals.len();
    let mut merit = vec![vec![0.0_f64; na]; np];
    for (i, &p) in picks.iter().enumerate() {
        for (j, arrival) in arrivals.iter().enumerate() {
            merit[i][j] = pair_merit(event, p, arrival, session, cfg);
        }
    }

    let k = np.min(na);
    let permutable = k <= cfg.phase_id.max_cluster_permute
        && permutation_count(np.max(na), k) <= MAX_PERMUTATION_CELLS;

    let mut best_total = 0.0;
    if permutable {
        // Enumerate injective pairings over the shorter side.
        let over_picks = np <= na;
        let n = if over_picks { na } else { np };
        let mut selection: Vec<usize> = Vec::with_capacity(k);
        let mut used = vec![false; n];
        permute(
            n,
            k,
            &mut selection,
            &mut used,
            &mut |sel: &[usize]| {
                let mut total = 1.0;
                for (short_idx, &long_idx) in sel.iter().enumerate() {
                    let (i, j) = if over_picks {
                        (short_idx, long_idx)
                    } else {
                        (long_idx, short_idx)
                    };
                    total *= merit[i][j];
                }
                if total <= best_total {
                    return;
                }
                best_total = total;
                for (short_idx, &long_idx) in sel.iter().enumerate() {
                    let (i, j) = if over_picks {
                        (short_idx, long_idx)
                    } else {
                        (long_idx, short_idx)
                    };
                    let p = picks[i];
                    if total > event.picks[p].scratch.stat_merit() {
                        event.picks[p].scratch.best_stat = Some((arrivals[j].clone(), total));
                    }
                }
            },
        );
    } else {
        // Greedy fallback for oversized clusters: earliest pick first,
        // each taking its best unclaimed arrival.
        trace!(np, na, "cluster too wide for permutation, assigning greedily");
        let mut taken = vec![false; na];
        let mut total = 1.0;
        for (i, &p) in picks.iter().enumerate() {
            let best = (0..na)
                .filter(|&j| !taken[j])
                .max_by(|&a, &b| merit[i][a].total_cmp(&merit[i][b]));
            if let Some(j) = best {
                taken[j] = true;
                total *= merit[i][j];
                if merit[i][j] > 0.0 {
                    event.picks[p].scratch.best_stat = Some((arrivals[j].clone(), merit[i][j]));
                }
            }
        }
        best_total = total;
    }
    best_total
}

/// Number of ordered k-selections from n, saturating.
fn permutation_count(n: usize, k: usize) -> u64 {
    let mut count: u64 = 1;
    for i in 0..k {
        count = count.saturating_mul((n - i) as u64);
        if count > MAX_PERMUTATION_CELLS {
            return u64::MAX;
        }
    }
    count
}

/// Visit every ordered selection of `k` distinct indices from `0..n`.
fn permute(
    n: usize,
    k: usize,
    selection: &mut Vec<usize>,
    used: &mut [bool],
    visit: &mut impl FnMut(&[usize]),
) {
    if selection.len() == k {
        visit(selection);
        return;
    }
    for i in 0..n {
        if used[i] {
            continue;
        }
        used[i] = true;
        selection.push(i);
        permute(n, k, selection, used, visit);
        selection.pop();
        used[i] = false;
    }
}

/// Merge a pick's statistical and alternative winners into a final
/// assignment, applying the distance correction to first arrivals.
fn merge_winners(
    event: &mut Event,
    pick_idx: usize,
    first_arrival_code: &str,
    distance_deg: f64,
    cfg: &LocatorConfig,
) -> Option<Assignment> {
    let pick = &event.picks[pick_idx];
    let stat = pick.scratch.best_stat.clone();
    let alt = pick.scratch.best_alt.clone();

    let assignment = match (stat, alt) {
        (Some((stat_arrival, mut stat_fom)), alt) => {
            // First arrivals get harder to trust at a large distance.
            if stat_arrival.phase_code == first_arrival_code
                && distance_deg > cfg.phase_id.distance_correction_deg
            {
                let excess = (distance_deg - cfg.phase_id.distance_correction_deg)
                    / cfg.phase_id.distance_correction_scale;
                stat_fom /= 1.0 + excess * excess;
            }

            let stat_residual = pick.travel_time - stat_arrival.travel_time;
            let stat_limit = validity_limit(stat_arrival.spread, cfg);

            let prefer_alt = match &alt {
                Some((alt_arrival, _)) => {
                    let alt_residual = pick.travel_time - alt_arrival.travel_time;
                    let alt_limit = validity_limit(alt_arrival.spread, cfg);
                    if stat_residual.abs() > 2.0 * stat_limit && alt_residual.abs() <= alt_limit {
                        true
                    } else {
                        // On the group's first arrival the alternate wins
                        // any near-tie.
                        alt_arrival.phase_code == first_arrival_code
                            && alt_arrival.phase_code != stat_arrival.phase_code
                            && alt_residual.abs() <= alt_limit
                            && alt_residual.abs() * ALT_FIRST_BONUS <= stat_residual.abs()
                    }
                }
                None => false,
            };

            if prefer_alt {
                let (alt_arrival, _) = alt.unwrap_or((stat_arrival.clone(), 0.0));
                Some(Assignment {
                    pick: pick_idx,
                    arrival: alt_arrival,
                    fom: stat_fom,
                })
            } else if stat_residual.abs() <= 2.0 * stat_limit || pick.scratch.force_association {
                Some(Assignment {
                    pick: pick_idx,
                    arrival: stat_arrival,
                    fom: stat_fom,
                })
            } else {
                None
            }
        }
        (None, Some((alt_arrival, _))) => {
            let alt_residual = pick.travel_time - alt_arrival.travel_time;
            let limit = validity_limit(alt_arrival.spread, cfg);
            (alt_residual.abs() <= limit || pick.scratch.force_association).then(|| Assignment {
                pick: pick_idx,
                arrival: alt_arrival,
                fom: 0.0,
            })
        }
        (None, None) => None,
    };

    if let Some(ref a) = assignment {
        event.picks[pick_idx].best_phase = a.arrival.phase_code.clone();
    }
    assignment
}

/// If two picks claim the same theoretical arrival, the later pick (or the
/// one with the worse statistical merit) loses its identification.
fn dedup_assignments(assignments: &mut Vec<Assignment>, event: &Event) {
    let mut losers: Vec<usize> = Vec::new();
    for i in 0..assignments.len() {
        for j in (i + 1)..assignments.len() {
            if assignments[i].arrival.phase_code != assignments[j].arrival.phase_code
                || (assignments[i].arrival.travel_time - assignments[j].arrival.travel_time).abs()
                    > 1.0e-9
            {
                continue;
            }
            let (a, b) = (&assignments[i], &assignments[j]);
            let loser = if (a.fom - b.fom).abs() > f64::EPSILON {
                if a.fom < b.fom {
                    i
                } else {
                    j
                }
            } else if event.picks[a.pick].travel_time <= event.picks[b.pick].travel_time {
                j
            } else {
                i
            };
            losers.push(loser);
        }
    }
    losers.sort_unstable();
    losers.dedup();
    for &idx in losers.iter().rev() {
        assignments.remove(idx);
    }
}

/// Drop the less observable of any pair of assignments whose theoretical
/// times invert the observed arrival order. Surface waves are exempt.
fn enforce_monotonicity(assignments: &mut Vec<Assignment>, event: &Event) {
    loop {
        let mut order: Vec<usize> = (0..assignments.len()).collect();
        order.sort_by(|&a, &b| {
            event.picks[assignments[a].pick]
                .travel_time
                .total_cmp(&event.picks[assignments[b].pick].travel_time)
        });
        let mut removed = None;
        for w in order.windows(2) {
            let (a, b) = (&assignments[w[0]], &assignments[w[1]]);
            if phase_is_surface_wave(&a.arrival.phase_code)
                || phase_is_surface_wave(&b.arrival.phase_code)
            {
                continue;
            }
            if a.arrival.travel_time > b.arrival.travel_time + 1.0e-9 {
                removed = Some(if a.arrival.observability <= b.arrival.observability {
                    w[0]
                } else {
                    w[1]
                });
                break;
            }
        }
        match removed {
            Some(idx) => {
                assignments.remove(idx);
            }
            None => break,
        }
    }
}

/// Write the surviving assignments into the picks.
fn apply_assignments(event: &mut Event, assignments: &[Assignment], cfg: &LocatorConfig) {
    // Picks without an assignment lose their usability for this iteration.
    let mut assigned = vec![false; event.picks.len()];
    for a in assignments {
        assigned[a.pick] = true;
    }
    for (idx, pick) in event.picks.iter_mut().enumerate() {
        if pick.is_surface_wave || pick.is_triage {
            continue;
        }
        if !assigned[idx] {
            pick.weight = 0.0;
            pick.is_used = false;
        }
    }

    for a in assignments {
        let pick = &mut event.picks[a.pick];
        if !pick.phase_is_frozen() {
            pick.current_phase = a.arrival.phase_code.clone();
        }
        pick.residual = pick.travel_time - a.arrival.travel_time;
        pick.weight = 1.0 / a.arrival.spread.max(cfg.estimator.min_spread_s);
        pick.is_used = pick.external_use && !pick.is_triage && pick.weight > 0.0;
        pick.scratch.assigned = Some(a.arrival.clone());
    }
}

/// Rebuild the weighted-residual rows for all used picks, appending the
/// Bayesian depth pseudo-row last.
pub fn rebuild_residuals(event: &mut Event) {
    event.residuals.clear();

    for g in 0..event.groups.len() {
        let group = &event.groups[g];
        let azimuth = group.azimuth_deg;
        for &p in &group.picks {
            let pick = &event.picks[p];
            if !pick.is_used || pick.weight <= 0.0 {
                continue;
            }
            let deriv = pick
                .scratch
                .assigned
                .as_ref()
                .map_or([0.0, 0.0, 0.0], |a| derivatives(a, azimuth));
            event
                .residuals
                .push(WeightedResidual::for_pick(p, pick.residual, pick.weight, deriv));
        }
    }

    let hypo = &event.hypocenter;
    if hypo.bayes_spread > 0.0 {
        event.residuals.push(WeightedResidual::bayesian_depth(
            hypo.depth,
            hypo.bayes_depth,
            hypo.bayes_spread,
        ));
    }
}

// ============================================================================
// No-re-ID pass
// ============================================================================

fn identify_no_reid(
    event: &mut Event,
    session: &dyn TravelTimeSession,
    cfg: &LocatorConfig,
) -> PhaseIdOutcome {
    // First check every used pick can be re-anchored; any failure falls
    // back to a full pass.
    let mut anchored: Vec<(usize, TtArrival)> = Vec::new();

    for group in event.groups.clone() {
        let station = &event.stations[group.station];
        let receiver = ReceiverGeometry {
            latitude: station.latitude,
            longitude: station.longitude,
            elevation: station.elevation,
            distance_deg: group.distance_deg,
            azimuth_deg: group.azimuth_deg,
        };
        let arrivals: Vec<TtArrival> = session
            .arrivals(&receiver)
            .into_iter()
            .filter(|a| a.can_use)
            .collect();

        for &p in &group.picks {
            let pick = &event.picks[p];
            if !pick.is_used {
                continue;
            }
            let same_code = arrivals
                .iter()
                .filter(|a| a.phase_code == pick.current_phase)
                .min_by(|a, b| {
                    (pick.travel_time - a.travel_time)
                        .abs()
                        .total_cmp(&(pick.travel_time - b.travel_time).abs())
                });
            let observed_group = session.find_group(&pick.current_phase, pick.is_automatic);
            let same_group = arrivals
                .iter()
                .filter(|a| Some(a.phase_group.as_str()) == observed_group.as_deref())
                .min_by(|a, b| {
                    (pick.travel_time - a.travel_time)
                        .abs()
                        .total_cmp(&(pick.travel_time - b.travel_time).abs())
                });
            let anchor = same_code.or(same_group);
            match anchor {
                Some(arrival)
                    if (pick.travel_time - arrival.travel_time).abs()
                        <= cfg.phase_id.assoc_tolerance_s =>
                {
                    anchored.push((p, arrival.clone()));
                }
                _ => {
                    debug!(
                        pick = %pick.external_id,
                        phase = %pick.current_phase,
                        "re-anchor failed, falling back to full re-identification"
                    );
                    return identify_full(event, session, cfg);
                }
            }
        }
    }

    for (p, arrival) in anchored {
        let pick = &mut event.picks[p];
        pick.residual = pick.travel_time - arrival.travel_time;
        pick.weight = 1.0 / arrival.spread.max(cfg.estimator.min_spread_s);
        pick.scratch.assigned = Some(arrival);
    }
    rebuild_residuals(event);
    PhaseIdOutcome { changed: false }
}
