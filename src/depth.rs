//! Bayesian depth priors from slab models and zone statistics.
//!
//! For a trial epicentre the selector assembles a ranked list of depth
//! candidates: a shallow prior (default, or merged from a shallow slab or
//! shallow zone statistics) followed by any deep priors, then picks the one
//! nearest the current trial depth. The chosen prior enters the estimator
//! as the Bayesian pseudo-pick.

use tracing::debug;

use crate::config::DepthConfig;
use crate::providers::AuxiliaryData;

/// Floor on any zone-statistics spread (km).
const MIN_ZONE_SPREAD_KM: f64 = 5.0;

/// Where a depth candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthSource {
    /// Built-in shallow default.
    Shallow,
    /// Classic zone statistics, shallow replacement.
    ZoneShallow,
    /// Revised zone statistics, shallow replacement.
    NewZoneShallow,
    /// Classic zone statistics at interface depths.
    ZoneInterface,
    /// Revised zone statistics at interface depths.
    NewZoneInterface,
    /// Shallow slab merged into the shallow prior.
    SlabInterface,
    /// Deep slab model depth.
    SlabModel,
    /// Classic zone statistics, deep.
    ZoneStats,
    /// Revised zone statistics, deep.
    NewZoneStats,
}

/// One ranked depth candidate.
#[derive(Debug, Clone, Copy)]
pub struct BayesianDepth {
    pub depth: f64,
    pub spread: f64,
    pub source: DepthSource,
}

/// Build the ranked candidate list for a trial epicentre.
///
/// The first entry is always the shallow prior; deep priors follow in
/// provider order.
pub fn rank_candidates(
    latitude: f64,
    longitude: f64,
    aux: &dyn AuxiliaryData,
    cfg: &DepthConfig,
) -> Vec<BayesianDepth> {
    let mut shallow = BayesianDepth {
        depth: cfg.default_depth_km,
        spread: cfg.default_depth_se_km,
        source: DepthSource::Shallow,
    };
    let mut deep: Vec<BayesianDepth> = Vec::new();

    if let Some(slabs) = aux.slab_depths(latitude, longitude) {
        for slab in &slabs {
            if slab.depth <= cfg.slab_merge_depth_km {
                // A shallow slab folds into the shallow prior: the merged
                // prior spans surface to the slab's deep error bound.
                shallow = BayesianDepth {
                    depth: 0.5 * slab.upper,
                    spread: slab.upper / 6.0,
                    source: DepthSource::SlabInterface,
                };
            } else {
                deep.push(BayesianDepth {
                    depth: slab.depth,
                    spread: (slab.upper - slab.depth).max(slab.depth - slab.lower),
                    source: DepthSource::SlabModel,
                });
            }
        }
    } else if let Some(zone) = aux.new_zone_stats(latitude, longitude) {
        let upper = zone.mean_depth + zone.spread;
        if upper < cfg.deepest_shallow_km {
            shallow = BayesianDepth {
                depth: zone.mean_depth,
                spread: zone.spread.max(MIN_ZONE_SPREAD_KM),
                source: DepthSource::NewZoneShallow,
            };
        } else if upper <= cfg.slab_merge_depth_km {
            shallow = BayesianDepth {
                depth: zone.mean_depth,
                spread: zone.spread.max(MIN_ZONE_SPREAD_KM),
                source: DepthSource::NewZoneInterface,
            };
        } else {
            deep.push(BayesianDepth {
                depth: zone.mean_depth,
                spread: zone.spread.max(MIN_ZONE_SPREAD_KM),
                source: DepthSource::NewZoneStats,
            });
        }
    } else if let Some(zone) = aux.zone_stats(latitude, longitude) {
        let spread = (0.5
            * (zone.max_depth - zone.mean_depth).max(zone.mean_depth - zone.min_depth))
        .max(MIN_ZONE_SPREAD_KM);
        if zone.max_depth < cfg.deepest_shallow_km {
            shallow = BayesianDepth {
                depth: zone.mean_depth,
                spread,
                source: DepthSource::ZoneShallow,
            };
        } else if zone.max_depth <= cfg.slab_merge_depth_km {
            shallow = BayesianDepth {
                depth: zone.mean_depth,
                spread,
                source: DepthSource::ZoneInterface,
            };
        } else {
            deep.push(BayesianDepth {
                depth: zone.mean_depth,
                spread,
                source: DepthSource::ZoneStats,
            });
        }
    }

    let mut candidates = Vec::with_capacity(1 + deep.len());
    candidates.push(shallow);
    candidates.extend(deep);
    candidates
}

/// Select the binding prior from a ranked list given the current depth.
pub fn select(candidates: &[BayesianDepth], current_depth: f64, cfg: &DepthConfig) -> BayesianDepth {
    let fallback = BayesianDepth {
        depth: cfg.default_depth_km,
        spread: cfg.default_depth_se_km,
        source: DepthSource::Shallow,
    };
    let Some(shallow) = candidates.first() else {
        return fallback;
    };
    let deep = &candidates[1..];

    let closest_deep = deep.iter().min_by(|a, b| {
        (a.depth - current_depth)
            .abs()
            .total_cmp(&(b.depth - current_depth).abs())
    });

    match closest_deep {
        Some(d) if current_depth > cfg.slab_max_shallow_depth_km => *d,
        Some(d) => {
            if (d.depth - current_depth).abs() < (shallow.depth - current_depth).abs() {
                *d
            } else {
                *shallow
            }
        }
        None => *shallow,
    }
}

/// Rank and select in one call, logging the outcome.
pub fn select_prior(
    latitude: f64,
    longitude: f64,
    current_depth: f64,
    aux: &dyn AuxiliaryData,
    cfg: &DepthConfig,
) -> BayesianDepth {
    let candidates = rank_candidates(latitude, longitude, aux, cfg);
    let chosen = select(&candidates, current_depth, cfg);
    debug!(
        depth = chosen.depth,
        spread = chosen.spread,
        source = ?chosen.source,
        candidates = candidates.len(),
        "Bayesian depth prior selected"
    );
    chosen
}
