//! Event state: the arena owning stations, picks, groups, residual arrays,
//! estimators, the decorrelation projection, and the audit trail.
//!
//! All cross-references are indices into the arenas, never pointers, so
//! audit snapshots stay primitive and the estimator can reorder residual
//! rows freely.

use tracing::debug;

use crate::config::LocatorConfig;
use crate::decorr::{Decorrelator, EigenSignPolicy};
use crate::estimator::RankSumEstimator;
use crate::geo;
use crate::providers::{CorrelationContext, CorrelationModel};
use crate::residual::WeightedResidual;
use crate::status::LocStatus;

use super::audit::HypoAudit;
use super::hypocenter::Hypocenter;
use super::pick::{phase_type_is_p, Pick, PickGroup};
use super::station::Station;

/// One seismic event being located.
#[derive(Debug)]
pub struct Event {
    /// Earth model name handed to every travel-time session.
    pub earth_model: String,
    pub hypocenter: Hypocenter,
    pub stations: Vec<Station>,
    pub picks: Vec<Pick>,
    /// Station pick groups, ordered by epicentral distance.
    pub groups: Vec<PickGroup>,

    /// Live weighted-residual rows; freely reordered by estimator sorts.
    pub residuals: Vec<WeightedResidual>,
    /// Copy of `residuals` in build order, for the decorrelation projection.
    pub original_order: Vec<WeightedResidual>,
    /// Projected (virtual) rows, Bayesian row appended last.
    pub projected: Vec<WeightedResidual>,

    pub rse_raw: RankSumEstimator,
    pub rse_proj: RankSumEstimator,
    pub decorr: Decorrelator,

    /// Audit ring, oldest first.
    pub audits: Vec<HypoAudit>,

    pub is_location_held: bool,
    pub is_depth_held: bool,
    /// Analyst supplied the Bayesian depth; never replaced by slab/zone data.
    pub is_bayes_fixed: bool,
    pub use_decorrelation: bool,
    pub is_location_new: bool,
    pub is_location_restarted: bool,
    /// Source lies in a stable craton.
    pub is_tectonic: bool,
}

impl Event {
    pub fn new(hypocenter: Hypocenter) -> Self {
        Self {
            earth_model: "ak135".to_string(),
            hypocenter,
            stations: Vec::new(),
            picks: Vec::new(),
            groups: Vec::new(),
            residuals: Vec::new(),
            original_order: Vec::new(),
            projected: Vec::new(),
            rse_raw: RankSumEstimator::new(),
            rse_proj: RankSumEstimator::new(),
            decorr: Decorrelator::new(),
            audits: Vec::new(),
            is_location_held: false,
            is_depth_held: false,
            is_bayes_fixed: false,
            use_decorrelation: false,
            is_location_new: true,
            is_location_restarted: false,
            is_tectonic: false,
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Add a station, deduplicating by identity. Returns its arena index.
    pub fn add_station(&mut self, station: Station) -> usize {
        if let Some(idx) = self.stations.iter().position(|s| s.id == station.id) {
            return idx;
        }
        self.stations.push(station);
        self.stations.len() - 1
    }

    pub fn add_pick(&mut self, pick: Pick) -> usize {
        self.picks.push(pick);
        self.picks.len() - 1
    }

    /// Group picks by station and compute the initial geometry.
    pub fn build_groups(&mut self) {
        self.groups.clear();
        for station in 0..self.stations.len() {
            let mut members: Vec<usize> = (0..self.picks.len())
                .filter(|&p| self.picks[p].station == station)
                .collect();
            if members.is_empty() {
                continue;
            }
            members.sort_by(|&a, &b| {
                self.picks[a]
                    .arrival_time
                    .total_cmp(&self.picks[b].arrival_time)
            });
            self.groups.push(PickGroup {
                station,
                picks: members,
                distance_deg: 0.0,
                azimuth_deg: 0.0,
                fom: 0.0,
            });
        }
        self.refresh_travel_times();
        self.refresh_geometry();
    }

    // ========================================================================
    // State updates (C10 operations)
    // ========================================================================

    /// Set all hypocenter fields and refresh every derived quantity.
    pub fn update(&mut self, origin_time: f64, latitude: f64, longitude: f64, depth: f64, cfg: &LocatorConfig) {
        self.hypocenter
            .set(origin_time, latitude, longitude, depth, &cfg.depth);
        self.refresh_travel_times();
        self.refresh_geometry();
    }

    /// Apply a spatial step plus an origin-time shift.
    pub fn update_step(&mut self, step: &[f64; 3], dt0: f64, cfg: &LocatorConfig) {
        self.hypocenter.apply_step(step, dt0, &cfg.depth);
        self.refresh_travel_times();
        self.refresh_geometry();
    }

    /// Cheap origin-only update: shifts travel times and residuals, keeps
    /// distances and azimuths.
    pub fn update_origin_time(&mut self, dt0: f64) {
        self.hypocenter.origin_time += dt0;
        for pick in &mut self.picks {
            pick.travel_time -= dt0;
            if pick.is_used {
                pick.residual -= dt0;
            }
        }
        for rows in [
            &mut self.residuals,
            &mut self.original_order,
        ] {
            for row in rows.iter_mut() {
                if !row.is_bayesian_depth {
                    row.residual -= dt0;
                    row.est_residual -= dt0;
                }
            }
        }
    }

    /// Revert to an audit snapshot.
    pub fn restore(&mut self, audit: &HypoAudit, cfg: &LocatorConfig) {
        debug!(
            stage = audit.stage,
            iteration = audit.iteration,
            "restoring hypocenter from audit"
        );
        self.hypocenter.set(
            audit.origin_time,
            audit.latitude,
            audit.longitude,
            audit.depth,
            &cfg.depth,
        );
        self.hypocenter.set_bayes(audit.bayes_depth, audit.bayes_spread);
        self.refresh_travel_times();
        self.refresh_geometry();
    }

    /// Record an audit snapshot.
    pub fn add_audit(&mut self, stage: usize, iteration: usize, step_len: f64, status: LocStatus) {
        let audit = HypoAudit::snapshot(
            &self.hypocenter,
            stage,
            iteration,
            self.stations_used(),
            step_len,
            status,
        );
        debug!(audit = %audit, "audit");
        self.audits.push(audit);
    }

    /// Last audit snapshot, if any.
    pub fn last_audit(&self) -> Option<&HypoAudit> {
        self.audits.last()
    }

    /// Shallow-copy the raw residual rows in their current build order, for
    /// use by the decorrelation projection after the live array is sorted.
    pub fn save_original_residuals(&mut self) {
        self.original_order.clone_from(&self.residuals);
    }

    // ========================================================================
    // Derived data
    // ========================================================================

    /// Recompute each group's distance and azimuth from the current
    /// hypocenter and keep the groups ordered by distance.
    pub fn refresh_geometry(&mut self) {
        for group in &mut self.groups {
            let station = &self.stations[group.station];
            let (delta, azimuth) = geo::distance_azimuth_cached(
                self.hypocenter.sin_colat,
                self.hypocenter.cos_colat,
                self.hypocenter.longitude,
                station.latitude,
                station.longitude,
            );
            group.distance_deg = delta;
            group.azimuth_deg = azimuth;
        }
        self.groups
            .sort_by(|a, b| a.distance_deg.total_cmp(&b.distance_deg));
    }

    /// Refresh every pick's cached travel time from the origin time.
    pub fn refresh_travel_times(&mut self) {
        let t0 = self.hypocenter.origin_time;
        for pick in &mut self.picks {
            pick.travel_time = pick.arrival_time - t0;
        }
        for group in &mut self.groups {
            let picks = &self.picks;
            group
                .picks
                .sort_by(|&a, &b| picks[a].travel_time.total_cmp(&picks[b].travel_time));
        }
    }

    /// Stations with at least one used pick.
    pub fn stations_used(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.picks.iter().any(|&p| self.picks[p].is_used))
            .count()
    }

    /// Count of used picks.
    pub fn picks_used(&self) -> usize {
        self.picks.iter().filter(|p| p.is_used).count()
    }

    /// Stations with any associated pick.
    pub fn stations_associated(&self) -> usize {
        self.groups.len()
    }

    /// All associated picks.
    pub fn picks_associated(&self) -> usize {
        self.picks.len()
    }

    /// Smallest epicentral distance among stations with used picks (deg).
    pub fn minimum_distance(&self) -> f64 {
        self.groups
            .iter()
            .filter(|g| g.picks.iter().any(|&p| self.picks[p].is_used))
            .map(|g| g.distance_deg)
            .fold(f64::INFINITY, f64::min)
    }

    /// Root-mean-square of the used picks' residuals (s).
    pub fn rms_residual(&self) -> f64 {
        let used: Vec<f64> = self
            .picks
            .iter()
            .filter(|p| p.is_used)
            .map(|p| p.residual)
            .collect();
        if used.is_empty() {
            return 0.0;
        }
        (used.iter().map(|r| r * r).sum::<f64>() / used.len() as f64).sqrt()
    }

    // ========================================================================
    // Decorrelation plumbing
    // ========================================================================

    /// Correlation contexts for the non-Bayesian rows of the saved
    /// original-order array.
    fn correlation_contexts(&self) -> Vec<CorrelationContext> {
        self.original_order
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .map(|row| {
                let pick = row.pick.map(|p| &self.picks[p]);
                let station = pick.map(|p| &self.stations[p.station]);
                CorrelationContext {
                    station_latitude: station.map_or(0.0, |s| s.latitude),
                    station_longitude: station.map_or(0.0, |s| s.longitude),
                    is_p_type: pick.is_some_and(|p| phase_type_is_p(&p.current_phase)),
                    window: 1.0 / row.weight.max(1.0e-9),
                }
            })
            .collect()
    }

    /// Build (or rebuild) the decorrelation projection from the saved
    /// original-order rows, flagging triaged picks sticky-unused.
    pub fn decorrelate(&mut self, model: &dyn CorrelationModel, cfg: &LocatorConfig) {
        let rows: Vec<WeightedResidual> = self
            .original_order
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .cloned()
            .collect();
        let contexts = self.correlation_contexts();
        let mut decorr = std::mem::take(&mut self.decorr);
        let triage = decorr.decorrelate(&rows, &contexts, model, &cfg.decorrelation);
        self.decorr = decorr;

        for pick_idx in triage.eliminated_picks {
            let pick = &mut self.picks[pick_idx];
            pick.is_triage = true;
            pick.is_used = false;
            pick.weight = 0.0;
            debug!(pick = %pick.external_id, "pick triaged out of decorrelation");
        }
        // Drop triaged rows from both raw arrays so the estimator and the
        // projection see the same pick set.
        let picks = &self.picks;
        let alive =
            |row: &WeightedResidual| row.pick.map_or(true, |p| !picks[p].is_triage);
        self.residuals.retain(alive);
        self.original_order.retain(alive);
    }

    /// Project picks (residuals + derivatives) onto the retained
    /// eigenvectors and append the Bayesian row unchanged.
    pub fn project_picks(&mut self, policy: &dyn EigenSignPolicy, cfg: &LocatorConfig) {
        let rows: Vec<WeightedResidual> = self
            .original_order
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .cloned()
            .collect();
        let mut decorr = std::mem::take(&mut self.decorr);
        decorr.project_picks(&rows, &mut self.projected, policy, &cfg.decorrelation);
        self.decorr = decorr;
        if let Some(bayes) = self
            .original_order
            .iter()
            .find(|r| r.is_bayesian_depth)
        {
            self.projected.push(bayes.clone());
        }
    }

    /// Project only the linear-estimate residuals through the frozen
    /// eigenvectors; the Bayesian row's estimate is copied through.
    pub fn project_estimated_picks(&mut self) {
        let rows: Vec<WeightedResidual> = self
            .original_order
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .cloned()
            .collect();
        self.decorr
            .project_estimated_picks(&rows, &mut self.projected);
        if let Some(bayes) = self.original_order.iter().find(|r| r.is_bayesian_depth) {
            if let Some(out) = self
                .projected
                .iter_mut()
                .find(|r| r.is_bayesian_depth)
            {
                out.est_residual = bayes.est_residual;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::pick::AuthorType;
    use crate::event::station::StationId;

    fn test_station(name: &str, lat: f64, lon: f64) -> Station {
        Station {
            id: StationId {
                network: "XX".to_string(),
                station: name.to_string(),
                location: "00".to_string(),
            },
            latitude: lat,
            longitude: lon,
            elevation: 0.0,
        }
    }

    fn test_pick(station: usize, arrival: f64) -> Pick {
        Pick {
            external_id: format!("pick-{station}-{arrival}"),
            station,
            channel: "BHZ".to_string(),
            arrival_time: arrival,
            quality: 0.5,
            external_use: true,
            affinity: 1.0,
            author_type: AuthorType::LocalHuman,
            original_phase: "P".to_string(),
            current_phase: "P".to_string(),
            best_phase: "P".to_string(),
            residual: 0.0,
            weight: 1.0,
            importance: 0.0,
            is_used: true,
            is_automatic: false,
            is_surface_wave: false,
            is_triage: false,
            travel_time: 0.0,
            scratch: Default::default(),
        }
    }

    fn small_event() -> Event {
        let mut event = Event::new(Hypocenter::new(1000.0, 0.0, 0.0, 10.0));
        let s0 = event.add_station(test_station("AAA", 1.0, 0.0));
        let s1 = event.add_station(test_station("BBB", 0.0, 5.0));
        event.add_pick(test_pick(s0, 1030.0));
        event.add_pick(test_pick(s1, 1075.0));
        event.add_pick(test_pick(s1, 1130.0));
        event.build_groups();
        event
    }

    #[test]
    fn test_groups_ordered_by_distance() {
        let event = small_event();
        assert_eq!(event.groups.len(), 2);
        assert!(event.groups[0].distance_deg < event.groups[1].distance_deg);
        assert_eq!(event.groups[1].picks.len(), 2);
    }

    #[test]
    fn test_noop_update_is_idempotent() {
        let mut event = small_event();
        let before_tt: Vec<f64> = event.picks.iter().map(|p| p.travel_time).collect();
        let before_dist: Vec<f64> = event.groups.iter().map(|g| g.distance_deg).collect();
        let h = event.hypocenter.clone();
        event.update(h.origin_time, h.latitude, h.longitude, h.depth, &LocatorConfig::default());
        let after_tt: Vec<f64> = event.picks.iter().map(|p| p.travel_time).collect();
        let after_dist: Vec<f64> = event.groups.iter().map(|g| g.distance_deg).collect();
        assert_eq!(before_tt, after_tt);
        assert_eq!(before_dist, after_dist);
    }

    #[test]
    fn test_origin_shift_updates_travel_times_only() {
        let mut event = small_event();
        let dist_before: Vec<f64> = event.groups.iter().map(|g| g.distance_deg).collect();
        let tt_before: Vec<f64> = event.picks.iter().map(|p| p.travel_time).collect();
        event.update_origin_time(2.0);
        assert!((event.hypocenter.origin_time - 1002.0).abs() < 1.0e-12);
        for (p, before) in event.picks.iter().zip(tt_before) {
            assert!((p.travel_time - (before - 2.0)).abs() < 1.0e-12);
        }
        let dist_after: Vec<f64> = event.groups.iter().map(|g| g.distance_deg).collect();
        assert_eq!(dist_before, dist_after);
    }

    #[test]
    fn test_restore_round_trip() {
        let cfg = LocatorConfig::default();
        let mut event = small_event();
        event.add_audit(0, 0, 0.0, LocStatus::Success);
        event.update_step(&[50.0, -30.0, 15.0], 3.0, &cfg);
        assert!((event.hypocenter.depth - 25.0).abs() < 1.0e-9);
        let audit = event.audits[0].clone();
        event.restore(&audit, &cfg);
        assert!((event.hypocenter.latitude - 0.0).abs() < 1.0e-9);
        assert!((event.hypocenter.longitude - 0.0).abs() < 1.0e-9);
        assert!((event.hypocenter.depth - 10.0).abs() < 1.0e-9);
        assert!((event.hypocenter.origin_time - 1000.0).abs() < 1.0e-9);
    }

    #[test]
    fn test_counts() {
        let mut event = small_event();
        assert_eq!(event.stations_used(), 2);
        assert_eq!(event.picks_used(), 3);
        assert_eq!(event.picks_associated(), 3);
        event.picks[1].is_used = false;
        event.picks[2].is_used = false;
        assert_eq!(event.stations_used(), 1);
        assert_eq!(event.picks_used(), 1);
    }

    #[test]
    fn test_station_dedup() {
        let mut event = Event::new(Hypocenter::new(0.0, 0.0, 0.0, 10.0));
        let a = event.add_station(test_station("AAA", 1.0, 0.0));
        let b = event.add_station(test_station("AAA", 1.0, 0.0));
        assert_eq!(a, b);
        assert_eq!(event.stations.len(), 1);
    }
}
