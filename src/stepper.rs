//! Multi-stage iteration controller.
//!
//! Couples the phase identifier, decorrelator, rank-sum estimator, and step
//! search into the location loop: identify phases, set the environment,
//! measure the penalty and a descent direction, search a step, apply it,
//! re-anchor phases, and accept or damp. A phase-identity change restarts
//! the iteration with a fresh direction; damping exhaustion restores the
//! last good audit and exits with a diagnostic status.

use tracing::{debug, info, warn};

use crate::config::defaults::{DISPERSION_SLACK, NEARLY_CONVERGED_RATIO};
use crate::config::LocatorConfig;
use crate::decorr::EigenSignPolicy;
use crate::depth;
use crate::estimator::Dispersion;
use crate::event::Event;
use crate::phase_id::{self, PhaseIdMode};
use crate::providers::{
    AuxiliaryData, CorrelationModel, ProviderError, SessionContext, TravelTimeModel,
    TravelTimeSession,
};
use crate::residual::WeightedResidual;
use crate::status::LocStatus;
use crate::step::{self, StepBounds, StepResult, TrialSpace};

/// Relative dispersion increase still accepted as "did not converge" rather
/// than "unstable" when damping saturates.
const UNSTABLE_RATIO: f64 = 0.1;

/// The iteration controller. Borrows the providers and configuration; all
/// mutable state lives in the `Event`.
pub struct Stepper<'a> {
    pub tt: &'a dyn TravelTimeModel,
    pub aux: &'a dyn AuxiliaryData,
    pub correlation: &'a dyn CorrelationModel,
    pub sign_policy: &'a dyn EigenSignPolicy,
    pub cfg: &'a LocatorConfig,
}

impl<'a> Stepper<'a> {
    pub fn new(
        tt: &'a dyn TravelTimeModel,
        aux: &'a dyn AuxiliaryData,
        correlation: &'a dyn CorrelationModel,
        sign_policy: &'a dyn EigenSignPolicy,
        cfg: &'a LocatorConfig,
    ) -> Self {
        Self {
            tt,
            aux,
            correlation,
            sign_policy,
            cfg,
        }
    }

    fn open_session(
        &self,
        event: &Event,
    ) -> Result<Box<dyn TravelTimeSession + 'a>, ProviderError> {
        self.tt.new_session(&SessionContext {
            earth_model: event.earth_model.clone(),
            source_depth: event.hypocenter.depth,
            source_latitude: event.hypocenter.latitude,
            source_longitude: event.hypocenter.longitude,
            all_phases: false,
            back_branches: false,
            is_tectonic: event.is_tectonic,
            use_regional: true,
        })
    }

    /// Run the location. On return the event carries the final hypocenter,
    /// residuals, and audit trail; close-out still has to run.
    pub fn run(&self, event: &mut Event) -> Result<LocStatus, ProviderError> {
        let depth_cfg = &self.cfg.depth;
        if event.hypocenter.depth < depth_cfg.depth_min_km
            || event.hypocenter.depth > depth_cfg.depth_max_km
        {
            warn!(depth = event.hypocenter.depth, "starting depth out of range");
            return Ok(LocStatus::BadDepth);
        }

        event.hypocenter.degrees_of_freedom = if event.is_depth_held { 2 } else { 3 };

        if event.is_location_held {
            // Single pass: identify phases and residuals at the fixed
            // hypocenter so close-out has data, then stop.
            self.set_environment(event);
            let session = self.open_session(event)?;
            phase_id::identify(event, session.as_ref(), PhaseIdMode::Full, self.cfg);
            if event.stations_used() < self.cfg.stages.min_stations_used {
                return Ok(LocStatus::InsufficientData);
            }
            event.add_audit(0, 0, 0.0, LocStatus::HeldHypocenter);
            return Ok(LocStatus::HeldHypocenter);
        }

        let mut prev_step = self.cfg.stages.initial_step_km;
        let mut needs_decorr = true;
        let mut status = LocStatus::Success;

        for stage in 0..self.cfg.stages.stage_limit {
            if stage == 1 {
                // Loose stages restore externally-requested use flags and
                // always decorrelate.
                for pick in &mut event.picks {
                    if !pick.is_triage {
                        pick.is_used = pick.external_use;
                    }
                }
                event.use_decorrelation = true;
                needs_decorr = true;
            }
            let mode = if stage == 0 {
                PhaseIdMode::NoReId
            } else {
                PhaseIdMode::Full
            };
            let conv = self.cfg.stages.convergence_km[stage];
            let step_max = self.cfg.stages.step_max_km[stage];
            let iter_cap = self.cfg.stages.iterations[stage];

            let mut last_disp: Option<Dispersion> = None;
            let mut converged = false;
            let mut iteration = 0;

            while iteration < iter_cap {
                iteration += 1;

                // (1) Phase identification under the stage mode.
                let session = self.open_session(event)?;
                let outcome = phase_id::identify(event, session.as_ref(), mode, self.cfg);
                if event.stations_used() < self.cfg.stages.min_stations_used {
                    info!(
                        stations = event.stations_used(),
                        "too few stations remain in use"
                    );
                    return Ok(LocStatus::InsufficientData);
                }
                if outcome.changed {
                    // Fresh direction next pass; the reference dispersion
                    // is no longer comparable.
                    event.add_audit(stage, iteration, prev_step, LocStatus::PhaseIdChanged);
                    last_disp = None;
                    needs_decorr = true;
                }

                // (2) Location environment: craton flag and depth prior.
                self.set_environment(event);

                // (3) Reference statistics and descent direction.
                let (d_ref, direction) = self.reference_stats(event, &mut needs_decorr);
                if let Some(prev) = last_disp {
                    let drift = d_ref.bayesian - prev.bayesian;
                    debug!(
                        stage,
                        iteration,
                        dispersion = d_ref.value,
                        previous = prev.value,
                        drift,
                        "iteration reference"
                    );
                    if d_ref.value - drift > prev.value + DISPERSION_SLACK {
                        // The applied step made things worse: damp it.
                        match self.damp_step(
                            event,
                            stage,
                            iteration,
                            prev,
                            d_ref,
                            prev_step,
                            &mut needs_decorr,
                        )? {
                            DampOutcome::Recovered { step, dispersion } => {
                                prev_step = step;
                                last_disp = Some(dispersion);
                                status = LocStatus::DampStepLength;
                                continue;
                            }
                            DampOutcome::Saturated(terminal) => {
                                return Ok(terminal);
                            }
                        }
                    }
                }

                // (4) Step search along the direction. Stage 0 probes with
                // a deliberately tiny first step.
                let start = if stage == 0 && iteration == 1 {
                    self.cfg.stages.initial_step_km
                } else {
                    prev_step.max(2.0 * conv).min(step_max)
                };
                let bounds = StepBounds {
                    start,
                    min: 0.01 * conv,
                    max: step_max,
                    depth: event.hypocenter.depth,
                    depth_min: self.cfg.depth.depth_min_km,
                    depth_max: self.cfg.depth.depth_max_km,
                };
                let result = self.search_step(event, &direction, &bounds, d_ref);

                if result.step_len < conv && result.dispersion.value >= d_ref.value {
                    // No downhill move within tolerance: converged.
                    event.add_audit(stage, iteration, result.step_len, LocStatus::Success);
                    converged = true;
                    break;
                }

                // (5) Apply the step. The audit taken first is the restore
                // point if damping is needed.
                event.add_audit(stage, iteration, result.step_len, status);
                event.update_step(&result.step_vec, 0.0, self.cfg);
                let session = self.open_session(event)?;
                let re_id =
                    phase_id::identify(event, session.as_ref(), PhaseIdMode::NoReId, self.cfg);
                self.shift_origin_to_median(event);

                prev_step = result.step_len;
                if re_id.changed {
                    event.add_audit(stage, iteration, result.step_len, LocStatus::PhaseIdChanged);
                    last_disp = None;
                    needs_decorr = true;
                    status = LocStatus::PhaseIdChanged;
                    continue;
                }
                last_disp = Some(d_ref);
                status = LocStatus::Success;

                if result.step_len <= conv {
                    converged = true;
                    break;
                }
            }

            debug!(stage, converged, "stage finished");
            if !converged && stage + 1 == self.cfg.stages.stage_limit {
                return Ok(LocStatus::DidNotConverge);
            }
        }

        Ok(LocStatus::Success)
    }

    /// Craton flag and Bayesian depth prior for the current epicentre, then
    /// refresh the Bayesian pseudo-row.
    fn set_environment(&self, event: &mut Event) {
        event.is_tectonic = !self
            .aux
            .craton_contains(event.hypocenter.latitude, event.hypocenter.longitude);
        if !event.is_bayes_fixed {
            let prior = depth::select_prior(
                event.hypocenter.latitude,
                event.hypocenter.longitude,
                event.hypocenter.depth,
                self.aux,
                &self.cfg.depth,
            );
            event.hypocenter.set_bayes(prior.depth, prior.spread);
        }
        update_bayes_row(event);
    }

    /// Demedian, optionally decorrelate and project, demedian the design
    /// matrix, and return the dispersion and descent direction.
    fn reference_stats(&self, event: &mut Event, needs_decorr: &mut bool) -> (Dispersion, [f64; 3]) {
        let dof = event.hypocenter.degrees_of_freedom;

        {
            let Event {
                rse_raw, residuals, ..
            } = event;
            let (_, anchor) = rse_raw.median(residuals);
            rse_raw.demedian_residuals(residuals);
            rse_raw.demedian_design_matrix(residuals, anchor);
        }

        if !event.use_decorrelation {
            let Event {
                rse_raw, residuals, ..
            } = event;
            let d = rse_raw.dispersion(residuals);
            let u = rse_raw.steepest_descent(residuals, dof);
            return (d, u);
        }

        // Decorrelated path: freeze the sorted, demedianed order as the
        // projection basis.
        event.save_original_residuals();
        let pick_rows = event
            .original_order
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .count();
        if *needs_decorr || pick_rows != event.decorr.rows_spanned() {
            event.decorrelate(self.correlation, self.cfg);
            event.save_original_residuals();
            *needs_decorr = false;
        }
        event.project_picks(self.sign_policy, self.cfg);

        if event.projected.len() < 2 {
            // Projection collapsed; fall back to the raw rows.
            warn!("projection produced fewer than two rows, using raw residuals");
            let Event {
                rse_raw, residuals, ..
            } = event;
            let d = rse_raw.dispersion(residuals);
            let u = rse_raw.steepest_descent(residuals, dof);
            return (d, u);
        }
        let Event {
            rse_proj,
            projected,
            ..
        } = event;
        let (_, anchor) = rse_proj.median(projected);
        rse_proj.demedian_residuals(projected);
        rse_proj.demedian_design_matrix(projected, anchor);
        let d = rse_proj.dispersion(projected);
        let u = rse_proj.steepest_descent(projected, dof);
        (d, u)
    }

    /// Run the line search in the active residual space.
    fn search_step(
        &self,
        event: &mut Event,
        direction: &[f64; 3],
        bounds: &StepBounds,
        d_ref: Dispersion,
    ) -> StepResult {
        if event.use_decorrelation && event.decorr.retained() > 0 {
            let mut space = ProjectedSpace { event };
            step::search(&mut space, direction, bounds, d_ref)
        } else {
            let Event {
                rse_raw, residuals, ..
            } = event;
            let mut space = RawSpace {
                rows: residuals,
                rse: rse_raw,
            };
            step::search(&mut space, direction, bounds, d_ref)
        }
    }

    /// Pull the origin time to the median of the freshly re-anchored
    /// residuals, keeping later phase passes centred.
    fn shift_origin_to_median(&self, event: &mut Event) {
        let mut rows: Vec<f64> = event
            .residuals
            .iter()
            .filter(|r| !r.is_bayesian_depth)
            .map(|r| r.residual)
            .collect();
        if rows.len() < 2 {
            return;
        }
        rows.sort_by(f64::total_cmp);
        let n = rows.len();
        let median = if n % 2 == 0 {
            0.5 * (rows[n / 2 - 1] + rows[n / 2])
        } else {
            rows[n / 2]
        };
        if median.abs() > 0.0 {
            event.update_origin_time(median);
        }
    }

    /// Halve the step from the last good audit until the dispersion drops
    /// or the step collapses below tolerance.
    #[allow(clippy::too_many_arguments)]
    fn damp_step(
        &self,
        event: &mut Event,
        stage: usize,
        iteration: usize,
        reference: Dispersion,
        failed: Dispersion,
        failed_step: f64,
        needs_decorr: &mut bool,
    ) -> Result<DampOutcome, ProviderError> {
        let conv = self.cfg.stages.convergence_km[stage];
        let Some(restore_point) = event.last_audit().cloned() else {
            return Ok(DampOutcome::Saturated(LocStatus::UnstableSolution));
        };

        let mut step_len = failed_step;
        let mut last_value = failed.value;
        loop {
            step_len *= self.cfg.stages.dampening;
            event.restore(&restore_point, self.cfg);
            if step_len < conv {
                // Saturated: leave the event at the last good state and
                // grade the failure by how far the dispersion overshot.
                let session = self.open_session(event)?;
                phase_id::identify(event, session.as_ref(), PhaseIdMode::NoReId, self.cfg);
                let ratio = (last_value - reference.value).max(0.0)
                    / reference.value.abs().max(1.0e-12);
                let terminal = if ratio <= NEARLY_CONVERGED_RATIO {
                    LocStatus::NearlyConverged
                } else if ratio <= UNSTABLE_RATIO {
                    LocStatus::DidNotConverge
                } else {
                    LocStatus::UnstableSolution
                };
                warn!(stage, iteration, ratio, status = %terminal, "step damping saturated");
                event.add_audit(stage, iteration, step_len, terminal);
                return Ok(DampOutcome::Saturated(terminal));
            }

            // Re-derive the direction at the restored state and try the
            // shorter step.
            let session = self.open_session(event)?;
            phase_id::identify(event, session.as_ref(), PhaseIdMode::NoReId, self.cfg);
            self.set_environment(event);
            let (d_here, direction) = self.reference_stats(event, needs_decorr);

            let mut vec = [
                step_len * direction[0],
                step_len * direction[1],
                step_len * direction[2],
            ];
            let clamped = (event.hypocenter.depth + vec[2])
                .clamp(self.cfg.depth.depth_min_km, self.cfg.depth.depth_max_km);
            vec[2] = clamped - event.hypocenter.depth;

            event.update_step(&vec, 0.0, self.cfg);
            let session = self.open_session(event)?;
            phase_id::identify(event, session.as_ref(), PhaseIdMode::NoReId, self.cfg);
            self.shift_origin_to_median(event);
            self.set_environment(event);
            let (d_new, _) = self.reference_stats(event, needs_decorr);

            let drift = d_new.bayesian - d_here.bayesian;
            debug!(
                stage,
                iteration,
                step = step_len,
                dispersion = d_new.value,
                reference = d_here.value,
                "damped retry"
            );
            if d_new.value - drift <= d_here.value + DISPERSION_SLACK {
                event.add_audit(stage, iteration, step_len, LocStatus::DampStepLength);
                return Ok(DampOutcome::Recovered {
                    step: step_len,
                    dispersion: d_new,
                });
            }
            last_value = d_new.value;
        }
    }
}

/// Outcome of a damping spiral.
enum DampOutcome {
    Recovered { step: f64, dispersion: Dispersion },
    Saturated(LocStatus),
}

/// Refresh (or create) the Bayesian pseudo-row for the current prior.
fn update_bayes_row(event: &mut Event) {
    let depth = event.hypocenter.depth;
    let bayes_depth = event.hypocenter.bayes_depth;
    let bayes_spread = event.hypocenter.bayes_spread;
    if bayes_spread <= 0.0 {
        event.residuals.retain(|r| !r.is_bayesian_depth);
        return;
    }
    let row = WeightedResidual::bayesian_depth(depth, bayes_depth, bayes_spread);
    match event
        .residuals
        .iter_mut()
        .find(|r| r.is_bayesian_depth)
    {
        Some(existing) => *existing = row,
        None => event.residuals.push(row),
    }
}

// ============================================================================
// Trial spaces for the line search
// ============================================================================

/// Raw rows: the estimate lives directly on each row.
struct RawSpace<'a> {
    rows: &'a mut Vec<WeightedResidual>,
    rse: &'a mut crate::estimator::RankSumEstimator,
}

impl TrialSpace for RawSpace<'_> {
    fn evaluate(&mut self, step: &[f64; 3]) -> (f64, Dispersion) {
        for row in self.rows.iter_mut() {
            row.update_estimate(step);
        }
        let median = self.rse.lin_est_median(self.rows);
        self.rse.demedian_est(self.rows);
        let dispersion = self.rse.est_dispersion(self.rows);
        (median, dispersion)
    }
}

/// Decorrelated rows: raw estimates are refreshed, then re-projected
/// through the frozen eigenvectors.
struct ProjectedSpace<'a> {
    event: &'a mut Event,
}

impl TrialSpace for ProjectedSpace<'_> {
    fn evaluate(&mut self, step: &[f64; 3]) -> (f64, Dispersion) {
        for row in self.event.original_order.iter_mut() {
            row.update_estimate(step);
        }
        self.event.project_estimated_picks();
        let Event {
            rse_proj,
            projected,
            ..
        } = self.event;
        let median = rse_proj.lin_est_median(projected);
        rse_proj.demedian_est(projected);
        let dispersion = rse_proj.est_dispersion(projected);
        (median, dispersion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Hypocenter;

    #[test]
    fn test_bayes_row_refresh() {
        let mut event = Event::new(Hypocenter::new(0.0, 0.0, 0.0, 10.0));
        event.hypocenter.set_bayes(550.0, 40.0);
        update_bayes_row(&mut event);
        assert_eq!(event.residuals.len(), 1);
        assert!(event.residuals[0].is_bayesian_depth);
        assert!((event.residuals[0].residual - (10.0 - 550.0)).abs() < 1.0e-9);

        // Prior moves: the row follows, no duplicate appears.
        event.hypocenter.set_bayes(300.0, 30.0);
        update_bayes_row(&mut event);
        assert_eq!(event.residuals.len(), 1);
        assert!((event.residuals[0].residual - (10.0 - 300.0)).abs() < 1.0e-9);

        // Spread collapses to zero: the row disappears.
        event.hypocenter.set_bayes(300.0, 0.0);
        update_bayes_row(&mut event);
        assert!(event.residuals.is_empty());
    }
}
