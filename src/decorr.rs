//! Residual decorrelation.
//!
//! Correlated picks are projected onto the retained eigenvectors of their
//! empirical residual covariance, yielding statistically independent
//! "virtual picks" whose weights are the inverse square roots of the
//! eigenvalues. The eigenvectors are frozen between phase-identification
//! passes so the step search can re-project linear estimates cheaply.

use nalgebra::{DMatrix, SymmetricEigen};
use tracing::{debug, warn};

use crate::config::DecorrelationConfig;
use crate::providers::{CorrelationContext, CorrelationModel};
use crate::residual::WeightedResidual;

/// Evidence for the eigenvector sign decision.
#[derive(Debug, Clone, Copy)]
pub struct SignEvidence {
    /// Dot product of the eigenvector with the raw residuals it projects.
    pub residual_correlation: f64,
    /// Dot product of the eigenvector with the raw depth derivatives.
    pub depth_derivative: f64,
}

/// Decides whether an eigenvector must be flipped in place.
///
/// The sign of an eigenvector is arbitrary; the engine's convention is that
/// a projected row correlates positively with its raw inputs. Near-zero
/// correlations are a heuristic regime, so the predicate is pluggable.
pub trait EigenSignPolicy: Sync {
    fn flip(&self, evidence: &SignEvidence, correlation_floor: f64) -> bool;
}

/// Default heuristic: trust the residual correlation when it is resolvable,
/// otherwise fall back to the depth-derivative tiebreaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSignPolicy;

impl EigenSignPolicy for DefaultSignPolicy {
    fn flip(&self, evidence: &SignEvidence, correlation_floor: f64) -> bool {
        if evidence.residual_correlation.abs() > correlation_floor {
            evidence.residual_correlation < 0.0
        } else {
            evidence.depth_derivative < 0.0
        }
    }
}

/// Outcome of the covariance triage: pick indices that were eliminated.
#[derive(Debug, Default)]
pub struct TriageResult {
    pub eliminated_picks: Vec<usize>,
}

/// The decorrelation projection.
///
/// Built by `decorrelate()`, applied by `project_picks()` /
/// `project_estimated_picks()`. Eigenvectors span the surviving rows in
/// their original (pre-sort) order.
#[derive(Debug, Default)]
pub struct Decorrelator {
    /// Retained eigenvectors, one inner Vec per virtual pick.
    eigenvectors: Vec<Vec<f64>>,
    /// Matching eigenvalues, descending.
    eigenvalues: Vec<f64>,
    /// Number of raw rows the projection spans.
    n_rows: usize,
    /// Trace of the covariance, for diagnostics and tests.
    total_variance: f64,
}

impl Decorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of virtual picks the projection produces.
    pub fn retained(&self) -> usize {
        self.eigenvectors.len()
    }

    /// Number of raw rows the projection spans.
    pub fn rows_spanned(&self) -> usize {
        self.n_rows
    }

    /// Sum of all covariance eigenvalues (the trace).
    pub fn total_variance(&self) -> f64 {
        self.total_variance
    }

    /// Sum of the retained eigenvalues.
    pub fn retained_variance(&self) -> f64 {
        self.eigenvalues.iter().sum()
    }

    /// Build the covariance of the given rows under the correlation model.
    ///
    /// The diagonal is the per-pick variance (inverse squared weight); the
    /// off-diagonal entries scale the model correlation by both sigmas.
    fn covariance(
        rows: &[WeightedResidual],
        contexts: &[CorrelationContext],
        model: &dyn CorrelationModel,
    ) -> DMatrix<f64> {
        let n = rows.len();
        let mut cov = DMatrix::zeros(n, n);
        for i in 0..n {
            let sigma_i = 1.0 / rows[i].weight.max(1.0e-9);
            cov[(i, i)] = sigma_i * sigma_i;
            for j in (i + 1)..n {
                let sigma_j = 1.0 / rows[j].weight.max(1.0e-9);
                let c = model.correlation(&contexts[i], &contexts[j]) * sigma_i * sigma_j;
                cov[(i, j)] = c;
                cov[(j, i)] = c;
            }
        }
        cov
    }

    /// Iteratively drop the pick with the largest off-diagonal row sum
    /// until at most `cap` rows remain. Returns local row indices kept and
    /// the pick indices eliminated.
    fn triage(cov: &DMatrix<f64>, rows: &[WeightedResidual], cap: usize) -> (Vec<usize>, TriageResult) {
        let n = rows.len();
        let mut alive: Vec<bool> = vec![true; n];
        let mut row_sums: Vec<f64> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i)
                    .map(|j| cov[(i, j)].abs())
                    .sum()
            })
            .collect();

        let mut result = TriageResult::default();
        let mut remaining = n;
        while remaining > cap {
            let worst = (0..n)
                .filter(|&i| alive[i])
                .max_by(|&a, &b| row_sums[a].total_cmp(&row_sums[b]));
            let Some(worst) = worst else { break };
            alive[worst] = false;
            remaining -= 1;
            for j in 0..n {
                if alive[j] && j != worst {
                    row_sums[j] -= cov[(j, worst)].abs();
                }
            }
            if let Some(pick) = rows[worst].pick {
                result.eliminated_picks.push(pick);
            }
        }

        let kept: Vec<usize> = (0..n).filter(|&i| alive[i]).collect();
        (kept, result)
    }

    /// Construct the projection for the given rows (Bayesian row excluded
    /// by the caller). Returns the triage outcome; eliminated picks must be
    /// flagged sticky by the event so they never re-enter.
    pub fn decorrelate(
        &mut self,
        rows: &[WeightedResidual],
        contexts: &[CorrelationContext],
        model: &dyn CorrelationModel,
        cfg: &DecorrelationConfig,
    ) -> TriageResult {
        debug_assert_eq!(rows.len(), contexts.len());
        let full_cov = Self::covariance(rows, contexts, model);
        let (kept, triage) = Self::triage(&full_cov, rows, cfg.max_picks_decorr);

        let cov = if kept.len() == rows.len() {
            full_cov
        } else {
            DMatrix::from_fn(kept.len(), kept.len(), |i, j| full_cov[(kept[i], kept[j])])
        };
        // The caller drops triaged rows before projecting, so the
        // projection spans exactly the surviving rows in their kept order.
        self.n_rows = kept.len();
        self.total_variance = cov.trace();

        let eigen = SymmetricEigen::new(cov);
        let n = eigen.eigenvalues.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let max_eig = order
            .first()
            .map_or(0.0, |&i| eigen.eigenvalues[i].max(0.0));
        let limit = cfg.eigen_limit * self.total_variance;

        self.eigenvectors.clear();
        self.eigenvalues.clear();
        let mut cumulative = 0.0;
        for &idx in &order {
            let value = eigen.eigenvalues[idx];
            if value <= 1.0e-12 {
                break;
            }
            // Stop once enough variance is captured and the remainder is
            // negligible against the dominant eigenvalue.
            if cumulative > limit && value <= cfg.eigen_thresh * max_eig {
                break;
            }
            let vector: Vec<f64> = (0..kept.len())
                .map(|local| eigen.eigenvectors[(local, idx)])
                .collect();
            self.eigenvectors.push(vector);
            self.eigenvalues.push(value);
            cumulative += value;
        }

        if self.eigenvectors.is_empty() {
            warn!("decorrelation retained no eigenvectors; projection is empty");
        }
        debug!(
            raw = rows.len(),
            kept = kept.len(),
            retained = self.eigenvectors.len(),
            variance = self.total_variance,
            "decorrelation built"
        );
        triage
    }

    /// Re-consent every eigenvector's sign against the current residuals,
    /// then project residuals, derivatives, and estimates into `out`.
    ///
    /// `rows` must be in the same original order the projection was built
    /// from (`Event::save_original_residuals`).
    pub fn project_picks(
        &mut self,
        rows: &[WeightedResidual],
        out: &mut Vec<WeightedResidual>,
        policy: &dyn EigenSignPolicy,
        cfg: &DecorrelationConfig,
    ) {
        out.clear();
        if rows.len() != self.n_rows {
            warn!(
                expected = self.n_rows,
                got = rows.len(),
                "projection row count changed since decorrelate(); skipping"
            );
            return;
        }
        for (k, vector) in self.eigenvectors.iter_mut().enumerate() {
            let mut evidence = SignEvidence {
                residual_correlation: 0.0,
                depth_derivative: 0.0,
            };
            for (v, row) in vector.iter().zip(rows) {
                evidence.residual_correlation += v * row.residual;
                evidence.depth_derivative += v * row.deriv[2];
            }
            if policy.flip(&evidence, cfg.sign_correlation_floor) {
                for v in vector.iter_mut() {
                    *v = -*v;
                }
            }

            let mut residual = 0.0;
            let mut est_residual = 0.0;
            let mut deriv = [0.0_f64; 3];
            for (v, row) in vector.iter().zip(rows) {
                residual += v * row.residual;
                est_residual += v * row.est_residual;
                for i in 0..3 {
                    deriv[i] += v * row.deriv[i];
                }
            }
            let mut projected = WeightedResidual::for_pick(0, residual, 1.0, deriv);
            projected.pick = None;
            projected.weight = 1.0 / self.eigenvalues[k].sqrt();
            projected.est_residual = est_residual;
            // The estimator reorders projected rows; the sort key remembers
            // which eigenvector owns this row.
            projected.sort_key = k as f64;
            out.push(projected);
        }
    }

    /// Project only the linear-estimate residuals using the frozen
    /// eigenvectors; never recomputes the decomposition. `out` must hold the
    /// rows produced by the last `project_picks()`, in any order (rows are
    /// matched by their eigenvector sort key, which survives estimator
    /// sorts).
    pub fn project_estimated_picks(&self, rows: &[WeightedResidual], out: &mut [WeightedResidual]) {
        if rows.len() != self.n_rows {
            return;
        }
        let estimates: Vec<f64> = self
            .eigenvectors
            .iter()
            .map(|vector| {
                vector
                    .iter()
                    .zip(rows)
                    .map(|(v, row)| v * row.est_residual)
                    .sum()
            })
            .collect();
        for row in out.iter_mut().filter(|r| !r.is_bayesian_depth) {
            let k = row.sort_key as usize;
            if let Some(&est) = estimates.get(k) {
                row.est_residual = est;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::DistanceDecayCorrelation;

    fn contexts(n: usize, spacing_deg: f64) -> Vec<CorrelationContext> {
        (0..n)
            .map(|i| CorrelationContext {
                station_latitude: 0.0,
                station_longitude: i as f64 * spacing_deg,
                is_p_type: true,
                window: 10.0,
            })
            .collect()
    }

    fn rows(residuals: &[f64]) -> Vec<WeightedResidual> {
        residuals
            .iter()
            .enumerate()
            .map(|(i, &r)| WeightedResidual::for_pick(i, r, 1.0, [0.05, 0.01, 0.3]))
            .collect()
    }

    #[test]
    fn test_eigenvalue_sum_matches_trace() {
        let rows = rows(&[0.1, -0.4, 0.7, 0.2, -0.2]);
        let ctx = contexts(5, 1.0);
        let model = DistanceDecayCorrelation::new(5.0);
        let mut decorr = Decorrelator::new();
        let cfg = DecorrelationConfig {
            eigen_limit: 1.0,
            eigen_thresh: 0.0,
            ..DecorrelationConfig::default()
        };
        decorr.decorrelate(&rows, &ctx, &model, &cfg);
        // Unit weights: trace is n, and with no truncation the retained
        // eigenvalues carry all of it.
        assert!((decorr.total_variance() - 5.0).abs() < 1.0e-9);
        assert!((decorr.retained_variance() - 5.0).abs() < 1.0e-9);
    }

    #[test]
    fn test_triage_respects_cap_and_removes_most_correlated() {
        let rows = rows(&[0.0; 6]);
        // Stations 0..4 tightly clustered, station 5 far away: the cluster
        // members carry the largest off-diagonal sums.
        let mut ctx = contexts(5, 0.1);
        ctx.push(CorrelationContext {
            station_latitude: 0.0,
            station_longitude: 90.0,
            is_p_type: true,
            window: 10.0,
        });
        let model = DistanceDecayCorrelation::new(5.0);
        let mut decorr = Decorrelator::new();
        let cfg = DecorrelationConfig {
            max_picks_decorr: 4,
            ..DecorrelationConfig::default()
        };
        let triage = decorr.decorrelate(&rows, &ctx, &model, &cfg);
        assert_eq!(triage.eliminated_picks.len(), 2);
        // The isolated far station must survive triage.
        assert!(!triage.eliminated_picks.contains(&5));
    }

    #[test]
    fn test_uncorrelated_projection_preserves_rows() {
        // Zero correlation length: covariance is the identity and the
        // projection is a permutation of the raw rows.
        let raw = rows(&[0.3, -0.6, 0.9, 0.1]);
        let ctx = contexts(4, 60.0);
        let model = DistanceDecayCorrelation::new(1.0e-9);
        let mut decorr = Decorrelator::new();
        let cfg = DecorrelationConfig {
            eigen_limit: 1.0,
            eigen_thresh: 0.0,
            ..DecorrelationConfig::default()
        };
        decorr.decorrelate(&raw, &ctx, &model, &cfg);
        let mut out = Vec::new();
        decorr.project_picks(&raw, &mut out, &DefaultSignPolicy, &cfg);
        assert_eq!(out.len(), 4);
        let mut got: Vec<f64> = out.iter().map(|r| r.residual.abs()).collect();
        let mut want: Vec<f64> = raw.iter().map(|r| r.residual.abs()).collect();
        got.sort_by(f64::total_cmp);
        want.sort_by(f64::total_cmp);
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1.0e-9);
        }
    }

    #[test]
    fn test_sign_policy_enforced() {
        struct AlwaysFlip;
        impl EigenSignPolicy for AlwaysFlip {
            fn flip(&self, _: &SignEvidence, _: f64) -> bool {
                true
            }
        }

        let raw = rows(&[0.5, 0.4, 0.6]);
        let ctx = contexts(3, 0.5);
        let model = DistanceDecayCorrelation::new(5.0);
        let cfg = DecorrelationConfig::default();

        let mut a = Decorrelator::new();
        a.decorrelate(&raw, &ctx, &model, &cfg);
        let mut out_default = Vec::new();
        a.project_picks(&raw, &mut out_default, &DefaultSignPolicy, &cfg);

        let mut b = Decorrelator::new();
        b.decorrelate(&raw, &ctx, &model, &cfg);
        let mut out_flipped = Vec::new();
        b.project_picks(&raw, &mut out_flipped, &AlwaysFlip, &cfg);

        // Flipping every eigenvector negates every projected residual.
        for (d, f) in out_default.iter().zip(&out_flipped) {
            assert!((d.residual + f.residual).abs() < 1.0e-9);
        }
    }

    #[test]
    fn test_default_sign_gives_nonnegative_correlation() {
        let raw = rows(&[0.5, 0.4, 0.6, 0.55]);
        let ctx = contexts(4, 0.5);
        let model = DistanceDecayCorrelation::new(5.0);
        let cfg = DecorrelationConfig::default();
        let mut decorr = Decorrelator::new();
        decorr.decorrelate(&raw, &ctx, &model, &cfg);
        let mut out = Vec::new();
        decorr.project_picks(&raw, &mut out, &DefaultSignPolicy, &cfg);
        for (vector, projected) in decorr.eigenvectors.iter().zip(&out) {
            let corr: f64 = vector.iter().zip(&raw).map(|(v, r)| v * r.residual).sum();
            let dz: f64 = vector.iter().zip(&raw).map(|(v, r)| v * r.deriv[2]).sum();
            if corr.abs() > cfg.sign_correlation_floor {
                assert!(corr >= 0.0, "projected row anti-correlated with inputs");
            } else {
                assert!(dz >= 0.0, "depth tiebreaker not applied");
            }
            assert!((projected.deriv[2] - dz).abs() < 1.0e-9);
        }
    }

    #[test]
    fn test_estimated_projection_uses_frozen_vectors() {
        let mut raw = rows(&[0.3, -0.2, 0.4]);
        let ctx = contexts(3, 1.0);
        let model = DistanceDecayCorrelation::new(5.0);
        let cfg = DecorrelationConfig::default();
        let mut decorr = Decorrelator::new();
        decorr.decorrelate(&raw, &ctx, &model, &cfg);
        let mut out = Vec::new();
        decorr.project_picks(&raw, &mut out, &DefaultSignPolicy, &cfg);

        // Move the estimates and re-project: residuals stay, estimates move.
        for row in raw.iter_mut() {
            row.update_estimate(&[1.0, 0.0, 0.0]);
        }
        let before: Vec<f64> = out.iter().map(|r| r.residual).collect();
        decorr.project_estimated_picks(&raw, &mut out);
        let mut moved = 0;
        for (row, res) in out.iter().zip(before) {
            assert!((row.residual - res).abs() < 1.0e-12);
            if (row.est_residual - row.residual).abs() > 1.0e-9 {
                moved += 1;
            }
        }
        assert!(moved >= 1, "no projected estimate moved with the trial step");
    }
}
