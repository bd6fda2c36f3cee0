//! Rank-sum estimator over weighted residuals.
//!
//! The locator minimises a dispersion penalty: optimal non-decreasing scores
//! interpolated onto the sample size, applied to residuals in sorted order.
//! The same scores, paired with the demedianed design matrix, give the
//! steepest-descent direction. Twin methods on the linear-estimate residual
//! let the step search score a candidate step without new travel times.
//!
//! The estimator sorts the row slice it is handed; callers that need the
//! original order must copy it first (`Event::save_original_residuals`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::residual::WeightedResidual;

/// Piecewise-linear score table: winsorized normal scores at 21 evenly
/// spaced breakpoints on [0, 1]. Monotone non-decreasing by construction.
const SCORE_TABLE: [f64; 21] = [
    -1.6449, -1.6449, -1.2816, -1.0364, -0.8416, -0.6745, -0.5244, -0.3853, -0.2533, -0.1257,
    0.0, 0.1257, 0.2533, 0.3853, 0.5244, 0.6745, 0.8416, 1.0364, 1.2816, 1.6449, 1.6449,
];

/// Dispersion value with the Bayesian depth row's contribution split out,
/// so the stepper can discount prior drift between iterations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispersion {
    /// Full penalty, Bayesian row included.
    pub value: f64,
    /// Contribution of the Bayesian depth row alone.
    pub bayesian: f64,
}

/// Proof that `median()` has established the row order; consumed by
/// `demedian_design_matrix()`, which must see that exact order.
#[derive(Debug)]
pub struct DemedianReady {
    lo: usize,
    hi: usize,
}

/// Rank-sum estimator state: score cache plus the last medians.
///
/// One instance per residual space (raw and projected); the interpolated
/// score arrays are shared between instances through a process-wide cache
/// keyed by sample size.
#[derive(Debug, Default)]
pub struct RankSumEstimator {
    scores: Option<Arc<Vec<f64>>>,
    median: f64,
    est_median: f64,
}

fn score_cache() -> &'static Mutex<HashMap<usize, Arc<Vec<f64>>>> {
    static CACHE: OnceLock<Mutex<HashMap<usize, Arc<Vec<f64>>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Interpolate the score table at `p` in [0, 1].
fn interpolate_score(p: f64) -> f64 {
    let scaled = p.clamp(0.0, 1.0) * (SCORE_TABLE.len() - 1) as f64;
    let idx = (scaled.floor() as usize).min(SCORE_TABLE.len() - 2);
    let frac = scaled - idx as f64;
    SCORE_TABLE[idx] + frac * (SCORE_TABLE[idx + 1] - SCORE_TABLE[idx])
}

/// Build the symmetric zero-mean score array for `n` samples.
fn build_scores(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let mut scores: Vec<f64> = (1..=n)
        .map(|j| interpolate_score(j as f64 / (n + 1) as f64))
        .collect();

    let mean = scores.iter().sum::<f64>() / n as f64;
    for s in &mut scores {
        *s -= mean;
    }
    // Force antisymmetry about the centre; the centre of an odd-length
    // array lands exactly on zero.
    for j in 0..n / 2 {
        let k = n - 1 - j;
        let half = 0.5 * (scores[j] - scores[k]);
        scores[j] = half;
        scores[k] = -half;
    }
    if n % 2 == 1 {
        scores[n / 2] = 0.0;
    }
    scores
}

impl RankSumEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores for the current sample size, from the shared cache.
    fn scores(&mut self, n: usize) -> Arc<Vec<f64>> {
        if let Some(ref s) = self.scores {
            if s.len() == n {
                return Arc::clone(s);
            }
        }
        let scores = match score_cache().lock() {
            Ok(mut cache) => Arc::clone(
                cache
                    .entry(n)
                    .or_insert_with(|| Arc::new(build_scores(n))),
            ),
            // A poisoned cache only costs a rebuild.
            Err(_) => Arc::new(build_scores(n)),
        };
        self.scores = Some(Arc::clone(&scores));
        scores
    }

    /// Last computed residual median.
    pub fn last_median(&self) -> f64 {
        self.median
    }

    /// Sample median of the residuals.
    ///
    /// Sorts the rows in place by residual and returns the median together
    /// with the `DemedianReady` anchor that ties the design-matrix demedian
    /// to this exact ordering.
    pub fn median(&mut self, rows: &mut [WeightedResidual]) -> (f64, DemedianReady) {
        let n = rows.len();
        if n < 2 {
            self.median = 0.0;
            return (0.0, DemedianReady { lo: 0, hi: 0 });
        }
        rows.sort_by(|a, b| a.residual.total_cmp(&b.residual));
        let (lo, hi) = if n % 2 == 0 {
            (n / 2 - 1, n / 2)
        } else {
            (n / 2, n / 2)
        };
        self.median = 0.5 * (rows[lo].residual + rows[hi].residual);
        (self.median, DemedianReady { lo, hi })
    }

    /// Normalised median absolute deviation about the last median.
    ///
    /// Requires a prior `median()` call; agrees before and after
    /// `demedian_residuals()` because demedianing re-centres the cached
    /// median at zero.
    pub fn spread(&self, rows: &[WeightedResidual], mad_norm: f64) -> f64 {
        let n = rows.len();
        if n < 2 {
            return 0.0;
        }
        let mut dev: Vec<f64> = rows
            .iter()
            .map(|r| (r.residual - self.median).abs())
            .collect();
        dev.sort_by(f64::total_cmp);
        let mad = if n % 2 == 0 {
            0.5 * (dev[n / 2 - 1] + dev[n / 2])
        } else {
            dev[n / 2]
        };
        mad_norm * mad
    }

    /// Subtract the last median from every residual and re-centre the
    /// cached median at zero.
    pub fn demedian_residuals(&mut self, rows: &mut [WeightedResidual]) {
        for row in rows.iter_mut() {
            row.residual -= self.median;
        }
        self.median = 0.0;
    }

    /// Subtract the design-row median, componentwise, at the positions
    /// established by the residual sort of the last `median()` call.
    pub fn demedian_design_matrix(&self, rows: &mut [WeightedResidual], anchor: DemedianReady) {
        if rows.len() < 2 {
            return;
        }
        let mut med = [0.0_f64; 3];
        for i in 0..3 {
            med[i] = 0.5 * (rows[anchor.lo].deriv[i] + rows[anchor.hi].deriv[i]);
        }
        for row in rows.iter_mut() {
            for i in 0..3 {
                row.demed_deriv[i] = row.deriv[i] - med[i];
            }
        }
    }

    /// Rank-sum penalty over the residuals, sorted order, weighted.
    pub fn dispersion(&mut self, rows: &mut [WeightedResidual]) -> Dispersion {
        let n = rows.len();
        if n < 2 {
            return Dispersion::default();
        }
        rows.sort_by(|a, b| a.residual.total_cmp(&b.residual));
        let scores = self.scores(n);
        let mut out = Dispersion::default();
        for (j, row) in rows.iter().enumerate() {
            let term = scores[j] * row.weight * row.residual;
            out.value += term;
            if row.is_bayesian_depth {
                out.bayesian = term;
            }
        }
        out
    }

    /// Unit steepest-descent direction in (north, east, down) kilometres.
    ///
    /// Pairs the sorted-order scores with the demedianed weighted design
    /// rows; callers must have run `dispersion()` (or `median()`) and
    /// `demedian_design_matrix()` without re-sorting in between.
    pub fn steepest_descent(&mut self, rows: &[WeightedResidual], degrees_of_freedom: usize) -> [f64; 3] {
        let n = rows.len();
        if n < 2 {
            return [0.0; 3];
        }
        let scores = self.scores(n);
        let mut u = [0.0_f64; 3];
        for (j, row) in rows.iter().enumerate() {
            let sw = scores[j] * row.weight;
            for i in 0..3 {
                u[i] += sw * row.demed_deriv[i];
            }
        }
        if degrees_of_freedom < 3 {
            u[2] = 0.0;
        }
        let norm = (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt();
        if norm < 1.0e-15 {
            return [0.0; 3];
        }
        // The gradient of the penalty with respect to position is the
        // negative of u, so the unit u itself is the downhill direction.
        [u[0] / norm, u[1] / norm, u[2] / norm]
    }

    // ========================================================================
    // Linear-estimate twins (step-search path)
    // ========================================================================

    /// Median of the linear-estimate residuals.
    pub fn lin_est_median(&mut self, rows: &mut [WeightedResidual]) -> f64 {
        let n = rows.len();
        if n < 2 {
            self.est_median = 0.0;
            return 0.0;
        }
        rows.sort_by(|a, b| a.est_residual.total_cmp(&b.est_residual));
        self.est_median = if n % 2 == 0 {
            0.5 * (rows[n / 2 - 1].est_residual + rows[n / 2].est_residual)
        } else {
            rows[n / 2].est_residual
        };
        self.est_median
    }

    /// Subtract the last estimate median from every estimate residual.
    pub fn demedian_est(&mut self, rows: &mut [WeightedResidual]) {
        for row in rows.iter_mut() {
            row.est_residual -= self.est_median;
        }
        self.est_median = 0.0;
    }

    /// Rank-sum penalty over the linear-estimate residuals.
    pub fn est_dispersion(&mut self, rows: &mut [WeightedResidual]) -> Dispersion {
        let n = rows.len();
        if n < 2 {
            return Dispersion::default();
        }
        rows.sort_by(|a, b| a.est_residual.total_cmp(&b.est_residual));
        let scores = self.scores(n);
        let mut out = Dispersion::default();
        for (j, row) in rows.iter().enumerate() {
            let term = scores[j] * row.weight * row.est_residual;
            out.value += term;
            if row.is_bayesian_depth {
                out.bayesian = term;
            }
        }
        out
    }
}
