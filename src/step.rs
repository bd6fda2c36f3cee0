//! One-dimensional step search along a descent direction.
//!
//! Scores candidate step lengths with the estimator's linear-estimate path
//! only; theoretical travel times are never recomputed here. The bracket
//! logic is a messy bisection: double while improving, halve while not,
//! then squeeze midpoints until the bracket is tight.

use tracing::debug;

use crate::estimator::Dispersion;

/// Result of a step search.
#[derive(Debug, Clone, Copy)]
pub struct StepResult {
    /// Chosen step length (km); zero means "do not move".
    pub step_len: f64,
    /// Trial step vector (north, east, down km) with the depth component
    /// already clamped to the model range.
    pub step_vec: [f64; 3],
    /// Median of the linear-estimate residuals at the chosen step (s);
    /// becomes the origin-time shift when the step is applied.
    pub median: f64,
    /// Estimated dispersion at the chosen step.
    pub dispersion: Dispersion,
}

impl StepResult {
    fn no_step(d0: Dispersion) -> Self {
        Self {
            step_len: 0.0,
            step_vec: [0.0; 3],
            median: 0.0,
            dispersion: d0,
        }
    }
}

/// A residual space able to score a trial step vector.
///
/// The raw space updates estimates in place; the decorrelated space updates
/// raw estimates and re-projects them through the frozen eigenvectors.
pub trait TrialSpace {
    /// Refresh linear-estimate residuals for the trial vector and return
    /// (estimate median, estimated dispersion).
    fn evaluate(&mut self, step: &[f64; 3]) -> (f64, Dispersion);
}

/// Bounds and starting point for one search.
#[derive(Debug, Clone, Copy)]
pub struct StepBounds {
    pub start: f64,
    pub min: f64,
    pub max: f64,
    /// Current hypocenter depth (km).
    pub depth: f64,
    pub depth_min: f64,
    pub depth_max: f64,
}

/// Relative bracket width at which the bisection stops.
const BRACKET_TOL: f64 = 0.15;

/// Build the trial vector for a step length, clamping the depth component
/// into the model range. The direction is not renormalised after clamping.
fn trial_vector(u: &[f64; 3], s: f64, b: &StepBounds) -> [f64; 3] {
    let mut v = [s * u[0], s * u[1], s * u[2]];
    let clamped_depth = (b.depth + v[2]).clamp(b.depth_min, b.depth_max);
    v[2] = clamped_depth - b.depth;
    v
}

/// Minimise the estimated dispersion along `u`.
///
/// `d0` is the dispersion at zero step. Returns a no-step result when no
/// candidate improves on it.
pub fn search(
    space: &mut dyn TrialSpace,
    u: &[f64; 3],
    bounds: &StepBounds,
    d0: Dispersion,
) -> StepResult {
    if u.iter().all(|c| c.abs() < 1.0e-15) {
        return StepResult::no_step(d0);
    }

    let mut eval = |s: f64| -> (f64, Dispersion, [f64; 3]) {
        let v = trial_vector(u, s, bounds);
        let (median, disp) = space.evaluate(&v);
        (median, disp, v)
    };

    let s0 = bounds.start.clamp(bounds.min, bounds.max);
    let (m1, d1, v1) = eval(s0);

    // Samples bracketing the minimum: (left, centre, right).
    let mut sl;
    let mut sm;
    let mut sr;
    let mut best = (s0, m1, d1, v1);

    if d0.value >= d1.value {
        // Downhill at s0: double while still improving, capped at max.
        let mut s_prev = s0;
        let mut d_prev = d1;
        let mut m_prev = m1;
        let mut v_prev = v1;
        let mut s_before = 0.0;
        loop {
            if s_prev >= bounds.max {
                // Monotone to the cap; take the cap sample.
                debug!(step = s_prev, "step search capped at stage maximum");
                return StepResult {
                    step_len: s_prev,
                    step_vec: v_prev,
                    median: m_prev,
                    dispersion: d_prev,
                };
            }
            let s_next = (2.0 * s_prev).min(bounds.max);
            let (m_next, d_next, v_next) = eval(s_next);
            if d_next.value < d_prev.value {
                s_before = s_prev;
                s_prev = s_next;
                d_prev = d_next;
                m_prev = m_next;
                v_prev = v_next;
            } else {
                sl = s_before;
                sm = s_prev;
                sr = s_next;
                best = (s_prev, m_prev, d_prev, v_prev);
                break;
            }
        }
    } else {
        // Uphill at s0: halve toward zero looking for any improvement.
        let mut s = s0;
        loop {
            s *= 0.5;
            if s < bounds.min {
                return StepResult::no_step(d0);
            }
            let (m, d, v) = eval(s);
            if d.value < d0.value {
                sl = 0.0;
                sm = s;
                sr = 2.0 * s;
                best = (s, m, d, v);
                break;
            }
        }
    }

    // Squeeze the bracket: test the midpoint of each half and keep the
    // triple surrounding the smallest sample.
    let mut d_best = best.2;
    while (sr - sl) / sm.max(1.0e-12) > BRACKET_TOL && (sr - sl) > bounds.min {
        let s_left_mid = 0.5 * (sl + sm);
        let s_right_mid = 0.5 * (sm + sr);
        let (ml, dl, vl) = eval(s_left_mid);
        let (mr, dr, vr) = eval(s_right_mid);

        if dl.value < d_best.value && dl.value <= dr.value {
            sr = sm;
            sm = s_left_mid;
            d_best = dl;
            best = (s_left_mid, ml, dl, vl);
        } else if dr.value < d_best.value {
            sl = sm;
            sm = s_right_mid;
            d_best = dr;
            best = (s_right_mid, mr, dr, vr);
        } else {
            sl = s_left_mid;
            sr = s_right_mid;
        }
    }

    debug!(
        step = best.0,
        dispersion = best.2.value,
        "step search converged"
    );
    StepResult {
        step_len: best.0,
        step_vec: best.3,
        median: best.1,
        dispersion: best.2,
    }
}
