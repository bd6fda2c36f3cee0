//! Engine-wide default constants.
//!
//! Centralises the locator's magic numbers. Grouped by subsystem; every value
//! here is the serde default of the matching `LocatorConfig` field, so a
//! missing TOML key reproduces built-in behaviour exactly.

// ============================================================================
// Depth model
// ============================================================================

/// Shallowest hypocenter depth the model supports (km).
pub const DEPTH_MIN_KM: f64 = 0.0;

/// Deepest hypocenter depth the model supports (km).
pub const DEPTH_MAX_KM: f64 = 800.0;

/// Default shallow Bayesian depth prior (km).
pub const DEFAULT_DEPTH_KM: f64 = 7.5;

/// Spread of the default shallow depth prior (km).
pub const DEFAULT_DEPTH_SE_KM: f64 = 15.0;

/// Upper bound of a zone-statistics result still treated as "shallow" (km).
pub const DEEPEST_SHALLOW_KM: f64 = 35.0;

/// Slab depths at or above this are merged into the shallow prior (km).
pub const SLAB_MERGE_DEPTH_KM: f64 = 70.0;

/// Hypocenters deeper than this prefer a deep prior when one exists (km).
pub const SLAB_MAX_SHALLOW_DEPTH_KM: f64 = 60.0;

// ============================================================================
// Rank-sum estimator
// ============================================================================

/// Normalisation of the median absolute deviation to a Gaussian sigma.
pub const MAD_NORM: f64 = 1.482_580;

/// Floor on any phase statistical spread used for weighting (s).
pub const MIN_SPREAD_S: f64 = 0.2;

// ============================================================================
// Iteration control
// ============================================================================

/// Number of location stages.
pub const STAGE_LIMIT: usize = 5;

/// Per-stage convergence tolerance on the step length (km).
pub const CONVERGENCE_KM: [f64; STAGE_LIMIT] = [1.0, 0.1, 0.1, 0.1, 0.1];

/// Per-stage cap on a single step (km).
pub const STEP_MAX_KM: [f64; STAGE_LIMIT] = [5.0, 50.0, 20.0, 20.0, 20.0];

/// Per-stage iteration cap.
pub const ITERATIONS: [usize; STAGE_LIMIT] = [15, 20, 20, 20, 20];

/// Multiplier applied to the step length on each damping retry.
pub const DAMPENING: f64 = 0.5;

/// Stage-0 starting step along the unit descent direction (km).
pub const INITIAL_STEP_KM: f64 = 0.01;

/// Dispersion must drop by more than this (beyond Bayesian drift) to accept
/// an undamped step.
pub const DISPERSION_SLACK: f64 = 1.0e-9;

/// Relative dispersion increase below which damping exhaustion still counts
/// as nearly converged.
pub const NEARLY_CONVERGED_RATIO: f64 = 1.0e-3;

/// Minimum number of used stations for a solvable event.
pub const MIN_STATIONS_USED: usize = 3;

// ============================================================================
// Phase identification
// ============================================================================

/// Re-association tolerance for the no-re-ID pass (s).
pub const ASSOC_TOLERANCE_S: f64 = 60.0;

/// Picks earlier than origin time minus this are never associated (s).
pub const MAX_NEG_RESIDUAL_S: f64 = 60.0;

/// Observability multiplier for phases disallowed at the source depth.
pub const DOWN_WEIGHT: f64 = 0.5;

/// Observability multiplier when observed and theoretical phase groups match.
pub const GROUP_WEIGHT: f64 = 16.0;

/// Observability multiplier when the phase groups differ.
pub const OTHER_WEIGHT: f64 = 0.5;

/// Extra penalty when P/S phase types disagree on a non-automatic pick.
pub const TYPE_WEIGHT: f64 = 0.1;

/// Bonus multiplier for keeping the previous phase identification.
pub const STICKY_WEIGHT: f64 = 1.5;

/// Residual validity limit in units of the phase spread.
pub const VALIDITY_SIGMA: f64 = 3.0;

/// Theoretical arrivals less observable than this never win an ID.
pub const OBSERVABILITY_MIN: f64 = 0.5;

/// Fraction of used stations whose first arrival may disagree before the
/// initial pass switches to complex mode.
pub const BAD_RATIO: f64 = 0.25;

/// Largest cluster side enumerated exhaustively; larger clusters fall back
/// to greedy assignment.
pub const MAX_CLUSTER_PERMUTE: usize = 8;

/// Distance beyond which the first-arrival figure of merit is derated (deg).
pub const DISTANCE_CORRECTION_DEG: f64 = 100.0;

/// Scale of the first-arrival derating beyond the threshold (deg).
pub const DISTANCE_CORRECTION_SCALE: f64 = 50.0;

// ============================================================================
// Decorrelation
// ============================================================================

/// Covariance triage cap on the number of picks entering the eigenproblem.
pub const MAX_PICKS_DECORR: usize = 450;

/// Fraction of total variance the retained eigenvectors must explain.
pub const EIGEN_LIMIT: f64 = 0.95;

/// Eigenvalues below this fraction of the largest are droppable.
pub const EIGEN_THRESH: f64 = 0.01;

/// Raw-residual correlation magnitude below which the eigenvector sign
/// falls back to the depth-derivative tiebreaker.
pub const SIGN_CORRELATION_FLOOR: f64 = 1.0e-3;

/// E-folding station separation of the default correlation kernel (deg).
pub const CORRELATION_LENGTH_DEG: f64 = 5.0;

// ============================================================================
// Close-out statistics
// ============================================================================

/// 90th-percentile multiplier for one-dimensional marginal errors.
pub const PERPT_1D: f64 = 1.6449;

/// 90th-percentile multiplier for the two-axis error ellipse.
pub const PERPT_2D: f64 = 2.1460;

/// 90th-percentile multiplier for the three-axis error ellipsoid.
pub const PERPT_3D: f64 = 2.5003;

/// Offset of the effective-data compensation factor.
pub const EFF_OFFSET: f64 = 2.45;

/// Slope of the effective-data compensation factor per decade of picks.
pub const EFF_SLOPE: f64 = 0.45;

/// Equivalent-error-radius limits for qualities A, B, C (km).
pub const HORIZ_LIMITS_KM: [f64; 3] = [8.5, 16.0, 60.0];

/// Depth-error limits for qualities A, B, C (km).
pub const VERT_LIMITS_KM: [f64; 3] = [16.0, 30.0, 75.0];

/// Minimum used-pick counts for qualities A and B.
pub const N_LIMITS: [usize; 2] = [6, 2];

/// Largest-semi-axis limits for qualities A, B, C (km).
pub const SEMI_LIMITS_KM: [f64; 3] = [42.0, 80.0, 300.0];

/// Ellipse aspect ratio beyond which the quality is demoted one grade.
pub const ASPECT_DEMOTE_RATIO: f64 = 3.0;

// ============================================================================
// GT5 criterion
// ============================================================================

/// Minimum number of local picks for the GT5 grade.
pub const GT5_LOCAL_PICKS: usize = 10;

/// A pick counts as local inside this distance (deg).
pub const GT5_LOCAL_DISTANCE_DEG: f64 = 2.25;

/// Maximum distance to the nearest used station (km).
pub const GT5_MIN_DISTANCE_KM: f64 = 30.0;

/// Maximum azimuthal gap (deg).
pub const GT5_GAP_DEG: f64 = 110.0;

/// Maximum robust (secondary) azimuthal gap (deg).
pub const GT5_SECONDARY_GAP_DEG: f64 = 160.0;
