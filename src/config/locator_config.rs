//! Locator configuration - every engine tunable as an operator-editable TOML value.
//!
//! Each struct implements `Default` with values matching `defaults.rs`,
//! ensuring unchanged behaviour when no config file is present. The config is
//! built once at the boundary and passed by reference into the engine; no
//! global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

/// Error loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A non-fatal configuration warning (suspicious or out-of-range value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for the locator engine.
///
/// Load with `LocatorConfig::load()` which searches:
/// 1. `$SEISLOC_CONFIG` env var
/// 2. `./seisloc.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocatorConfig {
    /// Depth model limits and Bayesian depth priors
    #[serde(default)]
    pub depth: DepthConfig,

    /// Rank-sum estimator tuning
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Multi-stage iteration control
    #[serde(default)]
    pub stages: StageConfig,

    /// Phase identification weights and tolerances
    #[serde(default)]
    pub phase_id: PhaseIdConfig,

    /// Residual decorrelation tuning
    #[serde(default)]
    pub decorrelation: DecorrelationConfig,

    /// Close-out statistics and quality grading
    #[serde(default)]
    pub closeout: CloseoutConfig,
}

impl LocatorConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SEISLOC_CONFIG` environment variable
    /// 2. `./seisloc.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SEISLOC_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded locator config from SEISLOC_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SEISLOC_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SEISLOC_CONFIG points to non-existent file, falling back");
            }
        }

        let local = Path::new("seisloc.toml");
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => {
                    info!(path = %local.display(), "Loaded locator config");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./seisloc.toml, using defaults");
                }
            }
        }

        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        for w in config.validate() {
            warn!(field = %w.field, "{}", w.message);
        }
        Ok(config)
    }

    /// Range-check the configuration. Warnings are advisory; callers decide
    /// whether to proceed, and `sanitized()` repairs broken fields.
    pub fn validate(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        let mut push = |field: &str, message: String| {
            warnings.push(ValidationWarning {
                field: field.to_string(),
                message,
            });
        };

        if self.depth.depth_min_km >= self.depth.depth_max_km {
            push(
                "depth.depth_min_km",
                format!(
                    "depth range is empty ({} >= {})",
                    self.depth.depth_min_km, self.depth.depth_max_km
                ),
            );
        }
        if self.stages.dampening <= 0.0 || self.stages.dampening >= 1.0 {
            push(
                "stages.dampening",
                format!("must be in (0, 1), got {}", self.stages.dampening),
            );
        }
        if self.stages.convergence_km.len() != self.stages.stage_limit
            || self.stages.step_max_km.len() != self.stages.stage_limit
            || self.stages.iterations.len() != self.stages.stage_limit
        {
            push(
                "stages.stage_limit",
                format!(
                    "per-stage arrays must have length {} (got {}/{}/{})",
                    self.stages.stage_limit,
                    self.stages.convergence_km.len(),
                    self.stages.step_max_km.len(),
                    self.stages.iterations.len()
                ),
            );
        }
        if self.decorrelation.eigen_limit <= 0.0 || self.decorrelation.eigen_limit > 1.0 {
            push(
                "decorrelation.eigen_limit",
                format!("must be in (0, 1], got {}", self.decorrelation.eigen_limit),
            );
        }
        if self.decorrelation.max_picks_decorr < defaults::MIN_STATIONS_USED {
            push(
                "decorrelation.max_picks_decorr",
                format!(
                    "cannot be below the minimum station count, got {}",
                    self.decorrelation.max_picks_decorr
                ),
            );
        }
        if self.estimator.mad_norm <= 0.0 {
            push(
                "estimator.mad_norm",
                format!("must be positive, got {}", self.estimator.mad_norm),
            );
        }
        if self.phase_id.bad_ratio <= 0.0 || self.phase_id.bad_ratio >= 1.0 {
            push(
                "phase_id.bad_ratio",
                format!("must be in (0, 1), got {}", self.phase_id.bad_ratio),
            );
        }

        warnings
    }

    /// Return a copy with any field that failed validation reset to its
    /// default. Per-field repair, never whole-section.
    pub fn sanitized(&self) -> Self {
        let mut out = self.clone();
        if out.depth.depth_min_km >= out.depth.depth_max_km {
            out.depth.depth_min_km = defaults::DEPTH_MIN_KM;
            out.depth.depth_max_km = defaults::DEPTH_MAX_KM;
        }
        if out.stages.dampening <= 0.0 || out.stages.dampening >= 1.0 {
            out.stages.dampening = defaults::DAMPENING;
        }
        if out.stages.convergence_km.len() != out.stages.stage_limit
            || out.stages.step_max_km.len() != out.stages.stage_limit
            || out.stages.iterations.len() != out.stages.stage_limit
        {
            out.stages = StageConfig::default();
        }
        if out.decorrelation.eigen_limit <= 0.0 || out.decorrelation.eigen_limit > 1.0 {
            out.decorrelation.eigen_limit = defaults::EIGEN_LIMIT;
        }
        if out.decorrelation.max_picks_decorr < defaults::MIN_STATIONS_USED {
            out.decorrelation.max_picks_decorr = defaults::MAX_PICKS_DECORR;
        }
        if out.estimator.mad_norm <= 0.0 {
            out.estimator.mad_norm = defaults::MAD_NORM;
        }
        if out.phase_id.bad_ratio <= 0.0 || out.phase_id.bad_ratio >= 1.0 {
            out.phase_id.bad_ratio = defaults::BAD_RATIO;
        }
        out
    }
}

// ============================================================================
// Depth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthConfig {
    /// Shallowest supported hypocenter depth (km)
    #[serde(default = "d_depth_min")]
    pub depth_min_km: f64,
    /// Deepest supported hypocenter depth (km)
    #[serde(default = "d_depth_max")]
    pub depth_max_km: f64,
    /// Default shallow Bayesian depth prior (km)
    #[serde(default = "d_default_depth")]
    pub default_depth_km: f64,
    /// Spread of the default shallow prior (km)
    #[serde(default = "d_default_depth_se")]
    pub default_depth_se_km: f64,
    /// Zone results above this stay "shallow" (km)
    #[serde(default = "d_deepest_shallow")]
    pub deepest_shallow_km: f64,
    /// Slab depths above this merge into the shallow prior (km)
    #[serde(default = "d_slab_merge")]
    pub slab_merge_depth_km: f64,
    /// Depths beyond this prefer a deep prior (km)
    #[serde(default = "d_slab_max_shallow")]
    pub slab_max_shallow_depth_km: f64,
}

fn d_depth_min() -> f64 {
    defaults::DEPTH_MIN_KM
}
fn d_depth_max() -> f64 {
    defaults::DEPTH_MAX_KM
}
fn d_default_depth() -> f64 {
    defaults::DEFAULT_DEPTH_KM
}
fn d_default_depth_se() -> f64 {
    defaults::DEFAULT_DEPTH_SE_KM
}
fn d_deepest_shallow() -> f64 {
    defaults::DEEPEST_SHALLOW_KM
}
fn d_slab_merge() -> f64 {
    defaults::SLAB_MERGE_DEPTH_KM
}
fn d_slab_max_shallow() -> f64 {
    defaults::SLAB_MAX_SHALLOW_DEPTH_KM
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            depth_min_km: d_depth_min(),
            depth_max_km: d_depth_max(),
            default_depth_km: d_default_depth(),
            default_depth_se_km: d_default_depth_se(),
            deepest_shallow_km: d_deepest_shallow(),
            slab_merge_depth_km: d_slab_merge(),
            slab_max_shallow_depth_km: d_slab_max_shallow(),
        }
    }
}

// ============================================================================
// Estimator
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// MAD-to-sigma normalisation
    #[serde(default = "d_mad_norm")]
    pub mad_norm: f64,
    /// Floor on statistical spreads (s)
    #[serde(default = "d_min_spread")]
    pub min_spread_s: f64,
}

fn d_mad_norm() -> f64 {
    defaults::MAD_NORM
}
fn d_min_spread() -> f64 {
    defaults::MIN_SPREAD_S
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            mad_norm: d_mad_norm(),
            min_spread_s: d_min_spread(),
        }
    }
}

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of location stages
    #[serde(default = "d_stage_limit")]
    pub stage_limit: usize,
    /// Per-stage convergence tolerance (km)
    #[serde(default = "d_convergence")]
    pub convergence_km: Vec<f64>,
    /// Per-stage step cap (km)
    #[serde(default = "d_step_max")]
    pub step_max_km: Vec<f64>,
    /// Per-stage iteration cap
    #[serde(default = "d_iterations")]
    pub iterations: Vec<usize>,
    /// Step multiplier per damping retry
    #[serde(default = "d_dampening")]
    pub dampening: f64,
    /// Stage-0 starting step along the unit direction (km)
    #[serde(default = "d_initial_step_km")]
    pub initial_step_km: f64,
    /// Minimum used stations for a solvable event
    #[serde(default = "d_min_stations")]
    pub min_stations_used: usize,
}

fn d_stage_limit() -> usize {
    defaults::STAGE_LIMIT
}
fn d_convergence() -> Vec<f64> {
    defaults::CONVERGENCE_KM.to_vec()
}
fn d_step_max() -> Vec<f64> {
    defaults::STEP_MAX_KM.to_vec()
}
fn d_iterations() -> Vec<usize> {
    defaults::ITERATIONS.to_vec()
}
fn d_dampening() -> f64 {
    defaults::DAMPENING
}
fn d_initial_step_km() -> f64 {
    defaults::INITIAL_STEP_KM
}
fn d_min_stations() -> usize {
    defaults::MIN_STATIONS_USED
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            stage_limit: d_stage_limit(),
            convergence_km: d_convergence(),
            step_max_km: d_step_max(),
            iterations: d_iterations(),
            dampening: d_dampening(),
            initial_step_km: d_initial_step_km(),
            min_stations_used: d_min_stations(),
        }
    }
}

// ============================================================================
// Phase identification
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseIdConfig {
    /// Re-association tolerance for the no-re-ID pass (s)
    #[serde(default = "d_assoc_tol")]
    pub assoc_tolerance_s: f64,
    /// Largest negative travel time accepted (s)
    #[serde(default = "d_max_neg_residual")]
    pub max_neg_residual_s: f64,
    /// Multiplier for depth-disallowed phases
    #[serde(default = "d_down_weight")]
    pub down_weight: f64,
    /// Multiplier for matching phase groups
    #[serde(default = "d_group_weight")]
    pub group_weight: f64,
    /// Multiplier for mismatched phase groups
    #[serde(default = "d_other_weight")]
    pub other_weight: f64,
    /// Extra penalty for P/S type disagreement on human picks
    #[serde(default = "d_type_weight")]
    pub type_weight: f64,
    /// Bonus for keeping the previous identification
    #[serde(default = "d_sticky_weight")]
    pub sticky_weight: f64,
    /// Residual validity limit in spreads
    #[serde(default = "d_validity_sigma")]
    pub validity_sigma: f64,
    /// Minimum winning observability
    #[serde(default = "d_observability_min")]
    pub observability_min: f64,
    /// First-arrival disagreement fraction triggering complex mode
    #[serde(default = "d_bad_ratio")]
    pub bad_ratio: f64,
    /// Largest cluster side enumerated exhaustively
    #[serde(default = "d_max_cluster_permute")]
    pub max_cluster_permute: usize,
    /// Distance beyond which first arrivals are derated (deg)
    #[serde(default = "d_distance_correction_deg")]
    pub distance_correction_deg: f64,
    /// Scale of the first-arrival derating (deg)
    #[serde(default = "d_distance_correction_scale")]
    pub distance_correction_scale: f64,
}

fn d_assoc_tol() -> f64 {
    defaults::ASSOC_TOLERANCE_S
}
fn d_max_neg_residual() -> f64 {
    defaults::MAX_NEG_RESIDUAL_S
}
fn d_down_weight() -> f64 {
    defaults::DOWN_WEIGHT
}
fn d_group_weight() -> f64 {
    defaults::GROUP_WEIGHT
}
fn d_other_weight() -> f64 {
    defaults::OTHER_WEIGHT
}
fn d_type_weight() -> f64 {
    defaults::TYPE_WEIGHT
}
fn d_sticky_weight() -> f64 {
    defaults::STICKY_WEIGHT
}
fn d_validity_sigma() -> f64 {
    defaults::VALIDITY_SIGMA
}
fn d_observability_min() -> f64 {
    defaults::OBSERVABILITY_MIN
}
fn d_bad_ratio() -> f64 {
    defaults::BAD_RATIO
}
fn d_max_cluster_permute() -> usize {
    defaults::MAX_CLUSTER_PERMUTE
}
fn d_distance_correction_deg() -> f64 {
    defaults::DISTANCE_CORRECTION_DEG
}
fn d_distance_correction_scale() -> f64 {
    defaults::DISTANCE_CORRECTION_SCALE
}

impl Default for PhaseIdConfig {
    fn default() -> Self {
        Self {
            assoc_tolerance_s: d_assoc_tol(),
            max_neg_residual_s: d_max_neg_residual(),
            down_weight: d_down_weight(),
            group_weight: d_group_weight(),
            other_weight: d_other_weight(),
            type_weight: d_type_weight(),
            sticky_weight: d_sticky_weight(),
            validity_sigma: d_validity_sigma(),
            observability_min: d_observability_min(),
            bad_ratio: d_bad_ratio(),
            max_cluster_permute: d_max_cluster_permute(),
            distance_correction_deg: d_distance_correction_deg(),
            distance_correction_scale: d_distance_correction_scale(),
        }
    }
}

// ============================================================================
// Decorrelation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecorrelationConfig {
    /// Triage cap on the number of picks in the eigenproblem
    #[serde(default = "d_max_picks_decorr")]
    pub max_picks_decorr: usize,
    /// Fraction of variance the retained eigenvectors must explain
    #[serde(default = "d_eigen_limit")]
    pub eigen_limit: f64,
    /// Eigenvalues below this fraction of the largest are droppable
    #[serde(default = "d_eigen_thresh")]
    pub eigen_thresh: f64,
    /// Correlation magnitude below which the sign falls to the tiebreaker
    #[serde(default = "d_sign_floor")]
    pub sign_correlation_floor: f64,
    /// E-folding separation of the default correlation kernel (deg)
    #[serde(default = "d_corr_length")]
    pub correlation_length_deg: f64,
}

fn d_max_picks_decorr() -> usize {
    defaults::MAX_PICKS_DECORR
}
fn d_eigen_limit() -> f64 {
    defaults::EIGEN_LIMIT
}
fn d_eigen_thresh() -> f64 {
    defaults::EIGEN_THRESH
}
fn d_sign_floor() -> f64 {
    defaults::SIGN_CORRELATION_FLOOR
}
fn d_corr_length() -> f64 {
    defaults::CORRELATION_LENGTH_DEG
}

impl Default for DecorrelationConfig {
    fn default() -> Self {
        Self {
            max_picks_decorr: d_max_picks_decorr(),
            eigen_limit: d_eigen_limit(),
            eigen_thresh: d_eigen_thresh(),
            sign_correlation_floor: d_sign_floor(),
            correlation_length_deg: d_corr_length(),
        }
    }
}

// ============================================================================
// Close-out
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseoutConfig {
    /// 90% multiplier, one-dimensional marginals
    #[serde(default = "d_perpt_1d")]
    pub perpt_1d: f64,
    /// 90% multiplier, two-axis ellipse
    #[serde(default = "d_perpt_2d")]
    pub perpt_2d: f64,
    /// 90% multiplier, three-axis ellipsoid
    #[serde(default = "d_perpt_3d")]
    pub perpt_3d: f64,
    /// Effective-data compensation offset
    #[serde(default = "d_eff_offset")]
    pub eff_offset: f64,
    /// Effective-data compensation slope
    #[serde(default = "d_eff_slope")]
    pub eff_slope: f64,
    /// Equivalent-error-radius limits for A, B, C (km)
    #[serde(default = "d_horiz_limits")]
    pub horiz_limits_km: Vec<f64>,
    /// Depth-error limits for A, B, C (km)
    #[serde(default = "d_vert_limits")]
    pub vert_limits_km: Vec<f64>,
    /// Used-pick minimums for A and B
    #[serde(default = "d_n_limits")]
    pub n_limits: Vec<usize>,
    /// Largest-semi-axis limits for A, B, C (km)
    #[serde(default = "d_semi_limits")]
    pub semi_limits_km: Vec<f64>,
    /// Aspect ratio beyond which quality is demoted
    #[serde(default = "d_aspect_demote")]
    pub aspect_demote_ratio: f64,
    /// GT5: minimum local pick count
    #[serde(default = "d_gt5_local_picks")]
    pub gt5_local_picks: usize,
    /// GT5: local distance limit (deg)
    #[serde(default = "d_gt5_local_distance")]
    pub gt5_local_distance_deg: f64,
    /// GT5: nearest-station distance limit (km)
    #[serde(default = "d_gt5_min_distance")]
    pub gt5_min_distance_km: f64,
    /// GT5: azimuthal gap limit (deg)
    #[serde(default = "d_gt5_gap")]
    pub gt5_gap_deg: f64,
    /// GT5: robust gap limit (deg)
    #[serde(default = "d_gt5_secondary_gap")]
    pub gt5_secondary_gap_deg: f64,
}

fn d_perpt_1d() -> f64 {
    defaults::PERPT_1D
}
fn d_perpt_2d() -> f64 {
    defaults::PERPT_2D
}
fn d_perpt_3d() -> f64 {
    defaults::PERPT_3D
}
fn d_eff_offset() -> f64 {
    defaults::EFF_OFFSET
}
fn d_eff_slope() -> f64 {
    defaults::EFF_SLOPE
}
fn d_horiz_limits() -> Vec<f64> {
    defaults::HORIZ_LIMITS_KM.to_vec()
}
fn d_vert_limits() -> Vec<f64> {
    defaults::VERT_LIMITS_KM.to_vec()
}
fn d_n_limits() -> Vec<usize> {
    defaults::N_LIMITS.to_vec()
}
fn d_semi_limits() -> Vec<f64> {
    defaults::SEMI_LIMITS_KM.to_vec()
}
fn d_aspect_demote() -> f64 {
    defaults::ASPECT_DEMOTE_RATIO
}
fn d_gt5_local_picks() -> usize {
    defaults::GT5_LOCAL_PICKS
}
fn d_gt5_local_distance() -> f64 {
    defaults::GT5_LOCAL_DISTANCE_DEG
}
fn d_gt5_min_distance() -> f64 {
    defaults::GT5_MIN_DISTANCE_KM
}
fn d_gt5_gap() -> f64 {
    defaults::GT5_GAP_DEG
}
fn d_gt5_secondary_gap() -> f64 {
    defaults::GT5_SECONDARY_GAP_DEG
}

impl Default for CloseoutConfig {
    fn default() -> Self {
        Self {
            perpt_1d: d_perpt_1d(),
            perpt_2d: d_perpt_2d(),
            perpt_3d: d_perpt_3d(),
            eff_offset: d_eff_offset(),
            eff_slope: d_eff_slope(),
            horiz_limits_km: d_horiz_limits(),
            vert_limits_km: d_vert_limits(),
            n_limits: d_n_limits(),
            semi_limits_km: d_semi_limits(),
            aspect_demote_ratio: d_aspect_demote(),
            gt5_local_picks: d_gt5_local_picks(),
            gt5_local_distance_deg: d_gt5_local_distance(),
            gt5_min_distance_km: d_gt5_min_distance(),
            gt5_gap_deg: d_gt5_gap(),
            gt5_secondary_gap_deg: d_gt5_secondary_gap(),
        }
    }
}
