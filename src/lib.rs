//! seisloc: robust single-event seismic hypocenter location.
//!
//! Given arrival-time picks, a travel-time service, and auxiliary
//! geographic statistics, the engine refines a hypocenter under a
//! rank-sum-estimator penalty and reports confidence intervals, an error
//! ellipsoid, and per-pick statistics.
//!
//! ## Architecture
//!
//! - **Envelope**: `LocRequest` in, `LocResult` out (camelCase wire forms)
//! - **Event**: arena state - hypocenter, stations, picks, residual rows
//! - **Phase ID**: cluster permutation matching of picks to theoretical
//!   arrivals, plus the pre-location heuristics
//! - **Estimator**: rank-sum penalty, spread, and steepest descent
//! - **Decorrelator**: eigenprojection of correlated residuals
//! - **Stepper**: multi-stage damped iteration
//! - **Close-out**: gaps, marginal errors, error ellipsoid, importances,
//!   quality grade
//!
//! Travel times and slab/zone/craton tables are consumed through the
//! traits in [`providers`]; the engine never computes or loads them.

pub mod closeout;
pub mod config;
pub mod decorr;
pub mod depth;
pub mod envelope;
pub mod estimator;
pub mod event;
pub mod geo;
pub mod locator;
pub mod phase_id;
pub mod providers;
pub mod residual;
pub mod status;
pub mod step;
pub mod stepper;

// Re-export the service surface
pub use config::LocatorConfig;
pub use envelope::{InputPick, LocRequest, LocResult, SupportingPick};
pub use locator::Locator;
pub use status::{ExitCode, LocStatus};

// Re-export the pieces integrators commonly plug into
pub use decorr::{DefaultSignPolicy, EigenSignPolicy, SignEvidence};
pub use providers::{
    AuxiliaryData, CorrelationModel, DistanceDecayCorrelation, NewZoneStats, ProviderError,
    ReceiverGeometry, SessionContext, SlabDepth, TravelTimeModel, TravelTimeSession, TtArrival,
    ZoneStats,
};
