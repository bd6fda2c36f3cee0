//! Location run outcomes.
//!
//! `LocStatus` is the engine-internal sum type threaded through the stepper
//! and close-out. `ExitCode` is the user-facing string enum on the wire; the
//! mapping between them lives here so the boundary never sees raw internals.

use serde::{Deserialize, Serialize};

/// Internal outcome of a location run or of a single stage/iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocStatus {
    /// Converged and closed out normally.
    Success,
    /// Damping stalled with the dispersion within tolerance of its last
    /// good value; the solution is usable.
    NearlyConverged,
    /// Iteration limit reached without convergence.
    DidNotConverge,
    /// Damping exhausted while the dispersion kept rising.
    UnstableSolution,
    /// Fewer than the minimum number of used stations remain.
    InsufficientData,
    /// The close-out normal matrix could not be inverted.
    SingularMatrix,
    /// The error-ellipsoid eigendecomposition failed.
    EllipsoidFailed,
    /// Starting depth outside the configured model range.
    BadDepth,
    /// A used pick changed phase identity; iteration restarts.
    PhaseIdChanged,
    /// A damped step was applied during the last iteration.
    DampStepLength,
    /// The hypocenter was held fixed by the analyst.
    HeldHypocenter,
}

impl LocStatus {
    /// True for outcomes that still carry a usable hypocenter.
    pub fn has_solution(self) -> bool {
        !matches!(
            self,
            LocStatus::InsufficientData | LocStatus::BadDepth
        )
    }
}

impl std::fmt::Display for LocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LocStatus::Success => "Success",
            LocStatus::NearlyConverged => "NearlyConverged",
            LocStatus::DidNotConverge => "DidNotConverge",
            LocStatus::UnstableSolution => "UnstableSolution",
            LocStatus::InsufficientData => "InsufficientData",
            LocStatus::SingularMatrix => "SingularMatrix",
            LocStatus::EllipsoidFailed => "EllipsoidFailed",
            LocStatus::BadDepth => "BadDepth",
            LocStatus::PhaseIdChanged => "PhaseIdChanged",
            LocStatus::DampStepLength => "DampStepLength",
            LocStatus::HeldHypocenter => "HeldHypocenter",
        };
        write!(f, "{s}")
    }
}

/// User-facing exit code reported in the output envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    Success,
    DidNotMove,
    ErrorsNotComputed,
    NotEnoughData,
    DidNotConverge,
    BadInput,
    CouldNotReadTTData,
    CouldNotReadAuxData,
    Failed,
    Unknown,
}

impl ExitCode {
    /// Map an internal status to the wire enum.
    ///
    /// `moved` is whether the hypocenter moved more than the final-stage
    /// convergence tolerance over the whole run; stationary free solutions
    /// report `DidNotMove`.
    pub fn from_status(status: LocStatus, moved: bool) -> Self {
        match status {
            LocStatus::Success | LocStatus::NearlyConverged => {
                if moved {
                    ExitCode::Success
                } else {
                    ExitCode::DidNotMove
                }
            }
            LocStatus::HeldHypocenter => ExitCode::Success,
            LocStatus::DidNotConverge | LocStatus::UnstableSolution => ExitCode::DidNotConverge,
            LocStatus::InsufficientData => ExitCode::NotEnoughData,
            LocStatus::SingularMatrix | LocStatus::EllipsoidFailed => ExitCode::ErrorsNotComputed,
            LocStatus::BadDepth => ExitCode::BadInput,
            // Transient iteration statuses never reach the boundary; if one
            // does, something upstream is broken.
            LocStatus::PhaseIdChanged | LocStatus::DampStepLength => ExitCode::Unknown,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitCode::Success => "Success",
            ExitCode::DidNotMove => "DidNotMove",
            ExitCode::ErrorsNotComputed => "ErrorsNotComputed",
            ExitCode::NotEnoughData => "NotEnoughData",
            ExitCode::DidNotConverge => "DidNotConverge",
            ExitCode::BadInput => "BadInput",
            ExitCode::CouldNotReadTTData => "CouldNotReadTTData",
            ExitCode::CouldNotReadAuxData => "CouldNotReadAuxData",
            ExitCode::Failed => "Failed",
            ExitCode::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_mapping() {
        assert_eq!(
            ExitCode::from_status(LocStatus::Success, true),
            ExitCode::Success
        );
        assert_eq!(
            ExitCode::from_status(LocStatus::Success, false),
            ExitCode::DidNotMove
        );
        assert_eq!(
            ExitCode::from_status(LocStatus::HeldHypocenter, false),
            ExitCode::Success
        );
        assert_eq!(
            ExitCode::from_status(LocStatus::InsufficientData, false),
            ExitCode::NotEnoughData
        );
        assert_eq!(
            ExitCode::from_status(LocStatus::SingularMatrix, true),
            ExitCode::ErrorsNotComputed
        );
        assert_eq!(
            ExitCode::from_status(LocStatus::UnstableSolution, true),
            ExitCode::DidNotConverge
        );
    }

    #[test]
    fn test_solution_availability() {
        assert!(LocStatus::DidNotConverge.has_solution());
        assert!(LocStatus::SingularMatrix.has_solution());
        assert!(!LocStatus::InsufficientData.has_solution());
        assert!(!LocStatus::BadDepth.has_solution());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(ExitCode::CouldNotReadTTData.to_string(), "CouldNotReadTTData");
        assert_eq!(LocStatus::DampStepLength.to_string(), "DampStepLength");
    }
}
