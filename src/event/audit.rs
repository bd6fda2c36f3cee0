//! Hypocenter audit snapshots.
//!
//! Immutable primitive-field copies of the hypocenter taken at iteration
//! boundaries. They serve double duty: the human-readable audit trail and
//! the restore point used when step damping fails.

use crate::status::LocStatus;

use super::hypocenter::Hypocenter;

/// One audit snapshot.
#[derive(Debug, Clone)]
pub struct HypoAudit {
    pub stage: usize,
    pub iteration: usize,
    pub status: LocStatus,

    pub origin_time: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub depth: f64,
    pub bayes_depth: f64,
    pub bayes_spread: f64,

    /// Used station count at snapshot time.
    pub stations_used: usize,
    /// Step length that led to this state (km).
    pub step_len: f64,
}

impl HypoAudit {
    pub fn snapshot(
        hypo: &Hypocenter,
        stage: usize,
        iteration: usize,
        stations_used: usize,
        step_len: f64,
        status: LocStatus,
    ) -> Self {
        Self {
            stage,
            iteration,
            status,
            origin_time: hypo.origin_time,
            latitude: hypo.latitude,
            longitude: hypo.longitude,
            depth: hypo.depth,
            bayes_depth: hypo.bayes_depth,
            bayes_spread: hypo.bayes_spread,
            stations_used,
            step_len,
        }
    }
}

impl std::fmt::Display for HypoAudit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stage {} iter {:2} [{}]: {:9.4} {:9.4} {:6.1} km t0={:.3} step={:6.2} km n={}",
            self.stage,
            self.iteration,
            self.status,
            self.latitude,
            self.longitude,
            self.depth,
            self.origin_time,
            self.step_len,
            self.stations_used
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_fields() {
        let mut hypo = Hypocenter::new(100.0, 35.0, -118.0, 8.0);
        hypo.set_bayes(12.0, 9.0);
        let audit = HypoAudit::snapshot(&hypo, 1, 4, 17, 0.25, LocStatus::Success);
        assert!((audit.latitude - 35.0).abs() < f64::EPSILON);
        assert!((audit.bayes_depth - 12.0).abs() < f64::EPSILON);
        assert_eq!(audit.stations_used, 17);
        // The snapshot is detached from the live hypocenter.
        hypo.set(0.0, 0.0, 0.0, 0.0, &crate::config::DepthConfig::default());
        assert!((audit.latitude - 35.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display_contains_stage_and_status() {
        let hypo = Hypocenter::new(0.0, 1.0, 2.0, 3.0);
        let audit = HypoAudit::snapshot(&hypo, 2, 7, 5, 1.0, LocStatus::DampStepLength);
        let text = audit.to_string();
        assert!(text.contains("stage 2"));
        assert!(text.contains("DampStepLength"));
    }
}
