//! Picks and station pick groups.

use serde::{Deserialize, Serialize};

use crate::providers::TtArrival;

/// Who made a pick; drives the default phase affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthorType {
    ContributedAutomatic,
    LocalAutomatic,
    ContributedHuman,
    LocalHuman,
    #[default]
    Unknown,
}

impl AuthorType {
    /// Default phase affinity by author class. Unknown authors carry no
    /// affinity of their own and fall back to the floor of 1.
    pub fn default_affinity(self) -> f64 {
        match self {
            AuthorType::ContributedAutomatic | AuthorType::LocalAutomatic => 1.0,
            AuthorType::ContributedHuman => 1.5,
            AuthorType::LocalHuman => 3.0,
            AuthorType::Unknown => 0.0,
        }
    }

    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            AuthorType::ContributedAutomatic | AuthorType::LocalAutomatic
        )
    }
}

impl std::fmt::Display for AuthorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthorType::ContributedAutomatic => "ContributedAutomatic",
            AuthorType::LocalAutomatic => "LocalAutomatic",
            AuthorType::ContributedHuman => "ContributedHuman",
            AuthorType::LocalHuman => "LocalHuman",
            AuthorType::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// P-versus-S classification of an observed phase code. Surface waves and
/// unknown codes are treated as non-P.
pub fn phase_type_is_p(code: &str) -> bool {
    matches!(code.chars().next(), Some('P' | 'p'))
}

/// Surface-wave phase codes whose identification is frozen.
pub fn phase_is_surface_wave(code: &str) -> bool {
    matches!(code, "Lg" | "LR")
}

/// Transient phase-identification scratch, reset at the top of every pass.
#[derive(Debug, Clone, Default)]
pub struct IdScratch {
    /// Best statistical candidate: theoretical arrival plus its cumulative
    /// figure of merit.
    pub best_stat: Option<(TtArrival, f64)>,
    /// Best alternative candidate by affinity-weighted absolute residual;
    /// the merit here is that residual, smaller is better.
    pub best_alt: Option<(TtArrival, f64)>,
    /// The arrival this pick was finally assigned to; source of the
    /// residual-row derivatives.
    pub assigned: Option<TtArrival>,
    /// Force this pick's association even when merit is poor. A one-shot
    /// flag set by the initial pass; it survives scratch resets and is
    /// cleared only once a full identification pass has consumed it.
    pub force_association: bool,
}

impl IdScratch {
    /// Reset the per-pass candidates; the alternate merit starts saturated.
    /// `force_association` is deliberately left alone so the winner merge
    /// later in the same pass can still see it.
    pub fn initialize(&mut self) {
        self.best_stat = None;
        self.best_alt = None;
        self.assigned = None;
    }

    /// Current alternate merit with a saturating default.
    pub fn alt_merit(&self) -> f64 {
        self.best_alt.as_ref().map_or(f64::INFINITY, |(_, m)| *m)
    }

    /// Current statistical merit (larger is better).
    pub fn stat_merit(&self) -> f64 {
        self.best_stat.as_ref().map_or(0.0, |(_, m)| *m)
    }
}

/// One observed arrival at one station.
#[derive(Debug, Clone)]
pub struct Pick {
    /// External pick ID echoed back in the output envelope.
    pub external_id: String,
    /// Index of the station in the event arena.
    pub station: usize,
    /// Channel code, e.g. "BHZ".
    pub channel: String,
    /// Arrival time (s since epoch).
    pub arrival_time: f64,
    /// Picker standard error (s).
    pub quality: f64,
    /// The contributor wants this pick used.
    pub external_use: bool,
    /// Effective phase affinity, already resolved against the author
    /// default; always >= 1.
    pub affinity: f64,
    pub author_type: AuthorType,

    /// Phase code as supplied.
    pub original_phase: String,
    /// Phase code as currently identified; evolves across passes.
    pub current_phase: String,
    /// Best candidate phase code seen so far.
    pub best_phase: String,

    /// Travel-time residual at the current hypocenter (s).
    pub residual: f64,
    /// Statistical weight, 1/spread.
    pub weight: f64,
    /// Data importance from close-out.
    pub importance: f64,

    pub is_used: bool,
    pub is_automatic: bool,
    /// Surface waves (Lg, LR) keep their phase code forever.
    pub is_surface_wave: bool,
    /// Removed by covariance triage; never reused for this event.
    pub is_triage: bool,

    /// Cached arrival minus origin time (s); refreshed whenever the origin
    /// time changes.
    pub travel_time: f64,

    /// Phase-identification scratch.
    pub scratch: IdScratch,
}

impl Pick {
    /// Resolve the effective affinity: zero selects the author default,
    /// any other supplied value passes through. The result is floored at 1.
    pub fn resolve_affinity(input_affinity: f64, author: AuthorType) -> f64 {
        let base = if input_affinity > 0.0 {
            input_affinity
        } else {
            author.default_affinity()
        };
        base.max(1.0)
    }

    /// Whether the current phase is a surface wave that must keep its code.
    pub fn phase_is_frozen(&self) -> bool {
        self.is_surface_wave && !self.is_automatic
    }
}

/// All picks of one station, ordered by travel time, with the station's
/// current source-receiver geometry.
#[derive(Debug, Clone, Default)]
pub struct PickGroup {
    /// Index of the station in the event arena.
    pub station: usize,
    /// Pick indices, ordered by travel time.
    pub picks: Vec<usize>,
    /// Epicentral distance (deg), recomputed from the current hypocenter.
    pub distance_deg: f64,
    /// Azimuth (deg clockwise from north).
    pub azimuth_deg: f64,
    /// Cumulative figure of merit used during phase permutation.
    pub fom: f64,
}
