//! Event state: hypocenter, stations, picks, groups, residual arrays, and
//! the audit trail.

mod audit;
mod event;
mod hypocenter;
mod pick;
mod station;

pub use audit::HypoAudit;
pub use event::Event;
pub use hypocenter::Hypocenter;
pub use pick::{phase_is_surface_wave, phase_type_is_p, AuthorType, IdScratch, Pick, PickGroup};
pub use station::{Station, StationId};
