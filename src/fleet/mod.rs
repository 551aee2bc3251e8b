//! In-memory fleet state: robot snapshots, aggregate counts, and the
//! staleness sweep that keeps them honest.

pub mod staleness;
pub mod state;
pub mod store;
pub mod types;

pub use staleness::StalenessMonitor;
pub use state::{ApplyOutcome, FleetSnapshot, FleetState, RosterEntry};
pub use store::{FleetStore, LoggedEvent};
pub use types::{Coordinates, RobotId, RobotSnapshot, RobotStatus, StatusTone};
