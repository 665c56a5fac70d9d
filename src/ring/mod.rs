//! Liveness ring module: redundant-connection death detection of buddies.

mod buddies;
mod config;
mod liveness;
mod monitor;

pub use buddies::select_buddies;
pub use config::RingConfig;
pub use liveness::LivenessRing;
pub use monitor::{MemberMonitor, RingNotice};
