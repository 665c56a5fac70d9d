//! Gridwatch: cluster-membership plumbing for an in-memory data grid.
//!
//! - a TCP liveness ring in which every member watches a few buddies over
//!   redundant connections and reports the ones it finds dead,
//! - polls that coordinate a request/response round across members,
//! - versioned leases guarding cached resources,
//! - packet bundles batching outbound datagrams.

#[macro_use]
mod utils;

mod bundle;
mod lease;
mod member;
mod poll;
mod ring;
mod service;

pub use utils::{logger_init, GridError, MemberSet, ME};

pub use member::{Member, MemberId};
pub use service::{GridService, ServiceConfig, ServiceCore, ServiceState};

pub use poll::{CompletionFn, Poll, PollHandle, PollId, PollProgress, PollState};

pub use lease::{
    compare_versions, current_thread_id, next_version, Lease, LeaseCell,
    LeaseStatus, BY_MEMBER, BY_THREAD, LEASE_WIRE_LEN,
};

pub use ring::{
    select_buddies, LivenessRing, MemberMonitor, RingConfig, RingNotice,
};

pub use bundle::{Lite, Packet, PacketBundle, RawPacket};
