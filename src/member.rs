//! Cluster member identity.

use std::fmt;
use std::net::SocketAddr;

/// Cluster member ID type. ID 0 is reserved to mean "no member".
pub type MemberId = u16;

/// A cluster member as seen by the liveness ring: its ID plus the address of
/// its ring listener.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Member {
    /// Member ID, unique within the cluster.
    pub id: MemberId,

    /// Address of the member's ring listener.
    pub ring_addr: SocketAddr,
}

impl Member {
    pub fn new(id: MemberId, ring_addr: SocketAddr) -> Self {
        Member { id, ring_addr }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Member(Id={}, RingAddr={})", self.id, self.ring_addr)
    }
}
