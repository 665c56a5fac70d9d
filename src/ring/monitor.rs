//! Per-buddy and per-connection bookkeeping of the liveness ring.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;

use crate::member::{Member, MemberId};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Ring-local connection handle ID.
pub(crate) type ConnId = u64;

/// Notice raised by the ring towards the membership layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingNotice {
    /// Every connection to the buddy went down with a definitive error; the
    /// member should be removed from the cluster.
    DeadBuddy { member: Member, reason: String },

    /// Nobody is watching this node any more.
    Isolated,
}

/// Events fed from the ring's I/O tasks into `select()`.
#[derive(Debug)]
pub(crate) enum RingEvent {
    /// New inbound connection accepted by the listener.
    Accepted { stream: TcpStream, addr: SocketAddr },

    /// Listener failed to accept.
    AcceptFailed(io::Error),

    /// Outbound connection attempt finished.
    Connected {
        conn: ConnId,
        result: io::Result<TcpStream>,
    },

    /// An established connection hit an I/O error or end of stream.
    Disconnected { conn: ConnId, error: io::Error },

    /// Interrupts a blocked `select()`.
    Wakeup,
}

/// Who opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnOwner {
    /// Accepted from a peer watching this node.
    Inbound,

    /// Opened by this node to watch `member`; `epoch` identifies the buddy
    /// monitor that opened it.
    Outbound { member: MemberId, epoch: u64 },
}

/// Connection state. A closed connection is simply removed from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Initiating,
    Connected,
}

/// A ring connection and the task driving it (connect attempt or reader).
#[derive(Debug)]
pub(crate) struct ConnHandle {
    pub(crate) owner: ConnOwner,
    pub(crate) state: ConnState,
    pub(crate) writer: Option<OwnedWriteHalf>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl ConnHandle {
    pub(crate) fn initiating(member: MemberId, epoch: u64) -> Self {
        ConnHandle {
            owner: ConnOwner::Outbound { member, epoch },
            state: ConnState::Initiating,
            writer: None,
            task: None,
        }
    }

    /// Drops the socket and stops the driving task.
    pub(crate) fn shut(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // writer half dropped here
    }
}

/// Liveness state of one monitored buddy.
#[derive(Debug, Clone)]
pub struct MemberMonitor {
    /// The buddy being watched.
    pub(crate) member: Member,

    /// Identifies this monitor among successive monitors of the same member.
    pub(crate) epoch: u64,

    /// Established connections to the buddy.
    pub(crate) conns: HashSet<ConnId>,

    /// Connections initiated but not yet established.
    pub(crate) pending: usize,
}

impl MemberMonitor {
    pub(crate) fn new(member: Member, epoch: u64) -> Self {
        MemberMonitor {
            member,
            epoch,
            conns: HashSet::new(),
            pending: 0,
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Number of established connections.
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Number of connection attempts in flight.
    pub fn pending_connections(&self) -> usize {
        self.pending
    }
}

/// Mutable state of the ring, guarded by a single lock.
#[derive(Debug, Default)]
pub(crate) struct RingState {
    pub(crate) buddies: HashMap<MemberId, MemberMonitor>,
    pub(crate) conns: HashMap<ConnId, ConnHandle>,
    pub(crate) inbound_count: usize,
    pub(crate) next_conn_id: ConnId,
    pub(crate) next_epoch: u64,
    pub(crate) stats_pings: u64,
    pub(crate) stats_failures: u64,
    pub(crate) acceptor: Option<JoinHandle<()>>,
    pub(crate) closed: bool,

    /// Set once isolation has been reported; cleared by the next inbound
    /// connection.
    pub(crate) isolated: bool,
}

impl RingState {
    pub(crate) fn alloc_conn_id(&mut self) -> ConnId {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    pub(crate) fn alloc_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Records an inbound connection, ending any isolation.
    pub(crate) fn add_inbound(&mut self) {
        self.inbound_count += 1;
        self.isolated = false;
    }

    /// Returns true if there is no inbound connection and isolation has not
    /// been reported yet, marking it reported.
    pub(crate) fn newly_isolated(&mut self) -> bool {
        if self.inbound_count > 0 || self.isolated {
            return false;
        }
        self.isolated = true;
        true
    }

    /// Aborts the acceptor and shuts every connection.
    pub(crate) fn shut_all(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        for (_, handle) in self.conns.drain() {
            handle.shut();
        }
        self.buddies.clear();
        self.inbound_count = 0;
    }

    /// Current monitor of `member`, if it is the one with `epoch`.
    pub(crate) fn monitor_of(
        &mut self,
        member: MemberId,
        epoch: u64,
    ) -> Option<&mut MemberMonitor> {
        self.buddies
            .get_mut(&member)
            .filter(|monitor| monitor.epoch == epoch)
    }

    /// Removes a connection, fixing up its monitor's counts, and shuts it.
    /// Returns its owner, or `None` if it was already gone.
    pub(crate) fn close_conn(&mut self, conn: ConnId) -> Option<ConnOwner> {
        let handle = self.conns.remove(&conn)?;
        let owner = handle.owner;
        if let ConnOwner::Outbound { member, epoch } = owner {
            if let Some(monitor) = self.monitor_of(member, epoch) {
                if !monitor.conns.remove(&conn) {
                    monitor.pending = monitor.pending.saturating_sub(1);
                }
            }
        }
        handle.shut();
        Some(owner)
    }
}

/// Failure class of a ring connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureClass {
    /// Timeout or unreachable host; never evidence of death.
    Transient,

    /// Anything else, e.g. refused, reset or end of stream.
    Definitive,
}

/// Classifies a connection error. Timeouts and unreachable hosts can't be
/// told apart from a slow but live peer, so they never count as death.
pub(crate) fn classify_failure(err: &io::Error) -> FailureClass {
    if err.kind() == io::ErrorKind::TimedOut {
        return FailureClass::Transient;
    }
    let msg = err.to_string();
    if msg.starts_with("No route to host")
        || msg.starts_with("Connection timed out")
        || msg.starts_with("Network is unreachable")
    {
        FailureClass::Transient
    } else {
        FailureClass::Definitive
    }
}

/// Short description of an error for log lines and notices.
pub(crate) fn failure_reason(err: &io::Error) -> String {
    format!("{:?}: {}", err.kind(), err)
}

#[cfg(test)]
mod monitor_tests {
    use super::*;

    #[test]
    fn classify_errors() {
        let timed_out =
            io::Error::new(io::ErrorKind::TimedOut, "Connection timed out");
        assert_eq!(classify_failure(&timed_out), FailureClass::Transient);
        let no_route = io::Error::new(io::ErrorKind::Other, "No route to host");
        assert_eq!(classify_failure(&no_route), FailureClass::Transient);
        // raw OS error text carries a suffix
        let unreachable = io::Error::new(
            io::ErrorKind::Other,
            "Network is unreachable (os error 101)",
        );
        assert_eq!(classify_failure(&unreachable), FailureClass::Transient);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_failure(&refused), FailureClass::Definitive);
        let eos = io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream");
        assert_eq!(classify_failure(&eos), FailureClass::Definitive);
        assert!(failure_reason(&eos).contains("end of stream"));
    }

    #[test]
    fn close_conn_fixes_counts() {
        let member = Member::new(2, "127.0.0.1:7000".parse().unwrap());
        let mut state = RingState::default();
        let epoch = state.alloc_epoch();
        let mut monitor = MemberMonitor::new(member, epoch);

        let pending = state.alloc_conn_id();
        state.conns.insert(pending, ConnHandle::initiating(2, epoch));
        monitor.pending += 1;
        let established = state.alloc_conn_id();
        let mut handle = ConnHandle::initiating(2, epoch);
        handle.state = ConnState::Connected;
        state.conns.insert(established, handle);
        monitor.conns.insert(established);
        state.buddies.insert(2, monitor);

        assert_eq!(
            state.close_conn(pending),
            Some(ConnOwner::Outbound { member: 2, epoch })
        );
        assert_eq!(state.buddies[&2].pending_connections(), 0);
        assert_eq!(state.buddies[&2].num_connections(), 1);
        state.close_conn(established);
        assert_eq!(state.buddies[&2].num_connections(), 0);
        assert_eq!(state.close_conn(established), None);
    }

    #[test]
    fn isolation_reported_once() {
        let mut state = RingState::default();
        assert!(state.newly_isolated());
        assert!(!state.newly_isolated());
        state.add_inbound();
        assert!(!state.newly_isolated());
        state.inbound_count -= 1;
        assert!(state.newly_isolated());
        assert!(!state.newly_isolated());
    }
}
