//! Liveness ring: redundant low-level TCP connections to a handful of buddy
//! members, used to detect their death quickly and with few false positives.
//!
//! All socket I/O is done by small spawned tasks (listener acceptor, one
//! connect task per attempt, one reader task per established connection)
//! that report back over a single event channel. `select()` drains that
//! channel and runs the state machine; the event receiver doubles as the
//! selector lock that `close()` also takes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::member::{Member, MemberId};
use crate::ring::monitor::{
    classify_failure, failure_reason, ConnHandle, ConnId, ConnOwner,
    ConnState, FailureClass, MemberMonitor, RingEvent, RingNotice, RingState,
};
use crate::ring::RingConfig;
use crate::utils::safetcp::{
    tcp_bind_with_retry, tcp_connect_with_timeout, SocketOptions,
};
use crate::utils::GridError;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// The liveness ring.
pub struct LivenessRing {
    /// My member ID.
    me: MemberId,

    /// Configuration parameters.
    config: RingConfig,

    /// Options applied to every ring socket.
    opts: SocketOptions,

    /// Address the ring listener is bound to.
    local_addr: SocketAddr,

    /// Runtime that I/O tasks are spawned onto, so that topology changes may
    /// be triggered from threads outside of it.
    runtime: Handle,

    /// Buddy monitors, connections and stats.
    state: Mutex<RingState>,

    /// Sender side of the event channel, cloned into I/O tasks.
    tx_event: mpsc::UnboundedSender<RingEvent>,

    /// Receiver side of the event channel; its lock is the selector lock.
    rx_event: tokio::sync::Mutex<mpsc::UnboundedReceiver<RingEvent>>,

    /// Sender side of the notice channel.
    tx_notice: mpsc::UnboundedSender<RingNotice>,

    /// Receiver side of the notice channel.
    rx_notice: tokio::sync::Mutex<mpsc::UnboundedReceiver<RingNotice>>,
}

// LivenessRing public API implementation
impl LivenessRing {
    /// Creates the ring and binds its listener on `bind_addr`, then spawns
    /// the acceptor task.
    pub async fn new_and_setup(
        me: MemberId,
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, GridError> {
        let config = parsed_config!(config_str => RingConfig;
                                    redundancy_level, connect_timeout_ms,
                                    heartbeat_interval_ms, tcp_nodelay,
                                    linger_zero, listen_backlog,
                                    bind_retries)?;
        if config.connect_timeout_ms == 0 {
            return logged_err!(
                "invalid config.connect_timeout_ms '{}'",
                config.connect_timeout_ms
            );
        }
        if config.heartbeat_interval_ms == 0 {
            return logged_err!(
                "invalid config.heartbeat_interval_ms '{}'",
                config.heartbeat_interval_ms
            );
        }
        if config.listen_backlog == 0 {
            return logged_err!(
                "invalid config.listen_backlog '{}'",
                config.listen_backlog
            );
        }

        let opts = SocketOptions {
            nodelay: config.tcp_nodelay,
            linger_zero: config.linger_zero,
        };
        let listener = tcp_bind_with_retry(
            bind_addr,
            config.listen_backlog,
            opts,
            config.bind_retries,
        )
        .await?;
        let local_addr = listener.local_addr()?;

        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_notice, rx_notice) = mpsc::unbounded_channel();

        let acceptor =
            tokio::spawn(Self::acceptor_task(listener, tx_event.clone()));
        let state = RingState {
            acceptor: Some(acceptor),
            ..Default::default()
        };

        pf_info!("ring listening on {}", local_addr);
        Ok(LivenessRing {
            me,
            config,
            opts,
            local_addr,
            runtime: Handle::current(),
            state: Mutex::new(state),
            tx_event,
            rx_event: tokio::sync::Mutex::new(rx_event),
            tx_notice,
            rx_notice: tokio::sync::Mutex::new(rx_notice),
        })
    }

    /// Gets my member ID.
    pub fn me(&self) -> MemberId {
        self.me
    }

    /// Gets the configuration in use.
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Address of the ring listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Opens connections to buddies in `targets` that are not monitored yet
    /// (or are below the redundancy target), and drops the established
    /// connections of monitored buddies no longer in `targets`.
    pub fn ensure_topology(&self, targets: &[Member]) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }

        let dropped: Vec<MemberId> = state
            .buddies
            .values()
            .filter(|monitor| !targets.contains(&monitor.member))
            .map(|monitor| monitor.member.id)
            .collect();
        for id in dropped {
            let Some(monitor) = state.buddies.remove(&id) else {
                continue;
            };
            if !monitor.conns.is_empty() {
                pf_info!(
                    "ring disconnected from {} to maintain ring",
                    monitor.member
                );
                for conn in monitor.conns {
                    state.close_conn(conn);
                }
            }
            // pending attempts get closed once they complete
        }

        for member in targets.iter().filter(|m| m.id != self.me) {
            self.connect(&mut state, *member);
        }
    }

    /// Restores missing connections to every buddy and writes a keep-alive
    /// byte on every established one. Signals isolation if no inbound
    /// connection is left afterwards.
    pub fn heartbeat_buddies(&self) {
        let mut state = self.lock_state();
        if state.closed {
            return;
        }

        let mut notices = vec![];
        let members: Vec<Member> =
            state.buddies.values().map(|m| m.member).collect();
        for member in members {
            self.connect(&mut state, member);

            let conns: Vec<ConnId> = match state.buddies.get(&member.id) {
                Some(monitor) => monitor.conns.iter().copied().collect(),
                None => continue,
            };
            for conn in conns {
                if let Err(err) = Self::heartbeat(&mut state, conn) {
                    self.on_disconnect(&mut state, conn, err, &mut notices);
                }
            }
        }

        if state.newly_isolated() {
            notices.push(RingNotice::Isolated);
        }
        drop(state);
        self.emit_notices(notices);
    }

    /// Waits for I/O events for up to `timeout_ms` millisecs (0 means no
    /// limit, negative means don't wait at all), then handles every event
    /// that is ready. Returns the number of events handled. Errors if the
    /// ring has been closed.
    pub async fn select(&self, timeout_ms: i64) -> Result<usize, GridError> {
        let mut rx_event = self.rx_event.lock().await;
        if self.is_closed() {
            return logged_err!("ring has been closed");
        }

        let first = if timeout_ms < 0 {
            rx_event.try_recv().ok()
        } else if timeout_ms == 0 {
            rx_event.recv().await
        } else {
            time::timeout(
                Duration::from_millis(timeout_ms as u64),
                rx_event.recv(),
            )
            .await
            .ok()
            .flatten()
        };

        let mut handled = 0;
        let mut next = first;
        while let Some(event) = next {
            if self.is_closed() {
                break;
            }
            if self.handle_event(event) {
                handled += 1;
            }
            next = rx_event.try_recv().ok();
        }
        Ok(handled)
    }

    /// Interrupts a blocked `select()`.
    pub fn wakeup(&self) {
        if self.tx_event.send(RingEvent::Wakeup).is_err() {
            pf_debug!("ring event channel already closed");
        }
    }

    /// Checks within `timeout_ms` millisecs that `member`'s ring listener
    /// accepts connections, by connecting and writing a single zero byte.
    pub async fn verify_reachable(&self, member: &Member, timeout_ms: u64) -> bool {
        let probe = async {
            let mut stream = tcp_connect_with_timeout(
                member.ring_addr,
                self.opts,
                Duration::from_millis(timeout_ms.max(1)),
            )
            .await?;
            stream.write_all(&[0]).await?;
            stream.shutdown().await
        };
        match probe.await {
            Ok(()) => true,
            Err(err) => {
                pf_debug!(
                    "ring probe of {} failed: {}",
                    member,
                    failure_reason(&err)
                );
                false
            }
        }
    }

    /// Tears down all connections and the listener. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        // let any in-flight select() finish before tearing down
        self.wakeup();
        let _rx_event = self.rx_event.lock().await;

        self.lock_state().shut_all();
        pf_info!("ring closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Waits for the next notice for the membership layer.
    pub async fn get_notice(&self) -> Result<RingNotice, GridError> {
        match self.rx_notice.lock().await.recv().await {
            Some(notice) => Ok(notice),
            None => logged_err!("ring notice channel has been closed"),
        }
    }

    /// Takes the next notice if there is one, without waiting.
    pub fn try_get_notice(&self) -> Option<RingNotice> {
        self.rx_notice.try_lock().ok()?.try_recv().ok()
    }

    /// IDs of the monitored buddies, ascending.
    pub fn buddies(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> =
            self.lock_state().buddies.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of a buddy's monitor.
    pub fn monitor(&self, member: MemberId) -> Option<MemberMonitor> {
        self.lock_state().buddies.get(&member).cloned()
    }

    /// Number of connections from peers watching this node.
    pub fn inbound_connection_count(&self) -> usize {
        self.lock_state().inbound_count
    }

    /// Total number of open ring connections, including attempts in flight.
    pub fn num_connections(&self) -> usize {
        self.lock_state().conns.len()
    }

    pub fn stats_pings(&self) -> u64 {
        self.lock_state().stats_pings
    }

    pub fn stats_failures(&self) -> u64 {
        self.lock_state().stats_failures
    }

    pub fn format_stats(&self) -> String {
        let state = self.lock_state();
        format!(
            "Pings={}, Failures={}",
            state.stats_pings, state.stats_failures
        )
    }

    pub fn reset_stats(&self) {
        let mut state = self.lock_state();
        state.stats_pings = 0;
        state.stats_failures = 0;
    }
}

// LivenessRing internal helpers and event handlers
impl LivenessRing {
    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_notices(&self, notices: Vec<RingNotice>) {
        for notice in notices {
            if self.tx_notice.send(notice).is_err() {
                pf_debug!("ring notice channel has been closed");
            }
        }
    }

    /// Dispatches one event. Returns false for wakeups.
    fn handle_event(&self, event: RingEvent) -> bool {
        let mut notices = vec![];
        {
            let mut state = self.lock_state();
            match event {
                RingEvent::Wakeup => return false,
                RingEvent::Accepted { stream, addr } => {
                    self.on_accept(&mut state, stream, addr)
                }
                RingEvent::AcceptFailed(err) => {
                    pf_error!("error on ring accept: {}", err);
                }
                RingEvent::Connected { conn, result } => match result {
                    Ok(stream) => self.on_connect(&mut state, conn, stream),
                    Err(err) => {
                        self.on_disconnect(&mut state, conn, err, &mut notices)
                    }
                },
                RingEvent::Disconnected { conn, error } => {
                    self.on_disconnect(&mut state, conn, error, &mut notices)
                }
            }
        }
        self.emit_notices(notices);
        true
    }

    /// Tops up the connections to `member` to `1 + redundancy_level`,
    /// creating its monitor if needed.
    fn connect(&self, state: &mut RingState, member: Member) {
        let epoch = match state.buddies.get(&member.id) {
            Some(monitor) if monitor.member == member => monitor.epoch,
            _ => {
                // new buddy, or the member restarted at another address
                let epoch = state.alloc_epoch();
                if let Some(stale) = state
                    .buddies
                    .insert(member.id, MemberMonitor::new(member, epoch))
                {
                    for conn in stale.conns {
                        state.close_conn(conn);
                    }
                }
                epoch
            }
        };

        let Some(monitor) = state.monitor_of(member.id, epoch) else {
            return;
        };
        let target = 1 + self.config.redundancy_level as usize;
        let num_new =
            target.saturating_sub(monitor.conns.len() + monitor.pending);
        monitor.pending += num_new;

        for _ in 0..num_new {
            let conn = state.alloc_conn_id();
            let mut handle = ConnHandle::initiating(member.id, epoch);
            handle.task = Some(self.runtime.spawn(Self::connector_task(
                conn,
                member.ring_addr,
                self.opts,
                Duration::from_millis(self.config.connect_timeout_ms),
                self.tx_event.clone(),
            )));
            state.conns.insert(conn, handle);
            pf_trace!("ring connecting to {} (conn {})", member, conn);
        }
    }

    fn on_accept(&self, state: &mut RingState, stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = self.opts.apply_stream(&stream) {
            pf_error!("error on ring accept from {}: {}", addr, err);
            return;
        }

        let conn = state.alloc_conn_id();
        let (reader, writer) = stream.into_split();
        let task = self.runtime.spawn(Self::reader_task(
            conn,
            reader,
            self.tx_event.clone(),
        ));
        state.conns.insert(
            conn,
            ConnHandle {
                owner: ConnOwner::Inbound,
                state: ConnState::Connected,
                writer: Some(writer),
                task: Some(task),
            },
        );
        state.add_inbound();
        pf_trace!("ring accepted {} (conn {})", addr, conn);
    }

    fn on_connect(&self, state: &mut RingState, conn: ConnId, stream: TcpStream) {
        let Some(ConnOwner::Outbound { member, epoch }) =
            state.conns.get(&conn).map(|handle| handle.owner)
        else {
            // closed while connecting
            return;
        };

        let Some(monitor) = state.monitor_of(member, epoch) else {
            pf_trace!("ring member {} no longer a buddy", member);
            state.close_conn(conn);
            return;
        };
        monitor.pending = monitor.pending.saturating_sub(1);
        monitor.conns.insert(conn);
        pf_trace!("ring connected to {} (conn {})", monitor.member, conn);

        let (reader, writer) = stream.into_split();
        let task = self.runtime.spawn(Self::reader_task(
            conn,
            reader,
            self.tx_event.clone(),
        ));
        if let Some(handle) = state.conns.get_mut(&conn) {
            handle.state = ConnState::Connected;
            handle.writer = Some(writer);
            handle.task = Some(task);
        }
    }

    /// Handles a failed connection, classifying the failure.
    fn on_disconnect(
        &self,
        state: &mut RingState,
        conn: ConnId,
        err: io::Error,
        notices: &mut Vec<RingNotice>,
    ) {
        let Some(owner) = state.close_conn(conn) else {
            return;
        };

        match owner {
            ConnOwner::Inbound => {
                state.inbound_count = state.inbound_count.saturating_sub(1);
                if state.newly_isolated() {
                    pf_debug!("ring lost its last inbound connection");
                    notices.push(RingNotice::Isolated);
                }
            }

            ConnOwner::Outbound { member, epoch } => {
                let Some(monitor) = state.monitor_of(member, epoch) else {
                    return; // no longer a buddy
                };
                let reason = failure_reason(&err);
                let buddy = monitor.member;

                if classify_failure(&err) == FailureClass::Transient {
                    pf_debug!(
                        "ring connection to {} timed out ({}); retrying",
                        buddy,
                        reason
                    );
                } else if monitor.conns.is_empty() {
                    pf_warn!(
                        "ring disconnected from {} due to a peer departure ({}); removing the member",
                        buddy,
                        reason
                    );
                    state.stats_failures += 1;
                    state.buddies.remove(&member);
                    notices.push(RingNotice::DeadBuddy {
                        member: buddy,
                        reason,
                    });
                } else {
                    pf_debug!(
                        "ring connection to {} failed ({}); retrying",
                        buddy,
                        reason
                    );
                }
            }
        }
    }

    /// Writes a keep-alive byte without blocking.
    fn heartbeat(state: &mut RingState, conn: ConnId) -> io::Result<()> {
        let Some(writer) = state
            .conns
            .get(&conn)
            .filter(|handle| handle.state == ConnState::Connected)
            .and_then(|handle| handle.writer.as_ref())
        else {
            return Ok(());
        };
        match writer.try_write(&[0]) {
            Ok(_) => {
                state.stats_pings += 1;
                Ok(())
            }
            // send buffer full means the peer still holds unread pings
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Listener acceptor task function.
    async fn acceptor_task(
        listener: TcpListener,
        tx_event: mpsc::UnboundedSender<RingEvent>,
    ) {
        loop {
            let event = match listener.accept().await {
                Ok((stream, addr)) => RingEvent::Accepted { stream, addr },
                Err(err) => {
                    // avoid spinning on e.g. descriptor exhaustion
                    time::sleep(Duration::from_millis(100)).await;
                    RingEvent::AcceptFailed(err)
                }
            };
            if tx_event.send(event).is_err() {
                break;
            }
        }
    }

    /// Outbound connection attempt task function.
    async fn connector_task(
        conn: ConnId,
        addr: SocketAddr,
        opts: SocketOptions,
        timeout: Duration,
        tx_event: mpsc::UnboundedSender<RingEvent>,
    ) {
        let result = tcp_connect_with_timeout(addr, opts, timeout).await;
        let _ = tx_event.send(RingEvent::Connected { conn, result });
    }

    /// Connection reader task function. Data read is discarded; only the
    /// end of the connection matters.
    async fn reader_task(
        conn: ConnId,
        mut reader: OwnedReadHalf,
        tx_event: mpsc::UnboundedSender<RingEvent>,
    ) {
        let mut buf = [0u8; 64];
        let error = loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    break io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream",
                    )
                }
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        let _ = tx_event.send(RingEvent::Disconnected { conn, error });
    }
}

#[cfg(test)]
impl LivenessRing {
    /// Registers an established outbound connection to `member` that has no
    /// socket behind it.
    pub(crate) fn inject_connected(&self, member: Member) -> ConnId {
        let mut state = self.lock_state();
        if !state.buddies.contains_key(&member.id) {
            let epoch = state.alloc_epoch();
            state.buddies.insert(member.id, MemberMonitor::new(member, epoch));
        }
        let epoch = state.buddies[&member.id].epoch;
        let conn = state.alloc_conn_id();
        let mut handle = ConnHandle::initiating(member.id, epoch);
        handle.state = ConnState::Connected;
        state.conns.insert(conn, handle);
        if let Some(monitor) = state.buddies.get_mut(&member.id) {
            monitor.conns.insert(conn);
        }
        conn
    }

    /// Registers an inbound connection that has no socket behind it.
    pub(crate) fn inject_inbound(&self) -> ConnId {
        let mut state = self.lock_state();
        let conn = state.alloc_conn_id();
        state.conns.insert(
            conn,
            ConnHandle {
                owner: ConnOwner::Inbound,
                state: ConnState::Connected,
                writer: None,
                task: None,
            },
        );
        state.add_inbound();
        conn
    }

    /// Feeds an event as if it came from an I/O task.
    pub(crate) fn inject_event(&self, event: RingEvent) {
        let _ = self.tx_event.send(event);
    }
}

// tasks hold their own event senders, so they must be stopped explicitly
impl Drop for LivenessRing {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .shut_all();
    }
}

impl fmt::Display for LivenessRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids: Vec<String> =
            self.buddies().iter().map(|id| id.to_string()).collect();
        write!(f, "LivenessRing{{Connections=[{}]}}", ids.join(", "))
    }
}

#[cfg(test)]
mod liveness_tests {
    use super::*;

    async fn new_ring(me: MemberId) -> Result<LivenessRing, GridError> {
        LivenessRing::new_and_setup(
            me,
            "127.0.0.1:0".parse()?,
            Some("connect_timeout_ms = 2000"),
        )
        .await
    }

    fn fake_member(id: MemberId) -> Member {
        Member::new(id, "127.0.0.1:9".parse().unwrap())
    }

    fn definitive() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionReset)
    }

    /// Runs `select()` until `cond` holds, or fails after a few seconds.
    async fn select_until(
        ring: &LivenessRing,
        cond: impl Fn(&LivenessRing) -> bool,
    ) -> Result<(), GridError> {
        for _ in 0..100 {
            if cond(ring) {
                return Ok(());
            }
            ring.select(50).await?;
        }
        logged_err!("condition not reached in time")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redundant_failures_declare_death_once() -> Result<(), GridError> {
        let ring = new_ring(1).await?;
        let buddy = fake_member(2);
        let c1 = ring.inject_connected(buddy);
        let c2 = ring.inject_connected(buddy);

        ring.inject_event(RingEvent::Disconnected {
            conn: c1,
            error: definitive(),
        });
        assert_eq!(ring.select(-1).await?, 1);
        assert_eq!(ring.try_get_notice(), None);
        assert_eq!(ring.buddies(), vec![2]);
        assert_eq!(ring.monitor(2).map(|m| m.num_connections()), Some(1));

        ring.inject_event(RingEvent::Disconnected {
            conn: c2,
            error: definitive(),
        });
        // a duplicate report must not count twice
        ring.inject_event(RingEvent::Disconnected {
            conn: c2,
            error: definitive(),
        });
        ring.select(-1).await?;
        match ring.try_get_notice() {
            Some(RingNotice::DeadBuddy { member, .. }) => {
                assert_eq!(member, buddy)
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(ring.try_get_notice(), None);
        assert!(ring.buddies().is_empty());
        assert_eq!(ring.stats_failures(), 1);
        ring.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeouts_never_declare_death() -> Result<(), GridError> {
        let ring = new_ring(1).await?;
        for redundancy in 0..3 {
            let buddy = fake_member(10 + redundancy);
            let conns: Vec<ConnId> = (0..=redundancy)
                .map(|_| ring.inject_connected(buddy))
                .collect();
            for (i, conn) in conns.into_iter().enumerate() {
                let error = if i % 2 == 0 {
                    io::Error::new(io::ErrorKind::TimedOut, "Connection timed out")
                } else {
                    io::Error::new(io::ErrorKind::Other, "No route to host")
                };
                ring.inject_event(RingEvent::Disconnected { conn, error });
            }
            ring.select(-1).await?;
            assert_eq!(ring.try_get_notice(), None);
            assert!(ring.buddies().contains(&buddy.id));
            assert_eq!(ring.monitor(buddy.id).map(|m| m.num_connections()), Some(0));
        }
        assert_eq!(ring.stats_failures(), 0);
        ring.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inbound_loss_signals_isolation() -> Result<(), GridError> {
        let ring = new_ring(1).await?;
        let c1 = ring.inject_inbound();
        let c2 = ring.inject_inbound();
        ring.inject_event(RingEvent::Disconnected {
            conn: c1,
            error: definitive(),
        });
        ring.select(-1).await?;
        assert_eq!(ring.try_get_notice(), None);
        ring.inject_event(RingEvent::Disconnected {
            conn: c2,
            error: definitive(),
        });
        ring.select(-1).await?;
        assert_eq!(ring.try_get_notice(), Some(RingNotice::Isolated));
        assert_eq!(ring.inbound_connection_count(), 0);

        // still isolated: repeated heartbeat passes stay quiet
        for _ in 0..5 {
            ring.heartbeat_buddies();
        }
        assert_eq!(ring.try_get_notice(), None);

        // a new watcher ends isolation; losing it reports again
        let c3 = ring.inject_inbound();
        ring.heartbeat_buddies();
        assert_eq!(ring.try_get_notice(), None);
        ring.inject_event(RingEvent::Disconnected {
            conn: c3,
            error: definitive(),
        });
        ring.select(-1).await?;
        assert_eq!(ring.try_get_notice(), Some(RingNotice::Isolated));
        ring.heartbeat_buddies();
        assert_eq!(ring.try_get_notice(), None);
        ring.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn real_ring_detects_departure() -> Result<(), GridError> {
        let ring_a = new_ring(1).await?;
        let ring_b = new_ring(2).await?;
        let member_b = Member::new(2, ring_b.local_addr());

        ring_a.ensure_topology(&[member_b]);
        ring_a.ensure_topology(&[member_b]);
        assert_eq!(ring_a.num_connections(), 2);
        select_until(&ring_a, |r| {
            r.monitor(2).map(|m| m.num_connections()) == Some(2)
        })
        .await?;
        select_until(&ring_b, |r| r.inbound_connection_count() == 2).await?;
        assert_eq!(ring_a.to_string(), "LivenessRing{Connections=[2]}");

        ring_a.heartbeat_buddies();
        assert_eq!(ring_a.stats_pings(), 2);
        assert_eq!(ring_a.format_stats(), "Pings=2, Failures=0");
        // nobody watches A
        assert_eq!(ring_a.try_get_notice(), Some(RingNotice::Isolated));
        ring_a.reset_stats();
        assert_eq!(ring_a.stats_pings(), 0);

        ring_b.close().await;
        ring_b.close().await;
        assert!(ring_b.select(-1).await.is_err());

        select_until(&ring_a, |r| r.buddies().is_empty()).await?;
        match ring_a.try_get_notice() {
            Some(RingNotice::DeadBuddy { member, .. }) => {
                assert_eq!(member.id, 2)
            }
            other => panic!("unexpected notice {:?}", other),
        }
        assert_eq!(ring_a.try_get_notice(), None);
        assert_eq!(ring_a.stats_failures(), 1);
        ring_a.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_buddy_closes_late_connections() -> Result<(), GridError> {
        let ring_a = new_ring(1).await?;
        let ring_b = new_ring(2).await?;
        let member_b = Member::new(2, ring_b.local_addr());

        ring_a.ensure_topology(&[member_b]);
        ring_a.ensure_topology(&[]);
        assert!(ring_a.buddies().is_empty());
        // attempts in flight complete and are closed right away
        select_until(&ring_a, |r| r.num_connections() == 0).await?;
        assert_eq!(ring_a.try_get_notice(), None);

        // dropping established connections raises no notice either
        ring_a.ensure_topology(&[member_b]);
        select_until(&ring_a, |r| {
            r.monitor(2).map(|m| m.num_connections()) == Some(2)
        })
        .await?;
        ring_a.ensure_topology(&[]);
        assert_eq!(ring_a.num_connections(), 0);
        ring_a.select(200).await?;
        assert_eq!(ring_a.try_get_notice(), None);

        ring_a.close().await;
        ring_b.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn verify_reachable_probe() -> Result<(), GridError> {
        let ring_a = new_ring(1).await?;
        let ring_b = new_ring(2).await?;
        let member_b = Member::new(2, ring_b.local_addr());
        assert!(ring_a.verify_reachable(&member_b, 1000).await);

        ring_b.close().await;
        time::sleep(Duration::from_millis(100)).await;
        assert!(!ring_a.verify_reachable(&member_b, 1000).await);
        ring_a.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_without_close_stops_listener() -> Result<(), GridError> {
        let ring_a = new_ring(1).await?;
        let ring_b = new_ring(2).await?;
        let member_b = Member::new(2, ring_b.local_addr());
        ring_a.ensure_topology(&[member_b]);
        ring_a.ensure_topology(&[member_b]);
        select_until(&ring_a, |r| {
            r.monitor(2).map(|m| m.num_connections()) == Some(2)
        })
        .await?;
        select_until(&ring_b, |r| r.inbound_connection_count() == 2).await?;

        drop(ring_b);
        time::sleep(Duration::from_millis(100)).await;
        assert!(!ring_a.verify_reachable(&member_b, 1000).await);
        // connections of the dropped ring are torn down too
        select_until(&ring_a, |r| r.buddies().is_empty()).await?;
        ring_a.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wakeup_interrupts_select() -> Result<(), GridError> {
        let ring = std::sync::Arc::new(new_ring(1).await?);
        let ring_ref = ring.clone();
        let selector = tokio::spawn(async move { ring_ref.select(0).await });
        time::sleep(Duration::from_millis(100)).await;
        ring.wakeup();
        assert_eq!(selector.await??, 0);

        let ring_ref = ring.clone();
        let selector = tokio::spawn(async move {
            while ring_ref.select(0).await.is_ok() {}
        });
        time::sleep(Duration::from_millis(100)).await;
        ring.close().await;
        selector.await?;
        assert!(ring.is_closed());
        Ok(())
    }
}
