//! Owning-service collaborator interface, and a reference service core that
//! keeps the service member set, cluster clock, poll registry and stats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::member::MemberId;
use crate::poll::{Poll, PollHandle, PollId};
use crate::utils::{GridError, MemberSet};

use serde::Deserialize;

use tokio::sync::{mpsc, watch};

/// What leases and polls need from the service that owns them. Acts as both
/// the membership authority (who is alive, who am I) and the owner of poll
/// registration and statistics.
pub trait GridService: Send + Sync {
    /// Human-readable service name.
    fn service_name(&self) -> &str;

    /// ID of the local member.
    fn this_member(&self) -> MemberId;

    /// Current set of live service members, or `None` if the service has not
    /// finished starting yet.
    fn service_members(&self) -> Option<MemberSet>;

    /// True if the service has been stopped.
    fn is_stopped(&self) -> bool;

    /// Current cluster time in millisecs.
    fn cluster_time(&self) -> i64;

    /// Clock skew (millisecs) subtracted from a lease's expiration time when
    /// the local member is the holder, so the holder gives the lease up
    /// slightly before other members consider it expired.
    fn holder_clock_skew_ms(&self) -> i64 {
        10
    }

    /// Timeout in millisecs for poll waits whose caller gives none; 0 means
    /// infinite.
    fn default_poll_timeout_ms(&self) -> u64 {
        0
    }

    /// Called once after a poll has closed, outside of the poll's lock.
    fn on_poll_closed(&self, poll_id: PollId);

    /// Asks the service to close the poll on its own task.
    fn do_poll_close(&self, poll_id: PollId);

    /// Asks the service to mark `member` as departed for the poll on its own
    /// task.
    fn do_poll_member_left(&self, poll_id: PollId, member: MemberId);

    /// Bumps the request timeout statistics counter.
    fn record_timeout(&self);

    /// Subscribes to the poll limit gate: polls with an ID greater than the
    /// current value must wait before proceeding.
    fn suspend_poll_limit(&self) -> watch::Receiver<PollId>;
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Lease expiration skew applied when the local member holds a lease.
    pub holder_clock_skew_ms: i64,

    /// Timeout in millisecs for poll waits when the caller gives none.
    /// 0 means infinite.
    pub default_poll_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            holder_clock_skew_ms: 10,
            default_poll_timeout_ms: 0,
        }
    }
}

/// Lifecycle state of a service.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServiceState {
    Starting,
    Running,
    Stopped,
}

/// Deferred work to be carried out on the service's own task.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum ServiceTask {
    /// Close a poll.
    PollClose(PollId),

    /// Mark a member as departed for a poll.
    PollMemberLeft { poll_id: PollId, member: MemberId },
}

/// Reference owning service.
pub struct ServiceCore {
    /// Service name.
    name: String,

    /// My member ID.
    me: MemberId,

    /// Configuration parameters.
    config: ServiceConfig,

    /// Lifecycle state.
    state: RwLock<ServiceState>,

    /// Live service members; `None` until started.
    members: RwLock<Option<MemberSet>>,

    /// Offset in millisecs added to the local wall clock.
    clock_offset: AtomicI64,

    /// Last poll ID handed out; IDs start from 1.
    last_poll_id: AtomicU64,

    /// Registry of open polls.
    polls: Mutex<HashMap<PollId, Arc<dyn PollHandle>>>,

    /// Number of request timeouts observed.
    stats_timeouts: AtomicU64,

    /// Sender side of the poll limit gate.
    tx_suspend: watch::Sender<PollId>,

    /// Sender side of the service task channel.
    tx_task: mpsc::UnboundedSender<ServiceTask>,

    /// Receiver side of the service task channel.
    rx_task: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServiceTask>>,
}

// ServiceCore public API implementation
impl ServiceCore {
    /// Creates a new service core in starting state.
    pub fn new_and_setup(
        name: impl ToString,
        me: MemberId,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, GridError> {
        if me == 0 {
            return logged_err!("invalid member ID 0 for service");
        }
        let config = parsed_config!(config_str => ServiceConfig;
                                    holder_clock_skew_ms,
                                    default_poll_timeout_ms)?;
        if config.holder_clock_skew_ms < 0 {
            return logged_err!(
                "invalid holder_clock_skew_ms {}",
                config.holder_clock_skew_ms
            );
        }

        let (tx_suspend, _) = watch::channel(PollId::MAX);
        let (tx_task, rx_task) = mpsc::unbounded_channel();

        Ok(Arc::new(ServiceCore {
            name: name.to_string(),
            me,
            config,
            state: RwLock::new(ServiceState::Starting),
            members: RwLock::new(None),
            clock_offset: AtomicI64::new(0),
            last_poll_id: AtomicU64::new(0),
            polls: Mutex::new(HashMap::new()),
            stats_timeouts: AtomicU64::new(0),
            tx_suspend,
            tx_task,
            rx_task: tokio::sync::Mutex::new(rx_task),
        }))
    }

    /// Gets the configuration in use.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Gets the lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the service running with the given initial member set. The
    /// local member is always part of it.
    pub fn start(&self, mut members: MemberSet) {
        members.insert(self.me);
        pf_info!("service {} started with members {:?}", self.name, members);
        *self.members.write().unwrap_or_else(PoisonError::into_inner) =
            Some(members);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            ServiceState::Running;
    }

    /// Stops the service, closing every registered poll.
    pub fn stop(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            ServiceState::Stopped;
        for poll in self.registered_polls() {
            poll.close();
        }
        pf_info!("service {} stopped", self.name);
    }

    /// Adds a newly joined member to the service member set.
    pub fn member_joined(&self, member: MemberId) {
        let mut members =
            self.members.write().unwrap_or_else(PoisonError::into_inner);
        members.get_or_insert_with(MemberSet::new).insert(member);
    }

    /// Removes a departed member from the service member set, and cascades
    /// the departure into every open poll.
    pub fn member_left(&self, member: MemberId) {
        let removed = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map_or(false, |members| members.remove(member));
        if removed {
            pf_info!("service {} member {} left", self.name, member);
        }

        for poll in self.registered_polls() {
            poll.on_left(member);
        }
    }

    /// Shifts the cluster clock relative to the local wall clock.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.clock_offset.store(offset_ms, Ordering::Release);
    }

    /// Creates a new poll with the next poll ID and registers it with this
    /// service.
    pub fn open_poll<R>(self: &Arc<Self>) -> Arc<Poll<R>>
    where
        R: Send + 'static,
    {
        let poll_id = self.last_poll_id.fetch_add(1, Ordering::AcqRel) + 1;
        let poll = Arc::new(Poll::new(poll_id));
        let service: Arc<dyn GridService> = self.clone();
        poll.set_service(Arc::downgrade(&service));

        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(poll_id, poll.clone());
        pf_trace!("service {} opened poll {}", self.name, poll_id);
        poll
    }

    /// Looks up a registered (open) poll by ID.
    pub fn poll(&self, poll_id: PollId) -> Option<Arc<dyn PollHandle>> {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&poll_id)
            .cloned()
    }

    /// Number of polls currently registered.
    pub fn num_open_polls(&self) -> usize {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of request timeouts observed so far.
    pub fn timeout_count(&self) -> u64 {
        self.stats_timeouts.load(Ordering::Acquire)
    }

    /// Gates every poll issued after this point: their
    /// `wait_service_resume()` blocks until `resume_polls()`.
    pub fn suspend_polls(&self) {
        let limit = self.last_poll_id.load(Ordering::Acquire);
        self.tx_suspend.send_replace(limit);
        pf_debug!("service {} suspended polls above {}", self.name, limit);
    }

    /// Lifts the poll limit gate.
    pub fn resume_polls(&self) {
        self.tx_suspend.send_replace(PollId::MAX);
        pf_debug!("service {} resumed polls", self.name);
    }

    /// Processes all service tasks currently queued without waiting. Returns
    /// the number of tasks processed.
    pub fn process_pending_tasks(&self) -> usize {
        let Ok(mut rx_task) = self.rx_task.try_lock() else {
            // someone else is running the task loop
            return 0;
        };
        let mut cnt = 0;
        while let Ok(task) = rx_task.try_recv() {
            self.handle_task(task);
            cnt += 1;
        }
        cnt
    }

    /// Service task loop; runs until the service is stopped.
    pub async fn run_tasks(&self) -> Result<(), GridError> {
        let mut rx_task = self.rx_task.lock().await;
        while self.state() != ServiceState::Stopped {
            match rx_task.recv().await {
                Some(task) => self.handle_task(task),
                None => return logged_err!("service task channel closed"),
            }
        }
        Ok(())
    }
}

// ServiceCore internal helpers
impl ServiceCore {
    fn registered_polls(&self) -> Vec<Arc<dyn PollHandle>> {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn enqueue_task(&self, task: ServiceTask) {
        if let Err(e) = self.tx_task.send(task) {
            pf_error!("error enqueuing service task: {}", e);
        }
    }

    fn handle_task(&self, task: ServiceTask) {
        pf_trace!("service {} handling task {:?}", self.name, task);
        match task {
            ServiceTask::PollClose(poll_id) => {
                if let Some(poll) = self.poll(poll_id) {
                    poll.close();
                }
            }
            ServiceTask::PollMemberLeft { poll_id, member } => {
                if let Some(poll) = self.poll(poll_id) {
                    poll.on_left(member);
                }
            }
        }
    }
}

impl GridService for ServiceCore {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn this_member(&self) -> MemberId {
        self.me
    }

    fn service_members(&self) -> Option<MemberSet> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_stopped(&self) -> bool {
        self.state() == ServiceState::Stopped
    }

    fn cluster_time(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        wall + self.clock_offset.load(Ordering::Acquire)
    }

    fn holder_clock_skew_ms(&self) -> i64 {
        self.config.holder_clock_skew_ms
    }

    fn default_poll_timeout_ms(&self) -> u64 {
        self.config.default_poll_timeout_ms
    }

    fn on_poll_closed(&self, poll_id: PollId) {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&poll_id);
        pf_trace!("service {} closed poll {}", self.name, poll_id);
    }

    fn do_poll_close(&self, poll_id: PollId) {
        self.enqueue_task(ServiceTask::PollClose(poll_id));
    }

    fn do_poll_member_left(&self, poll_id: PollId, member: MemberId) {
        self.enqueue_task(ServiceTask::PollMemberLeft { poll_id, member });
    }

    fn record_timeout(&self) {
        self.stats_timeouts.fetch_add(1, Ordering::AcqRel);
    }

    fn suspend_poll_limit(&self) -> watch::Receiver<PollId> {
        self.tx_suspend.subscribe()
    }
}
