//! Poll: tracker of the outstanding responses to a multi-member request.
//!
//! A poll starts with the addressee set of its request as the "remaining"
//! members. Every remaining member eventually moves, exactly once, to either
//! the "responded" set or the "left" set. Once no member remains the poll
//! closes itself, wakes the issuing task, and tells its owning service.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::member::MemberId;
use crate::service::GridService;
use crate::utils::{GridError, MemberSet};

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

/// Service-scoped, monotonically assigned poll ID. 0 means unassigned.
pub type PollId = u64;

/// Poll lifecycle state. Only ever moves forward.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PollState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl PollState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PollState::Open,
            1 => PollState::Closing,
            _ => PollState::Closed,
        }
    }
}

/// Type-erased view of a poll, used by services to keep a registry of polls
/// with different result types.
pub trait PollHandle: Send + Sync {
    /// Gets the poll's ID.
    fn poll_id(&self) -> PollId;

    /// Marks a member as having responded.
    fn on_responded(&self, member: MemberId);

    /// Marks a member as having left the service.
    fn on_left(&self, member: MemberId);

    /// Closes the poll.
    fn close(&self);

    /// True if the poll has closed.
    fn is_closed(&self) -> bool;
}

/// Completion callback run while the poll is in CLOSING state, typically to
/// finalize an aggregate result.
pub type CompletionFn<R> = Box<dyn FnOnce(&mut PollProgress<R>) + Send>;

/// Member bookkeeping and accumulated result of a poll, guarded by the
/// poll's lock.
pub struct PollProgress<R> {
    remaining: MemberSet,
    responded: MemberSet,
    left: MemberSet,
    result: Option<R>,
    on_completion: Option<CompletionFn<R>>,
}

impl<R> PollProgress<R> {
    pub fn remaining(&self) -> &MemberSet {
        &self.remaining
    }

    pub fn responded(&self) -> &MemberSet {
        &self.responded
    }

    pub fn left(&self) -> &MemberSet {
        &self.left
    }

    /// Mutable access to the accumulated result.
    pub fn result_mut(&mut self) -> &mut Option<R> {
        &mut self.result
    }
}

/// In-flight multi-member request/response tracker.
pub struct Poll<R = ()> {
    /// Poll ID assigned by the owning service.
    poll_id: PollId,

    /// Wall-clock creation time in millisecs.
    init_time_ms: i64,

    /// Wall-clock expiry time in millisecs; 0 if none.
    expiry_time_ms: AtomicI64,

    /// Lifecycle state; only written while holding the `progress` lock.
    state: AtomicU8,

    /// If true, delivery of the request alone completes the poll.
    closeable_on_delivery: AtomicBool,

    /// Member sets and result.
    progress: Mutex<PollProgress<R>>,

    /// Single-waiter notifier; a signal raised before anyone waits is kept.
    notifier: Notify,

    /// Non-owning back-reference to the owning service; assigned once.
    service: OnceLock<Weak<dyn GridService>>,
}

// Poll public API implementation
impl<R> Poll<R>
where
    R: Send + 'static,
{
    /// Creates a new open poll with no addressees yet.
    pub fn new(poll_id: PollId) -> Self {
        let init_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        Poll {
            poll_id,
            init_time_ms,
            expiry_time_ms: AtomicI64::new(0),
            state: AtomicU8::new(PollState::Open as u8),
            closeable_on_delivery: AtomicBool::new(false),
            progress: Mutex::new(PollProgress {
                remaining: MemberSet::new(),
                responded: MemberSet::new(),
                left: MemberSet::new(),
                result: None,
                on_completion: None,
            }),
            notifier: Notify::new(),
            service: OnceLock::new(),
        }
    }

    /// Attaches the owning service. Panics if a service was already set.
    pub fn set_service(&self, service: Weak<dyn GridService>) {
        let fresh = self.service.set(service).is_ok();
        assert!(fresh, "service of poll {} assigned twice", self.poll_id);
    }

    /// Sets the callback to run when the poll completes.
    pub fn set_on_completion(
        &self,
        f: impl FnOnce(&mut PollProgress<R>) + Send + 'static,
    ) {
        self.lock_progress().on_completion = Some(Box::new(f));
    }

    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    pub fn init_time_ms(&self) -> i64 {
        self.init_time_ms
    }

    pub fn expiry_time_ms(&self) -> i64 {
        self.expiry_time_ms.load(Ordering::Acquire)
    }

    pub fn set_expiry_time_ms(&self, expiry_ms: i64) {
        self.expiry_time_ms.store(expiry_ms, Ordering::Release);
    }

    pub fn state(&self) -> PollState {
        PollState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PollState::Closed
    }

    pub fn set_closeable_on_delivery(&self, closeable: bool) {
        self.closeable_on_delivery
            .store(closeable, Ordering::Release);
    }

    pub fn remaining_members(&self) -> MemberSet {
        self.lock_progress().remaining.clone()
    }

    pub fn responded_members(&self) -> MemberSet {
        self.lock_progress().responded.clone()
    }

    pub fn left_members(&self) -> MemberSet {
        self.lock_progress().left.clone()
    }

    /// Runs `f` on the accumulated result under the poll's lock.
    pub fn update_result<T>(&self, f: impl FnOnce(&mut Option<R>) -> T) -> T {
        f(&mut self.lock_progress().result)
    }

    /// Prepares the poll right before its request is sent to `to_members`.
    ///
    /// Closes the poll right away if there is no addressee or the service
    /// has stopped. Addressees that are already not service members are
    /// handed to the service's task to be marked as departed. Before the
    /// service has a member set, only a poll addressed to just the local
    /// member is acceptable.
    pub fn prepare_dispatch(
        &self,
        to_members: &MemberSet,
    ) -> Result<(), GridError> {
        assert_ne!(self.poll_id, 0, "poll dispatched without an ID");

        self.lock_progress().remaining = to_members.clone();

        let Some(service) = self.service() else {
            return logged_err!("poll {} has no live service", self.poll_id);
        };

        if service.is_stopped() || to_members.is_empty() {
            self.close();
            return Ok(());
        }

        match service.service_members() {
            None => {
                let me = service.this_member();
                if to_members.len() != 1 || !to_members.contains(me) {
                    return logged_err!(
                        "poll {} addressed to {:?} before service {} started",
                        self.poll_id,
                        to_members,
                        service.service_name()
                    );
                }
            }
            Some(members) => {
                for member in to_members.iter().filter(|&m| !members.contains(m))
                {
                    pf_debug!(
                        "poll {} addressee {} already departed",
                        self.poll_id,
                        member
                    );
                    service.do_poll_member_left(self.poll_id, member);
                }
            }
        }

        Ok(())
    }

    /// Moves `member` from remaining to responded. No-op if the member is not
    /// remaining or the poll is closed. Closes the poll once nobody remains.
    pub fn on_responded(&self, member: MemberId) {
        let to_close = {
            let mut guard = self.lock_progress();
            let progress = &mut *guard;
            if self.is_closed() || !progress.remaining.contains(member) {
                return;
            }

            if progress.remaining.len() == 1 && progress.responded.is_empty() {
                // common single-destination case: swap whole sets
                mem::swap(&mut progress.remaining, &mut progress.responded);
            } else {
                progress.remaining.remove(member);
                progress.responded.insert(member);
            }
            progress.remaining.is_empty()
        };

        if to_close {
            self.close();
        }
    }

    /// Moves `member` from remaining to left. No-op if the member is not
    /// remaining or the poll is closed. Closes the poll once nobody remains.
    pub fn on_left(&self, member: MemberId) {
        let to_close = {
            let mut guard = self.lock_progress();
            let progress = &mut *guard;
            if self.is_closed() || !progress.remaining.contains(member) {
                return;
            }

            if progress.remaining.len() == 1 && progress.left.is_empty() {
                mem::swap(&mut progress.remaining, &mut progress.left);
            } else {
                progress.remaining.remove(member);
                progress.left.insert(member);
            }
            progress.remaining.is_empty()
        };

        if to_close {
            self.close();
        }
    }

    /// Handles a response message from `from`.
    pub fn on_response(&self, from: MemberId) {
        if !self.is_closed() {
            self.on_responded(from);
        }
    }

    /// Handles delivery confirmation of the request.
    pub fn on_delivery(&self) {
        if self.state() == PollState::Open
            && self.closeable_on_delivery.load(Ordering::Acquire)
        {
            self.close();
        }
    }

    /// Closes the poll: OPEN -> CLOSING -> CLOSED, exactly once even under
    /// concurrent calls. The completion callback runs while CLOSING, then the
    /// waiter is woken. The service is notified after the lock is released.
    ///
    /// A panicking completion callback still leaves the poll CLOSED, woken
    /// and unregistered; the panic is resumed afterwards.
    pub fn close(&self) {
        let (cleanup, callback_panic) = {
            let mut guard = self.lock_progress();
            if self.state() != PollState::Open {
                (false, None)
            } else {
                self.set_state(PollState::Closing);
                let mut callback_panic = None;
                if let Some(on_completion) = guard.on_completion.take() {
                    let progress = &mut *guard;
                    callback_panic = panic::catch_unwind(AssertUnwindSafe(
                        || on_completion(progress),
                    ))
                    .err();
                }
                self.set_state(PollState::Closed);
                self.notifier.notify_one();
                (true, callback_panic)
            }
        };

        if cleanup {
            if let Some(service) = self.service() {
                service.on_poll_closed(self.poll_id);
            }
        }
        if let Some(payload) = callback_panic {
            pf_error!("completion callback of poll {} panicked", self.poll_id);
            panic::resume_unwind(payload);
        }
    }

    /// Waits until the poll is closed, or until `timeout_ms` millisecs have
    /// passed since `start` (0 means no timeout). Returns the accumulated
    /// result on completion. Timing out does not close the poll.
    pub async fn wait_completion(
        &self,
        start: Instant,
        timeout_ms: u64,
    ) -> Result<Option<R>, GridError> {
        while !self.is_closed() {
            match self.check_request_timeout(start, timeout_ms)? {
                None => self.notifier.notified().await,
                Some(left) => {
                    // wakeups may be spurious; state is re-checked above
                    let _ = time::timeout(left, self.notifier.notified()).await;
                }
            }
        }
        Ok(self.lock_progress().result.take())
    }

    /// Like `wait_completion()`, with the owning service's default poll
    /// timeout.
    pub async fn wait_completion_default(
        &self,
        start: Instant,
    ) -> Result<Option<R>, GridError> {
        let timeout_ms = self
            .service()
            .map_or(0, |service| service.default_poll_timeout_ms());
        self.wait_completion(start, timeout_ms).await
    }

    /// Waits until the owning service's poll limit admits this poll. Returns
    /// the time budget left out of `timeout_ms` (`None` if unbounded).
    pub async fn wait_service_resume(
        &self,
        start: Instant,
        timeout_ms: u64,
    ) -> Result<Option<Duration>, GridError> {
        let Some(service) = self.service() else {
            return logged_err!("poll {} has no live service", self.poll_id);
        };
        let mut rx_limit = service.suspend_poll_limit();

        loop {
            let left = self.check_request_timeout(start, timeout_ms)?;
            if self.poll_id <= *rx_limit.borrow_and_update() {
                return Ok(left);
            }

            let changed = match left {
                None => rx_limit.changed().await,
                Some(left) => {
                    match time::timeout(left, rx_limit.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => continue, // re-check raises timeout
                    }
                }
            };
            if changed.is_err() {
                return logged_err!(
                    "poll limit gate of service {} dropped",
                    service.service_name()
                );
            }
        }
    }
}

// Poll internal helpers
impl<R> Poll<R> {
    fn lock_progress(&self) -> MutexGuard<'_, PollProgress<R>> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PollState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn service(&self) -> Option<Arc<dyn GridService>> {
        self.service.get().and_then(Weak::upgrade)
    }

    /// Returns the time left before the deadline, `None` if there is none,
    /// or a timeout error (counted in service stats) if it has passed.
    fn check_request_timeout(
        &self,
        start: Instant,
        timeout_ms: u64,
    ) -> Result<Option<Duration>, GridError> {
        if timeout_ms == 0 {
            return Ok(None);
        }

        let timeout = Duration::from_millis(timeout_ms);
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            if let Some(service) = self.service() {
                service.record_timeout();
            }
            return Err(GridError::timeout(format!(
                "request timed out after {} milliseconds",
                elapsed.as_millis()
            )));
        }
        Ok(Some(timeout - elapsed))
    }
}

impl<R> PollHandle for Poll<R>
where
    R: Send + 'static,
{
    fn poll_id(&self) -> PollId {
        self.poll_id
    }

    fn on_responded(&self, member: MemberId) {
        Poll::on_responded(self, member)
    }

    fn on_left(&self, member: MemberId) {
        Poll::on_left(self, member)
    }

    fn close(&self) {
        Poll::close(self)
    }

    fn is_closed(&self) -> bool {
        Poll::is_closed(self)
    }
}

impl<R> fmt::Display for Poll<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Poll\n  {{\n  PollId={}", self.poll_id)?;
        match PollState::from_u8(self.state.load(Ordering::Acquire)) {
            PollState::Closed => write!(f, ", closed")?,
            state => write!(f, ", active({:?})", state)?,
        }
        write!(f, "\n  InitTimeMillis={}", self.init_time_ms)?;
        match self.service.get().and_then(Weak::upgrade) {
            Some(service) => write!(f, "\n  Service={}", service.service_name())?,
            None => write!(f, "\n  Service=null")?,
        }
        let progress = self.lock_progress();
        write!(
            f,
            "\n  RespondedMemberSet={:?}\n  LeftMemberSet={:?}\n  RemainingMemberSet={:?}\n  }}",
            progress.responded, progress.left, progress.remaining
        )
    }
}

#[cfg(test)]
mod poll_tests {
    use super::*;
    use crate::service::ServiceCore;
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use std::sync::atomic::AtomicUsize;

    fn running_service(
        me: MemberId,
        members: &[MemberId],
    ) -> Result<Arc<ServiceCore>, GridError> {
        let svc = ServiceCore::new_and_setup("test-svc", me, None)?;
        svc.start(MemberSet::from_ids(members.iter().copied()));
        Ok(svc)
    }

    fn count_completions<R: Send + 'static>(
        poll: &Poll<R>,
    ) -> Arc<AtomicUsize> {
        let cnt = Arc::new(AtomicUsize::new(0));
        let cnt_ref = cnt.clone();
        poll.set_on_completion(move |_| {
            cnt_ref.fetch_add(1, Ordering::SeqCst);
        });
        cnt
    }

    #[test]
    fn all_members_accounted_any_order() -> Result<(), GridError> {
        let ids: Vec<MemberId> = (1..=9).collect();
        let svc = running_service(1, &ids)?;
        let mut rng = thread_rng();

        for round in 0..50 {
            let poll = svc.open_poll::<()>();
            let closes = count_completions(&poll);
            poll.prepare_dispatch(&MemberSet::from_ids(ids.iter().copied()))?;

            let mut order = ids.clone();
            order.shuffle(&mut rng);
            for (i, &m) in order.iter().enumerate() {
                assert!(!poll.is_closed());
                if (i + round) % 3 == 0 {
                    poll.on_left(m);
                } else {
                    poll.on_responded(m);
                }
            }

            assert!(poll.is_closed());
            assert_eq!(closes.load(Ordering::SeqCst), 1);
            assert!(poll.remaining_members().is_empty());
            let mut union = poll.responded_members();
            union.extend_from(&poll.left_members());
            assert_eq!(union, MemberSet::from_ids(ids.iter().copied()));
            assert_eq!(
                poll.responded_members().len() + poll.left_members().len(),
                ids.len()
            );
        }
        assert_eq!(svc.num_open_polls(), 0);
        Ok(())
    }

    #[test]
    fn concurrent_notifications_close_once() -> Result<(), GridError> {
        let ids: Vec<MemberId> = (1..=16).collect();
        let svc = running_service(1, &ids)?;
        let poll = svc.open_poll::<()>();
        let closes = count_completions(&poll);
        poll.prepare_dispatch(&MemberSet::from_ids(ids.iter().copied()))?;

        let handles: Vec<_> = ids
            .iter()
            .map(|&m| {
                let poll = poll.clone();
                std::thread::spawn(move || {
                    // each member reported twice, via both paths
                    if m % 2 == 0 {
                        poll.on_responded(m);
                        poll.on_left(m);
                    } else {
                        poll.on_left(m);
                        poll.on_responded(m);
                    }
                    poll.close();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(poll.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn responded_twice_is_noop() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2, 3])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2, 3]))?;
        poll.on_responded(2);
        poll.on_responded(2);
        poll.on_left(2);
        assert_eq!(poll.responded_members(), MemberSet::from_ids([2]));
        assert!(poll.left_members().is_empty());
        assert_eq!(poll.remaining_members(), MemberSet::from_ids([3]));
        // never an addressee
        poll.on_responded(7);
        assert_eq!(poll.remaining_members(), MemberSet::from_ids([3]));
        assert!(!poll.is_closed());
        Ok(())
    }

    #[test]
    fn single_member_fast_path() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;
        poll.on_left(2);
        assert!(poll.is_closed());
        assert_eq!(poll.left_members(), MemberSet::from_ids([2]));
        assert!(poll.responded_members().is_empty());
        assert!(poll.remaining_members().is_empty());
        Ok(())
    }

    #[test]
    fn dispatch_edge_cases() -> Result<(), GridError> {
        // no addressee closes right away
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::new())?;
        assert!(poll.is_closed());

        // departed addressee handed to the service task
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2, 9]))?;
        assert!(!poll.is_closed());
        assert_eq!(svc.process_pending_tasks(), 1);
        assert_eq!(poll.left_members(), MemberSet::from_ids([9]));
        poll.on_responded(2);
        assert!(poll.is_closed());

        // before start, only a local-only poll is allowed
        let svc = ServiceCore::new_and_setup("early", 4, None)?;
        let poll = svc.open_poll::<()>();
        assert!(poll.prepare_dispatch(&MemberSet::from_ids([4])).is_ok());
        let poll = svc.open_poll::<()>();
        assert!(poll.prepare_dispatch(&MemberSet::from_ids([4, 5])).is_err());

        // stopped service closes the poll
        let svc = running_service(1, &[1, 2])?;
        svc.stop();
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;
        assert!(poll.is_closed());
        Ok(())
    }

    #[test]
    #[should_panic]
    fn service_assigned_twice() {
        let svc = ServiceCore::new_and_setup("svc", 1, None).unwrap();
        let poll = svc.open_poll::<()>();
        let service: Arc<dyn GridService> = svc.clone();
        poll.set_service(Arc::downgrade(&service));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_completion_still_closes() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.set_on_completion(|_| panic!("completion callback failure"));
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;

        let poll_ref = poll.clone();
        let waiter = tokio::spawn(async move {
            poll_ref.wait_completion(Instant::now(), 5000).await
        });
        time::sleep(Duration::from_millis(100)).await;

        let poll_ref = poll.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            poll_ref.on_responded(2)
        }));
        assert!(result.is_err());
        assert_eq!(poll.state(), PollState::Closed);
        assert_eq!(svc.num_open_polls(), 0);
        assert_eq!(waiter.await??, None);

        // later closes are quiet no-ops
        poll.close();
        assert!(poll.is_closed());
        Ok(())
    }

    #[test]
    fn delivery_closes_if_flagged() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;
        poll.on_delivery();
        assert!(!poll.is_closed());
        poll.set_closeable_on_delivery(true);
        poll.on_delivery();
        assert!(poll.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_blocks_until_closed() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2, 3])?;
        let poll = svc.open_poll::<u32>();
        poll.set_on_completion(|progress| {
            *progress.result_mut() = Some(progress.responded().len() as u32);
        });
        poll.prepare_dispatch(&MemberSet::from_ids([2, 3]))?;

        let poll_ref = poll.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            poll_ref.on_responded(2);
            time::sleep(Duration::from_millis(100)).await;
            poll_ref.close();
        });

        let start = Instant::now();
        let result = poll.wait_completion(start, 0).await?;
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(result, Some(1));
        assert!(poll.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signal_before_wait() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;
        poll.on_responded(2);
        let start = Instant::now();
        poll.wait_completion(start, 5000).await?;
        assert!(start.elapsed() < Duration::from_millis(1000));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_times_out_leaving_poll_open() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;

        let start = Instant::now();
        let err = poll.wait_completion(start, 150).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(!poll.is_closed());
        assert_eq!(svc.timeout_count(), 1);

        // can still complete later
        poll.on_responded(2);
        assert!(poll.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn default_timeout_from_service() -> Result<(), GridError> {
        let svc = ServiceCore::new_and_setup(
            "svc",
            1,
            Some("default_poll_timeout_ms = 100"),
        )?;
        svc.start(MemberSet::from_ids([1, 2]));
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2]))?;
        let err = poll
            .wait_completion_default(Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!poll.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn service_resume_gate() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2])?;
        let early = svc.open_poll::<()>();
        svc.suspend_polls();
        let gated = svc.open_poll::<()>();

        // polls issued before suspension pass straight through
        let left = early.wait_service_resume(Instant::now(), 1000).await?;
        assert!(left.is_some());

        let err = gated
            .wait_service_resume(Instant::now(), 100)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(svc.timeout_count(), 1);

        let svc_ref = svc.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            svc_ref.resume_polls();
        });
        assert_eq!(gated.wait_service_resume(Instant::now(), 0).await?, None);
        Ok(())
    }

    #[test]
    fn display_lists_sets() -> Result<(), GridError> {
        let svc = running_service(1, &[1, 2, 3])?;
        let poll = svc.open_poll::<()>();
        poll.prepare_dispatch(&MemberSet::from_ids([2, 3]))?;
        poll.on_responded(3);
        let s = poll.to_string();
        assert!(s.contains("PollId=1"));
        assert!(s.contains("Service=test-svc"));
        assert!(s.contains("RespondedMemberSet={1; [3]}"));
        assert!(s.contains("RemainingMemberSet={1; [2]}"));
        Ok(())
    }
}
