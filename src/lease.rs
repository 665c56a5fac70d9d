//! Lease: versioned, expirable, cluster-wide ownership record of a keyed
//! resource.
//!
//! Lease and resource versions are single bytes compared circularly: 0 means
//! "nonexistent", 1 means "freshly inserted", and live versions cycle through
//! 2..=255. Status is never stored; it is derived from the holder/issuer
//! fields against the owning service's current member set and clock.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{self, AtomicI64};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::member::MemberId;
use crate::service::GridService;
use crate::utils::{GridError, MemberSet};

use bytes::{Buf, BufMut};

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Number of bytes a lease occupies on the wire. Cache index and resource key
/// are serialized by the caller, not included here.
pub const LEASE_WIRE_LEN: usize = 2 + 2 + 8 + 8 + 8 + 2;

/// Lock scope: the lease is held by a specific thread of the holder member.
pub const BY_THREAD: i32 = 0;

/// Lock scope: the lease is held by the holder member as a whole.
pub const BY_MEMBER: i32 = 1;

/// Derived lease status.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LeaseStatus {
    /// Status cannot be determined (service member set not known yet).
    Unknown,

    /// No live issuer: a lease issue is unconfirmed or the issuer is gone.
    Unissued,

    /// No live holder, or the holding period has expired.
    Available,

    /// Held by the local member.
    Locked,

    /// Held by another live member.
    Dirty,
}

impl LeaseStatus {
    pub fn name(&self) -> &'static str {
        match self {
            LeaseStatus::Unknown => "LEASE_UNKNOWN",
            LeaseStatus::Unissued => "LEASE_UNISSUED",
            LeaseStatus::Available => "LEASE_AVAILABLE",
            LeaseStatus::Locked => "LEASE_LOCKED",
            LeaseStatus::Dirty => "LEASE_DIRTY",
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compares two 1-byte versions circularly. Returns `Greater` if `v1` is the
/// newer one. Version 0 is older than everything else; otherwise a distance
/// of 128 or more means one side has wrapped around.
pub fn compare_versions(v1: u8, v2: u8) -> Ordering {
    match v1.cmp(&v2) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Greater => {
            if v2 == 0 || v1 - v2 < 128 {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        Ordering::Less => {
            if v1 == 0 || v2 - v1 < 128 {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    }
}

/// Next version after `version`, skipping the reserved values 0 and 1 on
/// wraparound.
pub fn next_version(version: u8) -> u8 {
    match version.checked_add(1) {
        Some(v) => v,
        None => 2,
    }
}

static THREAD_ID_COUNTER: AtomicI64 = AtomicI64::new(0);

thread_local! {
    static THREAD_ID: Cell<i64> = const { Cell::new(0) };
}

/// Returns a process-unique lease holder ID for the calling OS thread,
/// assigned on first use. Never 0.
pub fn current_thread_id() -> i64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(
                THREAD_ID_COUNTER.fetch_add(1, atomic::Ordering::Relaxed) + 1,
            );
        }
        id.get()
    })
}

/// Lease of a resource identified by key `K` within cache `cache_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease<K> {
    cache_index: i32,
    key: K,
    issuer_id: MemberId,
    holder_id: MemberId,
    holder_thread_id: i64,
    effective_time: i64,
    expiration_time: i64,
    lease_version: u8,
    resource_version: u8,

    /// Estimated serialized size of the resource; -1 if unknown.
    resource_size: i32,
}

impl<K> Lease<K>
where
    K: Clone + PartialEq + fmt::Debug,
{
    /// Creates a fresh lease of `key` in cache `cache_index`, with nothing
    /// issued or held and unknown size.
    pub fn new(cache_index: i32, key: K) -> Self {
        Lease {
            cache_index,
            key,
            issuer_id: 0,
            holder_id: 0,
            holder_thread_id: 0,
            effective_time: 0,
            expiration_time: 0,
            lease_version: 0,
            resource_version: 0,
            resource_size: -1,
        }
    }

    pub fn cache_index(&self) -> i32 {
        self.cache_index
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn issuer_id(&self) -> MemberId {
        self.issuer_id
    }

    pub fn set_issuer_id(&mut self, issuer_id: MemberId) {
        self.issuer_id = issuer_id;
    }

    pub fn holder_id(&self) -> MemberId {
        self.holder_id
    }

    pub fn set_holder_id(&mut self, holder_id: MemberId) {
        self.holder_id = holder_id;
    }

    pub fn holder_thread_id(&self) -> i64 {
        self.holder_thread_id
    }

    pub fn set_holder_thread_id(&mut self, thread_id: i64) {
        self.holder_thread_id = thread_id;
    }

    pub fn effective_time(&self) -> i64 {
        self.effective_time
    }

    pub fn set_effective_time(&mut self, time_ms: i64) {
        self.effective_time = time_ms;
    }

    pub fn expiration_time(&self) -> i64 {
        self.expiration_time
    }

    pub fn set_expiration_time(&mut self, time_ms: i64) {
        self.expiration_time = time_ms;
    }

    pub fn lease_version(&self) -> u8 {
        self.lease_version
    }

    pub fn resource_version(&self) -> u8 {
        self.resource_version
    }

    pub fn resource_size(&self) -> i32 {
        self.resource_size
    }

    pub fn set_resource_size(&mut self, size: i32) {
        self.resource_size = size;
    }

    /// Grants the lease to `holder`'s `thread_id` for the window
    /// `[effective, expiration)`.
    pub fn lock(
        &mut self,
        holder: MemberId,
        thread_id: i64,
        effective: i64,
        expiration: i64,
    ) {
        self.holder_id = holder;
        self.holder_thread_id = thread_id;
        self.effective_time = effective;
        self.expiration_time = expiration;
    }

    /// Grants the lease to the local member for `[effective, expiration)`.
    /// With `BY_THREAD` the calling thread becomes the holder thread; with
    /// `BY_MEMBER` no particular thread holds it.
    ///
    /// Panics on any other scope value.
    pub fn lock_local(
        &mut self,
        svc: &dyn GridService,
        scope: i32,
        effective: i64,
        expiration: i64,
    ) {
        let thread_id = match scope {
            BY_THREAD => current_thread_id(),
            BY_MEMBER => 0,
            _ => panic!("invalid lease lock scope {}", scope),
        };
        self.lock(svc.this_member(), thread_id, effective, expiration);
    }

    /// True if the lease is `Locked` by the local member within `scope`:
    /// for `BY_THREAD` the calling thread must also be the holder thread.
    ///
    /// Panics on any other scope value.
    pub fn is_held_locally(&self, svc: &dyn GridService, scope: i32) -> bool {
        let thread_matches = match scope {
            BY_THREAD => self.holder_thread_id == current_thread_id(),
            BY_MEMBER => true,
            _ => panic!("invalid lease lock scope {}", scope),
        };
        thread_matches && self.status(svc) == LeaseStatus::Locked
    }

    pub fn increment_lease_version(&mut self) {
        self.lease_version = next_version(self.lease_version);
    }

    pub fn increment_resource_version(&mut self) {
        self.resource_version = next_version(self.resource_version);
    }

    /// Orders two leases of the same resource by how up-to-date they are:
    /// lease versions first, then resource versions, then effective time.
    pub fn freshness_cmp(&self, other: &Self) -> Ordering {
        if self.lease_version != other.lease_version {
            return compare_versions(self.lease_version, other.lease_version);
        }
        if self.resource_version != other.resource_version {
            return compare_versions(
                self.resource_version,
                other.resource_version,
            );
        }
        self.effective_time.cmp(&other.effective_time)
    }

    /// Merges in lease data received from elsewhere. Unknown values in
    /// `other` (size -1, version 0) never overwrite known ones here.
    ///
    /// Panics if `other` is a lease of a different resource.
    pub fn copy_from(&mut self, other: &Self) {
        assert!(
            self.key == other.key && self.cache_index == other.cache_index,
            "copying lease of {:?}[{}] into lease of {:?}[{}]",
            other.key,
            other.cache_index,
            self.key,
            self.cache_index
        );

        self.issuer_id = other.issuer_id;
        self.holder_id = other.holder_id;
        self.holder_thread_id = other.holder_thread_id;
        self.effective_time = other.effective_time;
        self.expiration_time = other.expiration_time;
        if other.resource_size >= 0 {
            self.resource_size = other.resource_size;
        }
        self.copy_version(other);
    }

    /// Copies the known (non-zero) versions of `other`.
    pub fn copy_version(&mut self, other: &Self) {
        if other.lease_version > 0 {
            self.lease_version = other.lease_version;
        }
        if other.resource_version > 0 {
            self.resource_version = other.resource_version;
        }
    }

    /// Releases the lease: clears the holder and stamps the current cluster
    /// time as the expiration.
    pub fn unlock(&mut self, svc: &dyn GridService) {
        self.holder_id = 0;
        self.holder_thread_id = 0;
        self.expiration_time = svc.cluster_time();
    }

    /// Reclaims the lease from a departed or expired holder, and forgets a
    /// departed issuer. Returns true if anything changed.
    pub fn validate(&mut self, svc: &dyn GridService) -> bool {
        let members = svc.service_members();
        let is_live = |id: MemberId| {
            members.as_ref().map_or(true, |m: &MemberSet| m.contains(id))
        };
        let mut changed = false;

        if self.holder_id != 0 && !is_live(self.holder_id) {
            self.unlock(svc);
            changed = true;
        }
        if self.holder_id != 0 && self.expiration_time <= svc.cluster_time() {
            self.unlock(svc);
            changed = true;
        }

        if self.issuer_id != 0 && !is_live(self.issuer_id) {
            self.issuer_id = 0;
            changed = true;
        }
        changed
    }

    /// Derives the current status of the lease as seen by the local member.
    pub fn status(&self, svc: &dyn GridService) -> LeaseStatus {
        let Some(members) = svc.service_members() else {
            return LeaseStatus::Unknown;
        };
        let me = svc.this_member();

        let mut available =
            self.holder_id == 0 || !members.contains(self.holder_id);
        if !available {
            // be more pessimistic on the holder side
            let mut expiration = self.expiration_time;
            if self.holder_id == me {
                expiration -= svc.holder_clock_skew_ms();
            }
            available = expiration <= svc.cluster_time();
        }

        if available {
            if self.issuer_id == 0 || !members.contains(self.issuer_id) {
                LeaseStatus::Unissued
            } else {
                LeaseStatus::Available
            }
        } else if self.holder_id == me {
            LeaseStatus::Locked
        } else {
            LeaseStatus::Dirty
        }
    }

    /// Serializes the ownership fields.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.issuer_id);
        buf.put_u16(self.holder_id);
        buf.put_i64(self.holder_thread_id);
        buf.put_i64(self.effective_time);
        buf.put_i64(self.expiration_time);
        buf.put_u16(
            self.lease_version as u16 | ((self.resource_version as u16) << 8),
        );
    }

    /// Deserializes the ownership fields written by `write_to()`.
    pub fn read_from(&mut self, buf: &mut impl Buf) -> Result<(), GridError> {
        if buf.remaining() < LEASE_WIRE_LEN {
            return logged_err!(
                "lease of {:?} truncated: {} < {} bytes",
                self.key,
                buf.remaining(),
                LEASE_WIRE_LEN
            );
        }

        self.issuer_id = buf.get_u16();
        self.holder_id = buf.get_u16();
        self.holder_thread_id = buf.get_i64();
        self.effective_time = buf.get_i64();
        self.expiration_time = buf.get_i64();
        let versions = buf.get_u16();
        self.lease_version = (versions & 0xFF) as u8;
        self.resource_version = (versions >> 8) as u8;
        Ok(())
    }

    /// Human-readable description of the lease from the local member's
    /// point of view.
    pub fn describe(&self, svc: &dyn GridService) -> String {
        let status = self.status(svc);
        let size = if self.resource_size == -1 {
            "Unknown".to_string()
        } else {
            self.resource_size.to_string()
        };
        let mut s = format!(
            "Lease: {:?} (Cache={}[{}], Size={}, Version={}/{}, IssuerId={}, HolderId={}, Status={}",
            self.key,
            svc.service_name(),
            self.cache_index,
            size,
            self.lease_version,
            self.resource_version,
            self.issuer_id,
            self.holder_id,
            status
        );

        if status == LeaseStatus::Locked || status == LeaseStatus::Dirty {
            if self.holder_id == svc.this_member() {
                s += &format!(", Held by threadId={}", self.holder_thread_id);
            }
            s += &format!(
                ", Locked at {}ms, Expires in {} millis",
                self.effective_time,
                self.expiration_time - svc.cluster_time()
            );
        } else if self.holder_id == 0 {
            s += &format!(", Last locked at {}ms", self.effective_time);
        } else {
            s += &format!(
                ", Last held by member {} from {}ms to {}ms",
                self.holder_id, self.effective_time, self.expiration_time
            );
        }
        s.push(')');
        s
    }
}

/// Shared lease guarded by a mutex, with change notification.
///
/// Every method locks individually. Callers that need several steps to
/// happen atomically must hold the guard from `lock()` across them, and call
/// `touch()` afterwards so that waiters re-check.
pub struct LeaseCell<K> {
    lease: Mutex<Lease<K>>,

    /// Change counter bumped on every mutation.
    tx_change: watch::Sender<u64>,
}

impl<K> LeaseCell<K>
where
    K: Clone + PartialEq + fmt::Debug,
{
    pub fn new(lease: Lease<K>) -> Self {
        let (tx_change, _) = watch::channel(0);
        LeaseCell {
            lease: Mutex::new(lease),
            tx_change,
        }
    }

    /// Locks the lease for a multi-step sequence.
    pub fn lock(&self) -> MutexGuard<'_, Lease<K>> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes up waiters after changes made through `lock()`.
    pub fn touch(&self) {
        self.tx_change.send_modify(|cnt| *cnt += 1);
    }

    /// Number of changes made so far.
    pub fn change_count(&self) -> u64 {
        *self.tx_change.borrow()
    }

    /// Returns a copy of the current lease.
    pub fn snapshot(&self) -> Lease<K> {
        self.lock().clone()
    }

    /// Applies `f` under the lock and notifies waiters.
    pub fn update<T>(&self, f: impl FnOnce(&mut Lease<K>) -> T) -> T {
        let ret = f(&mut *self.lock());
        self.touch();
        ret
    }

    pub fn copy_from(&self, other: &Lease<K>) {
        self.update(|lease| lease.copy_from(other));
    }

    pub fn increment_lease_version(&self) {
        self.update(|lease| lease.increment_lease_version());
    }

    pub fn increment_resource_version(&self) {
        self.update(|lease| lease.increment_resource_version());
    }

    pub fn unlock(&self, svc: &dyn GridService) {
        self.update(|lease| lease.unlock(svc));
    }

    pub fn validate(&self, svc: &dyn GridService) -> bool {
        let changed = self.lock().validate(svc);
        if changed {
            self.touch();
        }
        changed
    }

    /// Waits until `pred` holds on the lease, or until `timeout_ms` millisecs
    /// have passed since `start` (0 means no timeout). Returns a copy of the
    /// lease that satisfied `pred`.
    pub async fn wait_until(
        &self,
        start: Instant,
        timeout_ms: u64,
        pred: impl Fn(&Lease<K>) -> bool,
    ) -> Result<Lease<K>, GridError> {
        let mut rx_change = self.tx_change.subscribe();
        loop {
            {
                let lease = self.lock();
                if pred(&*lease) {
                    return Ok(lease.clone());
                }
            }

            let changed = if timeout_ms == 0 {
                rx_change.changed().await
            } else {
                let timeout = Duration::from_millis(timeout_ms);
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return Err(GridError::timeout(format!(
                        "lease wait timed out after {} milliseconds",
                        elapsed.as_millis()
                    )));
                }
                match time::timeout(timeout - elapsed, rx_change.changed())
                    .await
                {
                    Ok(changed) => changed,
                    Err(_) => continue,
                }
            };
            if changed.is_err() {
                return logged_err!("lease change notifier dropped");
            }
        }
    }
}
