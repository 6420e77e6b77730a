//! Per-backend health state and the backend registry.
//!
//! Each backend is represented by a [`Backend`] handle holding its address,
//! stable registry index, and atomic health fields. Health transitions are
//! lock-free: consecutive failures live in an [`AtomicU32`], the suspension
//! deadline in an [`AtomicU64`] of nanoseconds since the registry epoch, and
//! in-flight connections in an [`AtomicUsize`].
//!
//! The registry's membership and order are fixed at construction. Only the
//! per-backend fields mutate afterwards, so the backend sequence itself can
//! be read concurrently without synchronization.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{parse_backends, BackendAddr};
use crate::Result;

/// `down_until` value of a backend that is suspended until explicitly reset.
const SUSPENDED_FOREVER: u64 = u64::MAX;

/// The fixed, insertion-ordered set of backends.
#[derive(Debug, Clone)]
pub struct Registry {
    backends: Arc<Vec<Backend>>,
}

/// Runtime state for a single backend. Cloning yields another handle to
/// the same shared state.
#[derive(Debug, Clone)]
pub struct Backend {
    state: Arc<InnerState>,
}

#[derive(Debug)]
struct InnerState {
    /// Position in the registry. Stable for the registry's lifetime.
    index: usize,
    addr: BackendAddr,
    /// Reference point for `down_until`, shared by every backend of a registry.
    epoch: Instant,
    /// Consecutive failures since the last success.
    fails: AtomicU32,
    /// Nanoseconds after `epoch` at which the backend is eligible again.
    /// Zero means healthy since creation; [`SUSPENDED_FOREVER`] never elapses.
    down_until: AtomicU64,
    /// Connections currently routed to this backend.
    active_connections: AtomicUsize,
}

/// Suspension state of a backend at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// Eligible for selection.
    None,
    /// Excluded until the given instant.
    Until(Instant),
    /// Excluded until [`Backend::reset`] is called.
    Forever,
}

/// Point-in-time view of one backend, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub index: usize,
    pub address: String,
    pub healthy: bool,
    pub fails: u32,
    pub active_connections: usize,
    /// Remaining suspension in milliseconds. `None` when healthy or when
    /// suspended until reset.
    pub suspended_for_ms: Option<u64>,
}

impl Registry {
    /// Builds a registry from parsed addresses, every backend starting
    /// healthy with no recorded failures.
    pub fn from_addrs(addrs: &[BackendAddr]) -> Self {
        let epoch = Instant::now();
        let backends = addrs
            .iter()
            .enumerate()
            .map(|(index, addr)| Backend::new(index, addr.clone(), epoch))
            .collect();
        Self {
            backends: Arc::new(backends),
        }
    }

    /// Parses a `host1:port1,host2:port2` specification into a registry.
    pub fn parse(spec: &str) -> Result<Self> {
        parse_backends(spec).map(|addrs| Self::from_addrs(&addrs))
    }

    /// Returns a slice of all backends (healthy and suspended), in
    /// configuration order.
    pub fn all(&self) -> &[Backend] {
        &self.backends
    }

    /// Returns the backends that are healthy at `now`, in configuration order.
    pub fn healthy_at(&self, now: Instant) -> Vec<&Backend> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy_at(now))
            .collect()
    }

    pub fn healthy(&self) -> Vec<&Backend> {
        self.healthy_at(Instant::now())
    }

    /// Returns the total number of configured backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Returns `true` if no backends are configured.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Captures the state of every backend at `now`.
    pub fn snapshot_at(&self, now: Instant) -> Vec<BackendStatus> {
        self.backends.iter().map(|b| b.status_at(now)).collect()
    }

    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.snapshot_at(Instant::now())
    }
}

impl Backend {
    fn new(index: usize, addr: BackendAddr, epoch: Instant) -> Self {
        Self {
            state: Arc::new(InnerState {
                index,
                addr,
                epoch,
                fails: AtomicU32::new(0),
                down_until: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the backend address.
    pub fn addr(&self) -> &BackendAddr {
        &self.state.addr
    }

    pub fn host(&self) -> &str {
        &self.state.addr.host
    }

    pub fn port(&self) -> u16 {
        self.state.addr.port
    }

    /// Returns the stable position of this backend in its registry.
    pub fn index(&self) -> usize {
        self.state.index
    }

    /// Returns the current consecutive failure count.
    pub fn fails(&self) -> u32 {
        self.state.fails.load(Ordering::Acquire)
    }

    /// Returns the number of connections currently routed here.
    pub fn active_connections(&self) -> usize {
        self.state.active_connections.load(Ordering::Acquire)
    }

    /// Returns `true` if the suspension deadline has elapsed at `now`.
    pub fn is_healthy_at(&self, now: Instant) -> bool {
        self.state.down_until.load(Ordering::Acquire) <= self.offset(now)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    /// Returns the suspension state as seen at `now`.
    pub fn suspension_at(&self, now: Instant) -> Suspension {
        let down_until = self.state.down_until.load(Ordering::Acquire);
        if down_until <= self.offset(now) {
            return Suspension::None;
        }
        if down_until == SUSPENDED_FOREVER {
            return Suspension::Forever;
        }
        // An unrepresentable deadline is as good as forever.
        self.state
            .epoch
            .checked_add(Duration::from_nanos(down_until))
            .map_or(Suspension::Forever, Suspension::Until)
    }

    /// Records a failed connection attempt at `now`, incrementing the
    /// consecutive failure counter. Once the counter reaches `threshold`,
    /// the backend is suspended until `now + fail_timeout`.
    ///
    /// A failure never shortens an existing suspension. Returns `true` if
    /// this failure moved the backend from healthy to suspended.
    pub fn record_failure_at(&self, threshold: u32, fail_timeout: Duration, now: Instant) -> bool {
        let prev = self
            .state
            .fails
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                Some(f.saturating_add(1))
            })
            .unwrap_or_else(|f| f);

        if prev.saturating_add(1) < threshold {
            return false;
        }

        let now_offset = self.offset(now);
        let deadline = now_offset
            .saturating_add(saturating_nanos(fail_timeout))
            .min(SUSPENDED_FOREVER - 1);
        let prev_deadline = self.state.down_until.fetch_max(deadline, Ordering::AcqRel);

        prev_deadline <= now_offset
    }

    /// Records a successful connection, resetting the failure counter.
    ///
    /// An active suspension is left in place: a late success does not
    /// cancel a penalty that has already been applied.
    pub fn record_success(&self) {
        self.state.fails.store(0, Ordering::Release);
    }

    /// Suspends this backend for `duration` starting at `now`, replacing any
    /// existing deadline.
    pub fn suspend_for(&self, duration: Duration, now: Instant) {
        let deadline = self
            .offset(now)
            .saturating_add(saturating_nanos(duration))
            .min(SUSPENDED_FOREVER - 1);
        self.state.down_until.store(deadline, Ordering::Release);
    }

    /// Suspends this backend until [`Backend::reset`] is called.
    pub fn suspend_forever(&self) {
        self.state
            .down_until
            .store(SUSPENDED_FOREVER, Ordering::Release);
    }

    /// Clears the failure counter and any suspension, returning the backend
    /// to rotation immediately.
    pub fn reset(&self) {
        self.state.fails.store(0, Ordering::Release);
        self.state.down_until.store(0, Ordering::Release);
    }

    /// Counts a new connection against this backend. The count is released
    /// when the returned guard is dropped.
    pub fn acquire(&self) -> ConnectionGuard {
        self.state
            .active_connections
            .fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            backend: self.clone(),
        }
    }

    fn release(&self) {
        let _ = self.state.active_connections.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    /// Returns `true` if both handles refer to the same registry slot.
    pub fn same_slot(&self, other: &Backend) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn status_at(&self, now: Instant) -> BackendStatus {
        let suspension = self.suspension_at(now);
        BackendStatus {
            index: self.index(),
            address: self.addr().to_string(),
            healthy: suspension == Suspension::None,
            fails: self.fails(),
            active_connections: self.active_connections(),
            suspended_for_ms: match suspension {
                Suspension::Until(deadline) => {
                    Some(saturating_millis(deadline.saturating_duration_since(now)))
                }
                Suspension::None | Suspension::Forever => None,
            },
        }
    }

    fn offset(&self, at: Instant) -> u64 {
        saturating_nanos(at.saturating_duration_since(self.state.epoch))
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// RAII guard for one routed connection. Dropping it decrements the
/// backend's active connection count.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Backend,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn registry(spec: &str) -> Registry {
        Registry::parse(spec).unwrap()
    }

    #[test]
    fn new_backend_starts_healthy() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        assert!(backend.is_healthy());
        assert_eq!(backend.fails(), 0);
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(backend.suspension_at(Instant::now()), Suspension::None);
    }

    #[test]
    fn indices_follow_configuration_order() {
        let pool = registry("a:1,b:2,a:1");
        let indices = pool.all().iter().map(Backend::index).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(!pool.all()[0].same_slot(&pool.all()[2]));
    }

    #[test]
    fn record_success_resets_failures() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();
        backend.record_failure_at(5, TIMEOUT, now);
        backend.record_failure_at(5, TIMEOUT, now);
        assert_eq!(backend.fails(), 2);

        backend.record_success();
        assert_eq!(backend.fails(), 0);
        assert!(backend.is_healthy_at(now));
    }

    #[test]
    fn record_failure_suspends_at_threshold() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();

        assert!(!backend.record_failure_at(3, TIMEOUT, now));
        assert!(!backend.record_failure_at(3, TIMEOUT, now));
        assert!(backend.record_failure_at(3, TIMEOUT, now));

        assert!(!backend.is_healthy_at(now));
        assert!(!backend.is_healthy_at(now + TIMEOUT - Duration::from_millis(1)));
        assert!(backend.is_healthy_at(now + TIMEOUT));
        assert_eq!(backend.suspension_at(now), Suspension::Until(now + TIMEOUT));
    }

    #[test]
    fn failure_beyond_threshold_does_not_retrigger() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();

        backend.record_failure_at(2, TIMEOUT, now);
        assert!(backend.record_failure_at(2, TIMEOUT, now));
        assert!(!backend.record_failure_at(2, TIMEOUT, now));
        assert_eq!(backend.fails(), 3);
    }

    #[test]
    fn failure_after_threshold_extends_suspension() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();
        let later = now + Duration::from_secs(10);

        backend.record_failure_at(1, TIMEOUT, now);
        backend.record_failure_at(1, TIMEOUT, later);

        assert!(!backend.is_healthy_at(now + TIMEOUT));
        assert!(backend.is_healthy_at(later + TIMEOUT));
    }

    #[test]
    fn success_does_not_lift_suspension() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();

        backend.record_failure_at(1, TIMEOUT, now);
        backend.record_success();

        assert_eq!(backend.fails(), 0);
        assert!(!backend.is_healthy_at(now));
        assert!(backend.is_healthy_at(now + TIMEOUT));
    }

    #[test]
    fn failure_never_shortens_infinite_suspension() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();

        backend.suspend_forever();
        backend.record_failure_at(1, TIMEOUT, now);

        assert_eq!(backend.suspension_at(now + TIMEOUT), Suspension::Forever);
    }

    #[test]
    fn reset_clears_infinite_suspension() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];

        backend.record_failure_at(10, TIMEOUT, Instant::now());
        backend.suspend_forever();
        assert!(!backend.is_healthy());

        backend.reset();
        assert!(backend.is_healthy());
        assert_eq!(backend.fails(), 0);
    }

    #[test]
    fn suspend_for_replaces_deadline() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];
        let now = Instant::now();

        backend.suspend_forever();
        backend.suspend_for(Duration::from_secs(1), now);

        assert!(!backend.is_healthy_at(now));
        assert!(backend.is_healthy_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn connection_guard_tracks_active_count() {
        let pool = registry("web1:80");
        let backend = &pool.all()[0];

        let first = backend.acquire();
        let second = backend.acquire();
        assert_eq!(backend.active_connections(), 2);
        assert!(first.backend().same_slot(backend));

        drop(first);
        assert_eq!(backend.active_connections(), 1);
        drop(second);
        assert_eq!(backend.active_connections(), 0);

        backend.release();
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn healthy_filters_suspended_backends() {
        let pool = registry("b1:3000,b2:3000,b3:3000");
        pool.all()[1].suspend_forever();

        let healthy = pool.healthy();
        assert_eq!(healthy.len(), 2);
        assert_eq!(healthy[0].host(), "b1");
        assert_eq!(healthy[1].host(), "b3");
    }

    #[test]
    fn millisecond_conversion_saturates() {
        assert_eq!(saturating_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn snapshot_reports_suspension() {
        let pool = registry("b1:3000,b2:3000,b3:3000");
        let now = Instant::now();
        pool.all()[0].suspend_for(Duration::from_secs(2), now);
        pool.all()[1].suspend_forever();
        let _guard = pool.all()[2].acquire();

        let snapshot = pool.snapshot_at(now);
        assert_eq!(snapshot[0].suspended_for_ms, Some(2000));
        assert!(!snapshot[0].healthy);
        assert_eq!(snapshot[1].suspended_for_ms, None);
        assert!(!snapshot[1].healthy);
        assert!(snapshot[2].healthy);
        assert_eq!(snapshot[2].active_connections, 1);
        assert_eq!(snapshot[2].address, "b3:3000");
    }
}
