//! Standalone pooled-node limiter
//!
//! A bounded semaphore with two admission classes. Prioritized demand (work
//! already in flight) is always accepted into an unbounded queue; regular
//! demand is accepted into a queue of at most `max_queue_size` waiters and
//! rejected beyond that. A release always serves prioritized waiters first.
//!
//! Waiting allocates nothing per call: a waiter is a slab slot plus the
//! [`Waiter`] future that polls it.

mod wait_list;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_errors::{Error, LimiterError};
use strata_types::{PriorityClass, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::lease::{Acquisition, Lease, PermitRelease};
use crate::limiter::{ConcurrencyLimiter, LimiterStatistics};
use wait_list::{NodeOutcome, WaitList};

/// Longest timeout accepted by [`PooledLimiter::acquire`]
pub const MAX_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

struct PooledCore {
    resource: Resource,
    concurrency_limit: usize,
    max_queue_size: usize,
    /// Free permits. Only grows under the `waiters` lock and only while both
    /// queues are empty, so any positive value may be taken without the lock.
    available: AtomicUsize,
    /// Written under the `waiters` lock
    disposed: AtomicBool,
    waiters: Mutex<WaitList>,
    successful: AtomicU64,
    failed: AtomicU64,
}

/// Outcome picked under the lock, acted on after it is dropped
enum Admission {
    Ready(Acquisition),
    Wait(usize),
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Canceled,
    TimedOut,
}

impl From<Interrupt> for Acquisition {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Canceled => Acquisition::Canceled,
            Interrupt::TimedOut => Acquisition::TimedOut,
        }
    }
}

/// Single-permit-per-lease limiter with pooled wait nodes
pub struct PooledLimiter {
    core: Arc<PooledCore>,
}

impl PooledLimiter {
    /// Create a limiter with `concurrency_limit` permits that queues at most
    /// `max_queue_size` regular waiters
    ///
    /// # Errors
    ///
    /// Returns an error if either parameter is zero.
    pub fn new(
        resource: Resource,
        concurrency_limit: usize,
        max_queue_size: usize,
    ) -> Result<Self, Error> {
        if concurrency_limit == 0 {
            return Err(LimiterError::invalid_argument(
                "concurrency_limit",
                "must be greater than zero",
            )
            .into());
        }
        if max_queue_size == 0 {
            return Err(LimiterError::invalid_argument(
                "max_queue_size",
                "must be greater than zero",
            )
            .into());
        }

        debug!(%resource, concurrency_limit, max_queue_size, "pooled limiter created");

        Ok(Self {
            core: Arc::new(PooledCore {
                resource,
                concurrency_limit,
                max_queue_size,
                available: AtomicUsize::new(concurrency_limit),
                disposed: AtomicBool::new(false),
                waiters: Mutex::new(WaitList::default()),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn resource(&self) -> Resource {
        self.core.resource
    }

    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.core.concurrency_limit
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.core.available.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Acquire one permit
    ///
    /// - no timeout: wait until granted, canceled or disposed
    /// - zero timeout: grant only if a permit is free right now, never queue
    /// - otherwise: wait at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` exceeds [`MAX_TIMEOUT`].
    pub async fn acquire(
        &self,
        prioritized: bool,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        let Some(timeout) = timeout else {
            return Ok(self.acquire_untimed(prioritized, cancel).await);
        };

        if timeout > MAX_TIMEOUT {
            return Err(LimiterError::InvalidTimeout {
                millis: timeout.as_millis(),
            }
            .into());
        }

        if timeout.is_zero() {
            return Ok(self.core.acquire_now().unwrap_or_else(|| {
                self.core.failed.fetch_add(1, Ordering::Relaxed);
                Acquisition::TimedOut
            }));
        }

        Ok(match self.core.admit(prioritized, cancel) {
            Admission::Ready(outcome) => outcome,
            Admission::Wait(key) => self.core.wait(key, Some(timeout), cancel).await,
        })
    }

    async fn acquire_untimed(&self, prioritized: bool, cancel: &CancellationToken) -> Acquisition {
        match self.core.admit(prioritized, cancel) {
            Admission::Ready(outcome) => outcome,
            Admission::Wait(key) => self.core.wait(key, None, cancel).await,
        }
    }

    /// Acquire one permit only if one is free right now
    pub fn attempt_acquire(&self) -> Acquisition {
        self.core.acquire_now().unwrap_or_else(|| {
            self.core.failed.fetch_add(1, Ordering::Relaxed);
            Acquisition::Rejected
        })
    }

    /// Resolve every waiter with [`Acquisition::Disposed`] and refuse all
    /// further acquisitions
    pub fn dispose(&self) {
        let wakers = {
            let mut waiters = self.core.waiters.lock();
            if self.core.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            let queued = waiters.len();
            let wakers = waiters.dispose_all();
            info!(resource = %self.core.resource, resolved = queued, "pooled limiter disposed");
            wakers
        };
        for waker in wakers {
            waker.wake();
        }
    }

    #[must_use]
    pub fn statistics(&self) -> LimiterStatistics {
        LimiterStatistics {
            available_permits: self.available_permits(),
            queued_count: self.core.waiters.lock().len(),
            total_successful_leases: self.core.successful.load(Ordering::Relaxed),
            total_failed_leases: self.core.failed.load(Ordering::Relaxed),
        }
    }
}

impl PooledCore {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn fail(&self, outcome: Acquisition) -> Acquisition {
        self.failed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Take a free permit without locking
    fn try_take(self: &Arc<Self>) -> Option<Lease> {
        let mut current = self.available.load(Ordering::Acquire);
        while current > 0 {
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    return Some(Lease::granted(1, self.clone()));
                }
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Synchronous outcome that never touches the queues
    fn acquire_now(self: &Arc<Self>) -> Option<Acquisition> {
        if self.is_disposed() {
            return Some(self.fail(Acquisition::Disposed));
        }
        self.try_take().map(Acquisition::Acquired)
    }

    /// Pick exactly one outcome: disposed, granted, canceled, rejected or
    /// queued
    fn admit(self: &Arc<Self>, prioritized: bool, cancel: &CancellationToken) -> Admission {
        // Plenty of capacity and no contention: skip the lock
        if let Some(outcome) = self.acquire_now() {
            return Admission::Ready(outcome);
        }

        let mut waiters = self.waiters.lock();
        if self.is_disposed() {
            return Admission::Ready(self.fail(Acquisition::Disposed));
        }
        if let Some(lease) = self.try_take() {
            return Admission::Ready(Acquisition::Acquired(lease));
        }
        if cancel.is_cancelled() {
            return Admission::Ready(self.fail(Acquisition::Canceled));
        }
        if !prioritized && waiters.regular_len() >= self.max_queue_size {
            drop(waiters);
            debug!(resource = %self.resource, max_queue_size = self.max_queue_size, "admission rejected");
            return Admission::Ready(self.fail(Acquisition::Rejected));
        }

        let key = waiters.enqueue(prioritized);
        trace!(resource = %self.resource, prioritized, queued = waiters.len(), "waiter queued");
        Admission::Wait(key)
    }

    async fn wait(
        self: &Arc<Self>,
        key: usize,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Acquisition {
        let mut waiter = Waiter {
            core: self,
            key: Some(key),
        };
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let interrupt = tokio::select! {
            biased;
            outcome = &mut waiter => return outcome,
            () = cancel.cancelled() => Interrupt::Canceled,
            () = deadline => Interrupt::TimedOut,
        };
        waiter.interrupt(interrupt)
    }

    /// Turn a consumed node outcome into the caller's result
    fn finish(self: &Arc<Self>, outcome: NodeOutcome, interrupt: Interrupt) -> Acquisition {
        match outcome {
            NodeOutcome::Signaled => {
                self.successful.fetch_add(1, Ordering::Relaxed);
                Acquisition::Acquired(Lease::granted(1, self.clone()))
            }
            NodeOutcome::Disposed => self.fail(Acquisition::Disposed),
            NodeOutcome::Canceled | NodeOutcome::Pending => {
                debug!(resource = %self.resource, ?interrupt, "waiter interrupted");
                self.fail(interrupt.into())
            }
        }
    }

    fn release_one(&self) {
        let waker = {
            let mut waiters = self.waiters.lock();
            match waiters.signal_next() {
                Some(waker) => waker,
                None => {
                    self.available.fetch_add(1, Ordering::AcqRel);
                    None
                }
            }
        };
        trace!(resource = %self.resource, "permit released");
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl PermitRelease for PooledCore {
    fn release_permits(self: Arc<Self>, permits: usize) {
        for _ in 0..permits {
            self.release_one();
        }
    }
}

/// Future resolving a queued node
///
/// Dropping it before completion is a cancellation; a permit that was
/// already handed to it is passed on to the next waiter.
struct Waiter<'a> {
    core: &'a Arc<PooledCore>,
    key: Option<usize>,
}

impl Waiter<'_> {
    /// Resolve the node on the caller's side
    ///
    /// If a release signaled the node first, that grant wins.
    fn interrupt(&mut self, interrupt: Interrupt) -> Acquisition {
        let Some(key) = self.key.take() else {
            return interrupt.into();
        };
        let core = self.core;
        let outcome = {
            let mut waiters = core.waiters.lock();
            waiters.cancel(key);
            waiters.consume(key, !core.is_disposed())
        };
        core.finish(outcome, interrupt)
    }
}

impl Future for Waiter<'_> {
    type Output = Acquisition;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Acquisition> {
        let core = self.core;
        let Some(key) = self.key else {
            return Poll::Pending;
        };

        let outcome = {
            let mut waiters = core.waiters.lock();
            let node = waiters.node_mut(key);
            if node.outcome == NodeOutcome::Pending {
                if !node
                    .waker
                    .as_ref()
                    .is_some_and(|waker| waker.will_wake(cx.waker()))
                {
                    node.waker = Some(cx.waker().clone());
                }
                return Poll::Pending;
            }
            waiters.consume(key, !core.is_disposed())
        };

        self.key = None;
        Poll::Ready(core.finish(outcome, Interrupt::Canceled))
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let outcome = {
            let mut waiters = self.core.waiters.lock();
            waiters.cancel(key);
            waiters.consume(key, !self.core.is_disposed())
        };
        match outcome {
            // Granted to a caller that is gone
            NodeOutcome::Signaled => self.core.release_one(),
            NodeOutcome::Canceled => {
                self.core.failed.fetch_add(1, Ordering::Relaxed);
            }
            NodeOutcome::Disposed | NodeOutcome::Pending => {}
        }
    }
}

#[async_trait]
impl ConcurrencyLimiter for PooledLimiter {
    async fn acquire(
        &self,
        class: PriorityClass,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        check_single_permit(permits)?;
        Ok(self.acquire_untimed(class.continuation, cancel).await)
    }

    fn attempt_acquire(
        &self,
        _class: PriorityClass,
        permits: usize,
    ) -> Result<Acquisition, Error> {
        check_single_permit(permits)?;
        Ok(PooledLimiter::attempt_acquire(self))
    }

    fn statistics(&self) -> LimiterStatistics {
        PooledLimiter::statistics(self)
    }
}

fn check_single_permit(permits: usize) -> Result<(), Error> {
    if permits != 1 {
        return Err(LimiterError::invalid_argument(
            "permits",
            format!("pooled limiter grants exactly one permit per lease, got {permits}"),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::poll;
    use std::task::Poll;

    fn limiter(concurrency_limit: usize, max_queue_size: usize) -> PooledLimiter {
        PooledLimiter::new(Resource::ChunkCache, concurrency_limit, max_queue_size).unwrap()
    }

    fn held(outcome: Acquisition) -> Lease {
        match outcome {
            Acquisition::Acquired(lease) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }

    #[test]
    fn zero_sized_limits_are_invalid() {
        assert!(PooledLimiter::new(Resource::Index, 0, 1).is_err());
        assert!(PooledLimiter::new(Resource::Index, 1, 0).is_err());
    }

    #[tokio::test]
    async fn timeout_above_maximum_is_invalid() {
        let limiter = limiter(1, 1);
        let cancel = CancellationToken::new();
        let err = limiter
            .acquire(false, Some(MAX_TIMEOUT + Duration::from_millis(1)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Limiter(LimiterError::InvalidTimeout { .. })
        ));
        assert!(limiter
            .acquire(false, Some(MAX_TIMEOUT), &cancel)
            .await
            .unwrap()
            .is_acquired());
    }

    #[tokio::test]
    async fn free_permits_are_granted_without_waiting() {
        let limiter = limiter(2, 1);
        let cancel = CancellationToken::new();
        let a = held(limiter.acquire(false, None, &cancel).await.unwrap());
        let b = held(limiter.acquire(true, None, &cancel).await.unwrap());
        assert_eq!(limiter.available_permits(), 0);
        drop((a, b));
        assert_eq!(limiter.available_permits(), 2);
        assert_eq!(limiter.statistics().total_successful_leases, 2);
    }

    #[tokio::test]
    async fn zero_timeout_never_queues() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let _holder = held(limiter.attempt_acquire());

        let outcome = limiter
            .acquire(false, Some(Duration::ZERO), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(limiter.available_permits(), 0);
        assert_eq!(limiter.statistics().queued_count, 0);
    }

    #[tokio::test]
    async fn prioritized_waiter_overtakes_regular() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let holder = held(limiter.attempt_acquire());

        let mut regular = Box::pin(limiter.acquire(false, None, &cancel));
        let mut prioritized = Box::pin(limiter.acquire(true, None, &cancel));
        assert!(poll!(regular.as_mut()).is_pending());
        assert!(poll!(prioritized.as_mut()).is_pending());

        drop(holder);
        assert!(poll!(regular.as_mut()).is_pending());
        let Poll::Ready(granted) = poll!(prioritized.as_mut()) else {
            panic!("prioritized waiter should hold the released permit");
        };
        let lease = held(granted.unwrap());
        assert_eq!(limiter.available_permits(), 0);

        drop(lease);
        drop(held(regular.await.unwrap()));
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn regular_queue_is_bounded() {
        let limiter = limiter(1, 1);
        let cancel = CancellationToken::new();
        let _holder = held(limiter.attempt_acquire());

        let mut queued = Box::pin(limiter.acquire(false, None, &cancel));
        assert!(poll!(queued.as_mut()).is_pending());

        let rejected = limiter.acquire(false, None, &cancel).await.unwrap();
        assert!(matches!(rejected, Acquisition::Rejected));

        let mut prioritized = Box::pin(limiter.acquire(true, None, &cancel));
        assert!(poll!(prioritized.as_mut()).is_pending());
        assert_eq!(limiter.statistics().queued_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_wait_expires() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let holder = held(limiter.attempt_acquire());

        let outcome = limiter
            .acquire(false, Some(Duration::from_millis(100)), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(limiter.statistics().queued_count, 0);

        drop(holder);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn canceled_waiter_is_skipped_by_release() {
        let limiter = limiter(1, 4);
        let holder = held(limiter.attempt_acquire());

        let cancel = CancellationToken::new();
        let other = CancellationToken::new();
        let mut canceled = Box::pin(limiter.acquire(false, None, &cancel));
        let mut next = Box::pin(limiter.acquire(false, None, &other));
        assert!(poll!(canceled.as_mut()).is_pending());
        assert!(poll!(next.as_mut()).is_pending());

        cancel.cancel();
        assert!(matches!(canceled.await.unwrap(), Acquisition::Canceled));

        drop(holder);
        drop(held(next.await.unwrap()));
        let stats = limiter.statistics();
        assert_eq!(stats.available_permits, 1);
        assert_eq!(stats.queued_count, 0);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[tokio::test]
    async fn dropped_waiter_passes_its_grant_on() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let holder = held(limiter.attempt_acquire());

        let mut gone = Box::pin(limiter.acquire(true, None, &cancel));
        let mut next = Box::pin(limiter.acquire(false, None, &cancel));
        assert!(poll!(gone.as_mut()).is_pending());
        assert!(poll!(next.as_mut()).is_pending());

        drop(holder);
        drop(gone);

        drop(held(next.await.unwrap()));
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn dispose_resolves_waiters_and_refuses_new_work() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let holder = held(limiter.attempt_acquire());

        let mut regular = Box::pin(limiter.acquire(false, None, &cancel));
        let mut prioritized = Box::pin(limiter.acquire(true, Some(Duration::from_secs(60)), &cancel));
        assert!(poll!(regular.as_mut()).is_pending());
        assert!(poll!(prioritized.as_mut()).is_pending());

        limiter.dispose();
        limiter.dispose();
        assert!(limiter.is_disposed());
        assert!(matches!(regular.await.unwrap(), Acquisition::Disposed));
        assert!(matches!(prioritized.await.unwrap(), Acquisition::Disposed));

        assert!(matches!(limiter.attempt_acquire(), Acquisition::Disposed));
        assert!(matches!(
            limiter.acquire(true, None, &cancel).await.unwrap(),
            Acquisition::Disposed
        ));

        drop(holder);
        assert_eq!(limiter.statistics().queued_count, 0);
        assert_eq!(limiter.core.waiters.lock().pool_capacity(), 0);
    }

    #[tokio::test]
    async fn trait_surface_grants_single_permits_only() {
        let limiter = limiter(2, 1);
        let cancel = CancellationToken::new();
        let class = PriorityClass::continuation(strata_types::Priority::Low);

        assert!(ConcurrencyLimiter::acquire(&limiter, class, 2, &cancel)
            .await
            .is_err());
        assert!(ConcurrencyLimiter::attempt_acquire(&limiter, class, 0).is_err());
        let lease = ConcurrencyLimiter::acquire(&limiter, class, 1, &cancel)
            .await
            .unwrap()
            .into_lease();
        assert_eq!(lease.permits(), 1);
        assert_eq!(ConcurrencyLimiter::statistics(&limiter).available_permits, 1);
    }
}
