//! Priority concurrency limiter
//!
//! A pool of permits shared by every priority of one resource, gated by a
//! [`BoundedPriorityQueue`]. Requests are granted synchronously while nothing
//! is queued; once anything waits, every later arrival queues behind it, even
//! when it would fit on its own. That gives up some packing in exchange for
//! strict ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_errors::{Error, LimiterError};
use strata_types::{PriorityClass, Resource};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::lease::{Acquisition, Lease, PermitRelease};
use crate::limiter::{ConcurrencyLimiter, LimiterStatistics};
use crate::queue::{BoundedPriorityQueue, Prioritized};

/// Queued demand, resolved by the admission loop
struct AcquisitionRequest {
    id: u64,
    permits: usize,
    class: PriorityClass,
    completion: oneshot::Sender<Acquisition>,
}

impl Prioritized for AcquisitionRequest {
    fn priority_class(&self) -> PriorityClass {
        self.class
    }
}

struct State {
    in_use: usize,
    next_id: u64,
    closed: bool,
}

struct Core {
    resource: Resource,
    pool_size: usize,
    // Lock order: `state`, then the queue's own lock
    state: Mutex<State>,
    queue: BoundedPriorityQueue<AcquisitionRequest>,
    successful: AtomicU64,
    failed: AtomicU64,
}

/// Grants computed under the lock, delivered after it is dropped
type Completions = Vec<(oneshot::Sender<Acquisition>, Acquisition)>;

/// Bounded permit pool with priority admission for a single resource
pub struct PriorityLimiter {
    core: Arc<Core>,
}

impl PriorityLimiter {
    /// Create a limiter with `pool_size` permits and a wait queue admitting
    /// `capacity_per_priority` new-work requests per band
    ///
    /// # Errors
    ///
    /// Returns an error if either parameter is zero.
    pub fn new(
        resource: Resource,
        pool_size: usize,
        capacity_per_priority: usize,
    ) -> Result<Self, Error> {
        if pool_size == 0 {
            return Err(
                LimiterError::invalid_argument("pool_size", "must be greater than zero").into(),
            );
        }
        let queue = BoundedPriorityQueue::new(capacity_per_priority)?;

        debug!(%resource, pool_size, capacity_per_priority, "priority limiter created");

        Ok(Self {
            core: Arc::new(Core {
                resource,
                pool_size,
                state: Mutex::new(State {
                    in_use: 0,
                    next_id: 0,
                    closed: false,
                }),
                queue,
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
    pub fn pool_size(&self) -> usize {
        self.core.pool_size
    }

    /// Acquire `permits`, queueing behind earlier demand when necessary
    ///
    /// Resolves to [`Acquisition::Rejected`] without waiting when the
    /// request's band is full, and to [`Acquisition::Canceled`] if `cancel`
    /// fires before a grant.
    ///
    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the pool size.
    pub async fn acquire(
        &self,
        class: PriorityClass,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        self.core.check_permits(permits)?;

        if cancel.is_cancelled() {
            self.core.record_failure();
            return Ok(Acquisition::Canceled);
        }

        let (completion, mut granted) = oneshot::channel();
        let (id, completions) = {
            let mut state = self.core.state.lock();
            if let Some(outcome) = self.core.try_grant(&mut state, permits) {
                return Ok(outcome);
            }

            let id = state.next_id;
            state.next_id += 1;
            let request = AcquisitionRequest {
                id,
                permits,
                class,
                completion,
            };
            if self.core.queue.try_enqueue(request).is_err() {
                drop(state);
                self.core.record_failure();
                debug!(resource = %self.core.resource, %class, permits, "admission rejected");
                return Ok(Acquisition::Rejected);
            }
            trace!(resource = %self.core.resource, %class, permits, "request queued");

            // A high-priority arrival may be servable right away
            (id, self.core.pump(&mut state))
        };
        deliver(completions);

        let mut pending = PendingRequest {
            core: &self.core,
            id,
            armed: true,
        };

        let delivered = tokio::select! {
            biased;
            outcome = &mut granted => Some(outcome),
            () = cancel.cancelled() => None,
        };

        let outcome = match delivered {
            Some(outcome) => outcome.unwrap_or(Acquisition::Disposed),
            None if self.core.abandon(id) => {
                debug!(resource = %self.core.resource, %class, "queued request canceled");
                Acquisition::Canceled
            }
            // The admission loop dequeued us first; its grant is on the way
            None => granted.await.unwrap_or(Acquisition::Disposed),
        };
        pending.armed = false;
        Ok(outcome)
    }

    /// [`PriorityLimiter::acquire`] bounded by a deadline
    ///
    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the pool size.
    pub async fn acquire_with_timeout(
        &self,
        class: PriorityClass,
        permits: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        if let Ok(outcome) = tokio::time::timeout(timeout, self.acquire(class, permits, cancel)).await
        {
            return outcome;
        }
        debug!(resource = %self.core.resource, %class, ?timeout, "acquisition timed out");
        Ok(Acquisition::TimedOut)
    }

    /// Acquire `permits` only if no waiting is needed
    ///
    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the pool size.
    pub fn attempt_acquire(
        &self,
        class: PriorityClass,
        permits: usize,
    ) -> Result<Acquisition, Error> {
        self.core.check_permits(permits)?;

        let mut state = self.core.state.lock();
        if let Some(outcome) = self.core.try_grant(&mut state, permits) {
            return Ok(outcome);
        }
        drop(state);

        self.core.record_failure();
        trace!(resource = %self.core.resource, %class, permits, "attempt refused");
        Ok(Acquisition::Rejected)
    }

    /// Resolve every queued request with [`Acquisition::Disposed`] and refuse
    /// further acquisitions
    ///
    /// Leases already granted stay valid and are released normally.
    pub fn close(&self) {
        let drained = {
            let mut state = self.core.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.core.queue.drain()
        };

        self.core
            .failed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        debug!(resource = %self.core.resource, resolved = drained.len(), "priority limiter closed");
        for request in drained {
            let _ = request.completion.send(Acquisition::Disposed);
        }
    }

    #[must_use]
    pub fn statistics(&self) -> LimiterStatistics {
        let in_use = self.core.state.lock().in_use;
        LimiterStatistics {
            available_permits: self.core.pool_size - in_use,
            queued_count: self.core.queue.len(),
            total_successful_leases: self.core.successful.load(Ordering::Relaxed),
            total_failed_leases: self.core.failed.load(Ordering::Relaxed),
        }
    }
}

impl Core {
    fn check_permits(&self, permits: usize) -> Result<(), Error> {
        if permits > self.pool_size {
            return Err(LimiterError::invalid_argument(
                "permits",
                format!("{permits} exceeds pool size {}", self.pool_size),
            )
            .into());
        }
        Ok(())
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Synchronous outcome, if one exists without queueing
    fn try_grant(self: &Arc<Self>, state: &mut State, permits: usize) -> Option<Acquisition> {
        if state.closed {
            self.record_failure();
            return Some(Acquisition::Disposed);
        }
        if permits == 0 {
            // Probe: succeeds only if a real request could be granted now
            if self.queue.is_empty() && state.in_use < self.pool_size {
                return Some(Acquisition::Acquired(Lease::empty()));
            }
            self.record_failure();
            return Some(Acquisition::Rejected);
        }
        if !self.queue.is_empty() || self.pool_size - state.in_use < permits {
            return None;
        }

        state.in_use += permits;
        self.successful.fetch_add(1, Ordering::Relaxed);
        trace!(resource = %self.resource, permits, in_use = state.in_use, "granted");
        Some(Acquisition::Acquired(Lease::granted(permits, self.clone())))
    }

    /// Admission loop: grant queued requests while the head fits
    fn pump(self: &Arc<Self>, state: &mut State) -> Completions {
        let mut completions = Vec::new();
        while let Some(permits) = self.queue.try_peek(|head| head.permits) {
            if self.pool_size - state.in_use < permits {
                break;
            }
            let Some(request) = self.queue.try_read() else {
                break;
            };
            if request.completion.is_closed() {
                // Waiter vanished without abandoning; nothing to grant
                continue;
            }

            state.in_use += permits;
            let lease = Lease::granted(permits, self.clone());
            self.successful.fetch_add(1, Ordering::Relaxed);
            trace!(
                resource = %self.resource,
                class = %request.class,
                permits,
                in_use = state.in_use,
                "granted from queue"
            );
            completions.push((request.completion, Acquisition::Acquired(lease)));
        }
        completions
    }

    /// Remove a still-queued request; false if the admission loop took it
    fn abandon(self: &Arc<Self>, id: u64) -> bool {
        let completions = {
            let mut state = self.state.lock();
            if self.queue.remove_where(|request| request.id == id).is_none() {
                return false;
            }
            // The removed request may have been blocking smaller ones
            self.pump(&mut state)
        };
        self.record_failure();
        deliver(completions);
        true
    }
}

impl PermitRelease for Core {
    fn release_permits(self: Arc<Self>, permits: usize) {
        let completions = {
            let mut state = self.state.lock();
            state.in_use -= permits;
            trace!(resource = %self.resource, permits, in_use = state.in_use, "released");
            self.pump(&mut state)
        };
        deliver(completions);
    }
}

/// Hand grants to their waiters outside the lock
///
/// A waiter that disappeared in the meantime drops its lease here, which
/// returns the permits and re-runs the admission loop.
fn deliver(completions: Completions) {
    for (completion, outcome) in completions {
        let _ = completion.send(outcome);
    }
}

/// Dequeues the request if the waiting future is dropped mid-wait
struct PendingRequest<'a> {
    core: &'a Arc<Core>,
    id: u64,
    armed: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.abandon(self.id);
        }
    }
}

#[async_trait]
impl ConcurrencyLimiter for PriorityLimiter {
    async fn acquire(
        &self,
        class: PriorityClass,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        PriorityLimiter::acquire(self, class, permits, cancel).await
    }

    fn attempt_acquire(
        &self,
        class: PriorityClass,
        permits: usize,
    ) -> Result<Acquisition, Error> {
        PriorityLimiter::attempt_acquire(self, class, permits)
    }

    fn statistics(&self) -> LimiterStatistics {
        PriorityLimiter::statistics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::poll;
    use std::task::Poll;
    use strata_types::Priority;

    fn limiter(pool_size: usize, capacity_per_priority: usize) -> PriorityLimiter {
        PriorityLimiter::new(Resource::Index, pool_size, capacity_per_priority).unwrap()
    }

    fn held(outcome: Result<Acquisition, Error>) -> Lease {
        match outcome.unwrap() {
            Acquisition::Acquired(lease) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }

    #[test]
    fn zero_sized_limits_are_invalid() {
        assert!(PriorityLimiter::new(Resource::Index, 0, 4).is_err());
        assert!(PriorityLimiter::new(Resource::Index, 4, 0).is_err());
    }

    #[test]
    fn permits_beyond_pool_are_invalid() {
        let limiter = limiter(2, 4);
        let err = limiter
            .attempt_acquire(Priority::High.into(), 3)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Limiter(LimiterError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn attempt_grants_until_exhausted() {
        let limiter = limiter(3, 4);
        let two = held(limiter.attempt_acquire(Priority::Low.into(), 2));
        let one = held(limiter.attempt_acquire(Priority::Low.into(), 1));
        assert_eq!(two.permits(), 2);
        assert!(matches!(
            limiter.attempt_acquire(Priority::High.into(), 1).unwrap(),
            Acquisition::Rejected
        ));

        drop(two);
        assert_eq!(limiter.statistics().available_permits, 2);
        drop(one);

        let stats = limiter.statistics();
        assert_eq!(stats.available_permits, 3);
        assert_eq!(stats.total_successful_leases, 2);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[test]
    fn zero_permits_probe_capacity() {
        let limiter = limiter(1, 4);
        let probe = held(limiter.attempt_acquire(Priority::Low.into(), 0));
        assert_eq!(probe.permits(), 0);
        assert!(!probe.is_held());

        let _lease = held(limiter.attempt_acquire(Priority::Low.into(), 1));
        assert!(matches!(
            limiter.attempt_acquire(Priority::Low.into(), 0).unwrap(),
            Acquisition::Rejected
        ));
    }

    #[tokio::test]
    async fn release_grants_in_priority_order() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let blocker = held(limiter.acquire(Priority::Low.into(), 1, &cancel).await);

        let mut low = Box::pin(limiter.acquire(Priority::Low.into(), 1, &cancel));
        let mut high = Box::pin(limiter.acquire(Priority::High.into(), 1, &cancel));
        let mut resumed = Box::pin(limiter.acquire(PriorityClass::continuation(Priority::High), 1, &cancel));
        assert!(poll!(low.as_mut()).is_pending());
        assert!(poll!(high.as_mut()).is_pending());
        assert!(poll!(resumed.as_mut()).is_pending());
        assert_eq!(limiter.statistics().queued_count, 3);

        drop(blocker);
        assert!(poll!(low.as_mut()).is_pending());
        assert!(poll!(high.as_mut()).is_pending());
        let Poll::Ready(first) = poll!(resumed.as_mut()) else {
            panic!("continuation request should be served first");
        };
        drop(held(first));

        assert!(poll!(low.as_mut()).is_pending());
        let second = held(high.await);
        drop(second);
        drop(held(low.await));

        assert_eq!(limiter.statistics().available_permits, 1);
    }

    #[tokio::test]
    async fn large_head_blocks_smaller_followers() {
        let limiter = limiter(2, 4);
        let cancel = CancellationToken::new();
        let one = held(limiter.acquire(Priority::Medium.into(), 1, &cancel).await);

        let mut wide = Box::pin(limiter.acquire(Priority::Medium.into(), 2, &cancel));
        assert!(poll!(wide.as_mut()).is_pending());

        // A permit is free, but the queue is not empty
        let mut narrow = Box::pin(limiter.acquire(Priority::Medium.into(), 1, &cancel));
        assert!(poll!(narrow.as_mut()).is_pending());
        assert_eq!(limiter.statistics().available_permits, 1);

        drop(one);
        let wide = held(wide.await);
        assert_eq!(wide.permits(), 2);
        assert!(poll!(narrow.as_mut()).is_pending());
        drop(wide);
        drop(held(narrow.await));
    }

    #[tokio::test]
    async fn full_band_rejects_but_continuations_queue() {
        let limiter = limiter(1, 1);
        let cancel = CancellationToken::new();
        let _blocker = held(limiter.acquire(Priority::Low.into(), 1, &cancel).await);

        let mut first = Box::pin(limiter.acquire(Priority::Low.into(), 1, &cancel));
        assert!(poll!(first.as_mut()).is_pending());

        let second = limiter.acquire(Priority::Low.into(), 1, &cancel).await.unwrap();
        assert!(matches!(second, Acquisition::Rejected));

        let mut resumed = Box::pin(limiter.acquire(PriorityClass::continuation(Priority::Low), 1, &cancel));
        assert!(poll!(resumed.as_mut()).is_pending());
        assert_eq!(limiter.statistics().queued_count, 2);
    }

    #[tokio::test]
    async fn cancellation_removes_queued_request() {
        let limiter = limiter(1, 4);
        let blocker = held(limiter.attempt_acquire(Priority::Low.into(), 1));

        let cancel = CancellationToken::new();
        let mut waiting = Box::pin(limiter.acquire(Priority::High.into(), 1, &cancel));
        assert!(poll!(waiting.as_mut()).is_pending());

        cancel.cancel();
        assert!(matches!(waiting.await.unwrap(), Acquisition::Canceled));
        assert_eq!(limiter.statistics().queued_count, 0);

        drop(blocker);
        let stats = limiter.statistics();
        assert_eq!(stats.available_permits, 1);
        assert_eq!(stats.total_failed_leases, 1);
    }

    #[tokio::test]
    async fn canceled_before_call_never_queues() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = limiter.acquire(Priority::High.into(), 1, &cancel).await.unwrap();
        assert!(matches!(outcome, Acquisition::Canceled));
        assert_eq!(limiter.statistics().available_permits, 1);
    }

    #[tokio::test]
    async fn grant_to_dropped_waiter_returns_to_pool() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let blocker = held(limiter.attempt_acquire(Priority::Low.into(), 1));

        let mut gone = Box::pin(limiter.acquire(Priority::High.into(), 1, &cancel));
        let mut next = Box::pin(limiter.acquire(Priority::Low.into(), 1, &cancel));
        assert!(poll!(gone.as_mut()).is_pending());
        assert!(poll!(next.as_mut()).is_pending());

        // `gone` is granted on release, then dropped before observing it
        drop(blocker);
        drop(gone);

        drop(held(next.await));
        assert_eq!(limiter.statistics().available_permits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_and_dequeues() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let _blocker = held(limiter.attempt_acquire(Priority::Low.into(), 1));

        let outcome = limiter
            .acquire_with_timeout(Priority::High.into(), 1, Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(limiter.statistics().queued_count, 0);
    }

    #[tokio::test]
    async fn close_disposes_waiters_and_later_calls() {
        let limiter = limiter(1, 4);
        let cancel = CancellationToken::new();
        let blocker = held(limiter.attempt_acquire(Priority::Low.into(), 1));

        let mut waiting = Box::pin(limiter.acquire(Priority::High.into(), 1, &cancel));
        assert!(poll!(waiting.as_mut()).is_pending());

        limiter.close();
        limiter.close();
        assert!(matches!(waiting.await.unwrap(), Acquisition::Disposed));
        assert!(matches!(
            limiter.attempt_acquire(Priority::High.into(), 1).unwrap(),
            Acquisition::Disposed
        ));

        // Leases granted before teardown still release normally
        drop(blocker);
        assert_eq!(limiter.statistics().available_permits, 1);
    }
}
