//! Composition root for the storage engine's admission control
//!
//! `ResourceLimiters` is built once by whoever owns the engine and handed to
//! the I/O paths that need it. It is cheap to clone; every clone shares the
//! same partitions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strata_config::LimitsConfig;
use strata_errors::Error;
use strata_types::{Resource, ResourceKey};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lease::Acquisition;
use crate::limiter::LimiterStatistics;
use crate::partition::PartitionedLimiter;
use crate::priority::PriorityLimiter;

/// Per-resource priority limiters behind a partition router
#[derive(Clone)]
pub struct ResourceLimiters {
    inner: Arc<PartitionedLimiter<PriorityLimiter>>,
}

impl ResourceLimiters {
    /// Build every partition from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration describes a zero-sized pool or
    /// queue.
    pub fn from_config(limits: &LimitsConfig) -> Result<Self, Error> {
        limits.validate()?;
        let inner = PartitionedLimiter::try_new(|resource| {
            let partition = limits.partition(resource);
            PriorityLimiter::new(
                resource,
                partition.pool_size,
                partition.capacity_per_priority,
            )
        })?;
        debug!("resource limiters initialized");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Build every partition with the same limits
    ///
    /// # Errors
    ///
    /// Returns an error if either parameter is zero.
    pub fn new(pool_size: usize, capacity_per_priority: usize) -> Result<Self, Error> {
        let inner = PartitionedLimiter::try_new(|resource| {
            PriorityLimiter::new(resource, pool_size, capacity_per_priority)
        })?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Build every partition from default, CPU-derived limits
    ///
    /// # Errors
    ///
    /// Returns an error if the default limits are invalid.
    pub fn with_defaults() -> Result<Self, Error> {
        Self::from_config(&LimitsConfig::default())
    }

    #[must_use]
    pub fn partition(&self, resource: Resource) -> &PriorityLimiter {
        self.inner.partition(resource)
    }

    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the partition's pool size.
    pub async fn acquire(
        &self,
        key: ResourceKey,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        self.inner.acquire(key, permits, cancel).await
    }

    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the partition's pool size.
    pub async fn acquire_with_timeout(
        &self,
        key: ResourceKey,
        permits: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        self.partition(key.resource)
            .acquire_with_timeout(key.class, permits, timeout, cancel)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if `permits` exceeds the partition's pool size.
    pub fn attempt_acquire(&self, key: ResourceKey, permits: usize) -> Result<Acquisition, Error> {
        self.inner.attempt_acquire(key, permits)
    }

    #[must_use]
    pub fn statistics(&self, key: ResourceKey) -> LimiterStatistics {
        self.inner.statistics(key)
    }

    /// Statistics of every partition
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Resource, LimiterStatistics)> {
        self.inner
            .partitions()
            .map(|(resource, limiter)| (resource, limiter.statistics()))
            .collect()
    }

    /// Run `op` while holding one permit of `key`'s partition
    ///
    /// The permit is returned on every exit path, including when the
    /// returned future is dropped.
    ///
    /// # Errors
    ///
    /// Returns the limiter's error if no permit was granted, or whatever
    /// `op` returns.
    pub async fn scoped<F, Fut, T, E>(
        &self,
        key: ResourceKey,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let lease = self
            .acquire(key, 1, cancel)
            .await?
            .into_result(key.resource)
            .map_err(Error::from)?;
        let result = op().await;
        drop(lease);
        result
    }

    /// Resolve every queued request as disposed and refuse new ones
    pub fn close(&self) {
        for (_, limiter) in self.inner.partitions() {
            limiter.close();
        }
    }
}
