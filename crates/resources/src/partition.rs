//! Two-level partition router
//!
//! One independent limiter per [`Resource`], built eagerly, so exhausting the
//! index never blocks archive work. The router keeps no mutable state of its
//! own; every call is a lookup followed by a delegation.

use strata_errors::Error;
use strata_types::{Resource, ResourceKey};
use tokio_util::sync::CancellationToken;

use crate::lease::Acquisition;
use crate::limiter::{ConcurrencyLimiter, LimiterStatistics};

/// Routes `(resource, priority class)` keys to per-resource limiters
pub struct PartitionedLimiter<L> {
    partitions: Vec<L>,
}

impl<L: ConcurrencyLimiter> PartitionedLimiter<L> {
    /// Build one partition per resource with an infallible factory
    pub fn new(factory: impl FnMut(Resource) -> L) -> Self {
        Self {
            partitions: Resource::ALL.into_iter().map(factory).collect(),
        }
    }

    /// Build one partition per resource, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `factory`.
    pub fn try_new(factory: impl FnMut(Resource) -> Result<L, Error>) -> Result<Self, Error> {
        Ok(Self {
            partitions: Resource::ALL
                .into_iter()
                .map(factory)
                .collect::<Result<_, _>>()?,
        })
    }

    /// The limiter guarding `resource`
    #[must_use]
    pub fn partition(&self, resource: Resource) -> &L {
        &self.partitions[resource.index()]
    }

    /// Iterate partitions in [`Resource::ALL`] order
    pub fn partitions(&self) -> impl Iterator<Item = (Resource, &L)> {
        Resource::ALL.into_iter().zip(&self.partitions)
    }

    /// # Errors
    ///
    /// Returns an error if the partition refuses `permits` outright.
    pub async fn acquire(
        &self,
        key: ResourceKey,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error> {
        self.partition(key.resource)
            .acquire(key.class, permits, cancel)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the partition refuses `permits` outright.
    pub fn attempt_acquire(&self, key: ResourceKey, permits: usize) -> Result<Acquisition, Error> {
        self.partition(key.resource)
            .attempt_acquire(key.class, permits)
    }

    /// Statistics of the partition `key` routes to
    #[must_use]
    pub fn statistics(&self, key: ResourceKey) -> LimiterStatistics {
        self.partition(key.resource).statistics()
    }
}
