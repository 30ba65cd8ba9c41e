//! Common interface of the limiter designs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_errors::Error;
use strata_types::PriorityClass;
use tokio_util::sync::CancellationToken;

use crate::lease::Acquisition;

/// Point-in-time counters of a single limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStatistics {
    pub available_permits: usize,
    pub queued_count: usize,
    pub total_successful_leases: u64,
    pub total_failed_leases: u64,
}

/// A permit pool that admits work by priority class
///
/// Implemented by [`crate::PriorityLimiter`] and [`crate::PooledLimiter`], so
/// either can sit behind a [`crate::PartitionedLimiter`].
#[async_trait]
pub trait ConcurrencyLimiter: Send + Sync {
    /// Acquire `permits`, waiting in line if none are free
    ///
    /// # Errors
    ///
    /// Returns an error if `permits` can never be satisfied by this limiter.
    async fn acquire(
        &self,
        class: PriorityClass,
        permits: usize,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, Error>;

    /// Acquire `permits` only if that is possible without waiting
    ///
    /// # Errors
    ///
    /// Returns an error if `permits` can never be satisfied by this limiter.
    fn attempt_acquire(&self, class: PriorityClass, permits: usize)
        -> Result<Acquisition, Error>;

    fn statistics(&self) -> LimiterStatistics;
}
