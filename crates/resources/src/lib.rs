#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Admission control for the strata storage engine
//!
//! This crate bounds how much concurrent work reaches each backend resource
//! (index, archive, chunk cache, file system). Requests carry a priority
//! class; when a resource is saturated they wait in a bounded priority queue
//! and are admitted highest band first, with already-admitted work ahead of
//! new work inside each band.
//!
//! Two limiter designs share the [`ConcurrencyLimiter`] interface:
//! [`PriorityLimiter`] for multi-permit leases with full priority ordering,
//! and [`PooledLimiter`] for single-permit leases with pooled wait nodes.
//! [`ResourceLimiters`] wires one priority limiter per resource from
//! configuration.

pub mod lease;
pub mod limiter;
pub mod limiters;
pub mod partition;
pub mod pooled;
pub mod priority;
pub mod queue;

pub use lease::{Acquisition, Lease};
pub use limiter::{ConcurrencyLimiter, LimiterStatistics};
pub use limiters::ResourceLimiters;
pub use partition::PartitionedLimiter;
pub use pooled::{PooledLimiter, MAX_TIMEOUT};
pub use priority::PriorityLimiter;
pub use queue::{BoundedPriorityQueue, Prioritized};

pub use strata_types::{Priority, PriorityClass, Resource, ResourceKey};
