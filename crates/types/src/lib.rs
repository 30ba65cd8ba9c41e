#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Core type definitions for strata admission control
//!
//! This crate provides the closed taxonomy shared by every limiter: the
//! backend resources being protected, caller-declared priorities, and the
//! composite key used to route a request to its partition.

pub mod priority;
pub mod resource;

// Re-export commonly used types
pub use priority::{Priority, PriorityClass};
pub use resource::{Resource, ResourceKey};
