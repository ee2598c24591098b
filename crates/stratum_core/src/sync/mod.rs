//! # Job Scheduling Primitives
//!
//! ## The Problem
//!
//! ```text
//! Job A:  WRITE Position
//! Job B:  READ  Position, WRITE Velocity
//! Job C:  READ  Health
//!
//! Without ordering: A and B race on Position.
//! With a global lock: C waits for A for no reason.
//! ```
//!
//! ## The Solution: Per-Type Dependencies
//!
//! Every job declares its read and write sets up front. The
//! [`DependencyTracker`] chains B after A (shared type, one writer) and
//! leaves C free to run beside both. The [`JobPool`] queues a job only once
//! its dependencies have completed.

pub(crate) mod handle;
mod pool;
mod tracker;

pub use handle::{JobHandle, JobId};
pub use pool::JobPool;
pub use tracker::{AccessSet, DependencyState, DependencyTracker};
