//! # STRATUM Core Engine
//!
//! Chunked entity/component storage with parallel job scheduling:
//! - Archetypes stored in fixed-size, structure-of-arrays chunks
//! - Per-entity and bulk structural changes
//! - Per-component-type job dependencies that turn data races into errors
//! - Deterministic deferred command buffers
//!
//! ## Architecture Rules
//!
//! 1. **Fixed-size blocks** - Every chunk is one pooled block; chunks never resize
//! 2. **Declared access** - Jobs name every type they read or write up front
//! 3. **One structural writer** - Row moves happen on one thread, with exclusive clearance
//!
//! ## Example
//!
//! ```rust,ignore
//! use stratum_core::prelude::*;
//!
//! let mut world = World::new(StoreConfig::default())?;
//! let position = world.register::<Position>()?;
//! let entity = world.create_entity(&[position])?;
//!
//! let moving = world.build_query(QueryDesc::new().with(position))?;
//! let job = world.schedule(AccessSet::new().write(position), move |scope| {
//!     for chunk in scope.chunks_mut(moving, &ChunkFilter::all()).into_iter().flatten() {
//!         for p in chunk.column_mut::<Position>().into_iter().flatten() {
//!             p.x += 1.0;
//!         }
//!     }
//! });
//! world.complete(&job)?;
//! ```

#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::StoreConfig;
pub use ecs::{
    AccessScope, ArchetypeId, ChunkFilter, ChunkLayout, ChunkView, ChunkViewMut, CommandBuffer, Component,
    ComponentBundle, ComponentDescriptor, ComponentTypeId, Entity, EntityLocation, PlaybackPolicy, QueryDesc,
    QueryId, Store, StructuralChangeProcessor, TempEntity, World,
};
pub use error::{AccessKind, StoreError, StoreResult};
pub use memory::ChunkId;
pub use sync::{AccessSet, DependencyState, DependencyTracker, JobHandle, JobId};

/// Common imports for store users.
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::ecs::{
        AccessScope, ChunkFilter, CommandBuffer, Component, ComponentBundle, ComponentTypeId, Entity, QueryDesc,
        QueryId, StructuralChangeProcessor, World,
    };
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::sync::{AccessSet, JobHandle};
}
