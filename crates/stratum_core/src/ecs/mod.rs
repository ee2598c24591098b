//! # Entity Component Storage
//!
//! Archetype-based storage with fixed-size chunks.
//!
//! ## Design Philosophy
//!
//! - Every entity lives in exactly one chunk row of its archetype
//! - Component data is plain old data, laid out column by column
//! - Structural changes move rows; everything else edits columns in place
//! - Parallel jobs declare what they touch; violations are errors, not races

pub mod archetype;
pub mod commands;
pub mod component;
pub mod entity;
pub mod query;
pub mod store;
pub mod structural;
pub mod view;
pub mod world;

pub use archetype::{Archetype, ArchetypeGraph, ArchetypeId, ArchetypeSignature, ChunkLayout, ColumnLayout, Transition};
pub use commands::{CommandBuffer, PlaybackPolicy, PlaybackStats, Target, TempEntity};
pub use component::{Component, ComponentBundle, ComponentDescriptor, ComponentTypeId, ComponentTypeInfo, TypeRegistry};
pub use entity::{Entity, EntityLocation, EntityStore};
pub use query::{ChunkFilter, ChunkSelection, QueryDesc, QueryEngine, QueryId};
pub use store::{Store, StoreStats};
pub use structural::StructuralChangeProcessor;
pub use view::{AccessScope, ChunkIter, ChunkIterMut, ChunkView, ChunkViewMut};
pub use world::World;
