//! # Store Error Types
//!
//! All errors that can occur in the storage and scheduling engine.
//!
//! Store-invariant violations (`StaleEntity`, `UnsynchronizedAccess`) always
//! abort the offending operation and name the entity, type or job that
//! triggered them. Registration and capacity errors surface at setup time,
//! before any entity exists in the offending archetype.

use thiserror::Error;

use crate::ecs::archetype::ArchetypeId;
use crate::ecs::component::ComponentTypeId;
use crate::ecs::commands::TempEntity;
use crate::ecs::entity::Entity;
use crate::ecs::query::QueryId;
use crate::sync::handle::JobId;

/// How a component type was about to be accessed when a check failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// Shared read of a column.
    Read,
    /// Exclusive write of a column.
    Write,
    /// Row relocation or chunk reclassification.
    Structural,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::Structural => f.write_str("structural change"),
        }
    }
}

/// Errors that can occur in the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Operation on a destroyed or generation-mismatched entity.
    #[error("stale entity {entity}: destroyed or generation mismatch")]
    StaleEntity {
        /// The offending entity reference.
        entity: Entity,
    },

    /// A component type id that the registry never issued.
    #[error("component type {type_id} is not registered")]
    TypeNotRegistered {
        /// The unknown id.
        type_id: ComponentTypeId,
    },

    /// A Rust type that was never registered.
    #[error("rust type `{name}` is not registered as a component")]
    RustTypeNotRegistered {
        /// `std::any::type_name` of the type.
        name: &'static str,
    },

    /// Access to a component type while a conflicting job is still pending.
    #[error("unsynchronized {access} access to component type {type_id}: job {job} has not completed")]
    UnsynchronizedAccess {
        /// The component type being accessed.
        type_id: ComponentTypeId,
        /// The incomplete job that owns the conflicting dependency.
        job: JobId,
        /// The attempted access.
        access: AccessKind,
    },

    /// A single row does not fit into a chunk block.
    #[error("row stride of {row_stride} bytes exceeds chunk block size of {chunk_bytes} bytes")]
    CapacityExceeded {
        /// Bytes required by one row (entity id included).
        row_stride: usize,
        /// Configured chunk block size.
        chunk_bytes: usize,
    },

    /// Recording into (or replaying) a consumed single-use command buffer.
    #[error("command buffer has already been played back")]
    BufferAlreadyPlayedBack,

    /// Typed access with a Rust type that does not match the registered layout.
    #[error("type mismatch for component type {type_id}: expected {expected_size} bytes, got {actual_size}")]
    TypeMismatch {
        /// The component type being accessed.
        type_id: ComponentTypeId,
        /// Registered size in bytes.
        expected_size: usize,
        /// Size of the supplied value or Rust type.
        actual_size: usize,
    },

    /// The entity's archetype does not contain the requested type.
    #[error("entity {entity} has no component of type {type_id}")]
    ComponentMissing {
        /// Entity that was addressed.
        entity: Entity,
        /// Missing component type.
        type_id: ComponentTypeId,
    },

    /// A chunk view was asked for a column its archetype does not have.
    #[error("{archetype} has no column for component type {type_id}")]
    ColumnMissing {
        /// Archetype of the viewed chunk.
        archetype: ArchetypeId,
        /// Requested component type.
        type_id: ComponentTypeId,
    },

    /// Enable/disable requested on a type registered without enabled bits.
    #[error("component type {type_id} is not enableable")]
    NotEnableable {
        /// The component type.
        type_id: ComponentTypeId,
    },

    /// A query id that was never built.
    #[error("unknown query {0}")]
    UnknownQuery(QueryId),

    /// A command referenced a temporary entity no earlier command created.
    #[error("temporary entity {0} was never created in this buffer")]
    UnknownTempEntity(TempEntity),

    /// A column was borrowed twice in one chunk view in conflicting modes.
    #[error("column for component type {type_id} is already borrowed in this chunk view")]
    ColumnAlreadyBorrowed {
        /// The component type.
        type_id: ComponentTypeId,
    },

    /// A job panicked while running; its handle was released.
    #[error("job {job} panicked")]
    JobPanicked {
        /// The job that panicked.
        job: JobId,
    },

    /// The registry has issued every available component type id.
    #[error("component registry full: capacity {capacity}")]
    RegistryFull {
        /// Maximum number of component types.
        capacity: usize,
    },

    /// Every entity index is in use.
    #[error("entity limit reached")]
    EntityLimitReached,

    /// Invalid configuration file or value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
