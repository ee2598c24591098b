//! # Store
//!
//! Single owner of everything that describes entity data: the type
//! registry, archetype graph, chunks, entity locations and queries.
//!
//! A `Store` performs no dependency checks of its own. Structural changes
//! live in [`crate::ecs::structural`]; checked access goes through
//! [`crate::World`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::archetype::{ArchetypeGraph, ArchetypeId, ChunkLayout};
use super::component::{Component, ComponentDescriptor, ComponentTypeId, TypeRegistry};
use super::entity::{Entity, EntityLocation, EntityStore};
use super::query::{QueryDesc, QueryEngine, QueryId};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::memory::{ChunkAllocator, ChunkId, ChunkStats};

/// Summary of store contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live entities.
    pub entities: usize,
    /// Archetypes ever created.
    pub archetypes: usize,
    /// Chunk occupancy.
    pub chunks: ChunkStats,
    /// Blocks waiting for reuse.
    pub pooled_blocks: usize,
}

/// Entity and component storage.
#[derive(Debug)]
pub struct Store {
    pub(crate) registry: TypeRegistry,
    pub(crate) graph: ArchetypeGraph,
    pub(crate) chunks: ChunkAllocator,
    pub(crate) entities: EntityStore,
    pub(crate) queries: QueryEngine,
    change_tick: AtomicU64,
    config: StoreConfig,
}

impl Store {
    /// Creates an empty store.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: TypeRegistry::new(),
            graph: ArchetypeGraph::new(config.chunk_bytes, config.max_chunk_rows),
            chunks: ChunkAllocator::new(),
            entities: EntityStore::new(),
            queries: QueryEngine::new(),
            change_tick: AtomicU64::new(1),
            config,
        })
    }

    /// Configuration the store was created with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Registers `T`. Idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::RegistryFull`] when no id is left.
    pub fn register<T: Component>(&mut self) -> StoreResult<ComponentTypeId> {
        self.registry.register::<T>()
    }

    /// Registers a type by layout only.
    ///
    /// # Errors
    ///
    /// See [`TypeRegistry::register_raw`].
    pub fn register_raw(&mut self, descriptor: ComponentDescriptor) -> StoreResult<ComponentTypeId> {
        self.registry.register_raw(descriptor)
    }

    /// Registers a zero-sized tag.
    ///
    /// # Errors
    ///
    /// [`StoreError::RegistryFull`] when no id is left.
    pub fn register_tag(&mut self, name: impl Into<String>) -> StoreResult<ComponentTypeId> {
        self.registry.register_tag(name)
    }

    /// Component type registry.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Id registered for `T`.
    ///
    /// # Errors
    ///
    /// [`StoreError::RustTypeNotRegistered`] if `T` is unknown.
    pub fn id_of<T: 'static>(&self) -> StoreResult<ComponentTypeId> {
        self.registry.id_of::<T>()
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Archetype graph.
    #[must_use]
    pub fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    /// Chunk allocator.
    #[must_use]
    pub fn chunks(&self) -> &ChunkAllocator {
        &self.chunks
    }

    /// Query engine.
    #[must_use]
    pub fn queries(&self) -> &QueryEngine {
        &self.queries
    }

    /// Current location of `entity`.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn resolve(&self, entity: Entity) -> StoreResult<EntityLocation> {
        self.entities.resolve(entity)
    }

    /// Checks if `entity` is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Component types of `entity`, ascending.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn types_of(&self, entity: Entity) -> StoreResult<&[ComponentTypeId]> {
        let location = self.resolve(entity)?;
        Ok(self.graph.archetype(location.archetype).types())
    }

    /// Checks if `entity` has `type_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn has_component(&self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<bool> {
        let location = self.resolve(entity)?;
        Ok(self.graph.archetype(location.archetype).contains(type_id))
    }

    /// Bytes of one component value.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] or [`StoreError::ComponentMissing`].
    pub fn component_bytes(&self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<&[u8]> {
        let location = self.resolve(entity)?;
        let chunk = self.chunks.chunk(location.chunk);
        let column = chunk
            .column_index(type_id)
            .ok_or(StoreError::ComponentMissing { entity, type_id })?;
        Ok(chunk.component_bytes(column, location.row()))
    }

    /// Copy of one typed component value.
    ///
    /// # Errors
    ///
    /// [`StoreError::RustTypeNotRegistered`], [`StoreError::StaleEntity`] or
    /// [`StoreError::ComponentMissing`].
    pub fn get<T: Component>(&self, entity: Entity) -> StoreResult<T> {
        let type_id = self.registry.id_of::<T>()?;
        let bytes = self.component_bytes(entity, type_id)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Whether a component of `entity` is enabled.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] or [`StoreError::ComponentMissing`].
    pub fn is_enabled(&self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<bool> {
        let location = self.resolve(entity)?;
        let chunk = self.chunks.chunk(location.chunk);
        let column = chunk
            .column_index(type_id)
            .ok_or(StoreError::ComponentMissing { entity, type_id })?;
        Ok(chunk.is_enabled(column, location.row()))
    }

    /// Shared layout of an archetype, for external serializers.
    #[must_use]
    pub fn layout(&self, archetype: ArchetypeId) -> Option<Arc<ChunkLayout>> {
        self.graph.get(archetype).map(|a| Arc::clone(a.layout()))
    }

    /// Raw block bytes of a chunk, laid out per [`Store::layout`].
    #[must_use]
    pub fn chunk_bytes(&self, chunk: ChunkId) -> Option<&[u8]> {
        self.chunks.get(chunk).map(crate::memory::Chunk::as_bytes)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Builds (or reuses) a query.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] if any listed type is unknown.
    pub fn build_query(&self, desc: QueryDesc) -> StoreResult<QueryId> {
        self.queries.build(&self.registry, desc)
    }

    /// Number of entities in archetypes matching `query`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`] for ids never built.
    pub fn query_count(&self, query: QueryId) -> StoreResult<usize> {
        let archetypes = self.queries.matching(query, &self.graph)?;
        Ok(archetypes
            .iter()
            .flat_map(|&a| self.graph.archetype(a).chunks())
            .map(|&c| self.chunks.chunk(c).len())
            .sum())
    }

    /// Union of component types over archetypes matching `query`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`] for ids never built.
    pub fn query_types(&self, query: QueryId) -> StoreResult<Vec<ComponentTypeId>> {
        let mut types: Vec<ComponentTypeId> = self
            .queries
            .matching(query, &self.graph)?
            .iter()
            .flat_map(|&a| self.graph.archetype(a).types().iter().copied())
            .collect();
        types.sort_unstable();
        types.dedup();
        Ok(types)
    }

    // ========================================================================
    // TICKS AND STATS
    // ========================================================================

    /// Advances and returns the change tick used to stamp column versions.
    pub fn next_tick(&self) -> u64 {
        self.change_tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last issued change tick. Use as a changed-since baseline.
    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.change_tick.load(Ordering::Acquire)
    }

    /// Store summary.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entities: self.entities.len(),
            archetypes: self.graph.len(),
            chunks: self.chunks.stats(),
            pooled_blocks: self.chunks.pooled_blocks(),
        }
    }
}
