//! # Structural Changes
//!
//! The only code allowed to move rows between chunks or to create and
//! destroy chunks.
//!
//! ## Per-Entity Mode
//!
//! ```text
//! source chunk            target chunk
//! [a b c d]  -- c -->     [x y c']       c' = shared columns copied,
//! [a b d]                                      new columns zeroed
//! ```
//!
//! The vacated source row is filled by swapping in the last row, so chunks
//! never develop holes. Empty chunks are freed immediately.
//!
//! ## Bulk Mode
//!
//! [`StructuralChangeProcessor::add_component_bulk`] reclassifies every chunk
//! of every matching archetype to the target archetype in place. Zero-sized
//! changes move no bytes; other changes re-lay columns out inside the same
//! block.
//!
//! Bulk mode works on whole chunks. Calling it every frame on a query that
//! matches only a few freshly created entities reclassifies the small chunk
//! holding them each time, leaving the target archetype with many
//! low-occupancy chunks. Callers pick bulk mode for large batches and
//! per-entity mode for trickles.

use std::sync::Arc;

use super::archetype::{ArchetypeId, Transition};
use super::component::{Component, ComponentBundle, ComponentTypeId};
use super::entity::{Entity, EntityLocation};
use super::query::QueryId;
use super::store::Store;
use crate::error::{StoreError, StoreResult};
use crate::memory::ChunkId;

/// Operations that change which components entities have, or whether they
/// exist.
///
/// Implemented by [`Store`] (unchecked) and [`crate::World`] (checks
/// exclusive dependency clearance first). Command buffers replay through
/// this trait.
pub trait StructuralChangeProcessor {
    /// Creates an entity with zero-initialized components of `types`.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`], [`StoreError::CapacityExceeded`] or
    /// [`StoreError::EntityLimitReached`].
    fn create_entity(&mut self, types: &[ComponentTypeId]) -> StoreResult<Entity>;

    /// Creates an entity with the types and initial values of `bundle`.
    ///
    /// # Errors
    ///
    /// As [`StructuralChangeProcessor::create_entity`], plus
    /// [`StoreError::TypeMismatch`] for a value of the wrong size.
    fn create_entity_with(&mut self, bundle: &ComponentBundle) -> StoreResult<Entity>;

    /// Destroys an entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if it is not alive.
    fn destroy_entity(&mut self, entity: Entity) -> StoreResult<()>;

    /// Adds a zero-initialized component. No-op if already present.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`], [`StoreError::TypeNotRegistered`] or
    /// [`StoreError::CapacityExceeded`].
    fn add_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()>;

    /// Removes a component. No-op if absent.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] or [`StoreError::TypeNotRegistered`].
    fn remove_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()>;

    /// Overwrites one component value.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`], [`StoreError::TypeNotRegistered`],
    /// [`StoreError::TypeMismatch`] or [`StoreError::ComponentMissing`].
    fn set_component_bytes(&mut self, entity: Entity, type_id: ComponentTypeId, bytes: &[u8]) -> StoreResult<()>;

    /// Enables or disables one component of an entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotEnableable`], [`StoreError::StaleEntity`] or
    /// [`StoreError::ComponentMissing`].
    fn set_enabled(&mut self, entity: Entity, type_id: ComponentTypeId, enabled: bool) -> StoreResult<()>;

    /// Adds `type_id` to every entity matching `query` by reclassifying
    /// whole chunks. Returns the number of entities affected.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`], [`StoreError::TypeNotRegistered`] or
    /// [`StoreError::CapacityExceeded`].
    fn add_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize>;

    /// Removes `type_id` from every entity matching `query` by reclassifying
    /// whole chunks. Returns the number of entities affected.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`] or [`StoreError::TypeNotRegistered`].
    fn remove_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize>;

    /// Typed variant of [`StructuralChangeProcessor::set_component_bytes`].
    ///
    /// # Errors
    ///
    /// As [`StructuralChangeProcessor::set_component_bytes`].
    fn set_component<T: Component>(&mut self, entity: Entity, type_id: ComponentTypeId, value: T) -> StoreResult<()>
    where
        Self: Sized,
    {
        self.set_component_bytes(entity, type_id, bytemuck::bytes_of(&value))
    }
}

// ============================================================================
// ROW MOVEMENT
// ============================================================================

impl Store {
    /// Appends a zeroed row for a new entity in `archetype`.
    fn insert_row(&mut self, archetype: ArchetypeId) -> StoreResult<Entity> {
        let tick = self.next_tick();
        let chunk_id = self.chunks.allocate(self.graph.archetype_mut(archetype), tick);
        let row = self.chunks.chunk(chunk_id).len();
        let location = EntityLocation {
            archetype,
            chunk: chunk_id,
            // Rows are bounded by chunk capacity.
            row: row as u32,
        };
        let entity = match self.entities.create(location) {
            Ok(entity) => entity,
            Err(err) => {
                if self.chunks.chunk(chunk_id).is_empty() {
                    self.chunks.free(chunk_id, self.graph.archetype_mut(archetype));
                }
                return Err(err);
            }
        };
        self.chunks.chunk_mut(chunk_id).push_row(entity, tick);
        Ok(entity)
    }

    /// Swap-removes the row at `location`, fixing the moved entity and
    /// freeing the chunk once empty.
    fn remove_row(&mut self, location: EntityLocation) -> StoreResult<()> {
        let chunk = self.chunks.chunk_mut(location.chunk);
        if let Some(moved) = chunk.swap_remove(location.row()) {
            self.entities.set_location(moved, location)?;
        }
        if chunk.is_empty() {
            self.chunks.free(location.chunk, self.graph.archetype_mut(location.archetype));
        }
        Ok(())
    }

    /// Moves `entity` from `from` into a row of archetype `to`.
    fn move_entity(&mut self, entity: Entity, from: EntityLocation, to: ArchetypeId) -> StoreResult<()> {
        let tick = self.next_tick();
        let chunk_id = self.chunks.allocate(self.graph.archetype_mut(to), tick);
        let (source, target) = self.chunks.pair_mut(from.chunk, chunk_id);
        let row = target.push_row(entity, tick);
        source.copy_row_to(from.row(), target, row, tick);
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype: to,
                chunk: chunk_id,
                row: row as u32,
            },
        )?;
        self.remove_row(from)?;
        tracing::trace!(%entity, from = %from.archetype, %to, "moved entity");
        Ok(())
    }

    fn transition_entity(&mut self, entity: Entity, type_id: ComponentTypeId, op: Transition) -> StoreResult<()> {
        let location = self.entities.resolve(entity)?;
        let target = self.graph.transition(&self.registry, location.archetype, type_id, op)?;
        if target == location.archetype {
            return Ok(());
        }
        self.move_entity(entity, location, target)
    }

    // ========================================================================
    // BULK RECLASSIFICATION
    // ========================================================================

    fn transition_bulk(&mut self, query: QueryId, type_id: ComponentTypeId, op: Transition) -> StoreResult<usize> {
        self.registry.info(type_id)?;
        let archetypes = self.queries.matching(query, &self.graph)?;

        // Resolve every target first so a failing transition changes nothing.
        let mut plan = Vec::with_capacity(archetypes.len());
        for source in archetypes {
            let target = self.graph.transition(&self.registry, source, type_id, op)?;
            if target != source {
                plan.push((source, target));
            }
        }

        let mut affected = 0;
        for (source, target) in plan {
            let chunks = self.graph.archetype(source).chunks().to_vec();
            for chunk in chunks {
                affected += self.reclassify_chunk(chunk, target)?;
            }
        }
        tracing::debug!(query = %query, type_id = type_id.raw(), ?op, affected, "bulk structural change");
        Ok(affected)
    }

    /// Moves a whole chunk to archetype `to`. Returns the rows affected.
    fn reclassify_chunk(&mut self, chunk_id: ChunkId, to: ArchetypeId) -> StoreResult<usize> {
        let target_layout = Arc::clone(self.graph.archetype(to).layout());
        let chunk = self.chunks.chunk(chunk_id);
        let from = chunk.archetype();
        let affected = chunk.len();

        // Blocks of another geometry cannot be reused; move row by row. The
        // last move frees `chunk_id`, so it is not touched again.
        if !chunk.layout().same_block(&target_layout) {
            let entities = chunk.entities().to_vec();
            for entity in entities {
                let location = self.entities.resolve(entity)?;
                self.move_entity(entity, location, to)?;
            }
            return Ok(affected);
        }

        let keep = target_layout.capacity();
        while self.chunks.chunk(chunk_id).len() > keep {
            let Some(&entity) = self.chunks.chunk(chunk_id).entities().last() else {
                break;
            };
            let location = self.entities.resolve(entity)?;
            self.move_entity(entity, location, to)?;
        }

        let tick = self.next_tick();
        self.chunks.chunk_mut(chunk_id).reclassify(to, target_layout, tick);
        self.graph.archetype_mut(from).detach_chunk(chunk_id);
        self.graph.archetype_mut(to).attach_chunk(chunk_id);
        let chunk = self.chunks.chunk(chunk_id);
        for (row, &entity) in chunk.entities().iter().enumerate() {
            self.entities.set_location(
                entity,
                EntityLocation {
                    archetype: to,
                    chunk: chunk_id,
                    row: row as u32,
                },
            )?;
        }
        Ok(affected)
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

impl StructuralChangeProcessor for Store {
    fn create_entity(&mut self, types: &[ComponentTypeId]) -> StoreResult<Entity> {
        let archetype = self.graph.get_or_create(&self.registry, types)?;
        self.insert_row(archetype)
    }

    fn create_entity_with(&mut self, bundle: &ComponentBundle) -> StoreResult<Entity> {
        for (type_id, bytes) in bundle.values() {
            self.registry.info(type_id)?.check_value_len(bytes)?;
        }
        let types: Vec<ComponentTypeId> = bundle.types().collect();
        let entity = self.create_entity(&types)?;
        let location = self.entities.resolve(entity)?;
        let tick = self.current_tick();
        let chunk = self.chunks.chunk_mut(location.chunk);
        for (type_id, bytes) in bundle.values() {
            if let Some(column) = chunk.column_index(type_id) {
                chunk.write_component(column, location.row(), bytes, tick);
            }
        }
        Ok(entity)
    }

    fn destroy_entity(&mut self, entity: Entity) -> StoreResult<()> {
        let location = self.entities.destroy(entity)?;
        self.remove_row(location)
    }

    fn add_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()> {
        self.transition_entity(entity, type_id, Transition::Add)
    }

    fn remove_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()> {
        self.transition_entity(entity, type_id, Transition::Remove)
    }

    fn set_component_bytes(&mut self, entity: Entity, type_id: ComponentTypeId, bytes: &[u8]) -> StoreResult<()> {
        let location = self.entities.resolve(entity)?;
        self.registry.info(type_id)?.check_value_len(bytes)?;
        let tick = self.next_tick();
        let chunk = self.chunks.chunk_mut(location.chunk);
        let column = chunk
            .column_index(type_id)
            .ok_or(StoreError::ComponentMissing { entity, type_id })?;
        chunk.write_component(column, location.row(), bytes, tick);
        Ok(())
    }

    fn set_enabled(&mut self, entity: Entity, type_id: ComponentTypeId, enabled: bool) -> StoreResult<()> {
        if !self.registry.info(type_id)?.enableable {
            return Err(StoreError::NotEnableable { type_id });
        }
        let location = self.entities.resolve(entity)?;
        let tick = self.next_tick();
        let chunk = self.chunks.chunk_mut(location.chunk);
        let column = chunk
            .column_index(type_id)
            .ok_or(StoreError::ComponentMissing { entity, type_id })?;
        chunk.set_enabled(column, location.row(), enabled, tick);
        Ok(())
    }

    fn add_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize> {
        self.transition_bulk(query, type_id, Transition::Add)
    }

    fn remove_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize> {
        self.transition_bulk(query, type_id, Transition::Remove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::ecs::query::QueryDesc;
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {}

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    impl Component for Velocity {}

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Shield {
        charge: u32,
    }

    impl Component for Shield {
        const ENABLEABLE: bool = true;
    }

    fn store() -> (Store, ComponentTypeId, ComponentTypeId) {
        let mut store = Store::new(StoreConfig::default()).unwrap();
        let pos = store.register::<Position>().unwrap();
        let vel = store.register::<Velocity>().unwrap();
        (store, pos, vel)
    }

    #[test]
    fn test_create_places_entity() {
        let (mut store, pos, vel) = store();
        let entity = store.create_entity(&[vel, pos]).unwrap();
        assert_eq!(store.types_of(entity).unwrap(), &[pos, vel]);
        assert_eq!(store.get::<Position>(entity).unwrap(), Position::default());
    }

    #[test]
    fn test_create_with_values() {
        let (mut store, pos, _) = store();
        let bundle = ComponentBundle::new().with(pos, Position { x: 1.0, y: 2.0 });
        let entity = store.create_entity_with(&bundle).unwrap();
        assert_eq!(store.get::<Position>(entity).unwrap(), Position { x: 1.0, y: 2.0 });
    }

    #[test]
    fn test_create_with_wrong_size_changes_nothing() {
        let (mut store, pos, _) = store();
        let mut bundle = ComponentBundle::new();
        bundle.insert_bytes(pos, vec![0; 3]);
        assert!(matches!(store.create_entity_with(&bundle), Err(StoreError::TypeMismatch { .. })));
        assert_eq!(store.entity_count(), 0);
        assert_eq!(store.stats().chunks.chunks, 0);
    }

    #[test]
    fn test_add_preserves_values() {
        let (mut store, pos, vel) = store();
        let entity = store.create_entity(&[pos]).unwrap();
        store.set_component(entity, pos, Position { x: 4.0, y: 5.0 }).unwrap();
        store.add_component(entity, vel).unwrap();

        assert_eq!(store.types_of(entity).unwrap(), &[pos, vel]);
        assert_eq!(store.get::<Position>(entity).unwrap(), Position { x: 4.0, y: 5.0 });
        assert_eq!(store.get::<Velocity>(entity).unwrap(), Velocity::default());
    }

    #[test]
    fn test_add_present_and_remove_absent_are_noops() {
        let (mut store, pos, vel) = store();
        let entity = store.create_entity(&[pos]).unwrap();
        let before = store.resolve(entity).unwrap();
        store.add_component(entity, pos).unwrap();
        store.remove_component(entity, vel).unwrap();
        assert_eq!(store.resolve(entity).unwrap(), before);
    }

    #[test]
    fn test_destroy_swaps_last_row_in() {
        let (mut store, pos, _) = store();
        let a = store.create_entity(&[pos]).unwrap();
        let b = store.create_entity(&[pos]).unwrap();
        let c = store.create_entity(&[pos]).unwrap();
        store.set_component(c, pos, Position { x: 9.0, y: 9.0 }).unwrap();

        store.destroy_entity(a).unwrap();
        let moved = store.resolve(c).unwrap();
        assert_eq!(moved.row, 0);
        assert_eq!(store.resolve(b).unwrap().row, 1);
        assert_eq!(store.get::<Position>(c).unwrap(), Position { x: 9.0, y: 9.0 });
        assert_eq!(store.chunks().chunk(moved.chunk).entities(), &[c, b]);
    }

    #[test]
    fn test_empty_chunks_are_freed() {
        let (mut store, pos, vel) = store();
        let entity = store.create_entity(&[pos]).unwrap();
        store.add_component(entity, vel).unwrap();
        let stats = store.stats();
        assert_eq!(stats.chunks.chunks, 1);
        assert_eq!(stats.pooled_blocks, 1);

        store.destroy_entity(entity).unwrap();
        assert_eq!(store.stats().chunks.chunks, 0);
        assert_eq!(store.destroy_entity(entity), Err(StoreError::StaleEntity { entity }));
    }

    #[test]
    fn test_chunks_fill_before_new_ones() {
        let mut store = Store::new(StoreConfig::default().with_max_chunk_rows(4)).unwrap();
        let pos = store.register::<Position>().unwrap();
        for _ in 0..9 {
            store.create_entity(&[pos]).unwrap();
        }
        let stats = store.stats().chunks;
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.rows, 9);
        assert_eq!(stats.capacity, 12);
    }

    #[test]
    fn test_enabled_bits_follow_moves() {
        let (mut store, pos, vel) = store();
        let shield = store.register::<Shield>().unwrap();
        let entity = store.create_entity(&[pos, shield]).unwrap();
        assert!(store.is_enabled(entity, shield).unwrap());

        store.set_enabled(entity, shield, false).unwrap();
        store.add_component(entity, vel).unwrap();
        assert!(!store.is_enabled(entity, shield).unwrap());
        assert_eq!(store.set_enabled(entity, pos, false), Err(StoreError::NotEnableable { type_id: pos }));
    }

    #[test]
    fn test_bulk_add_reclassifies_in_place() {
        let (mut store, pos, vel) = store();
        let entities: Vec<_> = (0..10)
            .map(|i| {
                let e = store.create_entity(&[pos]).unwrap();
                store.set_component(e, pos, Position { x: i as f32, y: 0.0 }).unwrap();
                e
            })
            .collect();
        let chunk_before = store.resolve(entities[0]).unwrap().chunk;

        let query = store.build_query(QueryDesc::new().with(pos)).unwrap();
        assert_eq!(store.add_component_bulk(query, vel).unwrap(), 10);

        for (i, &e) in entities.iter().enumerate() {
            let location = store.resolve(e).unwrap();
            assert_eq!(location.chunk, chunk_before);
            assert_eq!(location.row as usize, i);
            assert_eq!(store.types_of(e).unwrap(), &[pos, vel]);
            assert_eq!(store.get::<Position>(e).unwrap().x, i as f32);
            assert_eq!(store.get::<Velocity>(e).unwrap(), Velocity::default());
        }
    }

    #[test]
    fn test_bulk_tag_moves_no_bytes() {
        let (mut store, pos, _) = store();
        let frozen = store.register_tag("Frozen").unwrap();
        let entity = store.create_entity(&[pos]).unwrap();
        store.set_component(entity, pos, Position { x: 3.0, y: 1.0 }).unwrap();
        let before = store.chunk_bytes(store.resolve(entity).unwrap().chunk).unwrap().to_vec();

        let query = store.build_query(QueryDesc::new().with(pos)).unwrap();
        store.add_component_bulk(query, frozen).unwrap();

        let location = store.resolve(entity).unwrap();
        assert!(store.has_component(entity, frozen).unwrap());
        assert_eq!(store.chunk_bytes(location.chunk).unwrap(), before.as_slice());
    }

    #[test]
    fn test_bulk_remove() {
        let (mut store, pos, vel) = store();
        let entity = store.create_entity(&[pos, vel]).unwrap();
        store.set_component(entity, vel, Velocity { dx: 2.0, dy: 3.0 }).unwrap();
        let query = store.build_query(QueryDesc::new().with(pos)).unwrap();
        assert_eq!(store.remove_component_bulk(query, pos).unwrap(), 1);
        assert_eq!(store.types_of(entity).unwrap(), &[vel]);
        assert_eq!(store.get::<Velocity>(entity).unwrap(), Velocity { dx: 2.0, dy: 3.0 });
    }

    #[test]
    fn test_bulk_overflow_moves_tail_rows() {
        // 16-byte rows give 64 per 1 KiB chunk; 72-byte rows give 14, so
        // 26 of the 40 rows must move out before the chunk is reclassified.
        let mut store = Store::new(StoreConfig::default().with_chunk_bytes(1024)).unwrap();
        let pos = store.register::<Position>().unwrap();
        let big = store
            .register_raw(crate::ecs::component::ComponentDescriptor {
                name: "Big".to_string(),
                size: 56,
                alignment: 8,
                enableable: false,
            })
            .unwrap();
        let entities: Vec<_> = (0..40).map(|_| store.create_entity(&[pos]).unwrap()).collect();

        let query = store.build_query(QueryDesc::new().with(pos)).unwrap();
        assert_eq!(store.add_component_bulk(query, big).unwrap(), 40);

        for &e in &entities {
            assert_eq!(store.types_of(e).unwrap(), &[pos, big]);
        }
        let stats = store.stats().chunks;
        assert_eq!(stats.rows, 40);
        assert_eq!(stats.chunks, 3);
    }
}
