//! # Entity Management
//!
//! Entities are lightweight identifiers consisting of:
//! - An index into the entity location table
//! - A generation counter for safe reuse
//!
//! The [`EntityStore`] is the sole authority on liveness. Destroying an
//! entity bumps the generation of its slot, so every outstanding copy of the
//! old id fails with [`StoreError::StaleEntity`].

use std::fmt;

use bytemuck::{Pod, Zeroable};

use super::archetype::ArchetypeId;
use crate::error::{StoreError, StoreResult};
use crate::memory::ChunkId;

/// Unique identifier for an entity.
///
/// The id is split into two parts:
/// - Lower 32 bits: slot index
/// - Upper 32 bits: generation counter for detecting stale references
///
/// Entities are stored inline as the first column of every chunk, so the
/// type is plain old data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// Null/invalid entity.
    pub const NULL: Self = Self(u64::MAX);

    /// Creates an entity from index and generation.
    ///
    /// # Arguments
    ///
    /// * `index` - Slot index (0 to 2^32-1)
    /// * `generation` - Generation counter (0 to 2^32-1)
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the packed 64-bit value.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Checks if this is the null entity.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Entity(null)");
        }
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// Where a live entity's row is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// Archetype of the entity.
    pub archetype: ArchetypeId,
    /// Chunk holding the row.
    pub chunk: ChunkId,
    /// Row inside the chunk.
    pub row: u32,
}

impl EntityLocation {
    /// Row as an index.
    #[inline]
    #[must_use]
    pub const fn row(&self) -> usize {
        self.row as usize
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: u32,
    location: Option<EntityLocation>,
}

/// Table of entity slots with LIFO index recycling.
#[derive(Debug, Default)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: usize,
}

impl EntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues an entity placed at `location`.
    ///
    /// Recycles the most recently destroyed index when one exists; its
    /// generation was already bumped on destroy.
    ///
    /// # Errors
    ///
    /// [`StoreError::EntityLimitReached`] when every index is in use.
    pub fn create(&mut self, location: EntityLocation) -> StoreResult<Entity> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.location = Some(location);
            self.alive += 1;
            return Ok(Entity::new(index, slot.generation));
        }
        // Index u32::MAX is reserved so no live entity equals `Entity::NULL`.
        let index = u32::try_from(self.slots.len())
            .ok()
            .filter(|&i| i < u32::MAX)
            .ok_or(StoreError::EntityLimitReached)?;
        self.slots.push(Slot {
            generation: 0,
            location: Some(location),
        });
        self.alive += 1;
        Ok(Entity::new(index, 0))
    }

    /// Index the next [`EntityStore::create`] will use.
    #[must_use]
    pub fn peek_next(&self) -> Option<u32> {
        self.free
            .last()
            .copied()
            .or_else(|| u32::try_from(self.slots.len()).ok().filter(|&i| i < u32::MAX))
    }

    /// Retires `entity`, returning its last location.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn destroy(&mut self, entity: Entity) -> StoreResult<EntityLocation> {
        let slot = self.live_slot_mut(entity)?;
        let location = slot.location.take().ok_or(StoreError::StaleEntity { entity })?;
        // A slot whose generation wraps is retired instead of recycled.
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(entity.index());
            }
            None => slot.generation = u32::MAX,
        }
        self.alive -= 1;
        Ok(location)
    }

    /// Current location of `entity`.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn resolve(&self, entity: Entity) -> StoreResult<EntityLocation> {
        self.slots
            .get(entity.index() as usize)
            .filter(|slot| slot.generation == entity.generation())
            .and_then(|slot| slot.location)
            .ok_or(StoreError::StaleEntity { entity })
    }

    /// Updates the location of a live entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) -> StoreResult<()> {
        let slot = self.live_slot_mut(entity)?;
        if slot.location.is_none() {
            return Err(StoreError::StaleEntity { entity });
        }
        slot.location = Some(location);
        Ok(())
    }

    /// Checks if `entity` is alive.
    #[inline]
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.resolve(entity).is_ok()
    }

    /// Number of live entities.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.alive
    }

    /// Checks if no entity is alive.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    fn live_slot_mut(&mut self, entity: Entity) -> StoreResult<&mut Slot> {
        self.slots
            .get_mut(entity.index() as usize)
            .filter(|slot| slot.generation == entity.generation())
            .ok_or(StoreError::StaleEntity { entity })
    }
}
