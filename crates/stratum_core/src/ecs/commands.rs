//! # Command Buffers
//!
//! Deferred structural changes recorded from any number of threads and
//! replayed later on one thread.
//!
//! ```text
//! worker 0 (key 3) ──┐
//! worker 1 (key 1) ──┼──> [entries] ──sort (key, seq)──> playback ──> processor
//! worker 2 (key 2) ──┘
//! ```
//!
//! Each entry carries a caller-chosen `sort_key`, conventionally the index
//! of the work partition that produced it. Playback sorts by
//! `(sort_key, insertion sequence)`, so the final store contents depend only
//! on what was recorded under which key, never on thread timing.
//!
//! Entities created through the buffer are referred to by [`TempEntity`]
//! tokens until playback maps them to real entities.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::component::{Component, ComponentBundle, ComponentTypeId};
use super::entity::Entity;
use super::structural::StructuralChangeProcessor;
use crate::error::{StoreError, StoreResult};

/// Placeholder for an entity a buffer will create at playback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TempEntity {
    sort_key: u64,
    local_id: u32,
}

impl TempEntity {
    /// Sort key of the entry that creates this entity.
    #[inline]
    #[must_use]
    pub const fn sort_key(self) -> u64 {
        self.sort_key
    }

    /// Buffer-local id.
    #[inline]
    #[must_use]
    pub const fn local_id(self) -> u32 {
        self.local_id
    }
}

impl fmt::Display for TempEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp{}@{}", self.local_id, self.sort_key)
    }
}

/// Entity an entry applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Entity that already exists.
    Entity(Entity),
    /// Entity created earlier in the same buffer.
    Temp(TempEntity),
}

impl From<Entity> for Target {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<TempEntity> for Target {
    fn from(temp: TempEntity) -> Self {
        Self::Temp(temp)
    }
}

/// Whether a buffer may be played back more than once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackPolicy {
    /// Entries are consumed; recording afterwards fails.
    #[default]
    Single,
    /// Entries are kept and replayed on every playback. Each playback
    /// creates fresh entities for the buffer's temp entities.
    Multi,
}

#[derive(Clone, Debug)]
enum Command {
    Create {
        temp: TempEntity,
        bundle: ComponentBundle,
    },
    Destroy(Target),
    Add(Target, ComponentTypeId),
    Remove(Target, ComponentTypeId),
    Set {
        target: Target,
        type_id: ComponentTypeId,
        bytes: Vec<u8>,
    },
    SetEnabled {
        target: Target,
        type_id: ComponentTypeId,
        enabled: bool,
    },
}

#[derive(Clone, Debug)]
struct Entry {
    sort_key: u64,
    seq: u64,
    command: Command,
}

#[derive(Debug, Default)]
struct Entries {
    list: Vec<Entry>,
    played: bool,
}

/// Counts of what one playback applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Entries applied.
    pub applied: usize,
    /// Entities created.
    pub created: usize,
    /// Entities destroyed.
    pub destroyed: usize,
}

/// Deferred, deterministically ordered structural changes.
///
/// Recording takes `&self`, so a buffer can be shared by reference (or in
/// an `Arc`) between jobs.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    entries: Mutex<Entries>,
    next_seq: AtomicU64,
    next_temp: AtomicU32,
    policy: PlaybackPolicy,
}

impl CommandBuffer {
    /// Creates a single-playback buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer with an explicit playback policy.
    #[must_use]
    pub fn with_policy(policy: PlaybackPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Playback policy.
    #[must_use]
    pub fn policy(&self) -> PlaybackPolicy {
        self.policy
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().list.len()
    }

    /// Checks if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a single-playback buffer has been consumed.
    #[must_use]
    pub fn is_played_back(&self) -> bool {
        self.entries.lock().played
    }

    fn record(&self, sort_key: u64, command: Command) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        if entries.played {
            return Err(StoreError::BufferAlreadyPlayedBack);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.list.push(Entry { sort_key, seq, command });
        Ok(())
    }

    /// Records creation of an entity with zero-initialized `types`.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn create_temp(&self, sort_key: u64, types: &[ComponentTypeId]) -> StoreResult<TempEntity> {
        let bundle = types
            .iter()
            .fold(ComponentBundle::new(), |bundle, &type_id| bundle.with_default(type_id));
        self.create_temp_with(sort_key, bundle)
    }

    /// Records creation of an entity with the values of `bundle`.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn create_temp_with(&self, sort_key: u64, bundle: ComponentBundle) -> StoreResult<TempEntity> {
        let temp = TempEntity {
            sort_key,
            local_id: self.next_temp.fetch_add(1, Ordering::Relaxed),
        };
        self.record(sort_key, Command::Create { temp, bundle })?;
        Ok(temp)
    }

    /// Records destruction of `target`.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn destroy(&self, sort_key: u64, target: impl Into<Target>) -> StoreResult<()> {
        self.record(sort_key, Command::Destroy(target.into()))
    }

    /// Records adding a zero-initialized component.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn add_component(&self, sort_key: u64, target: impl Into<Target>, type_id: ComponentTypeId) -> StoreResult<()> {
        self.record(sort_key, Command::Add(target.into(), type_id))
    }

    /// Records removing a component.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn remove_component(
        &self,
        sort_key: u64,
        target: impl Into<Target>,
        type_id: ComponentTypeId,
    ) -> StoreResult<()> {
        self.record(sort_key, Command::Remove(target.into(), type_id))
    }

    /// Records overwriting a component value.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback. Size
    /// mismatches surface at playback.
    pub fn set_component_bytes(
        &self,
        sort_key: u64,
        target: impl Into<Target>,
        type_id: ComponentTypeId,
        bytes: &[u8],
    ) -> StoreResult<()> {
        self.record(
            sort_key,
            Command::Set {
                target: target.into(),
                type_id,
                bytes: bytes.to_vec(),
            },
        )
    }

    /// Typed variant of [`CommandBuffer::set_component_bytes`].
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn set_component<T: Component>(
        &self,
        sort_key: u64,
        target: impl Into<Target>,
        type_id: ComponentTypeId,
        value: T,
    ) -> StoreResult<()> {
        self.set_component_bytes(sort_key, target, type_id, bytemuck::bytes_of(&value))
    }

    /// Records enabling or disabling a component.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] after single playback.
    pub fn set_enabled(
        &self,
        sort_key: u64,
        target: impl Into<Target>,
        type_id: ComponentTypeId,
        enabled: bool,
    ) -> StoreResult<()> {
        self.record(
            sort_key,
            Command::SetEnabled {
                target: target.into(),
                type_id,
                enabled,
            },
        )
    }

    /// Replays recorded entries through `processor` in
    /// `(sort_key, insertion)` order.
    ///
    /// Playback stops at the first failing entry; entries before it stay
    /// applied. A single-playback buffer is consumed even when playback
    /// fails.
    ///
    /// # Errors
    ///
    /// [`StoreError::BufferAlreadyPlayedBack`] when replaying a consumed
    /// buffer, [`StoreError::UnknownTempEntity`] for a temp entity whose
    /// creation failed or sorts later, or the first processor error.
    pub fn playback(&self, processor: &mut impl StructuralChangeProcessor) -> StoreResult<PlaybackStats> {
        let mut entries = {
            let mut guard = self.entries.lock();
            if guard.played {
                return Err(StoreError::BufferAlreadyPlayedBack);
            }
            match self.policy {
                PlaybackPolicy::Single => {
                    guard.played = true;
                    std::mem::take(&mut guard.list)
                }
                PlaybackPolicy::Multi => guard.list.clone(),
            }
        };
        entries.sort_unstable_by_key(|e| (e.sort_key, e.seq));

        let mut replay = Replay::default();
        for entry in &entries {
            replay.apply(processor, &entry.command).map_err(|error| {
                tracing::debug!(
                    sort_key = entry.sort_key,
                    applied = replay.stats.applied,
                    %error,
                    "command buffer playback stopped"
                );
                error
            })?;
            replay.stats.applied += 1;
        }

        tracing::debug!(
            applied = replay.stats.applied,
            created = replay.stats.created,
            destroyed = replay.stats.destroyed,
            "command buffer played back"
        );
        Ok(replay.stats)
    }
}

#[derive(Default)]
struct Replay {
    remap: HashMap<TempEntity, Entity>,
    stats: PlaybackStats,
}

impl Replay {
    fn resolve(&self, target: Target) -> StoreResult<Entity> {
        match target {
            Target::Entity(entity) => Ok(entity),
            Target::Temp(temp) => self
                .remap
                .get(&temp)
                .copied()
                .ok_or(StoreError::UnknownTempEntity(temp)),
        }
    }

    fn apply(&mut self, processor: &mut impl StructuralChangeProcessor, command: &Command) -> StoreResult<()> {
        match command {
            Command::Create { temp, bundle } => {
                let entity = processor.create_entity_with(bundle)?;
                self.remap.insert(*temp, entity);
                self.stats.created += 1;
            }
            Command::Destroy(target) => {
                processor.destroy_entity(self.resolve(*target)?)?;
                self.stats.destroyed += 1;
            }
            Command::Add(target, type_id) => processor.add_component(self.resolve(*target)?, *type_id)?,
            Command::Remove(target, type_id) => processor.remove_component(self.resolve(*target)?, *type_id)?,
            Command::Set { target, type_id, bytes } => {
                processor.set_component_bytes(self.resolve(*target)?, *type_id, bytes)?;
            }
            Command::SetEnabled {
                target,
                type_id,
                enabled,
            } => processor.set_enabled(self.resolve(*target)?, *type_id, *enabled)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::ecs::store::Store;
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    impl Component for Health {}

    fn store() -> (Store, ComponentTypeId) {
        let mut store = Store::new(StoreConfig::default()).unwrap();
        let health = store.register::<Health>().unwrap();
        (store, health)
    }

    #[test]
    fn test_temp_entities_resolve_at_playback() {
        let (mut store, health) = store();
        let buffer = CommandBuffer::new();
        let temp = buffer.create_temp(0, &[health]).unwrap();
        buffer.set_component(0, temp, health, Health(7)).unwrap();

        let stats = buffer.playback(&mut store).unwrap();
        assert_eq!(stats, PlaybackStats { applied: 2, created: 1, destroyed: 0 });
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn test_sort_key_orders_playback() {
        let (mut store, health) = store();
        let entity = store.create_entity(&[health]).unwrap();
        let buffer = CommandBuffer::new();
        buffer.set_component(2, entity, health, Health(2)).unwrap();
        buffer.set_component(1, entity, health, Health(1)).unwrap();
        buffer.playback(&mut store).unwrap();
        assert_eq!(store.get::<Health>(entity).unwrap(), Health(2));
    }

    #[test]
    fn test_same_key_keeps_insertion_order() {
        let (mut store, health) = store();
        let entity = store.create_entity(&[health]).unwrap();
        let buffer = CommandBuffer::new();
        buffer.set_component(5, entity, health, Health(1)).unwrap();
        buffer.set_component(5, entity, health, Health(9)).unwrap();
        buffer.playback(&mut store).unwrap();
        assert_eq!(store.get::<Health>(entity).unwrap(), Health(9));
    }

    #[test]
    fn test_single_policy_consumes_buffer() {
        let (mut store, health) = store();
        let buffer = CommandBuffer::new();
        buffer.create_temp(0, &[health]).unwrap();
        buffer.playback(&mut store).unwrap();

        assert!(buffer.is_played_back());
        assert!(buffer.is_empty());
        assert_eq!(buffer.create_temp(0, &[health]), Err(StoreError::BufferAlreadyPlayedBack));
        assert_eq!(buffer.playback(&mut store), Err(StoreError::BufferAlreadyPlayedBack));
    }

    #[test]
    fn test_multi_policy_replays() {
        let (mut store, health) = store();
        let buffer = CommandBuffer::with_policy(PlaybackPolicy::Multi);
        buffer.create_temp(0, &[health]).unwrap();
        buffer.playback(&mut store).unwrap();
        buffer.playback(&mut store).unwrap();
        buffer.create_temp(1, &[health]).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(store.entity_count(), 2);
    }

    #[test]
    fn test_temp_used_before_creation_fails() {
        let (mut store, health) = store();
        let buffer = CommandBuffer::new();
        let temp = buffer.create_temp(9, &[health]).unwrap();
        buffer.destroy(1, temp).unwrap();
        assert_eq!(buffer.playback(&mut store), Err(StoreError::UnknownTempEntity(temp)));
        assert_eq!(store.entity_count(), 0);
    }

    #[test]
    fn test_playback_stops_at_first_error() {
        let (mut store, health) = store();
        let entity = store.create_entity(&[health]).unwrap();
        let buffer = CommandBuffer::new();
        buffer.set_component(0, entity, health, Health(3)).unwrap();
        buffer.destroy(1, entity).unwrap();
        buffer.destroy(2, entity).unwrap();
        buffer.create_temp(3, &[health]).unwrap();

        assert_eq!(buffer.playback(&mut store), Err(StoreError::StaleEntity { entity }));
        assert_eq!(store.entity_count(), 0);
    }
}
