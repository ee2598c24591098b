//! # World
//!
//! Public facade over a [`Store`], its [`DependencyTracker`] and the
//! [`JobPool`] that runs scheduled jobs.
//!
//! ## Threading Model
//!
//! ```text
//! main thread                         workers
//! ───────────                         ───────
//! schedule(access, job) ──begin──>    [wait deps] -> job(&mut AccessScope)
//! access(|scope| ...)    checks clearance per column
//! add_component(..)      checks exclusive clearance, then write lock
//! complete(handle)       waits, reports panics
//! ```
//!
//! Jobs run while holding a shared lock on the store and may only touch
//! columns they declared. Structural changes need exclusive clearance on
//! every type of the archetypes they touch and then take the store's write
//! lock, which also waits out jobs still running on unrelated types.

use std::sync::Arc;

use parking_lot::RwLock;

use super::archetype::{ArchetypeId, ChunkLayout, Transition};
use super::component::{Component, ComponentBundle, ComponentDescriptor, ComponentTypeId};
use super::entity::{Entity, EntityLocation};
use super::query::{QueryDesc, QueryId};
use super::store::{Store, StoreStats};
use super::structural::StructuralChangeProcessor;
use super::view::{AccessPolicy, AccessScope};
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::sync::{AccessSet, DependencyState, DependencyTracker, JobHandle, JobPool};

/// Store plus job scheduling.
pub struct World {
    store: Arc<RwLock<Store>>,
    tracker: DependencyTracker,
    pool: JobPool,
}

impl World {
    /// Creates an empty world and starts its worker pool.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::InvalidConfig`] or
    /// [`crate::StoreError::WorkerSpawn`].
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let threads = config.resolved_worker_threads();
        let store = Store::new(config)?;
        Ok(Self {
            store: Arc::new(RwLock::new(store)),
            tracker: DependencyTracker::new(),
            pool: JobPool::new(threads)?,
        })
    }

    /// Configuration the world was created with.
    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.store.read().config().clone()
    }

    /// Dependency tracker of this world.
    #[must_use]
    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    /// Dependency state of one component type.
    #[must_use]
    pub fn dependency_state(&self, type_id: ComponentTypeId) -> DependencyState {
        self.tracker.state(type_id)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.pool.threads()
    }

    // ========================================================================
    // REGISTRATION AND LOOKUP
    // ========================================================================

    /// Registers `T`. Idempotent.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::RegistryFull`] when no id is left.
    pub fn register<T: Component>(&mut self) -> StoreResult<ComponentTypeId> {
        self.store.write().register::<T>()
    }

    /// Registers a type by layout only.
    ///
    /// # Errors
    ///
    /// See [`crate::ecs::component::TypeRegistry::register_raw`].
    pub fn register_raw(&mut self, descriptor: ComponentDescriptor) -> StoreResult<ComponentTypeId> {
        self.store.write().register_raw(descriptor)
    }

    /// Registers a zero-sized tag.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::RegistryFull`] when no id is left.
    pub fn register_tag(&mut self, name: impl Into<String>) -> StoreResult<ComponentTypeId> {
        self.store.write().register_tag(name)
    }

    /// Id registered for `T`.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::RustTypeNotRegistered`] if `T` is unknown.
    pub fn id_of<T: 'static>(&self) -> StoreResult<ComponentTypeId> {
        self.store.read().id_of::<T>()
    }

    /// Builds (or reuses) a query.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::TypeNotRegistered`] if any listed type is unknown.
    pub fn build_query(&self, desc: QueryDesc) -> StoreResult<QueryId> {
        self.store.read().build_query(desc)
    }

    /// Current location of `entity`.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::StaleEntity`] if the entity is not alive.
    pub fn resolve(&self, entity: Entity) -> StoreResult<EntityLocation> {
        self.store.read().resolve(entity)
    }

    /// Checks if `entity` is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.store.read().is_alive(entity)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.store.read().entity_count()
    }

    /// Component types of `entity`, ascending.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::StaleEntity`] if the entity is not alive.
    pub fn types_of(&self, entity: Entity) -> StoreResult<Vec<ComponentTypeId>> {
        self.store.read().types_of(entity).map(<[ComponentTypeId]>::to_vec)
    }

    /// Shared layout of an archetype.
    #[must_use]
    pub fn layout(&self, archetype: ArchetypeId) -> Option<Arc<ChunkLayout>> {
        self.store.read().layout(archetype)
    }

    /// Store summary.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.store.read().stats()
    }

    /// Copy of one component value, checked like a main-thread read.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::UnsynchronizedAccess`] while a job writes `T`,
    /// or any lookup error of [`Store::get`].
    pub fn get<T: Component>(&mut self, entity: Entity) -> StoreResult<T> {
        self.access(|scope| scope.get::<T>(entity))?
    }

    /// Runs `f` against the bare store once every outstanding job has
    /// completed. Use for serialization or inspection of raw chunk bytes.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::JobPanicked`] if an outstanding job panicked.
    pub fn with_store<R>(&mut self, f: impl FnOnce(&Store) -> R) -> StoreResult<R> {
        self.tracker.complete_all()?;
        Ok(f(&self.store.read()))
    }

    // ========================================================================
    // ACCESS AND JOBS
    // ========================================================================

    /// Runs `f` with main-thread access to component data.
    ///
    /// With access checks on, each column access fails with
    /// [`crate::StoreError::UnsynchronizedAccess`] while a conflicting job is
    /// outstanding. With checks off, every outstanding job is completed
    /// first.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::JobPanicked`] when checks are off and an
    /// outstanding job panicked.
    pub fn access<R>(&mut self, f: impl FnOnce(&mut AccessScope<'_>) -> R) -> StoreResult<R> {
        let checked = self.store.read().config().access_checks;
        if !checked {
            self.tracker.complete_all()?;
        }
        let store = self.store.read();
        let policy = if checked {
            AccessPolicy::MainThread(&self.tracker)
        } else {
            AccessPolicy::Unchecked
        };
        let mut scope = AccessScope::new(&store, policy, store.next_tick());
        Ok(f(&mut scope))
    }

    /// Schedules `job` after every outstanding job that conflicts with
    /// `access`. The job may only touch the columns `access` declares.
    pub fn schedule<F>(&self, access: AccessSet, job: F) -> JobHandle
    where
        F: FnOnce(&mut AccessScope<'_>) + Send + 'static,
    {
        let handle = self.tracker.begin(&access);
        self.submit(handle.clone(), access, job);
        handle
    }

    /// Schedules `job` after `dependency` only.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::UnsynchronizedAccess`] if a conflicting
    /// outstanding job is not covered by `dependency`.
    pub fn schedule_after<F>(&self, access: AccessSet, dependency: &JobHandle, job: F) -> StoreResult<JobHandle>
    where
        F: FnOnce(&mut AccessScope<'_>) + Send + 'static,
    {
        let handle = self.tracker.begin_after(&access, dependency)?;
        self.submit(handle.clone(), access, job);
        Ok(handle)
    }

    fn submit<F>(&self, handle: JobHandle, access: AccessSet, job: F)
    where
        F: FnOnce(&mut AccessScope<'_>) + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let id = handle.id();
        self.pool.submit(handle, move || {
            let store = store.read();
            let policy = AccessPolicy::Job { access: &access, job: id };
            let mut scope = AccessScope::new(&store, policy, store.next_tick());
            job(&mut scope);
        });
    }

    /// Waits for `handle` and everything it depends on.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::JobPanicked`] if the job panicked.
    pub fn complete(&self, handle: &JobHandle) -> StoreResult<()> {
        self.tracker.complete(handle)
    }

    /// Waits for every outstanding job.
    ///
    /// # Errors
    ///
    /// [`crate::StoreError::JobPanicked`] for the first panicked job.
    pub fn complete_all(&self) -> StoreResult<()> {
        self.tracker.complete_all()
    }

    // ========================================================================
    // CLEARANCE
    // ========================================================================

    fn source_types(&self, entity: Entity) -> StoreResult<Vec<ComponentTypeId>> {
        self.types_of(entity)
    }

    fn clear_transition(&self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()> {
        let mut types = self.source_types(entity)?;
        types.push(type_id);
        self.tracker.check_exclusive(&types)
    }

    fn clear_bulk(&self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<()> {
        let mut types = self.store.read().query_types(query)?;
        types.push(type_id);
        self.tracker.check_exclusive(&types)
    }

    fn transition(&mut self, entity: Entity, type_id: ComponentTypeId, op: Transition) -> StoreResult<()> {
        self.clear_transition(entity, type_id)?;
        let mut store = self.store.write();
        match op {
            Transition::Add => store.add_component(entity, type_id),
            Transition::Remove => store.remove_component(entity, type_id),
        }
    }
}

impl StructuralChangeProcessor for World {
    fn create_entity(&mut self, types: &[ComponentTypeId]) -> StoreResult<Entity> {
        self.tracker.check_exclusive(types)?;
        self.store.write().create_entity(types)
    }

    fn create_entity_with(&mut self, bundle: &ComponentBundle) -> StoreResult<Entity> {
        let types: Vec<ComponentTypeId> = bundle.types().collect();
        self.tracker.check_exclusive(&types)?;
        self.store.write().create_entity_with(bundle)
    }

    fn destroy_entity(&mut self, entity: Entity) -> StoreResult<()> {
        self.tracker.check_exclusive(&self.source_types(entity)?)?;
        self.store.write().destroy_entity(entity)
    }

    fn add_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()> {
        self.transition(entity, type_id, Transition::Add)
    }

    fn remove_component(&mut self, entity: Entity, type_id: ComponentTypeId) -> StoreResult<()> {
        self.transition(entity, type_id, Transition::Remove)
    }

    fn set_component_bytes(&mut self, entity: Entity, type_id: ComponentTypeId, bytes: &[u8]) -> StoreResult<()> {
        self.tracker.check_write(type_id)?;
        self.store.write().set_component_bytes(entity, type_id, bytes)
    }

    fn set_enabled(&mut self, entity: Entity, type_id: ComponentTypeId, enabled: bool) -> StoreResult<()> {
        self.tracker.check_write(type_id)?;
        self.store.write().set_enabled(entity, type_id, enabled)
    }

    fn add_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize> {
        self.clear_bulk(query, type_id)?;
        self.store.write().add_component_bulk(query, type_id)
    }

    fn remove_component_bulk(&mut self, query: QueryId, type_id: ComponentTypeId) -> StoreResult<usize> {
        self.clear_bulk(query, type_id)?;
        self.store.write().remove_component_bulk(query, type_id)
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if let Err(error) = self.tracker.complete_all() {
            tracing::warn!(%error, "outstanding job failed while dropping world");
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("stats", &self.stats())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
