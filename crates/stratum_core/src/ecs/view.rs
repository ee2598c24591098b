//! # Chunk Views
//!
//! Read and read-write access to chunk columns for the frame loop and for
//! jobs. Every column borrow is checked against the caller's clearance:
//!
//! - main thread: the [`DependencyTracker`] must show no outstanding job
//!   that conflicts with the access
//! - job: the type must be in the job's declared [`AccessSet`]
//!
//! Within one [`ChunkViewMut`], a column is either borrowed mutably once or
//! shared any number of times, never both.

// SAFETY: Mutable column slices are created from shared chunk references.
// Exclusivity comes from dependency clearance across threads, from
// `&mut AccessScope` across views, and from the per-view borrow list within
// a view.
#![allow(unsafe_code)]

use std::cell::RefCell;

use super::archetype::ArchetypeId;
use super::component::{Component, ComponentTypeId};
use super::entity::Entity;
use super::query::{select_rows, ChunkFilter, ChunkSelection, QueryDesc, QueryId};
use super::store::Store;
use crate::error::{AccessKind, StoreError, StoreResult};
use crate::memory::{Chunk, ChunkId, RowMask};
use crate::sync::{AccessSet, DependencyTracker, JobId};

/// Whose clearance an access is checked against.
#[derive(Clone, Copy, Debug)]
pub(crate) enum AccessPolicy<'a> {
    /// No checks.
    Unchecked,
    /// Frame loop outside any job.
    MainThread(&'a DependencyTracker),
    /// Inside a running job.
    Job {
        /// Declared access of the job.
        access: &'a AccessSet,
        /// The running job.
        job: JobId,
    },
}

impl AccessPolicy<'_> {
    fn check(&self, type_id: ComponentTypeId, access: AccessKind) -> StoreResult<()> {
        match *self {
            Self::Unchecked => Ok(()),
            Self::MainThread(tracker) => match access {
                AccessKind::Read => tracker.check_read(type_id),
                AccessKind::Write | AccessKind::Structural => tracker.check_write(type_id),
            },
            Self::Job { access: declared, job } => {
                let allowed = match access {
                    AccessKind::Read => declared.can_read(type_id),
                    AccessKind::Write | AccessKind::Structural => declared.can_write(type_id),
                };
                if allowed {
                    Ok(())
                } else {
                    Err(StoreError::UnsynchronizedAccess { type_id, job, access })
                }
            }
        }
    }
}

/// Checked access to store data for the frame loop or one job.
pub struct AccessScope<'a> {
    store: &'a Store,
    policy: AccessPolicy<'a>,
    tick: u64,
}

impl<'a> AccessScope<'a> {
    pub(crate) fn new(store: &'a Store, policy: AccessPolicy<'a>, tick: u64) -> Self {
        Self { store, policy, tick }
    }

    /// Creates a scope with no dependency checks, for single-threaded use
    /// of a bare [`Store`].
    #[must_use]
    pub fn unchecked(store: &'a Store) -> Self {
        let tick = store.next_tick();
        Self::new(store, AccessPolicy::Unchecked, tick)
    }

    /// Tick stamped on columns written through this scope.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Id registered for `T`.
    ///
    /// # Errors
    ///
    /// [`StoreError::RustTypeNotRegistered`] if `T` is unknown.
    pub fn id_of<T: 'static>(&self) -> StoreResult<ComponentTypeId> {
        self.store.id_of::<T>()
    }

    /// Checks if `entity` is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.store.is_alive(entity)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.store.entity_count()
    }

    /// Component types of `entity`.
    ///
    /// # Errors
    ///
    /// [`StoreError::StaleEntity`] if the entity is not alive.
    pub fn types_of(&self, entity: Entity) -> StoreResult<&'a [ComponentTypeId]> {
        self.store.types_of(entity)
    }

    /// Reads one component of `entity`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] without read clearance, or any
    /// lookup error of [`Store::get`].
    pub fn get<T: Component>(&self, entity: Entity) -> StoreResult<T> {
        let type_id = self.store.id_of::<T>()?;
        self.policy.check(type_id, AccessKind::Read)?;
        self.store.get::<T>(entity)
    }

    /// Overwrites one component of `entity` in place.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsynchronizedAccess`] without write clearance,
    /// [`StoreError::StaleEntity`] or [`StoreError::ComponentMissing`].
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> StoreResult<()> {
        let type_id = self.store.id_of::<T>()?;
        self.policy.check(type_id, AccessKind::Write)?;
        let location = self.store.resolve(entity)?;
        let chunk = self.store.chunks.chunk(location.chunk);
        let column = chunk
            .column_index(type_id)
            .ok_or(StoreError::ComponentMissing { entity, type_id })?;
        // SAFETY: write clearance plus `&mut self` exclude every other
        // borrow of this column.
        let slice = unsafe { chunk.column_unchecked_mut::<T>(column) };
        slice[location.row()] = value;
        chunk.stamp(column, self.tick);
        Ok(())
    }

    fn prepare(&self, query: QueryId) -> StoreResult<(QueryDesc, Vec<ArchetypeId>)> {
        let desc = self.store.queries.desc(query)?;
        for type_id in desc.accessed() {
            self.policy.check(type_id, AccessKind::Read)?;
        }
        let archetypes = self.store.queries.matching(query, &self.store.graph)?;
        Ok((desc, archetypes))
    }

    /// Iterates read-only views of chunks matching `query`.
    ///
    /// The sequence is lazy and finite. Each call starts over; order follows
    /// archetype creation order and chunk order within each archetype.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`], or [`StoreError::UnsynchronizedAccess`]
    /// without read clearance on a required or optional type.
    pub fn chunks(&self, query: QueryId, filter: &ChunkFilter) -> StoreResult<ChunkIter<'_>> {
        let (desc, archetypes) = self.prepare(query)?;
        Ok(ChunkIter {
            store: self.store,
            policy: self.policy,
            desc,
            filter: filter.clone(),
            archetypes,
            archetype: 0,
            chunk: 0,
        })
    }

    /// Iterates read-write views of chunks matching `query`.
    ///
    /// Write clearance is checked per column at [`ChunkViewMut::column_mut`].
    ///
    /// # Errors
    ///
    /// As [`AccessScope::chunks`].
    pub fn chunks_mut(&mut self, query: QueryId, filter: &ChunkFilter) -> StoreResult<ChunkIterMut<'_>> {
        let tick = self.tick;
        let (desc, archetypes) = self.prepare(query)?;
        Ok(ChunkIterMut {
            inner: ChunkIter {
                store: self.store,
                policy: self.policy,
                desc,
                filter: filter.clone(),
                archetypes,
                archetype: 0,
                chunk: 0,
            },
            tick,
        })
    }
}

/// Lazy iterator over filtered chunk views.
pub struct ChunkIter<'s> {
    store: &'s Store,
    policy: AccessPolicy<'s>,
    desc: QueryDesc,
    filter: ChunkFilter,
    archetypes: Vec<ArchetypeId>,
    archetype: usize,
    chunk: usize,
}

impl<'s> Iterator for ChunkIter<'s> {
    type Item = ChunkView<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let &archetype = self.archetypes.get(self.archetype)?;
            let chunks = self.store.graph.archetype(archetype).chunks();
            let Some(&chunk_id) = chunks.get(self.chunk) else {
                self.archetype += 1;
                self.chunk = 0;
                continue;
            };
            self.chunk += 1;
            let chunk = self.store.chunks.chunk(chunk_id);
            let rows = match select_rows(chunk, self.desc.required(), &self.filter) {
                ChunkSelection::Skip => continue,
                ChunkSelection::All => None,
                ChunkSelection::Rows(mask) => Some(mask),
            };
            return Some(ChunkView {
                store: self.store,
                chunk,
                policy: self.policy,
                rows,
            });
        }
    }
}

/// Read-only view of one chunk.
pub struct ChunkView<'s> {
    store: &'s Store,
    chunk: &'s Chunk,
    policy: AccessPolicy<'s>,
    rows: Option<RowMask>,
}

impl<'s> ChunkView<'s> {
    /// Id of the viewed chunk.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    /// Archetype of the viewed chunk.
    #[must_use]
    pub fn archetype(&self) -> ArchetypeId {
        self.chunk.archetype()
    }

    /// Occupied rows, including rows the enabled filter rejected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    /// Checks if the chunk has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Entity of every occupied row.
    #[must_use]
    pub fn entities(&self) -> &'s [Entity] {
        self.chunk.entities()
    }

    /// Rows that passed the filter; `None` when every row did.
    #[must_use]
    pub fn rows(&self) -> Option<&RowMask> {
        self.rows.as_ref()
    }

    /// Checks if `row` passed the filter.
    #[must_use]
    pub fn is_selected(&self, row: usize) -> bool {
        row < self.chunk.len() && self.rows.as_ref().map_or(true, |mask| mask.get(row))
    }

    /// Indices of rows that passed the filter.
    pub fn selected_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.chunk.len()).filter(|&row| self.is_selected(row))
    }

    /// Change version of a column, if the archetype has it.
    #[must_use]
    pub fn version(&self, type_id: ComponentTypeId) -> Option<u64> {
        self.chunk.column_index(type_id).map(|c| self.chunk.version(c))
    }

    /// Enabled-row mask of an enableable column.
    #[must_use]
    pub fn enabled_mask(&self, type_id: ComponentTypeId) -> Option<&'s RowMask> {
        self.chunk.column_index(type_id).and_then(|c| self.chunk.enabled_mask(c))
    }

    fn typed_column<T: Component>(&self, access: AccessKind) -> StoreResult<(ComponentTypeId, Option<usize>)> {
        let type_id = self.store.registry.id_of::<T>()?;
        self.store.registry.info(type_id)?.check_rust_type::<T>()?;
        self.policy.check(type_id, access)?;
        Ok((type_id, self.chunk.column_index(type_id)))
    }

    fn missing(&self, type_id: ComponentTypeId) -> StoreError {
        StoreError::ColumnMissing {
            archetype: self.chunk.archetype(),
            type_id,
        }
    }

    /// Column of `T`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ColumnMissing`] if the archetype lacks `T`, plus
    /// registration and clearance errors.
    pub fn column<T: Component>(&self) -> StoreResult<&'s [T]> {
        match self.typed_column::<T>(AccessKind::Read)? {
            (_, Some(column)) => Ok(self.chunk.column::<T>(column)),
            (type_id, None) => Err(self.missing(type_id)),
        }
    }

    /// Column of `T`, or `None` if the archetype lacks it.
    ///
    /// # Errors
    ///
    /// Registration and clearance errors.
    pub fn optional_column<T: Component>(&self) -> StoreResult<Option<&'s [T]>> {
        let (_, column) = self.typed_column::<T>(AccessKind::Read)?;
        Ok(column.map(|column| self.chunk.column::<T>(column)))
    }

    /// Raw bytes of a column.
    ///
    /// # Errors
    ///
    /// [`StoreError::ColumnMissing`] or [`StoreError::UnsynchronizedAccess`].
    pub fn column_bytes(&self, type_id: ComponentTypeId) -> StoreResult<&'s [u8]> {
        self.policy.check(type_id, AccessKind::Read)?;
        let column = self.chunk.column_index(type_id).ok_or_else(|| self.missing(type_id))?;
        Ok(self.chunk.column_bytes(column))
    }
}

/// Lazy iterator over read-write chunk views.
pub struct ChunkIterMut<'s> {
    inner: ChunkIter<'s>,
    tick: u64,
}

impl<'s> Iterator for ChunkIterMut<'s> {
    type Item = ChunkViewMut<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|view| ChunkViewMut {
            view,
            borrows: RefCell::new(Vec::new()),
            tick: self.tick,
        })
    }
}

/// Read-write view of one chunk.
pub struct ChunkViewMut<'s> {
    view: ChunkView<'s>,
    /// Columns handed out so far: `(type, mutable)`.
    borrows: RefCell<Vec<(ComponentTypeId, bool)>>,
    tick: u64,
}

impl<'s> ChunkViewMut<'s> {
    /// Id of the viewed chunk.
    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.view.chunk_id()
    }

    /// Occupied rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.view.len()
    }

    /// Checks if the chunk has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.view.is_empty()
    }

    /// Entity of every occupied row.
    #[must_use]
    pub fn entities(&self) -> &'s [Entity] {
        self.view.entities()
    }

    /// Rows that passed the filter; `None` when every row did.
    #[must_use]
    pub fn rows(&self) -> Option<&RowMask> {
        self.view.rows()
    }

    /// Checks if `row` passed the filter.
    #[must_use]
    pub fn is_selected(&self, row: usize) -> bool {
        self.view.is_selected(row)
    }

    /// Change version of a column.
    #[must_use]
    pub fn version(&self, type_id: ComponentTypeId) -> Option<u64> {
        self.view.version(type_id)
    }

    fn borrow(&self, type_id: ComponentTypeId, mutable: bool) -> StoreResult<()> {
        let mut borrows = self.borrows.borrow_mut();
        let clash = borrows
            .iter()
            .any(|&(borrowed, was_mutable)| borrowed == type_id && (mutable || was_mutable));
        if clash {
            return Err(StoreError::ColumnAlreadyBorrowed { type_id });
        }
        borrows.push((type_id, mutable));
        Ok(())
    }

    /// Shared column of `T`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ColumnAlreadyBorrowed`] if the column is borrowed
    /// mutably, plus the errors of [`ChunkView::column`].
    pub fn column<T: Component>(&self) -> StoreResult<&'s [T]> {
        let (type_id, column) = self.view.typed_column::<T>(AccessKind::Read)?;
        let column = column.ok_or_else(|| self.view.missing(type_id))?;
        self.borrow(type_id, false)?;
        Ok(self.view.chunk.column::<T>(column))
    }

    /// Mutable column of `T`. Stamps the column version.
    ///
    /// # Errors
    ///
    /// [`StoreError::ColumnAlreadyBorrowed`] on a second borrow of the same
    /// column, [`StoreError::UnsynchronizedAccess`] without write clearance,
    /// [`StoreError::ColumnMissing`] if the archetype lacks `T`.
    pub fn column_mut<T: Component>(&self) -> StoreResult<&'s mut [T]> {
        let (type_id, column) = self.view.typed_column::<T>(AccessKind::Write)?;
        let column = column.ok_or_else(|| self.view.missing(type_id))?;
        self.borrow(type_id, true)?;
        self.view.chunk.stamp(column, self.tick);
        // SAFETY: write clearance excludes other threads, the scope's `&mut`
        // borrow excludes other views, and the borrow list excludes aliases
        // inside this view.
        Ok(unsafe { self.view.chunk.column_unchecked_mut::<T>(column) })
    }
}
