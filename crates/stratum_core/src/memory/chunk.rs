//! # Chunks
//!
//! A chunk is one fixed-size block holding up to `capacity` rows of a single
//! archetype in structure-of-arrays layout:
//!
//! ```text
//! offset 0                      column 0                column 1
//! [E0 E1 E2 .. E(cap-1)] pad [C0 C0 C0 ..] pad [C1 C1 C1 ..] ...
//! ```
//!
//! Rows are always packed. Removing a row swaps the last row into the hole.
//! Each column carries an atomic change version; each enableable column
//! carries a [`RowMask`] of enabled rows.
//!
//! The [`ChunkAllocator`] owns every chunk of a store, recycling both chunk
//! ids and blocks.

// SAFETY: Column access goes through raw block pointers. Offsets and
// lengths always come from the chunk's own `ChunkLayout`, which is computed
// so every column fits inside the block.
#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

use super::bitmask::RowMask;
use super::block::{Block, BlockPool};
use crate::ecs::archetype::{Archetype, ArchetypeId, ChunkLayout};
use crate::ecs::component::ComponentTypeId;
use crate::ecs::entity::Entity;

/// Identifier of a chunk slot. Recycled after the chunk is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Reconstructs an id from its raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk{}", self.0)
    }
}

/// Reinterprets column bytes as `T`, including zero-sized `T`.
fn typed<T: Pod>(bytes: &[u8], len: usize) -> &[T] {
    if std::mem::size_of::<T>() == 0 {
        // SAFETY: any dangling aligned pointer is a valid slice of ZSTs.
        return unsafe { std::slice::from_raw_parts(NonNull::<T>::dangling().as_ptr(), len) };
    }
    bytemuck::cast_slice(bytes)
}

fn typed_mut<T: Pod>(bytes: &mut [u8], len: usize) -> &mut [T] {
    if std::mem::size_of::<T>() == 0 {
        // SAFETY: any dangling aligned pointer is a valid slice of ZSTs.
        return unsafe {
            std::slice::from_raw_parts_mut(NonNull::<T>::dangling().as_ptr(), len)
        };
    }
    bytemuck::cast_slice_mut(bytes)
}

/// Fixed-capacity block of rows for one archetype.
pub struct Chunk {
    id: ChunkId,
    archetype: ArchetypeId,
    block: Block,
    layout: Arc<ChunkLayout>,
    len: usize,
    /// Change version per column, in layout column order.
    versions: Box<[AtomicU64]>,
    /// Enabled rows per column; `Some` only for enableable columns.
    enabled: Vec<Option<RowMask>>,
}

impl Chunk {
    fn new(id: ChunkId, archetype: ArchetypeId, block: Block, layout: Arc<ChunkLayout>, tick: u64) -> Self {
        let versions = layout.columns().iter().map(|_| AtomicU64::new(tick)).collect();
        let enabled = layout
            .columns()
            .iter()
            .map(|c| c.enableable.then(|| RowMask::new(layout.capacity())))
            .collect();
        Self {
            id,
            archetype,
            block,
            layout,
            len: 0,
            versions,
            enabled,
        }
    }

    /// Chunk id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Archetype the chunk currently belongs to.
    #[inline]
    #[must_use]
    pub fn archetype(&self) -> ArchetypeId {
        self.archetype
    }

    /// Layout shared with every chunk of the archetype.
    #[inline]
    #[must_use]
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Occupied rows.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks if no row is occupied.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum rows.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Checks if every row is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len >= self.layout.capacity()
    }

    /// Entity ids of occupied rows.
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        // SAFETY: the entity column starts at offset 0 of a block aligned to
        // at least 64 bytes and holds `capacity >= len` initialized ids.
        unsafe { std::slice::from_raw_parts(self.block.as_ptr().cast::<Entity>(), self.len) }
    }

    /// Column position of `type_id`, if the archetype has it.
    #[inline]
    #[must_use]
    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.layout.column_index(type_id)
    }

    fn column_ptr(&self, column: usize) -> *mut u8 {
        let offset = self.layout.columns()[column].offset;
        // SAFETY: offset lies within the block by layout construction.
        unsafe { self.block.as_ptr().add(offset) }
    }

    /// Bytes of the occupied part of a column.
    #[must_use]
    pub fn column_bytes(&self, column: usize) -> &[u8] {
        let size = self.layout.columns()[column].size;
        // SAFETY: the column spans `capacity * size` bytes inside the block.
        unsafe { std::slice::from_raw_parts(self.column_ptr(column), self.len * size) }
    }

    /// Occupied part of a column as `T`.
    ///
    /// Callers check that `T` matches the column's registered type.
    #[must_use]
    pub fn column<T: Pod>(&self, column: usize) -> &[T] {
        typed(self.column_bytes(column), self.len)
    }

    /// Mutable bytes of a column through a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other reference to this column of
    /// this chunk is alive for the returned lifetime. The store ensures this
    /// through dependency clearance and per-view borrow tracking.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn column_bytes_unchecked_mut(&self, column: usize) -> &mut [u8] {
        let size = self.layout.columns()[column].size;
        std::slice::from_raw_parts_mut(self.column_ptr(column), self.len * size)
    }

    /// Typed variant of [`Chunk::column_bytes_unchecked_mut`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Chunk::column_bytes_unchecked_mut`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn column_unchecked_mut<T: Pod>(&self, column: usize) -> &mut [T] {
        let len = self.len;
        typed_mut(self.column_bytes_unchecked_mut(column), len)
    }

    /// Bytes of one component value.
    #[must_use]
    pub fn component_bytes(&self, column: usize, row: usize) -> &[u8] {
        let size = self.layout.columns()[column].size;
        &self.column_bytes(column)[row * size..(row + 1) * size]
    }

    /// Overwrites one component value and stamps the column version.
    pub fn write_component(&mut self, column: usize, row: usize, bytes: &[u8], tick: u64) {
        let size = self.layout.columns()[column].size;
        debug_assert_eq!(bytes.len(), size);
        debug_assert!(row < self.len);
        // SAFETY: `&mut self` excludes every other borrow of the block.
        let dst = unsafe { self.column_bytes_unchecked_mut(column) };
        dst[row * size..(row + 1) * size].copy_from_slice(bytes);
        self.stamp(column, tick);
    }

    /// Last tick at which the column may have been written.
    #[inline]
    #[must_use]
    pub fn version(&self, column: usize) -> u64 {
        self.versions[column].load(Ordering::Acquire)
    }

    /// Raises the column version to `tick`.
    #[inline]
    pub fn stamp(&self, column: usize, tick: u64) {
        self.versions[column].fetch_max(tick, Ordering::AcqRel);
    }

    /// Enabled-row mask of an enableable column.
    #[inline]
    #[must_use]
    pub fn enabled_mask(&self, column: usize) -> Option<&RowMask> {
        self.enabled.get(column).and_then(Option::as_ref)
    }

    /// Whether a row's component is enabled. Non-enableable columns are
    /// always enabled.
    #[must_use]
    pub fn is_enabled(&self, column: usize, row: usize) -> bool {
        self.enabled_mask(column).map_or(true, |mask| mask.get(row))
    }

    /// Sets a row's enabled bit. Returns `false` if the column is not enableable.
    pub fn set_enabled(&mut self, column: usize, row: usize, enabled: bool, tick: u64) -> bool {
        let Some(mask) = self.enabled.get_mut(column).and_then(Option::as_mut) else {
            return false;
        };
        mask.set(row, enabled);
        self.stamp(column, tick);
        true
    }

    /// Appends a zeroed row for `entity` with every enableable column enabled.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is full.
    pub fn push_row(&mut self, entity: Entity, tick: u64) -> usize {
        assert!(!self.is_full(), "push_row on a full chunk");
        let row = self.len;
        // SAFETY: row < capacity; the entity column holds `capacity` ids.
        unsafe { self.block.as_ptr().cast::<Entity>().add(row).write(entity) };
        for (index, column) in self.layout.columns().iter().enumerate() {
            if column.size > 0 {
                // SAFETY: row < capacity keeps the write inside the column.
                unsafe {
                    std::ptr::write_bytes(self.column_ptr(index).add(row * column.size), 0, column.size);
                }
            }
        }
        for mask in self.enabled.iter_mut().flatten() {
            mask.set(row, true);
        }
        self.len += 1;
        for index in 0..self.versions.len() {
            self.stamp(index, tick);
        }
        row
    }

    /// Removes `row` by moving the last row into it.
    ///
    /// Returns the entity that now occupies `row`, if a move happened.
    pub fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        let moved = if row == last {
            None
        } else {
            let entity = self.entities()[last];
            // SAFETY: both rows are below len and distinct.
            unsafe { self.block.as_ptr().cast::<Entity>().add(row).write(entity) };
            for (index, column) in self.layout.columns().iter().enumerate() {
                if column.size > 0 {
                    let base = self.column_ptr(index);
                    // SAFETY: distinct rows never overlap.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            base.add(last * column.size),
                            base.add(row * column.size),
                            column.size,
                        );
                    }
                }
            }
            for mask in self.enabled.iter_mut().flatten() {
                mask.move_bit(last, row);
            }
            Some(entity)
        };
        self.len = last;
        moved
    }

    /// Copies every column shared with `dst` from `src_row` into `dst_row`,
    /// together with enabled bits.
    pub fn copy_row_to(&self, src_row: usize, dst: &mut Chunk, dst_row: usize, tick: u64) {
        for (src_col, column) in self.layout.columns().iter().enumerate() {
            let Some(dst_col) = dst.column_index(column.type_id) else {
                continue;
            };
            if column.size > 0 {
                let bytes = self.component_bytes(src_col, src_row);
                dst.write_component(dst_col, dst_row, bytes, tick);
            }
            if let Some(mask) = self.enabled_mask(src_col) {
                dst.set_enabled(dst_col, dst_row, mask.get(src_row), tick);
            }
        }
    }

    /// Moves the chunk to another archetype without leaving its block.
    ///
    /// Columns present in both layouts keep their data, version and enabled
    /// bits; new columns are zeroed and enabled. Identical column offsets
    /// move no bytes.
    ///
    /// # Panics
    ///
    /// Panics if the new layout needs a different block or holds fewer rows
    /// than the chunk currently has.
    pub fn reclassify(&mut self, archetype: ArchetypeId, layout: Arc<ChunkLayout>, tick: u64) {
        assert!(self.layout.same_block(&layout), "reclassify across block geometries");
        assert!(layout.capacity() >= self.len, "reclassify into a smaller chunk");

        if !self.layout.same_data_columns(&layout) {
            self.relayout(&layout);
        }

        let mut versions = Vec::with_capacity(layout.columns().len());
        let mut enabled = Vec::with_capacity(layout.columns().len());
        for column in layout.columns() {
            let old = self.layout.column_index(column.type_id);
            versions.push(AtomicU64::new(old.map_or(tick, |i| self.version(i))));
            enabled.push(column.enableable.then(|| {
                let mut mask = RowMask::new(layout.capacity());
                for row in 0..self.len {
                    let bit = old.map_or(true, |i| self.is_enabled(i, row));
                    mask.set(row, bit);
                }
                mask
            }));
        }

        self.archetype = archetype;
        self.layout = layout;
        self.versions = versions.into_boxed_slice();
        self.enabled = enabled;
    }

    fn relayout(&mut self, layout: &ChunkLayout) {
        let old = self.as_bytes().to_vec();
        let len = self.len;
        self.block.zero();
        let base = self.block.as_ptr();
        // SAFETY: the entity column sits at offset 0 in both layouts and
        // `len` fits both capacities.
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), base, len * 8) };
        for column in layout.columns() {
            let Some(src) = self.layout.column_index(column.type_id) else {
                continue;
            };
            let src_offset = self.layout.columns()[src].offset;
            let bytes = len * column.size;
            // SAFETY: both ranges lie inside equally sized buffers.
            unsafe {
                std::ptr::copy_nonoverlapping(old.as_ptr().add(src_offset), base.add(column.offset), bytes);
            }
        }
    }

    /// The whole block, for external serializers.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the block is valid and initialized for its full size.
        unsafe { std::slice::from_raw_parts(self.block.as_ptr(), self.block.size()) }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("archetype", &self.archetype)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Chunk occupancy statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Live chunks.
    pub chunks: usize,
    /// Occupied rows across all chunks.
    pub rows: usize,
    /// Row capacity across all chunks.
    pub capacity: usize,
}

impl ChunkStats {
    /// Fraction of capacity in use.
    #[must_use]
    pub fn occupancy(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.rows as f64 / self.capacity as f64
        }
    }
}

/// Owner of every chunk in a store.
#[derive(Debug, Default)]
pub struct ChunkAllocator {
    slots: Vec<Option<Chunk>>,
    free_slots: Vec<u32>,
    pool: BlockPool,
}

impl ChunkAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a chunk of `archetype` with at least one free row.
    ///
    /// Prefers the most recently created partial chunk; otherwise creates a
    /// chunk from a pooled or freshly allocated block.
    pub fn allocate(&mut self, archetype: &mut Archetype, tick: u64) -> ChunkId {
        let partial = archetype
            .chunks()
            .iter()
            .rev()
            .copied()
            .find(|&id| self.get(id).is_some_and(|chunk| !chunk.is_full()));
        if let Some(id) = partial {
            return id;
        }

        let layout = Arc::clone(archetype.layout());
        let block = self.pool.acquire(layout.block_bytes(), layout.block_align());
        let id = match self.free_slots.pop() {
            Some(slot) => ChunkId(slot),
            // Slot count is bounded by addressable memory well below u32::MAX blocks.
            None => ChunkId(self.slots.len() as u32),
        };
        let chunk = Chunk::new(id, archetype.id(), block, layout, tick);
        if id.index() == self.slots.len() {
            self.slots.push(Some(chunk));
        } else {
            self.slots[id.index()] = Some(chunk);
        }
        archetype.attach_chunk(id);
        tracing::debug!(chunk = %id, archetype = %archetype.id(), "allocated chunk");
        id
    }

    /// Frees an empty chunk, returning its block to the pool.
    pub fn free(&mut self, id: ChunkId, archetype: &mut Archetype) {
        let Some(chunk) = self.slots.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        debug_assert!(chunk.is_empty(), "freeing a chunk that still holds rows");
        archetype.detach_chunk(id);
        self.pool.release(chunk.block);
        self.free_slots.push(id.0);
        tracing::debug!(chunk = %id, archetype = %archetype.id(), "freed chunk");
    }

    /// Looks up a live chunk.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Looks up a live chunk mutably.
    #[inline]
    pub fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Live chunk.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live chunk; ids come from entity
    /// locations and archetype chunk lists, which the store keeps in sync.
    #[inline]
    #[must_use]
    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        match self.get(id) {
            Some(chunk) => chunk,
            None => panic!("{id} is not a live chunk"),
        }
    }

    /// Mutable variant of [`ChunkAllocator::chunk`].
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live chunk.
    #[inline]
    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        match self.get_mut(id) {
            Some(chunk) => chunk,
            None => panic!("{id} is not a live chunk"),
        }
    }

    /// Two distinct live chunks, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `a == b` or either id is not live.
    pub fn pair_mut(&mut self, a: ChunkId, b: ChunkId) -> (&mut Chunk, &mut Chunk) {
        assert_ne!(a, b, "pair_mut on the same chunk");
        let (low, high, swapped) = if a < b { (a, b, false) } else { (b, a, true) };
        let (head, tail) = self.slots.split_at_mut(high.index());
        let (Some(first), Some(second)) = (head[low.index()].as_mut(), tail[0].as_mut()) else {
            panic!("{a} or {b} is not a live chunk");
        };
        if swapped {
            (second, first)
        } else {
            (first, second)
        }
    }

    /// Iterates over live chunks.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.slots.iter().flatten()
    }

    /// Occupancy statistics.
    #[must_use]
    pub fn stats(&self) -> ChunkStats {
        self.iter().fold(ChunkStats::default(), |mut stats, chunk| {
            stats.chunks += 1;
            stats.rows += chunk.len();
            stats.capacity += chunk.capacity();
            stats
        })
    }

    /// Blocks waiting in the pool.
    #[must_use]
    pub fn pooled_blocks(&self) -> usize {
        self.pool.pooled()
    }
}
