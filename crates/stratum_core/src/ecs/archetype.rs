//! # Archetype Graph
//!
//! Entities with the same component set share an archetype and are stored
//! together in that archetype's chunks. Iteration is linear and
//! cache-friendly:
//!
//! ```text
//! Archetype {Position, Velocity}:
//!   chunk 0: [E E E ..][P P P ..][V V V ..]
//!   chunk 1: [E E ....][P P ....][V V ....]
//! ```
//!
//! ## Canonicalization
//!
//! An archetype is identified by its sorted, deduplicated type-id sequence.
//! No two archetypes model the same set. Archetypes are never mutated after
//! creation except for their chunk list.
//!
//! ## Transitions
//!
//! Adding or removing one type moves an entity to a neighbouring archetype.
//! Each `(archetype, type, add|remove)` edge is resolved once and memoized.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::component::{ComponentTypeId, ComponentTypeInfo, TypeRegistry};
use crate::error::{StoreError, StoreResult};
use crate::memory::{ChunkId, BLOCK_ALIGN};

/// Version of the in-memory chunk layout contract.
///
/// Bumped whenever the placement rules in [`ChunkLayout::compute`] change,
/// so external serializers can reject chunks persisted under other rules.
pub const LAYOUT_VERSION: u32 = 1;

/// Bytes per entity id in the entity column.
pub const ENTITY_STRIDE: usize = std::mem::size_of::<u64>();

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Identifier of an archetype, in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Index in creation order.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Reconstructs an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "archetype{}", self.0)
    }
}

/// Direction of a single-type archetype transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Add one type.
    Add,
    /// Remove one type.
    Remove,
}

/// Sorted, deduplicated set of component types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeSignature {
    types: Box<[ComponentTypeId]>,
}

impl ArchetypeSignature {
    /// Canonicalizes a type list.
    #[must_use]
    pub fn from_types(types: &[ComponentTypeId]) -> Self {
        let mut sorted = types.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            types: sorted.into_boxed_slice(),
        }
    }

    /// Checks if the signature contains a type.
    #[inline]
    #[must_use]
    pub fn contains(&self, type_id: ComponentTypeId) -> bool {
        self.types.binary_search(&type_id).is_ok()
    }

    /// Signature with `type_id` added.
    #[must_use]
    pub fn with(&self, type_id: ComponentTypeId) -> Self {
        let mut types = self.types.to_vec();
        types.push(type_id);
        Self::from_types(&types)
    }

    /// Signature with `type_id` removed.
    #[must_use]
    pub fn without(&self, type_id: ComponentTypeId) -> Self {
        let types: Vec<_> = self.types.iter().copied().filter(|&t| t != type_id).collect();
        Self {
            types: types.into_boxed_slice(),
        }
    }

    /// Types in ascending id order.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &[ComponentTypeId] {
        &self.types
    }

    /// Number of types.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Checks if the signature has no types.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ============================================================================
// CHUNK LAYOUT
// ============================================================================

/// Placement of one component column inside a chunk block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ColumnLayout {
    /// Component type stored in the column.
    pub type_id: ComponentTypeId,
    /// Byte offset of row 0 from the block start.
    pub offset: usize,
    /// Bytes per row.
    pub size: usize,
    /// Alignment of the column start.
    pub align: usize,
    /// Whether the column carries enabled bits.
    pub enableable: bool,
}

/// Byte layout shared by every chunk of an archetype.
///
/// This is the stable contract handed to external serializers: the entity
/// column sits at offset 0 with [`ENTITY_STRIDE`] bytes per row, and each
/// component column follows in ascending type-id order, aligned to its
/// type. The same type set always yields the same layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkLayout {
    version: u32,
    block_bytes: usize,
    block_align: usize,
    capacity: usize,
    row_stride: usize,
    entity_offset: usize,
    degenerate: bool,
    columns: Vec<ColumnLayout>,
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

impl ChunkLayout {
    /// Computes the layout for `infos` (ascending type id) in blocks of
    /// `chunk_bytes`, holding at most `max_rows` rows.
    ///
    /// Capacity starts at `min(max_rows, chunk_bytes / row_stride)` and
    /// shrinks until alignment padding fits. When even one row does not fit
    /// because of padding, the layout is degenerate: capacity 1 with a block
    /// just large enough for that row.
    ///
    /// # Errors
    ///
    /// [`StoreError::CapacityExceeded`] if one row is larger than the block.
    pub fn compute(infos: &[&ComponentTypeInfo], chunk_bytes: usize, max_rows: usize) -> StoreResult<Self> {
        debug_assert!(infos.windows(2).all(|w| w[0].id < w[1].id));
        let row_stride = ENTITY_STRIDE + infos.iter().map(|info| info.size).sum::<usize>();
        if row_stride > chunk_bytes {
            return Err(StoreError::CapacityExceeded {
                row_stride,
                chunk_bytes,
            });
        }

        let block_align = infos
            .iter()
            .map(|info| info.alignment)
            .fold(BLOCK_ALIGN, usize::max);

        let mut capacity = max_rows.min(chunk_bytes / row_stride).max(1);
        loop {
            let (columns, end) = Self::place(infos, capacity);
            if end <= chunk_bytes {
                return Ok(Self {
                    version: LAYOUT_VERSION,
                    block_bytes: chunk_bytes,
                    block_align,
                    capacity,
                    row_stride,
                    entity_offset: 0,
                    degenerate: false,
                    columns,
                });
            }
            if capacity == 1 {
                let block_bytes = align_up(end, ENTITY_STRIDE);
                tracing::warn!(
                    row_stride,
                    chunk_bytes,
                    block_bytes,
                    "degenerate archetype: alignment padding leaves room for a single row"
                );
                return Ok(Self {
                    version: LAYOUT_VERSION,
                    block_bytes,
                    block_align,
                    capacity,
                    row_stride,
                    entity_offset: 0,
                    degenerate: true,
                    columns,
                });
            }
            capacity -= 1;
        }
    }

    fn place(infos: &[&ComponentTypeInfo], capacity: usize) -> (Vec<ColumnLayout>, usize) {
        let mut offset = ENTITY_STRIDE * capacity;
        let columns = infos
            .iter()
            .map(|info| {
                offset = align_up(offset, info.alignment);
                let column = ColumnLayout {
                    type_id: info.id,
                    offset,
                    size: info.size,
                    align: info.alignment,
                    enableable: info.enableable,
                };
                offset += info.size * capacity;
                column
            })
            .collect();
        (columns, offset)
    }

    /// Layout contract version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Block size in bytes.
    #[inline]
    #[must_use]
    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Block alignment in bytes.
    #[inline]
    #[must_use]
    pub fn block_align(&self) -> usize {
        self.block_align
    }

    /// Rows per chunk.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per row, entity id included, padding excluded.
    #[inline]
    #[must_use]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// Offset of the entity column.
    #[inline]
    #[must_use]
    pub fn entity_offset(&self) -> usize {
        self.entity_offset
    }

    /// Whether padding forced a single-row chunk.
    #[inline]
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// Component columns in ascending type-id order.
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[ColumnLayout] {
        &self.columns
    }

    /// Position of `type_id` in [`ChunkLayout::columns`].
    #[inline]
    #[must_use]
    pub fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns.binary_search_by_key(&type_id, |c| c.type_id).ok()
    }

    /// Column of `type_id`.
    #[must_use]
    pub fn column(&self, type_id: ComponentTypeId) -> Option<&ColumnLayout> {
        self.column_index(type_id).map(|i| &self.columns[i])
    }

    /// Whether chunks of both layouts use interchangeable blocks.
    #[must_use]
    pub fn same_block(&self, other: &ChunkLayout) -> bool {
        self.block_bytes == other.block_bytes && self.block_align == other.block_align
    }

    /// Whether both layouts place the same data-carrying columns at the same
    /// offsets, so moving a chunk between them touches no column bytes.
    #[must_use]
    pub fn same_data_columns(&self, other: &ChunkLayout) -> bool {
        let data = |layout: &ChunkLayout| {
            layout
                .columns
                .iter()
                .filter(|c| c.size > 0)
                .map(|c| (c.type_id, c.offset))
                .collect::<Vec<_>>()
        };
        self.capacity == other.capacity && data(self) == data(other)
    }
}

// ============================================================================
// ARCHETYPES
// ============================================================================

/// One distinct component set and the chunks holding its rows.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    signature: ArchetypeSignature,
    layout: Arc<ChunkLayout>,
    chunks: Vec<ChunkId>,
}

impl Archetype {
    /// Archetype id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Component set.
    #[inline]
    #[must_use]
    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    /// Component types in ascending id order.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &[ComponentTypeId] {
        self.signature.types()
    }

    /// Checks if the archetype has `type_id`.
    #[inline]
    #[must_use]
    pub fn contains(&self, type_id: ComponentTypeId) -> bool {
        self.signature.contains(type_id)
    }

    /// Shared chunk layout.
    #[inline]
    #[must_use]
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Live chunks in attachment order.
    #[inline]
    #[must_use]
    pub fn chunks(&self) -> &[ChunkId] {
        &self.chunks
    }

    /// Appends a chunk to the chunk list.
    pub fn attach_chunk(&mut self, chunk: ChunkId) {
        self.chunks.push(chunk);
    }

    /// Removes a chunk from the chunk list, preserving order.
    pub fn detach_chunk(&mut self, chunk: ChunkId) {
        if let Some(pos) = self.chunks.iter().position(|&c| c == chunk) {
            self.chunks.remove(pos);
        }
    }
}

/// Canonical archetypes with memoized single-type transitions.
#[derive(Debug)]
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    lookup: HashMap<ArchetypeSignature, ArchetypeId>,
    edges: HashMap<(ArchetypeId, ComponentTypeId, Transition), ArchetypeId>,
    chunk_bytes: usize,
    max_chunk_rows: usize,
}

impl ArchetypeGraph {
    /// Creates an empty graph for chunks of `chunk_bytes` holding at most
    /// `max_chunk_rows` rows.
    #[must_use]
    pub fn new(chunk_bytes: usize, max_chunk_rows: usize) -> Self {
        Self {
            archetypes: Vec::new(),
            lookup: HashMap::new(),
            edges: HashMap::new(),
            chunk_bytes,
            max_chunk_rows,
        }
    }

    /// Returns the archetype for `types`, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] for unknown types,
    /// [`StoreError::CapacityExceeded`] if a row does not fit a block.
    pub fn get_or_create(&mut self, registry: &TypeRegistry, types: &[ComponentTypeId]) -> StoreResult<ArchetypeId> {
        let signature = ArchetypeSignature::from_types(types);
        if let Some(&id) = self.lookup.get(&signature) {
            return Ok(id);
        }
        self.create(registry, signature)
    }

    fn create(&mut self, registry: &TypeRegistry, signature: ArchetypeSignature) -> StoreResult<ArchetypeId> {
        let infos = signature
            .types()
            .iter()
            .map(|&id| registry.info(id))
            .collect::<StoreResult<Vec<_>>>()?;
        let layout = ChunkLayout::compute(&infos, self.chunk_bytes, self.max_chunk_rows)?;

        // Archetype count is bounded by distinct type sets actually used.
        let id = ArchetypeId(self.archetypes.len() as u32);
        tracing::debug!(
            archetype = %id,
            types = signature.len(),
            capacity = layout.capacity(),
            row_stride = layout.row_stride(),
            "created archetype"
        );
        self.lookup.insert(signature.clone(), id);
        self.archetypes.push(Archetype {
            id,
            signature,
            layout: Arc::new(layout),
            chunks: Vec::new(),
        });
        Ok(id)
    }

    /// Archetype reached from `from` by adding or removing `type_id`.
    ///
    /// Adding a present type or removing an absent type returns `from`.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] for unknown types,
    /// [`StoreError::CapacityExceeded`] if the target row does not fit.
    pub fn transition(
        &mut self,
        registry: &TypeRegistry,
        from: ArchetypeId,
        type_id: ComponentTypeId,
        op: Transition,
    ) -> StoreResult<ArchetypeId> {
        if let Some(&to) = self.edges.get(&(from, type_id, op)) {
            return Ok(to);
        }
        registry.info(type_id)?;
        let source = self.archetype(from).signature();
        let signature = match op {
            Transition::Add => source.with(type_id),
            Transition::Remove => source.without(type_id),
        };
        let to = match self.lookup.get(&signature) {
            Some(&id) => id,
            None => self.create(registry, signature)?,
        };
        self.edges.insert((from, type_id, op), to);
        Ok(to)
    }

    /// Looks up an archetype.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    /// Archetype by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this graph.
    #[inline]
    #[must_use]
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    /// Mutable archetype by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this graph.
    #[inline]
    pub fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    /// Archetypes in creation order.
    #[inline]
    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Number of archetypes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Checks if no archetype exists.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Number of memoized transitions.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::ComponentDescriptor;

    fn registry_with(sizes: &[(usize, usize)]) -> (TypeRegistry, Vec<ComponentTypeId>) {
        let mut registry = TypeRegistry::new();
        let ids = sizes
            .iter()
            .enumerate()
            .map(|(i, &(size, alignment))| {
                registry
                    .register_raw(ComponentDescriptor {
                        name: format!("C{i}"),
                        size,
                        alignment,
                        enableable: false,
                    })
                    .unwrap()
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_signature_is_canonical() {
        let a = ComponentTypeId::from_raw(3);
        let b = ComponentTypeId::from_raw(1);
        let sig = ArchetypeSignature::from_types(&[a, b, a]);
        assert_eq!(sig.types(), &[b, a]);
        assert_eq!(sig, ArchetypeSignature::from_types(&[b, a]));
        assert!(sig.contains(a));
        assert_eq!(sig.without(a).types(), &[b]);
    }

    #[test]
    fn test_get_or_create_dedupes() {
        let (registry, ids) = registry_with(&[(4, 4), (12, 4)]);
        let mut graph = ArchetypeGraph::new(16 * 1024, 128);
        let a = graph.get_or_create(&registry, &[ids[0], ids[1]]).unwrap();
        let b = graph.get_or_create(&registry, &[ids[1], ids[0], ids[1]]).unwrap();
        assert_eq!(a, b);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_layout_offsets() {
        let (registry, ids) = registry_with(&[(4, 4), (16, 16), (1, 1)]);
        let mut graph = ArchetypeGraph::new(1024, 128);
        let id = graph.get_or_create(&registry, &ids).unwrap();
        let layout = graph.archetype(id).layout();

        // stride = 8 + 4 + 16 + 1 = 29; 1024 / 29 = 35 rows, but padding
        // before the 16-aligned column only leaves room for 34.
        assert_eq!(layout.row_stride(), 29);
        assert_eq!(layout.capacity(), 34);
        assert_eq!(layout.columns()[0].offset, 8 * 34);
        assert_eq!(layout.columns()[1].offset, 416);
        let last = &layout.columns()[2];
        assert!(last.offset + last.size * layout.capacity() <= layout.block_bytes());
        assert_eq!(layout.version(), LAYOUT_VERSION);
    }

    #[test]
    fn test_capacity_capped_by_max_rows() {
        let (registry, ids) = registry_with(&[(4, 4)]);
        let mut graph = ArchetypeGraph::new(16 * 1024, 128);
        let id = graph.get_or_create(&registry, &ids).unwrap();
        assert_eq!(graph.archetype(id).layout().capacity(), 128);
    }

    #[test]
    fn test_capacity_exceeded() {
        let (registry, ids) = registry_with(&[(2048, 8)]);
        let mut graph = ArchetypeGraph::new(1024, 128);
        let err = graph.get_or_create(&registry, &ids).unwrap_err();
        assert_eq!(
            err,
            StoreError::CapacityExceeded {
                row_stride: 2056,
                chunk_bytes: 1024
            }
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn test_degenerate_single_row() {
        // One row fits by stride (8 + 1 + 64 = 73 <= 96) but the 64-byte
        // aligned column ends at byte 128.
        let (registry, ids) = registry_with(&[(1, 1), (64, 64)]);
        let mut graph = ArchetypeGraph::new(96, 128);
        let id = graph.get_or_create(&registry, &ids).unwrap();
        let layout = graph.archetype(id).layout();
        assert_eq!(layout.capacity(), 1);
        assert!(layout.is_degenerate());
        assert_eq!(layout.block_bytes(), 128);
    }

    #[test]
    fn test_transitions_are_memoized() {
        let (registry, ids) = registry_with(&[(4, 4), (8, 8)]);
        let mut graph = ArchetypeGraph::new(16 * 1024, 128);
        let base = graph.get_or_create(&registry, &[ids[0]]).unwrap();
        let added = graph.transition(&registry, base, ids[1], Transition::Add).unwrap();
        assert_eq!(graph.archetype(added).types(), &[ids[0], ids[1]]);
        assert_eq!(graph.transition(&registry, base, ids[1], Transition::Add).unwrap(), added);
        assert_eq!(graph.edge_count(), 1);

        let back = graph.transition(&registry, added, ids[1], Transition::Remove).unwrap();
        assert_eq!(back, base);
        let same = graph.transition(&registry, base, ids[0], Transition::Add).unwrap();
        assert_eq!(same, base);
    }

    #[test]
    fn test_unregistered_type_fails() {
        let (registry, _) = registry_with(&[(4, 4)]);
        let mut graph = ArchetypeGraph::new(16 * 1024, 128);
        let unknown = ComponentTypeId::from_raw(99);
        assert_eq!(
            graph.get_or_create(&registry, &[unknown]),
            Err(StoreError::TypeNotRegistered { type_id: unknown })
        );
        let empty = graph.get_or_create(&registry, &[]).unwrap();
        assert!(graph.transition(&registry, empty, unknown, Transition::Add).is_err());
    }

    #[test]
    fn test_layout_is_deterministic() {
        let (registry, ids) = registry_with(&[(4, 4), (16, 8), (2, 2)]);
        let mut first = ArchetypeGraph::new(4096, 64);
        let mut second = ArchetypeGraph::new(4096, 64);
        let a = first.get_or_create(&registry, &ids).unwrap();
        let reversed: Vec<_> = ids.iter().rev().copied().collect();
        let b = second.get_or_create(&registry, &reversed).unwrap();
        assert_eq!(first.archetype(a).layout(), second.archetype(b).layout());
    }

    #[test]
    fn test_layout_serializes() {
        let (registry, ids) = registry_with(&[(4, 4)]);
        let mut graph = ArchetypeGraph::new(1024, 16);
        let id = graph.get_or_create(&registry, &ids).unwrap();
        let text = toml::to_string(graph.archetype(id).layout().as_ref()).unwrap();
        assert!(text.contains("version = 1"));
        assert!(text.contains("[[columns]]"));
    }
}
