//! # Queries
//!
//! A query selects archetypes by required, excluded and optional component
//! types. Matches are cached per query and extended incrementally as the
//! archetype graph grows, so building a query once and iterating it every
//! frame costs one scan of each new archetype.
//!
//! Per-chunk filtering happens at iteration time:
//! - changed-since: skips whole chunks whose listed columns were not
//!   written after a baseline tick
//! - enabled: skips rows whose required enableable components are disabled,
//!   short-circuiting to whole-chunk include/skip when the masks are uniform

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::archetype::{Archetype, ArchetypeGraph, ArchetypeId};
use super::component::{ComponentTypeId, TypeRegistry};
use crate::error::{StoreError, StoreResult};
use crate::memory::{Chunk, RowMask};

/// Identifier of a built query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(u32);

impl QueryId {
    /// Reconstructs an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query{}", self.0)
    }
}

/// Archetype filter by component types.
///
/// ```rust,ignore
/// let moving = QueryDesc::new().with(position).with(velocity).without(frozen);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct QueryDesc {
    required: Vec<ComponentTypeId>,
    excluded: Vec<ComponentTypeId>,
    optional: Vec<ComponentTypeId>,
}

fn insert_sorted(list: &mut Vec<ComponentTypeId>, type_id: ComponentTypeId) {
    if let Err(pos) = list.binary_search(&type_id) {
        list.insert(pos, type_id);
    }
}

impl QueryDesc {
    /// Matches every archetype.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `type_id`.
    #[must_use]
    pub fn with(mut self, type_id: ComponentTypeId) -> Self {
        insert_sorted(&mut self.required, type_id);
        self
    }

    /// Excludes archetypes with `type_id`.
    #[must_use]
    pub fn without(mut self, type_id: ComponentTypeId) -> Self {
        insert_sorted(&mut self.excluded, type_id);
        self
    }

    /// Reads `type_id` where present without requiring it.
    #[must_use]
    pub fn optional(mut self, type_id: ComponentTypeId) -> Self {
        insert_sorted(&mut self.optional, type_id);
        self
    }

    /// Required types.
    #[must_use]
    pub fn required(&self) -> &[ComponentTypeId] {
        &self.required
    }

    /// Excluded types.
    #[must_use]
    pub fn excluded(&self) -> &[ComponentTypeId] {
        &self.excluded
    }

    /// Optional types.
    #[must_use]
    pub fn optional_types(&self) -> &[ComponentTypeId] {
        &self.optional
    }

    /// Types whose columns iteration may read: required then optional.
    pub fn accessed(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.required.iter().chain(&self.optional).copied()
    }

    /// Checks whether an archetype matches.
    #[must_use]
    pub fn matches(&self, archetype: &Archetype) -> bool {
        self.required.iter().all(|&t| archetype.contains(t))
            && !self.excluded.iter().any(|&t| archetype.contains(t))
    }
}

/// Per-chunk iteration filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkFilter {
    changed: Option<(Vec<ComponentTypeId>, u64)>,
    enabled: bool,
}

impl ChunkFilter {
    /// Yields every matching chunk, every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Skips chunks where none of `types` was written after `baseline`.
    #[must_use]
    pub fn changed_since(mut self, types: &[ComponentTypeId], baseline: u64) -> Self {
        self.changed = Some((types.to_vec(), baseline));
        self
    }

    /// Skips rows whose required enableable components are disabled.
    #[must_use]
    pub fn enabled_only(mut self) -> Self {
        self.enabled = true;
        self
    }

    /// Changed-since filter, if set.
    #[must_use]
    pub fn changed(&self) -> Option<(&[ComponentTypeId], u64)> {
        self.changed.as_ref().map(|(types, baseline)| (types.as_slice(), *baseline))
    }

    /// Whether the enabled filter is on.
    #[must_use]
    pub fn respects_enabled(&self) -> bool {
        self.enabled
    }
}

/// Outcome of filtering one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkSelection {
    /// Nothing in the chunk passes.
    Skip,
    /// Every occupied row passes.
    All,
    /// Only the set rows pass.
    Rows(RowMask),
}

/// Applies `filter` to `chunk` for a query requiring `required`.
#[must_use]
pub fn select_rows(chunk: &Chunk, required: &[ComponentTypeId], filter: &ChunkFilter) -> ChunkSelection {
    let len = chunk.len();
    if len == 0 {
        return ChunkSelection::Skip;
    }

    if let Some((types, baseline)) = filter.changed() {
        let touched = types
            .iter()
            .filter_map(|&t| chunk.column_index(t))
            .any(|column| chunk.version(column) > baseline);
        if !touched {
            return ChunkSelection::Skip;
        }
    }

    if !filter.respects_enabled() {
        return ChunkSelection::All;
    }

    let mut rows: Option<RowMask> = None;
    for &type_id in required {
        let Some(mask) = chunk.column_index(type_id).and_then(|c| chunk.enabled_mask(c)) else {
            continue;
        };
        match mask.uniform(len) {
            Some(true) => {}
            Some(false) => return ChunkSelection::Skip,
            None => match rows.as_mut() {
                Some(rows) => rows.and_with(mask),
                None => rows = Some(mask.clone()),
            },
        }
    }

    match rows {
        None => ChunkSelection::All,
        Some(rows) => match rows.uniform(len) {
            Some(true) => ChunkSelection::All,
            Some(false) => ChunkSelection::Skip,
            None => ChunkSelection::Rows(rows),
        },
    }
}

#[derive(Debug, Default)]
struct MatchCache {
    /// Archetypes already examined, as a prefix of creation order.
    seen: usize,
    archetypes: Vec<ArchetypeId>,
}

#[derive(Debug)]
struct QueryState {
    desc: QueryDesc,
    cache: Mutex<MatchCache>,
}

#[derive(Debug, Default)]
struct Queries {
    states: Vec<Arc<QueryState>>,
    by_desc: HashMap<QueryDesc, QueryId>,
}

/// Built queries and their archetype match caches.
#[derive(Debug, Default)]
pub struct QueryEngine {
    queries: RwLock<Queries>,
}

impl QueryEngine {
    /// Creates an engine with no queries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a query. Identical descriptions share one id.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] if any listed type is unknown.
    pub fn build(&self, registry: &TypeRegistry, desc: QueryDesc) -> StoreResult<QueryId> {
        registry.check_all(desc.required())?;
        registry.check_all(desc.excluded())?;
        registry.check_all(desc.optional_types())?;

        let mut queries = self.queries.write();
        if let Some(&id) = queries.by_desc.get(&desc) {
            return Ok(id);
        }
        // Query count is bounded by distinct descriptions actually built.
        let id = QueryId(queries.states.len() as u32);
        queries.states.push(Arc::new(QueryState {
            desc: desc.clone(),
            cache: Mutex::new(MatchCache::default()),
        }));
        queries.by_desc.insert(desc, id);
        tracing::debug!(query = %id, "built query");
        Ok(id)
    }

    fn state(&self, id: QueryId) -> StoreResult<Arc<QueryState>> {
        self.queries
            .read()
            .states
            .get(id.0 as usize)
            .cloned()
            .ok_or(StoreError::UnknownQuery(id))
    }

    /// Description of a built query.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`] for ids this engine never issued.
    pub fn desc(&self, id: QueryId) -> StoreResult<QueryDesc> {
        Ok(self.state(id)?.desc.clone())
    }

    /// Matching archetypes in creation order, refreshing the cache with
    /// archetypes created since the last call.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownQuery`] for ids this engine never issued.
    pub fn matching(&self, id: QueryId, graph: &ArchetypeGraph) -> StoreResult<Vec<ArchetypeId>> {
        let state = self.state(id)?;
        let mut cache = state.cache.lock();
        let archetypes = graph.archetypes();
        if cache.seen < archetypes.len() {
            let fresh = archetypes[cache.seen..]
                .iter()
                .filter(|a| state.desc.matches(a))
                .map(Archetype::id);
            cache.archetypes.extend(fresh);
            cache.seen = archetypes.len();
        }
        Ok(cache.archetypes.clone())
    }

    /// Number of built queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.read().states.len()
    }

    /// Checks if no query was built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
