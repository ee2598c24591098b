//! # Component Types
//!
//! Components are pure data containers with no behavior. They must be
//! plain old data so that chunk columns can be copied, zeroed and handed to
//! external serializers as raw bytes.
//!
//! The [`TypeRegistry`] assigns each component type a dense
//! [`ComponentTypeId`] together with its size and alignment. Ids are never
//! reused and the recorded layout never changes.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Maximum number of registered component types.
pub const MAX_COMPONENT_TYPES: usize = 4096;

/// Marker trait for storable components.
///
/// Components must be:
/// - `Pod`: plain old data, safe to view as bytes
/// - `Zeroable`: new columns start zero-initialized
/// - `Send + Sync`: columns are read and written from worker threads
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Position {
///     x: f32,
///     y: f32,
///     z: f32,
/// }
///
/// impl Component for Position {}
/// ```
pub trait Component: Copy + Pod + Zeroable + Send + Sync + 'static {
    /// Whether rows carry a per-row enabled bit for this type.
    const ENABLEABLE: bool = false;
}

/// Dense identifier of a registered component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    /// Returns the id as an index into per-type tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs an id from its raw value, e.g. from a persisted layout.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Layout description used to register a component type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Human readable name, used in diagnostics.
    pub name: String,
    /// Size of one value in bytes.
    pub size: usize,
    /// Alignment requirement in bytes (power of two).
    pub alignment: usize,
    /// Whether rows carry an enabled bit.
    pub enableable: bool,
}

impl ComponentDescriptor {
    /// Describes Rust type `T`.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            name: type_name::<T>().to_string(),
            size: std::mem::size_of::<T>(),
            alignment: std::mem::align_of::<T>(),
            enableable: T::ENABLEABLE,
        }
    }

    /// Describes a zero-sized tag.
    #[must_use]
    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            alignment: 1,
            enableable: false,
        }
    }

    /// Marks the described type as enableable.
    #[must_use]
    pub fn enableable(mut self) -> Self {
        self.enableable = true;
        self
    }
}

/// Registered metadata of a component type. Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentTypeInfo {
    /// Assigned id.
    pub id: ComponentTypeId,
    /// Diagnostic name.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes.
    pub alignment: usize,
    /// `size == 0`.
    pub is_zero_sized: bool,
    /// Rows carry an enabled bit.
    pub enableable: bool,
    /// Rust type behind the registration, if registered through [`Component`].
    pub rust_type: Option<TypeId>,
}

impl ComponentTypeInfo {
    /// Checks that `T` may view this type's column.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeMismatch`] when `T` is not the registered Rust type.
    pub fn check_rust_type<T: 'static>(&self) -> StoreResult<()> {
        if self.rust_type == Some(TypeId::of::<T>()) {
            return Ok(());
        }
        Err(StoreError::TypeMismatch {
            type_id: self.id,
            expected_size: self.size,
            actual_size: std::mem::size_of::<T>(),
        })
    }

    /// Checks that `bytes` holds exactly one value of this type.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeMismatch`] on a length mismatch.
    pub fn check_value_len(&self, bytes: &[u8]) -> StoreResult<()> {
        if bytes.len() == self.size {
            return Ok(());
        }
        Err(StoreError::TypeMismatch {
            type_id: self.id,
            expected_size: self.size,
            actual_size: bytes.len(),
        })
    }
}

/// Registry of component types for one store.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    infos: Vec<ComponentTypeInfo>,
    by_rust_type: HashMap<TypeId, ComponentTypeId>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`, returning the existing id if it is already known.
    ///
    /// # Errors
    ///
    /// [`StoreError::RegistryFull`] when [`MAX_COMPONENT_TYPES`] is reached.
    pub fn register<T: Component>(&mut self) -> StoreResult<ComponentTypeId> {
        let rust_type = TypeId::of::<T>();
        if let Some(&existing) = self.by_rust_type.get(&rust_type) {
            return Ok(existing);
        }
        let id = self.push(ComponentDescriptor::of::<T>(), Some(rust_type))?;
        self.by_rust_type.insert(rust_type, id);
        Ok(id)
    }

    /// Registers a type known only by its layout. Every call issues a new id.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] for a non power-of-two alignment,
    /// [`StoreError::RegistryFull`] when the registry is full.
    pub fn register_raw(&mut self, descriptor: ComponentDescriptor) -> StoreResult<ComponentTypeId> {
        if !descriptor.alignment.is_power_of_two() {
            return Err(StoreError::InvalidConfig(format!(
                "alignment of `{}` must be a power of two, got {}",
                descriptor.name, descriptor.alignment
            )));
        }
        self.push(descriptor, None)
    }

    /// Registers a zero-sized tag type.
    ///
    /// # Errors
    ///
    /// [`StoreError::RegistryFull`] when the registry is full.
    pub fn register_tag(&mut self, name: impl Into<String>) -> StoreResult<ComponentTypeId> {
        self.register_raw(ComponentDescriptor::tag(name))
    }

    fn push(
        &mut self,
        descriptor: ComponentDescriptor,
        rust_type: Option<TypeId>,
    ) -> StoreResult<ComponentTypeId> {
        if self.infos.len() >= MAX_COMPONENT_TYPES {
            return Err(StoreError::RegistryFull {
                capacity: MAX_COMPONENT_TYPES,
            });
        }
        // Bounded by MAX_COMPONENT_TYPES above.
        let id = ComponentTypeId(self.infos.len() as u32);
        tracing::debug!(
            type_id = id.raw(),
            name = %descriptor.name,
            size = descriptor.size,
            alignment = descriptor.alignment,
            "registered component type"
        );
        self.infos.push(ComponentTypeInfo {
            id,
            name: descriptor.name,
            size: descriptor.size,
            alignment: descriptor.alignment,
            is_zero_sized: descriptor.size == 0,
            enableable: descriptor.enableable,
            rust_type,
        });
        Ok(id)
    }

    /// Returns the metadata of `id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] for unknown ids.
    pub fn info(&self, id: ComponentTypeId) -> StoreResult<&ComponentTypeInfo> {
        self.infos
            .get(id.index())
            .ok_or(StoreError::TypeNotRegistered { type_id: id })
    }

    /// Returns the id registered for `T`.
    ///
    /// # Errors
    ///
    /// [`StoreError::RustTypeNotRegistered`] if `T` was never registered.
    pub fn id_of<T: 'static>(&self) -> StoreResult<ComponentTypeId> {
        self.by_rust_type
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(StoreError::RustTypeNotRegistered { name: type_name::<T>() })
    }

    /// Checks that every id in `ids` is registered.
    ///
    /// # Errors
    ///
    /// [`StoreError::TypeNotRegistered`] naming the first unknown id.
    pub fn check_all(&self, ids: &[ComponentTypeId]) -> StoreResult<()> {
        ids.iter().try_for_each(|&id| self.info(id).map(|_| ()))
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Checks if no type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Initial component values for entity creation.
///
/// Values are stored as bytes together with their type id; sizes are
/// validated against the registry when the bundle is applied.
#[derive(Clone, Debug, Default)]
pub struct ComponentBundle {
    values: Vec<(ComponentTypeId, Vec<u8>)>,
}

impl ComponentBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a typed value. A later value for the same type replaces the earlier one.
    #[must_use]
    pub fn with<T: Component>(mut self, type_id: ComponentTypeId, value: T) -> Self {
        self.insert_bytes(type_id, bytemuck::bytes_of(&value).to_vec());
        self
    }

    /// Adds a type without an explicit value; its column is zero-initialized.
    #[must_use]
    pub fn with_default(mut self, type_id: ComponentTypeId) -> Self {
        if !self.values.iter().any(|(id, _)| *id == type_id) {
            self.values.push((type_id, Vec::new()));
        }
        self
    }

    /// Adds raw bytes for a type.
    pub fn insert_bytes(&mut self, type_id: ComponentTypeId, bytes: Vec<u8>) {
        if let Some(slot) = self.values.iter_mut().find(|(id, _)| *id == type_id) {
            slot.1 = bytes;
        } else {
            self.values.push((type_id, bytes));
        }
    }

    /// Component types in this bundle, in insertion order.
    pub fn types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.values.iter().map(|(id, _)| *id)
    }

    /// Values with explicit bytes.
    pub fn values(&self) -> impl Iterator<Item = (ComponentTypeId, &[u8])> + '_ {
        self.values
            .iter()
            .filter(|(_, bytes)| !bytes.is_empty())
            .map(|(id, bytes)| (*id, bytes.as_slice()))
    }
}
