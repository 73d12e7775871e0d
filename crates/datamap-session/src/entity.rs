//! Shared entity handles.
//!
//! An [`Entity<T>`] is a cheap, clonable handle to one domain object. Identity
//! is reference identity: two handles denote the same entity only when they
//! point at the same allocation. Each allocation carries a slot for its
//! [`MetaEntity`], created on first use and never replaced.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use datamap_core::Model;

use crate::map::{DataMap, UberMap};
use crate::meta::{EntityState, MetaEntity};
use crate::repository::RepositoryCore;

/// Type-erased view of an entity allocation.
pub(crate) trait AnyEntity: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn meta_slot(&self) -> &OnceLock<Arc<MetaEntity>>;

    fn entity_type(&self) -> TypeId;

    fn type_name(&self) -> &'static str;

    /// Build an implicit map for this entity's type.
    fn create_weak_map(&self, repository: &RepositoryCore) -> Arc<dyn UberMap>;
}

pub(crate) struct EntityCell<T> {
    value: RwLock<T>,
    meta: OnceLock<Arc<MetaEntity>>,
}

impl<T: Model> AnyEntity for EntityCell<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn meta_slot(&self) -> &OnceLock<Arc<MetaEntity>> {
        &self.meta
    }

    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn create_weak_map(&self, repository: &RepositoryCore) -> Arc<dyn UberMap> {
        DataMap::<T>::new_weak(repository)
    }
}

/// Handle to a mapped domain object.
pub struct Entity<T: Model> {
    cell: Arc<EntityCell<T>>,
}

impl<T: Model> Entity<T> {
    /// Wrap a value into a new, untracked entity.
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                value: RwLock::new(value),
                meta: OnceLock::new(),
            }),
        }
    }

    /// Shared access to the value.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.value.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclusive access to the value.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.value.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether both handles denote the same entity.
    pub fn ptr_eq(&self, other: &Entity<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Type-erased handle to the same entity.
    pub fn erase(&self) -> ErasedEntity {
        ErasedEntity {
            inner: self.cell.clone(),
        }
    }

    /// Tracking metadata, if any was ever created.
    pub fn meta(&self) -> Option<Arc<MetaEntity>> {
        MetaEntity::locate(&self.erase(), false)
    }

    /// Current tracking state.
    pub fn state(&self) -> EntityState {
        self.meta().map_or(EntityState::Detached, |m| m.state())
    }
}

impl<T: Model> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Model + fmt::Debug> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Entity").field(&*self.read()).finish()
    }
}

/// Handle to an entity of any mapped type.
#[derive(Clone)]
pub struct ErasedEntity {
    pub(crate) inner: Arc<dyn AnyEntity>,
}

impl ErasedEntity {
    /// Whether both handles denote the same entity.
    pub fn ptr_eq(&self, other: &ErasedEntity) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }

    /// Whether this handle denotes `entity`.
    pub fn is<T: Model>(&self, entity: &Entity<T>) -> bool {
        self.ptr_eq(&entity.erase())
    }

    /// Type of the mapped value.
    pub fn entity_type(&self) -> TypeId {
        self.inner.entity_type()
    }

    /// Name of the mapped type, for logs.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    /// Recover the typed handle.
    pub fn downcast<T: Model>(&self) -> Option<Entity<T>> {
        self.inner
            .clone()
            .into_any()
            .downcast::<EntityCell<T>>()
            .ok()
            .map(|cell| Entity { cell })
    }

    /// Tracking metadata, if any was ever created.
    pub fn meta(&self) -> Option<Arc<MetaEntity>> {
        MetaEntity::locate(self, false)
    }

    /// Current tracking state.
    pub fn state(&self) -> EntityState {
        self.meta().map_or(EntityState::Detached, |m| m.state())
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn AnyEntity> {
        Arc::downgrade(&self.inner)
    }

    /// Run `f` with shared access to the typed value.
    pub(crate) fn with_value<T: Model, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let cell = self.inner.as_any().downcast_ref::<EntityCell<T>>()?;
        let guard = cell.value.read().unwrap_or_else(|e| e.into_inner());
        Some(f(&guard))
    }

    /// Run `f` with exclusive access to the typed value.
    pub(crate) fn with_value_mut<T: Model, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let cell = self.inner.as_any().downcast_ref::<EntityCell<T>>()?;
        let mut guard = cell.value.write().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut guard))
    }
}

impl fmt::Debug for ErasedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedEntity")
            .field("type", &self.type_name())
            .field("ptr", &Arc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

impl<T: Model> From<&Entity<T>> for ErasedEntity {
    fn from(entity: &Entity<T>) -> Self {
        entity.erase()
    }
}
