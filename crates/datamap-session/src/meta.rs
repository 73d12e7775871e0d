//! Per-entity tracking metadata.
//!
//! A [`MetaEntity`] belongs to exactly one entity allocation. It remembers the
//! map the entity is attached to, the record captured when the entity was last
//! loaded or written, the pending operation (if any) and, for `Child` members,
//! the children seen at capture time so that removals can be detected later.
//!
//! The metadata holds the entity only weakly. Once every handle is dropped the
//! state reads as [`EntityState::Collected`] and all operations degrade to
//! no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use datamap_core::{Error, Record, Result};

use crate::entity::{AnyEntity, ErasedEntity};
use crate::map::{DependencyMode, UberMap};
use crate::operation::OperationKind;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Tracking state of an entity, derived on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// The entity has been dropped.
    Collected,
    /// The entity is not attached to any map.
    Detached,
    /// An insert is pending.
    ToInsert,
    /// An update is pending.
    ToUpdate,
    /// A delete is pending.
    ToDelete,
    /// Attached with nothing pending.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRef {
    pub id: u64,
    pub kind: OperationKind,
}

#[derive(Default)]
struct MetaInner {
    map: Option<Weak<dyn UberMap>>,
    record: Option<Record>,
    to_refresh: bool,
    pending: Option<PendingRef>,
    member_childs: Vec<(String, Vec<ErasedEntity>)>,
}

/// Tracking metadata attached to one entity.
pub struct MetaEntity {
    serial: u64,
    entity: Weak<dyn AnyEntity>,
    type_name: &'static str,
    inner: Mutex<MetaInner>,
}

impl MetaEntity {
    /// The metadata of `entity`.
    ///
    /// With `create == false` this returns `None` when no metadata was ever
    /// allocated; with `create == true` it allocates on first access.
    pub fn locate(entity: &ErasedEntity, create: bool) -> Option<Arc<MetaEntity>> {
        if create {
            Some(Self::obtain(entity))
        } else {
            entity.inner.meta_slot().get().cloned()
        }
    }

    /// The metadata of `entity`, allocated on first access.
    pub(crate) fn obtain(entity: &ErasedEntity) -> Arc<MetaEntity> {
        entity
            .inner
            .meta_slot()
            .get_or_init(|| {
                let meta = Arc::new(MetaEntity {
                    serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                    entity: entity.downgrade(),
                    type_name: entity.type_name(),
                    inner: Mutex::new(MetaInner::default()),
                });
                tracing::trace!(serial = meta.serial, entity = meta.type_name, "Meta entity created");
                meta
            })
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, MetaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process-unique serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Name of the entity type, for logs.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// A strong handle to the entity, unless it was dropped.
    pub fn entity(&self) -> Option<ErasedEntity> {
        self.entity.upgrade().map(|inner| ErasedEntity { inner })
    }

    /// Whether the entity was dropped.
    pub fn is_collected(&self) -> bool {
        self.entity.strong_count() == 0
    }

    /// Current state, derived from liveness, attachment and pending operation.
    pub fn state(&self) -> EntityState {
        if self.is_collected() {
            return EntityState::Collected;
        }
        let inner = self.lock();
        if inner.map.as_ref().and_then(Weak::upgrade).is_none() {
            return EntityState::Detached;
        }
        match inner.pending {
            Some(p) => p.kind.pending_state(),
            None => EntityState::Ready,
        }
    }

    /// The map this entity is attached to.
    pub fn map(&self) -> Option<Arc<dyn UberMap>> {
        self.lock().map.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_map(&self, map: Option<&Arc<dyn UberMap>>) {
        self.lock().map = map.map(Arc::downgrade);
    }

    /// Record captured at the last load or write.
    pub fn record(&self) -> Option<Record> {
        self.lock().record.clone()
    }

    pub(crate) fn set_record(&self, record: Option<Record>) {
        self.lock().record = record;
    }

    /// Whether the next materialization of this row should reload the entity.
    pub fn to_refresh(&self) -> bool {
        self.lock().to_refresh
    }

    pub(crate) fn set_to_refresh(&self, value: bool) {
        self.lock().to_refresh = value;
    }

    pub(crate) fn pending(&self) -> Option<PendingRef> {
        self.lock().pending
    }

    pub(crate) fn set_pending(&self, pending: PendingRef) {
        self.lock().pending = Some(pending);
    }

    /// Clear the pending reference if it still points at operation `id`.
    pub(crate) fn clear_pending(&self, id: u64) {
        let mut inner = self.lock();
        if inner.pending.is_some_and(|p| p.id == id) {
            inner.pending = None;
        }
    }

    /// Forget map, record and snapshots.
    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        inner.map = None;
        inner.record = None;
        inner.to_refresh = false;
        inner.pending = None;
        inner.member_childs.clear();
    }

    /// Columns whose current member values differ from the captured record.
    ///
    /// Returns `Ok(None)` when nothing changed or the entity was collected.
    /// Without a captured record every written column counts as changed.
    pub fn get_record_changes(&self) -> Result<Option<Record>> {
        let Some(entity) = self.entity() else {
            return Ok(None);
        };
        let map = self.map().ok_or(Error::NotAttached {
            entity: self.type_name,
        })?;
        let captured = self.record();
        let mut current = match &captured {
            Some(record) => record.clone(),
            None => map.new_record()?,
        };
        map.write_record_any(&entity, &mut current)?;
        Ok(match captured {
            Some(captured) => current.changes(&captured),
            None => Some(current),
        })
    }

    /// Current dependencies of the given mode, flattened over all members.
    pub fn get_dependencies(&self, mode: DependencyMode) -> Vec<ErasedEntity> {
        let (Some(entity), Some(map)) = (self.entity(), self.map()) else {
            return Vec::new();
        };
        map.dependencies_any(&entity, mode)
            .into_iter()
            .flat_map(|(_, deps)| deps)
            .collect()
    }

    /// Snapshot the current children of every `Child` member.
    pub fn capture_member_childs(&self) {
        let (Some(entity), Some(map)) = (self.entity(), self.map()) else {
            return;
        };
        let snapshot = map.dependencies_any(&entity, DependencyMode::Child);
        self.lock().member_childs = snapshot;
    }

    /// Children present at the last capture but missing now.
    pub fn get_removed_childs(&self) -> Vec<ErasedEntity> {
        let (Some(entity), Some(map)) = (self.entity(), self.map()) else {
            return Vec::new();
        };
        let current = map.dependencies_any(&entity, DependencyMode::Child);
        let captured = self.lock().member_childs.clone();
        let mut removed: Vec<ErasedEntity> = Vec::new();
        for (member, before) in captured {
            let now = current
                .iter()
                .find(|(name, _)| *name == member)
                .map(|(_, childs)| childs.as_slice())
                .unwrap_or_default();
            for child in before {
                let still_there = now.iter().any(|c| c.ptr_eq(&child));
                if !still_there && !removed.iter().any(|r| r.ptr_eq(&child)) {
                    removed.push(child);
                }
            }
        }
        removed
    }
}

impl std::fmt::Debug for MetaEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaEntity")
            .field("serial", &self.serial)
            .field("type", &self.type_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::fixtures::{self, Customer, Order, OrderLine};
    use datamap_core::Value;

    #[test]
    fn test_locate_without_create_is_none() {
        let entity = Customer::named("Ada");
        assert!(MetaEntity::locate(&entity.erase(), false).is_none());
        assert_eq!(entity.state(), EntityState::Detached);

        let created = MetaEntity::locate(&entity.erase(), true).unwrap();
        let again = MetaEntity::locate(&entity.erase(), false).unwrap();
        assert!(Arc::ptr_eq(&created, &again));
    }

    #[test]
    fn test_state_follows_lifecycle() {
        let (_link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        let customer = Customer::named("Ada");
        let meta = MetaEntity::obtain(&customer.erase());
        assert_eq!(meta.state(), EntityState::Detached);

        let insert = customers.insert(&customer).unwrap();
        insert.submit().unwrap();
        assert_eq!(meta.state(), EntityState::ToInsert);

        repository.submit_changes().unwrap();
        assert_eq!(meta.state(), EntityState::Ready);
        assert!(meta.record().is_some());

        drop(customer);
        assert_eq!(meta.state(), EntityState::Collected);
        assert!(meta.get_record_changes().unwrap().is_none());
    }

    #[test]
    fn test_record_changes_single_column() {
        let (_link, repository) = fixtures::repository();
        let lines = repository.map::<OrderLine>().unwrap();
        let line = OrderLine::of("tea", 1);
        lines.insert(&line).unwrap().submit().unwrap();
        repository.submit_changes().unwrap();

        let meta = line.meta().unwrap();
        assert!(meta.get_record_changes().unwrap().is_none());

        line.write().quantity = 3;
        let changes = meta.get_record_changes().unwrap().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.get_named("quantity"), Some(&Value::BigInt(3)));
    }

    #[test]
    fn test_detached_changes_error() {
        let entity = Customer::named("Ada");
        let meta = MetaEntity::obtain(&entity.erase());
        assert!(matches!(
            meta.get_record_changes(),
            Err(Error::NotAttached { .. })
        ));
    }

    #[test]
    fn test_removed_childs_detected() {
        let (_link, repository) = fixtures::repository();
        let orders = repository.map::<Order>().unwrap();
        let kept = OrderLine::of("tea", 1);
        let removed = OrderLine::of("milk", 2);
        let order = Entity::new(Order {
            note: "weekly".to_string(),
            lines: vec![kept.clone(), removed.clone()],
            ..Order::default()
        });
        orders.insert(&order).unwrap().submit().unwrap();
        repository.submit_changes().unwrap();

        let meta = order.meta().unwrap();
        assert!(meta.get_removed_childs().is_empty());

        order.write().lines.retain(|l| !l.ptr_eq(&removed));
        let gone = meta.get_removed_childs();
        assert_eq!(gone.len(), 1);
        assert!(gone[0].is(&removed));
        assert_eq!(meta.get_dependencies(DependencyMode::Child).len(), 1);
    }
}
