//! The data repository: map registry, identity indexes and the pending
//! operation queue for one link.
//!
//! All mutable runtime state sits behind one lock (the master lock). Every
//! identity-index mutation and every step of submission and execution happens
//! while it is held, so cascades touching several maps never need to order
//! locks among themselves.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use datamap_core::{DataLink, Error, LinkScope, Model, NestableTransaction, Result};

use crate::collector::EntityCollector;
use crate::config::RepositoryConfig;
use crate::entity::{Entity, ErasedEntity};
use crate::identity::IdentityIndex;
use crate::map::{DataMap, MapConfig, UberMap, same_map};
use crate::meta::MetaEntity;
use crate::operation::{OperationCore, OperationKind, OperationState};

static NEXT_REPOSITORY: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Shared State
// ============================================================================

/// Everything guarded by the master lock.
#[derive(Default)]
pub(crate) struct RepositoryState {
    pub operations: Vec<Arc<OperationCore>>,
    pub maps: HashMap<TypeId, Arc<dyn UberMap>>,
    indexes: HashMap<TypeId, IdentityIndex>,
}

impl RepositoryState {
    pub(crate) fn index(&self, entity_type: TypeId) -> Option<&IdentityIndex> {
        self.indexes.get(&entity_type)
    }

    pub(crate) fn index_mut(&mut self, entity_type: TypeId) -> &mut IdentityIndex {
        self.indexes.entry(entity_type).or_default()
    }

    /// Associate `meta` with `map`, adding it to the identity index when the
    /// map tracks entities.
    pub(crate) fn attach(&mut self, map: &Arc<dyn UberMap>, meta: &Arc<MetaEntity>) -> Result<()> {
        if let Some(current) = meta.map() {
            if same_map(&current, map) {
                return Ok(());
            }
            if current.repository_id() != map.repository_id() {
                return Err(Error::ForeignRepository {
                    entity: meta.type_name(),
                });
            }
            return Err(Error::AttachedElsewhere {
                entity: meta.type_name(),
            });
        }

        meta.set_map(Some(map));
        if map.track_entities() {
            match map.identity_key(meta) {
                Ok(Some(key)) => {
                    tracing::trace!(serial = meta.serial(), key = %key, "Indexed");
                    self.index_mut(map.entity_type()).add(key, meta.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    meta.set_map(None);
                    return Err(e);
                }
            }
        }
        tracing::debug!(serial = meta.serial(), entity = meta.type_name(), "Attached");
        Ok(())
    }

    /// Remove `meta` from its identity index, drop its pending operation and
    /// forget its map and captured record.
    pub(crate) fn detach(&mut self, meta: &Arc<MetaEntity>) {
        if let Some(pending) = meta.pending() {
            self.discard_operation(pending.id, false);
        }
        if let Some(map) = meta.map() {
            let key = map.identity_key(meta).ok().flatten();
            if let Some(index) = self.indexes.get_mut(&map.entity_type()) {
                index.remove(key.as_deref(), meta);
            }
        }
        meta.reset();
        tracing::debug!(serial = meta.serial(), entity = meta.type_name(), "Detached");
    }

    /// Move `meta` from `old_key` to its current identity key.
    pub(crate) fn reindex(
        &mut self,
        map: &Arc<dyn UberMap>,
        meta: &Arc<MetaEntity>,
        old_key: Option<&str>,
    ) -> Result<()> {
        let key = map.identity_key(meta)?;
        let index = self.index_mut(map.entity_type());
        index.remove(old_key, meta);
        if let Some(key) = key {
            tracing::trace!(serial = meta.serial(), old = ?old_key, new = %key, "Reindexed");
            index.add(key, meta.clone());
        }
        Ok(())
    }

    /// Append `operation` to the queue.
    pub(crate) fn push_operation(&mut self, operation: Arc<OperationCore>) {
        self.operations.push(operation);
    }

    /// Move operation `id` to the end of the queue.
    pub(crate) fn move_to_end(&mut self, id: u64) {
        if let Some(operation) = self.remove_operation(id) {
            self.operations.push(operation);
        }
    }

    pub(crate) fn remove_operation(&mut self, id: u64) -> Option<Arc<OperationCore>> {
        let pos = self.operations.iter().position(|o| o.id == id)?;
        Some(self.operations.remove(pos))
    }

    /// Drop operation `id` from the queue without running it.
    ///
    /// With `revert`, an entity whose insert never ran goes back to
    /// `Detached`; otherwise entities return to `Ready`.
    pub(crate) fn discard_operation(&mut self, id: u64, revert: bool) {
        let Some(operation) = self.remove_operation(id) else {
            return;
        };
        operation.meta.clear_pending(operation.id);
        operation.set_state(OperationState::Discarded);
        tracing::trace!(
            id,
            kind = %operation.kind(),
            entity = operation.entity.type_name(),
            "Operation discarded"
        );
        if revert && operation.kind() == OperationKind::Insert && operation.meta.record().is_none() {
            self.detach(&operation.meta);
        }
    }

    /// Retire a replaced map: drop its operations and detach what it tracked.
    fn retire_map(&mut self, map: &Arc<dyn UberMap>) {
        let ids: Vec<u64> = self
            .operations
            .iter()
            .filter(|o| same_map(&o.map, map))
            .map(|o| o.id)
            .collect();
        for id in ids {
            self.discard_operation(id, false);
        }
        if let Some(mut index) = self.indexes.remove(&map.entity_type()) {
            for meta in index.drain() {
                meta.reset();
            }
        }
    }

    fn tracked_count(&self) -> usize {
        self.indexes.values().map(IdentityIndex::len).sum()
    }
}

/// The part of a repository shared with its maps and operations.
pub(crate) struct RepositoryCore {
    pub id: u64,
    pub link: Arc<dyn DataLink>,
    pub transaction: NestableTransaction,
    pub config: RepositoryConfig,
    pub self_ref: Weak<RepositoryCore>,
    state: Mutex<RepositoryState>,
}

impl RepositoryCore {
    fn new(link: Arc<dyn DataLink>, config: RepositoryConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| RepositoryCore {
            id: NEXT_REPOSITORY.fetch_add(1, Ordering::Relaxed),
            transaction: NestableTransaction::new(link.clone()),
            link,
            config,
            self_ref: me.clone(),
            state: Mutex::new(RepositoryState::default()),
        })
    }

    /// Take the master lock.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The map for `entity`'s type, creating a weak map if none is registered.
    pub(crate) fn locate_map(
        &self,
        state: &mut RepositoryState,
        entity: &ErasedEntity,
    ) -> Arc<dyn UberMap> {
        state
            .maps
            .entry(entity.entity_type())
            .or_insert_with(|| {
                tracing::info!(entity = entity.type_name(), "Weak map created");
                entity.inner.create_weak_map(self)
            })
            .clone()
    }

    /// Purge collected entities from every identity index.
    pub(crate) fn collect(&self) -> usize {
        let mut state = self.lock_state();
        let purged: usize = state
            .indexes
            .values_mut()
            .map(IdentityIndex::purge_collected)
            .sum();
        if purged > 0 {
            tracing::debug!(repository = self.id, purged, "Collected entities purged");
        }
        purged
    }
}

// ============================================================================
// DataRepository
// ============================================================================

/// A queued operation, as seen from outside.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// What the operation does.
    pub kind: OperationKind,
    /// The entity it applies to.
    pub entity: ErasedEntity,
}

impl PendingOperation {
    /// Whether this is a `kind` operation on `entity`.
    pub fn is<T: Model>(&self, kind: OperationKind, entity: &Entity<T>) -> bool {
        self.kind == kind && self.entity.is(entity)
    }
}

/// Debug information about repository state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDebugInfo {
    /// Repository identifier.
    pub id: u64,
    /// Registered and implicit maps.
    pub maps: usize,
    /// Of which implicit.
    pub weak_maps: usize,
    /// Entries across all identity indexes.
    pub tracked: usize,
    /// Queued operations.
    pub pending: usize,
    /// Nesting level of the transaction.
    pub transaction_level: usize,
}

/// Unit of work over one [`DataLink`].
///
/// Maps are registered with (or implicitly created by) the repository. Changes
/// are queued by submitting operations and reach the database when
/// [`submit_changes`](Self::submit_changes) or
/// [`execute_pending`](Self::execute_pending) runs the queue.
pub struct DataRepository {
    core: Arc<RepositoryCore>,
    collector: Option<EntityCollector>,
}

impl DataRepository {
    /// Create a repository with the default configuration.
    pub fn new(link: Arc<dyn DataLink>) -> Self {
        Self::with_config(link, RepositoryConfig::default())
    }

    /// Create a repository with a custom configuration.
    pub fn with_config(link: Arc<dyn DataLink>, config: RepositoryConfig) -> Self {
        let core = RepositoryCore::new(link, config);
        let collector = if core.config.collector.enabled {
            match EntityCollector::spawn(
                Arc::downgrade(&core),
                core.config.collector.effective_interval(),
            ) {
                Ok(collector) => Some(collector),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to start entity collector");
                    None
                }
            }
        } else {
            None
        };
        tracing::info!(
            repository = core.id,
            engine = %core.link.engine().name,
            collector = collector.is_some(),
            "Repository created"
        );
        Self { core, collector }
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn DataLink> {
        &self.core.link
    }

    /// The repository configuration.
    pub fn config(&self) -> &RepositoryConfig {
        &self.core.config
    }

    /// The nestable transaction wrapping the link.
    pub fn transaction(&self) -> &NestableTransaction {
        &self.core.transaction
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Register an explicit map for `T`.
    ///
    /// An implicit map for `T` is replaced, and everything it tracked is
    /// detached. A second explicit map is rejected.
    #[tracing::instrument(level = "debug", skip(self, config), fields(entity = std::any::type_name::<T>()))]
    pub fn register<T: Model>(&self, config: MapConfig<T>) -> Result<Arc<DataMap<T>>> {
        config.check()?;
        let mut state = self.core.lock_state();
        let entity_type = TypeId::of::<T>();
        if state.maps.get(&entity_type).is_some_and(|m| !m.is_weak()) {
            return Err(Error::MapAlreadyRegistered {
                entity: std::any::type_name::<T>(),
            });
        }

        let map = DataMap::create(&self.core, config, false);
        let erased: Arc<dyn UberMap> = map.clone();
        if let Some(replaced) = state.maps.insert(entity_type, erased) {
            state.retire_map(&replaced);
            tracing::info!(table = %map.table(), "Weak map replaced by explicit map");
        } else {
            tracing::info!(table = %map.table(), "Map registered");
        }
        Ok(map)
    }

    /// The map for `T`: the registered one, or an implicit map created now.
    pub fn map<T: Model>(&self) -> Result<Arc<DataMap<T>>> {
        let map = {
            let mut state = self.core.lock_state();
            state
                .maps
                .entry(TypeId::of::<T>())
                .or_insert_with(|| {
                    tracing::info!(entity = std::any::type_name::<T>(), "Weak map created");
                    DataMap::<T>::new_weak(&self.core)
                })
                .clone()
        };
        map.as_any_arc()
            .downcast::<DataMap<T>>()
            .map_err(|_| Error::NotFound {
                entity: std::any::type_name::<T>(),
                what: "map",
                name: std::any::type_name::<T>().to_string(),
            })
    }

    /// The map for `entity_type`, if one exists.
    pub fn locate_map(&self, entity_type: TypeId) -> Option<Arc<dyn UberMap>> {
        self.core.lock_state().maps.get(&entity_type).cloned()
    }

    /// Every map of this repository.
    pub fn maps(&self) -> Vec<Arc<dyn UberMap>> {
        self.core.lock_state().maps.values().cloned().collect()
    }

    // ========================================================================
    // Unit of Work
    // ========================================================================

    /// Snapshot of the queue, in execution order.
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.core
            .lock_state()
            .operations
            .iter()
            .map(|o| PendingOperation {
                kind: o.kind(),
                entity: o.entity.clone(),
            })
            .collect()
    }

    /// Number of queued operations.
    pub fn pending_len(&self) -> usize {
        self.core.lock_state().operations.len()
    }

    /// Run every queued operation in order.
    ///
    /// Each operation leaves the queue once it ran. On failure the failing
    /// operation and everything after it stay queued, and the error is
    /// returned as is.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn execute_pending(&self) -> Result<usize> {
        let start = std::time::Instant::now();
        let link = self.core.link.as_ref();
        let mut state = self.core.lock_state();
        if state.operations.is_empty() {
            return Ok(0);
        }
        tracing::info!(pending = state.operations.len(), "Executing pending operations");

        let _scope = LinkScope::enter(link)?;
        let mut executed = 0;
        while let Some(operation) = state.operations.first().cloned() {
            if let Err(e) = operation.execute(link, &mut state) {
                tracing::warn!(
                    error = %e,
                    executed,
                    remaining = state.operations.len(),
                    "Pending operation failed"
                );
                return Err(e);
            }
            state.remove_operation(operation.id);
            executed += 1;
        }

        tracing::info!(
            executed,
            elapsed_ms = start.elapsed().as_millis(),
            "Pending operations executed"
        );
        Ok(executed)
    }

    /// Run the queue inside the nestable transaction, aborting it on failure.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn submit_changes(&self) -> Result<usize> {
        let _scope = LinkScope::enter(self.core.link.as_ref())?;
        self.core.transaction.start()?;
        match self.execute_pending() {
            Ok(executed) => {
                self.core.transaction.commit()?;
                Ok(executed)
            }
            Err(e) => {
                if let Err(abort) = self.core.transaction.abort() {
                    tracing::warn!(error = %abort, "Failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    /// Empty the queue without running anything.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn discard_changes(&self) {
        let mut state = self.core.lock_state();
        let ids: Vec<u64> = state.operations.iter().map(|o| o.id).collect();
        for id in &ids {
            state.discard_operation(*id, true);
        }
        if !ids.is_empty() {
            tracing::info!(discarded = ids.len(), "Pending operations discarded");
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Purge collected entities now; returns how many entries were removed.
    pub fn collect_now(&self) -> usize {
        self.core.collect()
    }

    /// Dump repository state for debugging.
    pub fn debug_state(&self) -> RepositoryDebugInfo {
        let state = self.core.lock_state();
        RepositoryDebugInfo {
            id: self.core.id,
            maps: state.maps.len(),
            weak_maps: state.maps.values().filter(|m| m.is_weak()).count(),
            tracked: state.tracked_count(),
            pending: state.operations.len(),
            transaction_level: self.core.transaction.level(),
        }
    }
}

impl Drop for DataRepository {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.stop();
        }
        self.discard_changes();
        if self.core.transaction.is_active() {
            if let Err(e) = self.core.transaction.abort() {
                tracing::warn!(error = %e, "Failed to abort transaction on drop");
            }
        }
        tracing::debug!(repository = self.core.id, "Repository dropped");
    }
}

impl std::fmt::Debug for DataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRepository")
            .field("state", &self.debug_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Customer, Order};
    use crate::meta::EntityState;
    use datamap_core::{Command, Value};

    #[test]
    fn test_register_replaces_weak_map() {
        let link = fixtures::link();
        link.seed("customers", &[("name", "Ada".into())]).unwrap();
        let repository = DataRepository::new(link);

        let weak = repository.map::<Customer>().unwrap();
        let ada = weak.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        assert_eq!(repository.debug_state().weak_maps, 1);
        assert_eq!(repository.debug_state().tracked, 1);

        let explicit = repository.register(MapConfig::<Customer>::new()).unwrap();
        assert!(!explicit.is_weak());
        assert_eq!(ada.state(), EntityState::Detached);
        assert_eq!(repository.debug_state().weak_maps, 0);
        assert_eq!(repository.debug_state().tracked, 0);

        let again = explicit.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        assert!(!again.ptr_eq(&ada));
        assert!(Arc::ptr_eq(&repository.map::<Customer>().unwrap(), &explicit));
    }

    #[test]
    fn test_second_register_rejected() {
        let (_link, repository) = fixtures::repository();
        assert!(matches!(
            repository.register(fixtures::order_config()),
            Err(Error::MapAlreadyRegistered { .. })
        ));
        assert!(repository.locate_map(TypeId::of::<Order>()).is_some());
        assert!(repository.locate_map(TypeId::of::<Customer>()).is_none());
    }

    #[test]
    fn test_failed_execution_keeps_queue() {
        let (link, repository) = fixtures::repository();
        let orders = repository.map::<Order>().unwrap();
        let order = Entity::new(Order {
            customer: Some(Customer::named("Ada")),
            ..Order::default()
        });
        orders.insert(&order).unwrap().submit().unwrap();
        link.fail_when(|c| matches!(c, Command::Insert(i) if i.table == "orders"));

        assert!(matches!(repository.submit_changes(), Err(Error::Link { .. })));
        let pending = repository.pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is(OperationKind::Insert, &order));
        assert_eq!(link.row_count("customers"), 0);
        assert_eq!(link.log().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(repository.debug_state().transaction_level, 0);

        link.clear_failures();
        assert_eq!(repository.submit_changes().unwrap(), 1);
        assert_eq!(link.row_count("orders"), 1);
    }

    #[test]
    fn test_execute_pending_outside_transaction() {
        let (link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        customers
            .insert(&Customer::named("Ada"))
            .unwrap()
            .submit()
            .unwrap();
        assert_eq!(repository.execute_pending().unwrap(), 1);
        assert_eq!(repository.execute_pending().unwrap(), 0);
        assert!(!link.log().iter().any(|l| l == "BEGIN"));
        assert_eq!(link.row_count("customers"), 1);
    }

    #[test]
    fn test_discard_changes_reverts_inserts() {
        let (link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        let ada = Customer::named("Ada");
        customers.insert(&ada).unwrap().submit().unwrap();
        assert_eq!(ada.state(), EntityState::ToInsert);

        repository.discard_changes();
        assert_eq!(repository.pending_len(), 0);
        assert_eq!(ada.state(), EntityState::Detached);
        assert_eq!(repository.submit_changes().unwrap(), 0);
        assert_eq!(link.row_count("customers"), 0);
    }

    #[test]
    fn test_collect_now_purges_dropped_entities() {
        let link = fixtures::link();
        link.seed("customers", &[("name", "Ada".into())]).unwrap();
        link.seed("customers", &[("name", "Grace".into())]).unwrap();
        let repository = DataRepository::new(link);
        let customers = repository.map::<Customer>().unwrap();

        let mut found = customers.query(None).unwrap();
        assert_eq!(repository.debug_state().tracked, 2);
        found.truncate(1);
        assert_eq!(repository.collect_now(), 1);
        assert_eq!(repository.debug_state().tracked, 1);
        drop(found);
        assert_eq!(repository.collect_now(), 1);
        assert_eq!(repository.collect_now(), 0);
    }

    #[test]
    fn test_debug_state() {
        let (_link, repository) = fixtures::repository();
        repository.map::<Customer>().unwrap();
        let info = repository.debug_state();
        assert_eq!(info.id, repository.id());
        assert_eq!(info.maps, 2);
        assert_eq!(info.weak_maps, 1);
        assert_eq!(info.pending, 0);
        assert_eq!(info.transaction_level, 0);
        assert_eq!(repository.maps().len(), 2);
    }

    #[test]
    fn test_drop_aborts_open_transaction() {
        let (link, repository) = fixtures::repository();
        link.open().unwrap();
        repository.transaction().start().unwrap();
        repository.transaction().start().unwrap();
        assert_eq!(repository.debug_state().transaction_level, 2);
        drop(repository);
        assert_eq!(link.log().last().map(String::as_str), Some("ROLLBACK"));
    }
}
