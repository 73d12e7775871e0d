//! Pending insert, update and delete operations.
//!
//! A [`MetaOperation<T>`] is created by a map and does nothing until it is
//! submitted. Submission runs the dependency cascade (see the `cascade`
//! module) and places the operation in the repository's queue. Execution
//! happens when the repository flushes that queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use datamap_core::{Command, DataLink, Error, Model, Result};

use crate::cascade;
use crate::entity::{Entity, ErasedEntity};
use crate::map::{UberMap, overlay};
use crate::meta::{EntityState, MetaEntity};
use crate::repository::{RepositoryCore, RepositoryState};

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

/// What an operation does to its entity's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// State of an entity while an operation of this kind is pending.
    pub(crate) fn pending_state(self) -> EntityState {
        match self {
            OperationKind::Insert => EntityState::ToInsert,
            OperationKind::Update => EntityState::ToUpdate,
            OperationKind::Delete => EntityState::ToDelete,
        }
    }

    /// Lower-case name, for logs and errors.
    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Created and not yet queued.
    Created,
    /// Queued in the repository.
    Submitted,
    /// Sent to the link.
    Executed,
    /// Removed from the queue without running; may be submitted again.
    Discarded,
}

/// The shared part of an operation, referenced from the repository queue.
pub(crate) struct OperationCore {
    pub id: u64,
    kind: Mutex<OperationKind>,
    pub entity: ErasedEntity,
    pub meta: Arc<MetaEntity>,
    pub map: Arc<dyn UberMap>,
    state: Mutex<OperationState>,
}

impl OperationCore {
    pub(crate) fn new(kind: OperationKind, entity: ErasedEntity, map: Arc<dyn UberMap>) -> Arc<Self> {
        let meta = MetaEntity::obtain(&entity);
        Arc::new(Self {
            id: NEXT_OPERATION.fetch_add(1, Ordering::Relaxed),
            kind: Mutex::new(kind),
            entity,
            meta,
            map,
            state: Mutex::new(OperationState::Created),
        })
    }

    pub(crate) fn kind(&self) -> OperationKind {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turn a queued operation into another kind; only the cascade does this.
    pub(crate) fn set_kind(&self, kind: OperationKind) {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    pub(crate) fn state(&self) -> OperationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: OperationState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run the operation against `link`.
    ///
    /// Must be called with the repository state locked; the identity index is
    /// updated to reflect the outcome.
    #[tracing::instrument(
        level = "debug",
        skip(self, link, state),
        fields(id = self.id, kind = %self.kind(), entity = self.entity.type_name())
    )]
    pub(crate) fn execute(&self, link: &dyn DataLink, state: &mut RepositoryState) -> Result<()> {
        match self.kind() {
            OperationKind::Insert => {
                let old_key = self.map.identity_key(&self.meta).ok().flatten();
                let Some(command) = self.map.generate_insert(&self.meta)? else {
                    return self.finish_without_write();
                };
                tracing::debug!(command = %Command::Insert(command.clone()).trace_string(), "Execute");
                let row = link.insert(&command)?;
                self.complete_write(state, link, row, old_key)?;
            }
            OperationKind::Update => {
                let Some(command) = self.map.generate_update(&self.meta)? else {
                    tracing::debug!("No changes to update");
                    return self.finish_without_write();
                };
                self.map.validate_row_version(&self.meta, link)?;
                let old_key = self.map.identity_key(&self.meta).ok().flatten();
                tracing::debug!(command = %Command::Update(command.clone()).trace_string(), "Execute");
                let row = link.update(&command)?;
                self.complete_write(state, link, row, old_key)?;
            }
            OperationKind::Delete => {
                let Some(command) = self.map.generate_delete(&self.meta)? else {
                    return self.finish_without_write();
                };
                self.map.validate_row_version(&self.meta, link)?;
                tracing::debug!(command = %Command::Delete(command.clone()).trace_string(), "Execute");
                let affected = link.delete(&command)?;
                tracing::trace!(affected, "Deleted");
                self.meta.clear_pending(self.id);
                state.detach(&self.meta);
            }
        }
        self.set_state(OperationState::Executed);
        Ok(())
    }

    fn finish_without_write(&self) -> Result<()> {
        self.meta.capture_member_childs();
        self.meta.clear_pending(self.id);
        self.set_state(OperationState::Executed);
        Ok(())
    }

    /// Re-hydrate the entity from the persisted row and move it to its new
    /// place in the identity index.
    ///
    /// Columns no member writes keep their captured values unless the link
    /// reports the row.
    fn complete_write(
        &self,
        state: &mut RepositoryState,
        link: &dyn DataLink,
        row: Option<datamap_core::Record>,
        old_key: Option<String>,
    ) -> Result<()> {
        let mut record = match self.meta.record() {
            Some(captured) => captured,
            None => self.map.new_record()?,
        };
        self.map.write_record_any(&self.entity, &mut record)?;
        let row = match row {
            Some(row) => Some(row),
            None => self.map.reread_versioned(&record, link)?,
        };
        if let Some(row) = row {
            overlay(&mut record, &row);
            self.map.load_entity_any(&record, &self.entity)?;
        }
        self.meta.set_record(Some(record));
        if self.map.track_entities() {
            state.reindex(&self.map, &self.meta, old_key.as_deref())?;
        }
        self.meta.set_to_refresh(true);
        self.meta.capture_member_childs();
        self.meta.clear_pending(self.id);
        Ok(())
    }
}

impl fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("entity", &self.entity.type_name())
            .field("state", &self.state())
            .finish()
    }
}

/// A pending change to one entity.
pub struct MetaOperation<T: Model> {
    core: Arc<OperationCore>,
    entity: Entity<T>,
    repository: Weak<RepositoryCore>,
}

impl<T: Model> MetaOperation<T> {
    pub(crate) fn new(
        kind: OperationKind,
        entity: &Entity<T>,
        map: Arc<dyn UberMap>,
        repository: Weak<RepositoryCore>,
    ) -> Self {
        Self {
            core: OperationCore::new(kind, entity.erase(), map),
            entity: entity.clone(),
            repository,
        }
    }

    /// What this operation does.
    pub fn kind(&self) -> OperationKind {
        self.core.kind()
    }

    /// Where the operation is in its lifecycle.
    pub fn state(&self) -> OperationState {
        self.core.state()
    }

    /// Whether the operation is queued or already ran.
    pub fn is_submitted(&self) -> bool {
        matches!(
            self.core.state(),
            OperationState::Submitted | OperationState::Executed
        )
    }

    /// The target entity.
    pub fn entity(&self) -> &Entity<T> {
        &self.entity
    }

    /// Queue the operation, cascading to the entities it depends on.
    ///
    /// Fails if the operation was already submitted.
    pub fn submit(&self) -> Result<()> {
        let repository = self.repository.upgrade().ok_or(Error::Disposed)?;
        let mut state = repository.lock_state();
        cascade::submit(&repository, &mut state, &self.core)
    }

    /// Remove the operation from the queue without running it.
    pub fn discard(&self) -> Result<()> {
        let repository = self.repository.upgrade().ok_or(Error::Disposed)?;
        let mut state = repository.lock_state();
        match self.core.state() {
            OperationState::Submitted => {
                state.discard_operation(self.core.id, true);
            }
            OperationState::Created => self.core.set_state(OperationState::Discarded),
            OperationState::Executed | OperationState::Discarded => {}
        }
        Ok(())
    }
}

impl<T: Model> fmt::Debug for MetaOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Customer};
    use crate::map::MapConfig;
    use crate::repository::DataRepository;
    use datamap_core::{
        DeleteCommand, EngineInfo, InsertCommand, Predicate, QueryCommand, Record, RecordSet,
        UpdateCommand, Value,
    };

    /// A memory link that never reports the rows it updated.
    struct SilentUpdates(Arc<datamap_memory::MemoryLink>);

    impl DataLink for SilentUpdates {
        fn engine(&self) -> &EngineInfo {
            self.0.engine()
        }

        fn open(&self) -> Result<()> {
            self.0.open()
        }

        fn close(&self) -> Result<()> {
            self.0.close()
        }

        fn is_open(&self) -> bool {
            self.0.is_open()
        }

        fn query(&self, command: &QueryCommand) -> Result<RecordSet> {
            self.0.query(command)
        }

        fn insert(&self, command: &InsertCommand) -> Result<Option<Record>> {
            self.0.insert(command)
        }

        fn update(&self, command: &UpdateCommand) -> Result<Option<Record>> {
            self.0.update(command).map(|_| None)
        }

        fn delete(&self, command: &DeleteCommand) -> Result<u64> {
            self.0.delete(command)
        }

        fn begin(&self) -> Result<()> {
            self.0.begin()
        }

        fn commit(&self) -> Result<()> {
            self.0.commit()
        }

        fn rollback(&self) -> Result<()> {
            self.0.rollback()
        }
    }

    fn versioned(config: MapConfig<Customer>) -> (Arc<datamap_memory::MemoryLink>, DataRepository) {
        let link = fixtures::link();
        link.seed("customers", &[("name", "Ada".into())]).unwrap();
        let repository = DataRepository::new(link.clone());
        repository.register(config).unwrap();
        (link, repository)
    }

    fn writes(link: &datamap_memory::MemoryLink) -> Vec<String> {
        link.log()
            .into_iter()
            .filter(|l| !l.starts_with("SELECT") && l != "BEGIN" && l != "COMMIT" && l != "ROLLBACK")
            .collect()
    }

    #[test]
    fn test_double_submit_rejected() {
        let (_link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        let ada = Customer::named("Ada");
        let insert = customers.insert(&ada).unwrap();
        assert_eq!(insert.state(), OperationState::Created);

        insert.submit().unwrap();
        assert!(insert.is_submitted());
        assert!(matches!(
            insert.submit(),
            Err(Error::AlreadySubmitted { operation: "insert", .. })
        ));

        insert.discard().unwrap();
        assert_eq!(insert.state(), OperationState::Discarded);
        assert_eq!(ada.state(), EntityState::Detached);
        assert_eq!(repository.pending_len(), 0);

        insert.submit().unwrap();
        assert_eq!(repository.pending_len(), 1);
        assert_eq!(ada.state(), EntityState::ToInsert);
    }

    #[test]
    fn test_update_requires_attachment() {
        let (_link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        let ada = Customer::named("Ada");
        assert!(matches!(
            customers.update(&ada).unwrap().submit(),
            Err(Error::NotAttached { .. })
        ));
        assert!(matches!(
            customers.delete(&ada).unwrap().submit(),
            Err(Error::NotAttached { .. })
        ));
        assert_eq!(repository.pending_len(), 0);
    }

    #[test]
    fn test_insert_loads_generated_identity() {
        let (link, repository) = fixtures::repository();
        let customers = repository.map::<Customer>().unwrap();
        let ada = Customer::named("Ada");
        let insert = customers.insert(&ada).unwrap();
        insert.submit().unwrap();
        assert_eq!(repository.execute_pending().unwrap(), 1);

        assert_eq!(insert.state(), OperationState::Executed);
        assert_eq!(ada.read().id, Some(1));
        assert_eq!(ada.state(), EntityState::Ready);

        link.clear_log();
        let found = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        assert!(found.ptr_eq(&ada));
        assert!(link.log().is_empty());
    }

    #[test]
    fn test_update_without_changes_sends_nothing() {
        let (link, repository) = versioned(MapConfig::new().version_column("row_version"));
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();

        let update = customers.update(&ada).unwrap();
        update.submit().unwrap();
        link.clear_log();
        repository.execute_pending().unwrap();

        assert_eq!(update.state(), OperationState::Executed);
        assert!(writes(&link).is_empty());
        assert_eq!(ada.state(), EntityState::Ready);
    }

    #[test]
    fn test_version_mismatch_blocks_update() {
        let (link, repository) = versioned(MapConfig::new().version_column("row_version"));
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        link.modify("customers", &Predicate::eq("id", 1i64), &[("name", "Ada B.".into())])
            .unwrap();

        ada.write().name = "Ada L.".into();
        customers.update(&ada).unwrap().submit().unwrap();
        link.clear_log();

        let err = repository.submit_changes().unwrap_err();
        match err {
            Error::Changed {
                column,
                expected,
                found,
                ..
            } => {
                assert_eq!(column, "row_version");
                assert_eq!(expected, "1");
                assert_eq!(found, "2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(writes(&link).is_empty());
        assert_eq!(repository.pending_len(), 1);
        assert_eq!(link.rows("customers")[0].get_named("name"), Some(&Value::Text("Ada B.".into())));
    }

    #[test]
    fn test_custom_stringifier_decides_equality() {
        let (link, repository) = versioned(
            MapConfig::new().version_column_with("row_version", |_: &Value| "any".to_string()),
        );
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        link.modify("customers", &Predicate::eq("id", 1i64), &[("name", "Ada B.".into())])
            .unwrap();

        ada.write().name = "Ada L.".into();
        customers.update(&ada).unwrap().submit().unwrap();
        repository.submit_changes().unwrap();
        assert_eq!(link.rows("customers")[0].get_named("name"), Some(&Value::Text("Ada L.".into())));
        assert_eq!(link.rows("customers")[0].get_named("row_version"), Some(&Value::BigInt(3)));
    }

    #[test]
    fn test_deleted_row_fails_version_check() {
        let (link, repository) = versioned(MapConfig::new().version_column("row_version"));
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();
        link.modify("customers", &Predicate::eq("id", 1i64), &[("id", Value::BigInt(5))])
            .unwrap();

        customers.delete(&ada).unwrap().submit().unwrap();
        assert!(matches!(
            repository.execute_pending(),
            Err(Error::Changed { found, .. }) if found == "<missing>"
        ));
    }

    #[test]
    fn test_delete_detaches_entity() {
        let (link, repository) = versioned(MapConfig::new());
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();

        customers.delete(&ada).unwrap().submit().unwrap();
        assert_eq!(ada.state(), EntityState::ToDelete);
        repository.submit_changes().unwrap();

        assert_eq!(ada.state(), EntityState::Detached);
        assert_eq!(link.row_count("customers"), 0);
        assert_eq!(repository.debug_state().tracked, 0);
    }

    #[test]
    fn test_unreported_update_keeps_captured_version() {
        let link = fixtures::link();
        link.seed("customers", &[("name", "Ada".into())]).unwrap();
        let repository = DataRepository::new(Arc::new(SilentUpdates(link.clone())));
        repository
            .register(MapConfig::<Customer>::new().version_column("row_version"))
            .unwrap();
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();

        ada.write().name = "B".into();
        customers.update(&ada).unwrap().submit().unwrap();
        repository.submit_changes().unwrap();
        let captured = ada.meta().unwrap().record().unwrap();
        assert_eq!(captured.get_named("id"), Some(&Value::BigInt(1)));
        assert_eq!(captured.get_named("row_version"), Some(&Value::BigInt(2)));

        ada.write().name = "C".into();
        customers.update(&ada).unwrap().submit().unwrap();
        repository.submit_changes().unwrap();
        let row = &link.rows("customers")[0];
        assert_eq!(row.get_named("name"), Some(&Value::Text("C".into())));
        assert_eq!(row.get_named("row_version"), Some(&Value::BigInt(3)));
    }

    #[test]
    fn test_unreported_update_without_version_keeps_captured_columns() {
        let link = fixtures::link();
        link.seed("customers", &[("name", "Ada".into())]).unwrap();
        let repository = DataRepository::new(Arc::new(SilentUpdates(link.clone())));
        let customers = repository.map::<Customer>().unwrap();
        let ada = customers.find_now(&[Value::BigInt(1)]).unwrap().unwrap();

        ada.write().name = "B".into();
        customers.update(&ada).unwrap().submit().unwrap();
        link.clear_log();
        repository.submit_changes().unwrap();
        assert!(!link.log().iter().any(|l| l.starts_with("SELECT")));
        let captured = ada.meta().unwrap().record().unwrap();
        assert_eq!(captured.get_named("row_version"), Some(&Value::BigInt(1)));
        assert_eq!(captured.get_named("name"), Some(&Value::Text("B".into())));
    }
}
