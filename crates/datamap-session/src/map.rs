//! Data maps: type-to-table bindings and the runtime entity operations.
//!
//! A [`DataMap<T>`] binds one [`Model`] type to one table. Its structural
//! configuration is a [`MapConfig<T>`]; on first use the map validates itself
//! against the live table schema, resolving every column to a pair of accessor
//! closures, and from then on the structure is frozen.
//!
//! The repository talks to maps through the object-safe [`UberMap`] trait,
//! which lets the cascade engine operate on entities of any mapped type.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use datamap_core::{
    DataLink, DeleteCommand, Error, InsertCommand, LinkScope, Model, Predicate, QueryCommand,
    Record, Result, Schema, UpdateCommand, Value,
};

use crate::entity::{Entity, ErasedEntity};
use crate::map_config::{Loader, MemberConfig, Stringifier, Writer};
use crate::meta::MetaEntity;
use crate::operation::{MetaOperation, OperationKind};
use crate::repository::{RepositoryCore, RepositoryState};

pub use crate::map_config::{DependencyMode, DiscoveryMode, MapConfig};

// ============================================================================
// Erased Map Surface
// ============================================================================

/// Type-erased view of a [`DataMap`], used by the repository and the cascade
/// engine to work with entities whose concrete type is not known statically.
pub trait UberMap: Send + Sync + 'static {
    /// `TypeId` of the mapped type.
    fn entity_type(&self) -> TypeId;

    /// Name of the mapped type, for logs and errors.
    fn entity_name(&self) -> &'static str;

    /// Table the map is bound to.
    fn table(&self) -> String;

    /// Whether the map was created implicitly.
    fn is_weak(&self) -> bool;

    /// Whether the structure has been validated and frozen.
    fn is_validated(&self) -> bool;

    /// Validate against the live schema; idempotent.
    fn validate(&self) -> Result<()>;

    /// Whether materialized entities go into the identity index.
    fn track_entities(&self) -> bool;

    /// Identifier of the owning repository.
    fn repository_id(&self) -> u64;

    /// The validated column schema.
    fn schema(&self) -> Result<Arc<Schema>>;

    /// A record of the map's schema with every value `NULL`.
    fn new_record(&self) -> Result<Record>;

    /// Write the entity's current member values into `record`.
    fn write_record_any(&self, entity: &ErasedEntity, record: &mut Record) -> Result<()>;

    /// Load `record` into the entity's members.
    fn load_entity_any(&self, record: &Record, entity: &ErasedEntity) -> Result<()>;

    /// Entities referenced by members of the given mode, grouped by member.
    fn dependencies_any(
        &self,
        entity: &ErasedEntity,
        mode: DependencyMode,
    ) -> Vec<(String, Vec<ErasedEntity>)>;

    /// Identity key of a tracked entity, from its captured record or, if none
    /// was captured yet, from its current member values.
    fn identity_key(&self, meta: &MetaEntity) -> Result<Option<String>>;

    /// `INSERT` of every writable column.
    fn generate_insert(&self, meta: &MetaEntity) -> Result<Option<InsertCommand>>;

    /// `UPDATE` of the changed writable columns; `None` when nothing changed.
    fn generate_update(&self, meta: &MetaEntity) -> Result<Option<UpdateCommand>>;

    /// `DELETE` by identity.
    fn generate_delete(&self, meta: &MetaEntity) -> Result<Option<DeleteCommand>>;

    /// Compare the captured version column against the stored row.
    fn validate_row_version(&self, meta: &MetaEntity, link: &dyn DataLink) -> Result<()>;

    /// Re-read the row identified by `record` when the map has a version
    /// column, so a write the link did not echo back still captures the new
    /// version. `None` without a version column or a complete identity.
    fn reread_versioned(&self, record: &Record, link: &dyn DataLink) -> Result<Option<Record>>;

    /// Upcast for recovering the typed map.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Whether two erased handles denote the same map.
pub(crate) fn same_map(a: &Arc<dyn UberMap>, b: &Arc<dyn UberMap>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Copy every value of `row` into the same-named column of `target`.
pub(crate) fn overlay(target: &mut Record, row: &Record) {
    if Arc::ptr_eq(target.schema(), row.schema()) {
        *target = row.clone();
        return;
    }
    for (name, value) in row.iter() {
        if let Some(pos) = target.schema().position(name) {
            target.set(pos, value.clone());
        }
    }
}

// ============================================================================
// Validated Structure
// ============================================================================

struct BoundColumn<T> {
    name: String,
    writer: Option<Writer<T>>,
    loader: Option<Loader<T>>,
    read_only: bool,
}

impl<T> BoundColumn<T> {
    fn is_writable(&self) -> bool {
        self.writer.is_some() && !self.read_only
    }
}

struct BoundVersion {
    position: usize,
    name: String,
    stringifier: Option<Stringifier>,
}

impl BoundVersion {
    fn render(&self, value: &Value) -> String {
        match &self.stringifier {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }
}

/// The frozen structure of a map after validation. Column `i` of `columns`
/// describes position `i` of `schema`.
pub(crate) struct ValidatedMap<T> {
    table: String,
    schema: Arc<Schema>,
    columns: Vec<BoundColumn<T>>,
    identity: Vec<usize>,
    version: Option<BoundVersion>,
    discriminator: Option<Predicate>,
}

impl<T: Model> ValidatedMap<T> {
    fn new_record(&self) -> Record {
        Record::new(self.schema.clone())
    }

    fn adopt(&self, row: &Record) -> Record {
        let mut record = self.new_record();
        overlay(&mut record, row);
        record
    }

    fn write(&self, value: &T, record: &mut Record) {
        let same_schema = Arc::ptr_eq(record.schema(), &self.schema);
        for (pos, column) in self.columns.iter().enumerate() {
            let Some(writer) = &column.writer else {
                continue;
            };
            let target = if same_schema {
                Some(pos)
            } else {
                record.schema().position(&column.name)
            };
            if let Some(target) = target {
                record.set(target, writer(value));
            }
        }
    }

    fn load(&self, record: &Record, value: &mut T) -> Result<()> {
        let same_schema = Arc::ptr_eq(record.schema(), &self.schema);
        for (pos, column) in self.columns.iter().enumerate() {
            let Some(loader) = &column.loader else {
                continue;
            };
            let current = if same_schema {
                record.get(pos)
            } else {
                record.get_named(&column.name)
            };
            if let Some(current) = current {
                loader(value, current)?;
            }
        }
        Ok(())
    }

    /// `id1 = v1 AND ...` for the identity of `record`, with the discriminator.
    fn where_for(&self, record: &Record) -> Result<Predicate> {
        let no_identity = || Error::NoIdentity {
            entity: std::any::type_name::<T>(),
        };
        if self.identity.is_empty() {
            return Err(no_identity());
        }
        let id = Predicate::from_record(&record.project(&self.identity)).ok_or_else(no_identity)?;
        Ok(match &self.discriminator {
            Some(discriminator) => id.and(discriminator.clone()),
            None => id,
        })
    }
}

fn not_found<T>(what: &'static str, name: &str) -> Error {
    Error::NotFound {
        entity: std::any::type_name::<T>(),
        what,
        name: name.to_string(),
    }
}

fn wrong_type<T>(entity: &ErasedEntity) -> Error {
    Error::NotFound {
        entity: std::any::type_name::<T>(),
        what: "entity type",
        name: entity.type_name().to_string(),
    }
}

/// Find the reflected member matching `column`.
///
/// An exact match wins. Unless names are case-sensitive a single
/// case-insensitive match is accepted; several are a duplicate-name error.
fn resolve_field<T: Model>(column: &str, case_sensitive: bool) -> Result<Option<&'static str>> {
    let fields = T::fields();
    if let Some(field) = fields.iter().find(|f| **f == column) {
        return Ok(Some(field));
    }
    if case_sensitive {
        return Ok(None);
    }
    let mut matches = fields.iter().filter(|f| f.eq_ignore_ascii_case(column));
    match (matches.next(), matches.next()) {
        (None, _) => Ok(None),
        (Some(field), None) => Ok(Some(field)),
        (Some(_), Some(_)) => Err(Error::DuplicateName {
            entity: std::any::type_name::<T>(),
            what: "member",
            name: column.to_string(),
        }),
    }
}

fn reflected_accessors<T: Model>(field: &'static str) -> (Writer<T>, Loader<T>) {
    let writer: Writer<T> = Arc::new(move |value: &T| value.get_field(field).unwrap_or_default());
    let loader: Loader<T> = Arc::new(move |value: &mut T, v: &Value| {
        value.set_field(field, v)?;
        Ok(())
    });
    (writer, loader)
}

// ============================================================================
// DataMap
// ============================================================================

/// Binding of the model type `T` to a table, owned by a repository.
pub struct DataMap<T: Model> {
    repository: Weak<RepositoryCore>,
    repository_id: u64,
    weak: bool,
    self_ref: Weak<DataMap<T>>,
    config: Mutex<MapConfig<T>>,
    validated: OnceLock<Arc<ValidatedMap<T>>>,
}

impl<T: Model> DataMap<T> {
    pub(crate) fn create(
        repository: &RepositoryCore,
        config: MapConfig<T>,
        weak: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| DataMap {
            repository: repository.self_ref.clone(),
            repository_id: repository.id,
            weak,
            self_ref: me.clone(),
            config: Mutex::new(config),
            validated: OnceLock::new(),
        })
    }

    /// An implicit Auto-discovery map for `T::TABLE_NAME`.
    pub(crate) fn new_weak(repository: &RepositoryCore) -> Arc<dyn UberMap> {
        Self::create(repository, MapConfig::new(), true)
    }

    fn lock_config(&self) -> MutexGuard<'_, MapConfig<T>> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn repository(&self) -> Result<Arc<RepositoryCore>> {
        self.repository.upgrade().ok_or(Error::Disposed)
    }

    pub(crate) fn uber(&self) -> Result<Arc<dyn UberMap>> {
        self.self_ref
            .upgrade()
            .map(|map| map as Arc<dyn UberMap>)
            .ok_or(Error::Disposed)
    }

    fn is_self(&self, map: &Arc<dyn UberMap>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(map), std::ptr::from_ref(self))
    }

    // ------------------------------------------------------------------------
    // Configuration and validation
    // ------------------------------------------------------------------------

    /// Change the structure; only allowed before validation.
    pub fn reconfigure(&self, f: impl FnOnce(MapConfig<T>) -> MapConfig<T>) -> Result<()> {
        let mut config = self.lock_config();
        if self.validated.get().is_some() {
            return Err(Error::MapValidated {
                entity: std::any::type_name::<T>(),
            });
        }
        let updated = f(config.clone());
        updated.check()?;
        *config = updated;
        Ok(())
    }

    /// Validate against the live schema. Later calls return immediately.
    pub fn validate(&self) -> Result<()> {
        self.validated().map(|_| ())
    }

    /// Whether the structure is frozen.
    pub fn is_validated(&self) -> bool {
        self.validated.get().is_some()
    }

    /// Whether the map was created implicitly.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Table the map is bound to.
    pub fn table(&self) -> String {
        match self.validated.get() {
            Some(v) => v.table.clone(),
            None => self.lock_config().table.clone(),
        }
    }

    /// The validated column schema.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        Ok(self.validated()?.schema.clone())
    }

    /// Names of the identity columns, in key order.
    pub fn identity_columns(&self) -> Result<Vec<String>> {
        let v = self.validated()?;
        Ok(v.identity
            .iter()
            .filter_map(|pos| v.schema.column(*pos).map(|c| c.name.clone()))
            .collect())
    }

    /// Name of the version column, if any.
    pub fn version_column(&self) -> Option<String> {
        match self.validated.get() {
            Some(v) => v.version.as_ref().map(|version| version.name.clone()),
            None => self.lock_config().version.as_ref().map(|v| v.name.clone()),
        }
    }

    pub(crate) fn validated(&self) -> Result<Arc<ValidatedMap<T>>> {
        if let Some(v) = self.validated.get() {
            return Ok(v.clone());
        }
        let config = self.lock_config();
        if let Some(v) = self.validated.get() {
            return Ok(v.clone());
        }
        let repository = self.repository()?;
        let bound = Arc::new(self.bind(&config, &repository)?);
        let _ = self.validated.set(bound.clone());
        tracing::info!(
            entity = std::any::type_name::<T>(),
            table = %bound.table,
            columns = bound.columns.len(),
            identity = bound.identity.len(),
            weak = self.weak,
            "Map validated"
        );
        Ok(bound)
    }

    #[tracing::instrument(level = "debug", skip(self, config, repository), fields(table = %config.table))]
    fn bind(&self, config: &MapConfig<T>, repository: &RepositoryCore) -> Result<ValidatedMap<T>> {
        config.check()?;
        let link = repository.link.as_ref();
        let case_sensitive = link.engine().case_sensitive_names;
        let reflected = {
            let _scope = LinkScope::enter(link)?;
            link.query(&QueryCommand::new(config.table.clone()).top(1))?
        };
        let full = (*reflected.schema)
            .clone()
            .with_case_sensitivity(case_sensitive);

        let schema = match config.discovery {
            DiscoveryMode::Auto => full,
            DiscoveryMode::Explicit => {
                let mut positions = Vec::new();
                for column in &config.columns {
                    positions.push(
                        full.position(&column.name)
                            .ok_or_else(|| not_found::<T>("column", &column.name))?,
                    );
                }
                positions.extend(full.identity_columns());
                if let Some(version) = &config.version {
                    positions.push(
                        full.position(&version.name)
                            .ok_or_else(|| not_found::<T>("version column", &version.name))?,
                    );
                }
                positions.sort_unstable();
                positions.dedup();
                full.project(&positions)
            }
        };
        let schema = Arc::new(schema);

        let mut columns: Vec<BoundColumn<T>> = schema
            .columns()
            .iter()
            .map(|c| BoundColumn {
                name: c.name.clone(),
                writer: None,
                loader: None,
                read_only: c.read_only,
            })
            .collect();
        let mut configured = vec![false; columns.len()];

        for column in &config.columns {
            let pos = schema
                .position(&column.name)
                .ok_or_else(|| not_found::<T>("column", &column.name))?;
            configured[pos] = true;
            let (writer, loader) = match (&column.writer, &column.loader) {
                (Some(writer), Some(loader)) => (writer.clone(), loader.clone()),
                _ => {
                    let field = resolve_field::<T>(&column.name, case_sensitive)?
                        .ok_or_else(|| not_found::<T>("member", &column.name))?;
                    reflected_accessors::<T>(field)
                }
            };
            let bound = &mut columns[pos];
            bound.writer = column.write_enabled.then_some(writer);
            bound.loader = column.load_enabled.then_some(loader);
        }

        for (pos, bound) in columns.iter_mut().enumerate() {
            if configured[pos] {
                continue;
            }
            match resolve_field::<T>(&bound.name, case_sensitive)? {
                Some(field) => {
                    let (writer, loader) = reflected_accessors::<T>(field);
                    bound.writer = Some(writer);
                    bound.loader = Some(loader);
                }
                None => tracing::trace!(column = %bound.name, "Column left unbound"),
            }
        }

        let version = match &config.version {
            Some(version) => Some(BoundVersion {
                position: schema
                    .position(&version.name)
                    .ok_or_else(|| not_found::<T>("version column", &version.name))?,
                name: version.name.clone(),
                stringifier: version.stringifier.clone(),
            }),
            None => None,
        };

        Ok(ValidatedMap {
            table: config.table.clone(),
            identity: schema.identity_columns(),
            schema,
            columns,
            version,
            discriminator: config.discriminator.clone(),
        })
    }

    // ------------------------------------------------------------------------
    // Entity and record operations
    // ------------------------------------------------------------------------

    /// A new, detached entity holding `T::default()`.
    pub fn new_entity(&self) -> Entity<T> {
        Entity::new(T::default())
    }

    /// A record of the map's schema with every value `NULL`.
    pub fn new_record(&self) -> Result<Record> {
        Ok(self.validated()?.new_record())
    }

    /// Write the entity's member values into `record`. Columns without a
    /// writer keep whatever the record already held.
    pub fn write_record(&self, entity: &Entity<T>, record: &mut Record) -> Result<()> {
        let v = self.validated()?;
        v.write(&entity.read(), record);
        Ok(())
    }

    /// Load the values of `record` into the entity's members.
    pub fn load_entity(&self, record: &Record, entity: &Entity<T>) -> Result<()> {
        let v = self.validated()?;
        v.load(record, &mut entity.write())
    }

    /// The identity columns of `record` as a sub-record.
    pub fn extract_id(&self, record: &Record) -> Result<Record> {
        let v = self.validated()?;
        if v.identity.is_empty() {
            return Err(Error::NoIdentity {
                entity: std::any::type_name::<T>(),
            });
        }
        Ok(v.adopt(record).project(&v.identity))
    }

    /// Associate the entity with this map and its identity index.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = std::any::type_name::<T>()))]
    pub fn attach(&self, entity: &Entity<T>) -> Result<()> {
        self.validated()?;
        let repository = self.repository()?;
        let me = self.uber()?;
        let meta = MetaEntity::obtain(&entity.erase());
        let mut state = repository.lock_state();
        state.attach(&me, &meta)
    }

    /// Disassociate the entity from this map, dropping any pending operation.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = std::any::type_name::<T>()))]
    pub fn detach(&self, entity: &Entity<T>) -> Result<()> {
        let Some(meta) = entity.meta() else {
            return Ok(());
        };
        match meta.map() {
            None => return Ok(()),
            Some(map) if !self.is_self(&map) => {
                return Err(Error::AttachedElsewhere {
                    entity: std::any::type_name::<T>(),
                });
            }
            Some(_) => {}
        }
        let repository = self.repository()?;
        let mut state = repository.lock_state();
        state.detach(&meta);
        Ok(())
    }

    /// Columns whose current values differ from the captured record.
    pub fn get_record_changes(&self, entity: &Entity<T>) -> Result<Option<Record>> {
        let meta = entity.meta().ok_or(Error::NotAttached {
            entity: std::any::type_name::<T>(),
        })?;
        meta.get_record_changes()
    }

    /// The command an insert of `entity` would send.
    pub fn generate_insert_command(&self, entity: &Entity<T>) -> Result<Option<InsertCommand>> {
        self.generate_insert(&MetaEntity::obtain(&entity.erase()))
    }

    /// The command an update of `entity` would send.
    pub fn generate_update_command(&self, entity: &Entity<T>) -> Result<Option<UpdateCommand>> {
        let meta = self.attached_meta(entity)?;
        self.generate_update(&meta)
    }

    /// The command a delete of `entity` would send.
    pub fn generate_delete_command(&self, entity: &Entity<T>) -> Result<Option<DeleteCommand>> {
        let meta = self.attached_meta(entity)?;
        self.generate_delete(&meta)
    }

    fn attached_meta(&self, entity: &Entity<T>) -> Result<Arc<MetaEntity>> {
        entity
            .meta()
            .filter(|meta| meta.map().is_some_and(|m| self.is_self(&m)))
            .ok_or(Error::NotAttached {
                entity: std::any::type_name::<T>(),
            })
    }

    // ------------------------------------------------------------------------
    // Operation factories
    // ------------------------------------------------------------------------

    /// A pending insert of `entity`; nothing happens until it is submitted.
    pub fn insert(&self, entity: &Entity<T>) -> Result<MetaOperation<T>> {
        self.operation(OperationKind::Insert, entity)
    }

    /// A pending update of `entity`.
    pub fn update(&self, entity: &Entity<T>) -> Result<MetaOperation<T>> {
        self.operation(OperationKind::Update, entity)
    }

    /// A pending delete of `entity`.
    pub fn delete(&self, entity: &Entity<T>) -> Result<MetaOperation<T>> {
        self.operation(OperationKind::Delete, entity)
    }

    fn operation(&self, kind: OperationKind, entity: &Entity<T>) -> Result<MetaOperation<T>> {
        Ok(MetaOperation::new(
            kind,
            entity,
            self.uber()?,
            self.repository.clone(),
        ))
    }

    // ------------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------------

    /// Run a query against the table and materialize every row.
    ///
    /// Rows whose identity is already tracked resolve to the tracked entity,
    /// reloaded in place only when it is flagged for refresh and has nothing
    /// pending.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = std::any::type_name::<T>()))]
    pub fn query(&self, predicate: Option<Predicate>) -> Result<Vec<Entity<T>>> {
        let v = self.validated()?;
        let repository = self.repository()?;
        let mut command = QueryCommand::new(v.table.clone());
        if let Some(predicate) = Predicate::and_opt(predicate, v.discriminator.clone()) {
            command = command.filter(predicate);
        }
        let rows = self.fetch(&repository, &command)?;
        self.materialize(&repository, &v, &rows)
    }

    /// The entity with the given identity values (in identity-column order),
    /// from the identity index when tracked, else from the database.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = std::any::type_name::<T>()))]
    pub fn find_now(&self, id: &[Value]) -> Result<Option<Entity<T>>> {
        let v = self.validated()?;
        if v.identity.is_empty() {
            return Err(Error::NoIdentity {
                entity: std::any::type_name::<T>(),
            });
        }
        if id.len() != v.identity.len() {
            return Err(Error::CannotCreate {
                reason: format!(
                    "expected {} identity values for '{}', got {}",
                    v.identity.len(),
                    v.table,
                    id.len()
                ),
            });
        }
        let mut lookup = v.new_record();
        for (pos, value) in v.identity.iter().zip(id) {
            lookup.set(*pos, value.clone());
        }

        let repository = self.repository()?;
        if self.track_entities() {
            if let Some(key) = lookup.key(&v.identity) {
                let state = repository.lock_state();
                if let Some(found) = self.tracked(&state, &key).into_iter().next() {
                    tracing::trace!(key = %key, "Found in identity index");
                    return Ok(Some(found.0));
                }
            }
        }

        let command = QueryCommand::new(v.table.clone())
            .filter(v.where_for(&lookup)?)
            .top(1);
        let rows = self.fetch(&repository, &command)?;
        Ok(self.materialize(&repository, &v, &rows)?.into_iter().next())
    }

    /// Re-read the entity's row and reload every tracked entity sharing its
    /// identity. Returns `None` when the row no longer exists.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = std::any::type_name::<T>()))]
    pub fn refresh_now(&self, entity: &Entity<T>) -> Result<Option<Entity<T>>> {
        let v = self.validated()?;
        let meta = self.attached_meta(entity)?;
        let repository = self.repository()?;
        let captured = match meta.record() {
            Some(record) => record,
            None => {
                let mut record = v.new_record();
                v.write(&entity.read(), &mut record);
                record
            }
        };
        let command = QueryCommand::new(v.table.clone())
            .filter(v.where_for(&captured)?)
            .top(1);
        let Some(row) = self.fetch(&repository, &command)?.into_iter().next() else {
            tracing::debug!("Row no longer exists");
            return Ok(None);
        };
        let record = v.adopt(&row);

        let state = repository.lock_state();
        let mut targets: Vec<(Entity<T>, Arc<MetaEntity>)> = match record.key(&v.identity) {
            Some(key) if self.track_entities() => self.tracked(&state, &key),
            _ => Vec::new(),
        };
        if !targets.iter().any(|(e, _)| e.ptr_eq(entity)) {
            targets.push((entity.clone(), meta));
        }
        for (target, target_meta) in &targets {
            v.load(&record, &mut target.write())?;
            target_meta.set_record(Some(record.clone()));
            target_meta.set_to_refresh(false);
            target_meta.capture_member_childs();
        }
        tracing::debug!(reloaded = targets.len(), "Refreshed");
        drop(state);
        Ok(Some(entity.clone()))
    }

    fn fetch(&self, repository: &RepositoryCore, command: &QueryCommand) -> Result<Vec<Record>> {
        let link = repository.link.as_ref();
        let _scope = LinkScope::enter(link)?;
        tracing::trace!(
            command = %datamap_core::Command::Query(command.clone()).trace_string(),
            "Query"
        );
        Ok(link.query(command)?.records)
    }

    /// Alive entities of this map tracked under `key`.
    fn tracked(&self, state: &RepositoryState, key: &str) -> Vec<(Entity<T>, Arc<MetaEntity>)> {
        let Some(index) = state.index(TypeId::of::<T>()) else {
            return Vec::new();
        };
        index
            .find(key)
            .iter()
            .filter(|meta| meta.map().is_some_and(|m| self.is_self(&m)))
            .filter_map(|meta| {
                let entity = meta.entity()?.downcast::<T>()?;
                Some((entity, meta.clone()))
            })
            .collect()
    }

    fn materialize(
        &self,
        repository: &RepositoryCore,
        v: &ValidatedMap<T>,
        rows: &[Record],
    ) -> Result<Vec<Entity<T>>> {
        let me = self.uber()?;
        let track = self.track_entities() && !v.identity.is_empty();
        let mut state = repository.lock_state();
        let mut entities = Vec::with_capacity(rows.len());

        for row in rows {
            let record = v.adopt(row);
            let key = if track { record.key(&v.identity) } else { None };

            if let Some(key) = &key {
                if let Some((entity, meta)) = self.tracked(&state, key).into_iter().next() {
                    if meta.to_refresh() && meta.pending().is_none() {
                        v.load(&record, &mut entity.write())?;
                        meta.set_record(Some(record));
                        meta.set_to_refresh(false);
                        meta.capture_member_childs();
                        tracing::trace!(key = %key, "Reloaded tracked entity");
                    }
                    entities.push(entity);
                    continue;
                }
            }

            let entity = self.new_entity();
            v.load(&record, &mut entity.write())?;
            let meta = MetaEntity::obtain(&entity.erase());
            meta.set_map(Some(&me));
            meta.set_record(Some(record));
            if let Some(key) = key {
                state.index_mut(TypeId::of::<T>()).add(key, meta.clone());
            }
            meta.capture_member_childs();
            entities.push(entity);
        }

        tracing::debug!(rows = entities.len(), "Materialized");
        Ok(entities)
    }
}

impl<T: Model> UberMap for DataMap<T> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn entity_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn table(&self) -> String {
        DataMap::table(self)
    }

    fn is_weak(&self) -> bool {
        self.weak
    }

    fn is_validated(&self) -> bool {
        DataMap::is_validated(self)
    }

    fn validate(&self) -> Result<()> {
        DataMap::validate(self)
    }

    fn track_entities(&self) -> bool {
        let configured = self.lock_config().track_entities;
        configured.unwrap_or_else(|| {
            self.repository
                .upgrade()
                .is_none_or(|r| r.config.track_entities)
        })
    }

    fn repository_id(&self) -> u64 {
        self.repository_id
    }

    fn schema(&self) -> Result<Arc<Schema>> {
        DataMap::schema(self)
    }

    fn new_record(&self) -> Result<Record> {
        DataMap::new_record(self)
    }

    fn write_record_any(&self, entity: &ErasedEntity, record: &mut Record) -> Result<()> {
        let v = self.validated()?;
        entity
            .with_value::<T, _>(|value| v.write(value, record))
            .ok_or_else(|| wrong_type::<T>(entity))
    }

    fn load_entity_any(&self, record: &Record, entity: &ErasedEntity) -> Result<()> {
        let v = self.validated()?;
        entity
            .with_value_mut::<T, _>(|value| v.load(record, value))
            .ok_or_else(|| wrong_type::<T>(entity))?
    }

    fn dependencies_any(
        &self,
        entity: &ErasedEntity,
        mode: DependencyMode,
    ) -> Vec<(String, Vec<ErasedEntity>)> {
        let members: Vec<MemberConfig<T>> = self
            .lock_config()
            .members
            .iter()
            .filter(|m| m.mode == mode)
            .cloned()
            .collect();
        if members.is_empty() {
            return Vec::new();
        }
        entity
            .with_value::<T, _>(|value| {
                members
                    .iter()
                    .map(|m| (m.name.clone(), (m.accessor)(value)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn identity_key(&self, meta: &MetaEntity) -> Result<Option<String>> {
        let v = self.validated()?;
        if v.identity.is_empty() {
            return Err(Error::NoIdentity {
                entity: std::any::type_name::<T>(),
            });
        }
        if let Some(record) = meta.record() {
            return Ok(record.key(&v.identity));
        }
        let Some(entity) = meta.entity() else {
            return Ok(None);
        };
        let mut record = v.new_record();
        self.write_record_any(&entity, &mut record)?;
        Ok(record.key(&v.identity))
    }

    fn generate_insert(&self, meta: &MetaEntity) -> Result<Option<InsertCommand>> {
        let Some(entity) = meta.entity() else {
            return Ok(None);
        };
        let v = self.validated()?;
        let mut record = v.new_record();
        self.write_record_any(&entity, &mut record)?;
        let columns: Vec<(String, Value)> = v
            .columns
            .iter()
            .zip(record.values())
            .filter(|(column, _)| column.is_writable())
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect();
        if columns.is_empty() {
            return Err(Error::CannotCreate {
                reason: format!("no writable columns for '{}'", v.table),
            });
        }
        Ok(Some(InsertCommand {
            table: v.table.clone(),
            columns,
        }))
    }

    fn generate_update(&self, meta: &MetaEntity) -> Result<Option<UpdateCommand>> {
        let Some(changes) = meta.get_record_changes()? else {
            return Ok(None);
        };
        let v = self.validated()?;
        let columns: Vec<(String, Value)> = changes
            .iter()
            .filter(|(name, _)| {
                v.schema
                    .position(name)
                    .is_some_and(|pos| v.columns[pos].is_writable())
            })
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        if columns.is_empty() {
            return Ok(None);
        }
        let predicate = self.where_clause(&v, meta)?;
        Ok(Some(UpdateCommand {
            table: v.table.clone(),
            columns,
            predicate,
        }))
    }

    fn generate_delete(&self, meta: &MetaEntity) -> Result<Option<DeleteCommand>> {
        if meta.is_collected() {
            return Ok(None);
        }
        let v = self.validated()?;
        let predicate = self.where_clause(&v, meta)?;
        Ok(Some(DeleteCommand {
            table: v.table.clone(),
            predicate,
        }))
    }

    fn validate_row_version(&self, meta: &MetaEntity, link: &dyn DataLink) -> Result<()> {
        let v = self.validated()?;
        let Some(version) = &v.version else {
            return Ok(());
        };
        let Some(captured) = meta.record() else {
            return Ok(());
        };
        let command = QueryCommand::new(v.table.clone())
            .filter(v.where_for(&captured)?)
            .top(1);
        let expected = version.render(&captured.get(version.position).cloned().unwrap_or_default());
        let found = link
            .query(&command)?
            .into_first()
            .map(|row| version.render(&row.get_named(&version.name).cloned().unwrap_or_default()));

        match found {
            Some(found) if found == expected => Ok(()),
            found => {
                let found = found.unwrap_or_else(|| "<missing>".to_string());
                tracing::warn!(
                    table = %v.table,
                    column = %version.name,
                    expected = %expected,
                    found = %found,
                    "Row version mismatch"
                );
                Err(Error::Changed {
                    table: v.table.clone(),
                    column: version.name.clone(),
                    expected,
                    found,
                })
            }
        }
    }

    fn reread_versioned(&self, record: &Record, link: &dyn DataLink) -> Result<Option<Record>> {
        let v = self.validated()?;
        if v.version.is_none() || record.key(&v.identity).is_none() {
            return Ok(None);
        }
        let command = QueryCommand::new(v.table.clone())
            .filter(v.where_for(record)?)
            .top(1);
        tracing::trace!("Re-reading written row for its version");
        Ok(link.query(&command)?.into_first())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Model> DataMap<T> {
    /// Identity predicate from the captured record. Rows that were never
    /// loaded or saved, and identities holding NULL, cannot be targeted.
    fn where_clause(&self, v: &ValidatedMap<T>, meta: &MetaEntity) -> Result<Predicate> {
        let record = meta.record().ok_or_else(|| Error::CannotCreate {
            reason: format!("no row of '{}' was captured for this entity", v.table),
        })?;
        if v
            .identity
            .iter()
            .any(|pos| record.get(*pos).is_none_or(Value::is_null))
        {
            return Err(Error::CannotCreate {
                reason: format!("identity of the '{}' row is NULL", v.table),
            });
        }
        v.where_for(&record)
    }
}

impl<T: Model> fmt::Debug for DataMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataMap")
            .field("entity", &std::any::type_name::<T>())
            .field("table", &self.table())
            .field("weak", &self.weak)
            .field("validated", &self.is_validated())
            .field("repository", &self.repository_id)
            .finish()
    }
}
