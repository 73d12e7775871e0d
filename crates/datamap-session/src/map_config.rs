//! Structural configuration of a map.
//!
//! A [`MapConfig`] is assembled with a fluent builder and checked for
//! configuration mistakes before it is handed to a repository. Columns bind
//! either to an explicit pair of accessor closures or, by name, to a member
//! exposed through [`Model`]. Members describe the entities a value depends
//! on, classified by [`DependencyMode`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use datamap_core::{Error, FromValue, Model, Predicate, Result, Value, is_valid_identifier};

use crate::entity::{Entity, ErasedEntity};

pub(crate) type Writer<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
pub(crate) type Loader<T> = Arc<dyn Fn(&mut T, &Value) -> Result<()> + Send + Sync>;
pub(crate) type Accessor<T> = Arc<dyn Fn(&T) -> Vec<ErasedEntity> + Send + Sync>;

/// Renders a version column value for comparison.
pub type Stringifier = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// How the columns of a map are found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiscoveryMode {
    /// Every column of the table is mapped; unconfigured ones bind to members
    /// of the same name when such a member exists.
    #[default]
    Auto,
    /// Only configured columns (plus identity and version columns) are mapped.
    Explicit,
}

/// Role of a member that references other entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DependencyMode {
    /// No cascading.
    #[default]
    None,
    /// The referenced entity must exist before this one.
    Parent,
    /// The referenced entities follow this entity's changes.
    Child,
}

/// A configured column.
pub(crate) struct ColumnConfig<T> {
    pub name: String,
    pub writer: Option<Writer<T>>,
    pub loader: Option<Loader<T>>,
    pub write_enabled: bool,
    pub load_enabled: bool,
}

impl<T> Clone for ColumnConfig<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            writer: self.writer.clone(),
            loader: self.loader.clone(),
            write_enabled: self.write_enabled,
            load_enabled: self.load_enabled,
        }
    }
}

/// A configured dependency member.
pub(crate) struct MemberConfig<T> {
    pub name: String,
    pub mode: DependencyMode,
    pub accessor: Accessor<T>,
}

impl<T> Clone for MemberConfig<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            mode: self.mode,
            accessor: self.accessor.clone(),
        }
    }
}

/// The version column and how its values are compared.
#[derive(Clone)]
pub(crate) struct VersionConfig {
    pub name: String,
    pub stringifier: Option<Stringifier>,
}

/// Builder for the structure of a [`DataMap`](crate::map::DataMap).
///
/// # Example
///
/// ```ignore
/// let config = MapConfig::<Order>::new()
///     .table("orders")
///     .column("id")
///     .column_typed("customer_id", |o: &Order| o.customer_id(), |o, v| o.customer_id = v)
///     .parent("customer", |o: &Order| o.customer.clone())
///     .child("lines", |o: &Order| o.lines.clone())
///     .version_column("row_version");
/// ```
pub struct MapConfig<T: Model> {
    pub(crate) table: String,
    pub(crate) discovery: DiscoveryMode,
    pub(crate) columns: Vec<ColumnConfig<T>>,
    pub(crate) members: Vec<MemberConfig<T>>,
    pub(crate) version: Option<VersionConfig>,
    pub(crate) discriminator: Option<Predicate>,
    pub(crate) track_entities: Option<bool>,
}

impl<T: Model> MapConfig<T> {
    /// Configuration for `T::TABLE_NAME` with automatic discovery.
    pub fn new() -> Self {
        Self {
            table: T::TABLE_NAME.to_string(),
            discovery: DiscoveryMode::Auto,
            columns: Vec::new(),
            members: Vec::new(),
            version: None,
            discriminator: None,
            track_entities: None,
        }
    }

    /// Set the table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the discovery mode.
    pub fn discovery(mut self, mode: DiscoveryMode) -> Self {
        self.discovery = mode;
        self
    }

    /// Map a column to the member of the same name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnConfig {
            name: name.into(),
            writer: None,
            loader: None,
            write_enabled: true,
            load_enabled: true,
        });
        self
    }

    /// Map a column through explicit accessors.
    pub fn column_with<W, L>(mut self, name: impl Into<String>, writer: W, loader: L) -> Self
    where
        W: Fn(&T) -> Value + Send + Sync + 'static,
        L: Fn(&mut T, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.columns.push(ColumnConfig {
            name: name.into(),
            writer: Some(Arc::new(writer)),
            loader: Some(Arc::new(loader)),
            write_enabled: true,
            load_enabled: true,
        });
        self
    }

    /// Map a column through typed getter and setter closures.
    pub fn column_typed<V, G, S>(self, name: impl Into<String>, get: G, set: S) -> Self
    where
        V: Into<Value> + FromValue + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let name = name.into();
        let column = name.clone();
        self.column_with(
            name,
            move |entity: &T| get(entity).into(),
            move |entity: &mut T, value: &Value| {
                set(entity, value.convert::<V>(&column)?);
                Ok(())
            },
        )
    }

    /// Map a column whose value is only ever read from the database.
    pub fn column_load_only(mut self, name: impl Into<String>) -> Self {
        self = self.column(name);
        if let Some(last) = self.columns.last_mut() {
            last.write_enabled = false;
        }
        self
    }

    /// Enable or disable writing and loading of an already configured column.
    pub fn column_flags(mut self, name: &str, write: bool, load: bool) -> Self {
        for column in self.columns.iter_mut().filter(|c| c.name == name) {
            column.write_enabled = write;
            column.load_enabled = load;
        }
        self
    }

    /// Declare a member with an explicit dependency mode.
    pub fn member<A>(mut self, name: impl Into<String>, mode: DependencyMode, accessor: A) -> Self
    where
        A: Fn(&T) -> Vec<ErasedEntity> + Send + Sync + 'static,
    {
        self.members.push(MemberConfig {
            name: name.into(),
            mode,
            accessor: Arc::new(accessor),
        });
        self
    }

    /// Declare a `Parent` member referencing at most one entity.
    pub fn parent<P, A>(self, name: impl Into<String>, accessor: A) -> Self
    where
        P: Model,
        A: Fn(&T) -> Option<Entity<P>> + Send + Sync + 'static,
    {
        self.member(name, DependencyMode::Parent, move |entity: &T| {
            accessor(entity).iter().map(Entity::erase).collect()
        })
    }

    /// Declare a `Child` member referencing a collection of entities.
    pub fn child<C, A>(self, name: impl Into<String>, accessor: A) -> Self
    where
        C: Model,
        A: Fn(&T) -> Vec<Entity<C>> + Send + Sync + 'static,
    {
        self.member(name, DependencyMode::Child, move |entity: &T| {
            accessor(entity).iter().map(Entity::erase).collect()
        })
    }

    /// Use `name` as the optimistic-concurrency column.
    pub fn version_column(mut self, name: impl Into<String>) -> Self {
        self.version = Some(VersionConfig {
            name: name.into(),
            stringifier: None,
        });
        self
    }

    /// Use `name` as the optimistic-concurrency column with a custom renderer.
    pub fn version_column_with<F>(mut self, name: impl Into<String>, stringifier: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.version = Some(VersionConfig {
            name: name.into(),
            stringifier: Some(Arc::new(stringifier)),
        });
        self
    }

    /// Restrict the map to rows matching `predicate`.
    pub fn discriminator(mut self, predicate: Predicate) -> Self {
        self.discriminator = Some(predicate);
        self
    }

    /// Whether materialized entities go into the identity index.
    pub fn track_entities(mut self, value: bool) -> Self {
        self.track_entities = Some(value);
        self
    }

    /// Check names for validity and duplicates.
    pub fn check(&self) -> Result<()> {
        let entity = std::any::type_name::<T>();
        if !is_valid_identifier(&self.table) {
            return Err(Error::InvalidIdentifier {
                what: "table",
                name: self.table.clone(),
            });
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_valid_identifier(&column.name) {
                return Err(Error::InvalidIdentifier {
                    what: "column",
                    name: column.name.clone(),
                });
            }
            if !seen.insert(column.name.to_lowercase()) {
                return Err(Error::DuplicateName {
                    entity,
                    what: "column",
                    name: column.name.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if !is_valid_identifier(&member.name) {
                return Err(Error::InvalidIdentifier {
                    what: "member",
                    name: member.name.clone(),
                });
            }
            if !seen.insert(member.name.clone()) {
                return Err(Error::DuplicateName {
                    entity,
                    what: "member",
                    name: member.name.clone(),
                });
            }
        }

        if let Some(version) = &self.version {
            if !is_valid_identifier(&version.name) {
                return Err(Error::InvalidIdentifier {
                    what: "version column",
                    name: version.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<T: Model> Default for MapConfig<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Model> Clone for MapConfig<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            discovery: self.discovery,
            columns: self.columns.clone(),
            members: self.members.clone(),
            version: self.version.clone(),
            discriminator: self.discriminator.clone(),
            track_entities: self.track_entities,
        }
    }
}

impl<T: Model> fmt::Debug for MapConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapConfig")
            .field("table", &self.table)
            .field("discovery", &self.discovery)
            .field(
                "columns",
                &self.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "members",
                &self
                    .members
                    .iter()
                    .map(|m| (m.name.as_str(), m.mode))
                    .collect::<Vec<_>>(),
            )
            .field("version", &self.version.as_ref().map(|v| v.name.as_str()))
            .field("discriminator", &self.discriminator)
            .field("track_entities", &self.track_entities)
            .finish()
    }
}
