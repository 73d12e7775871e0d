//! DataMap Rust: object-relational mapping with identity tracking and a
//! cascading unit of work.
//!
//! `datamap` is the **facade crate**. It re-exports the pieces an application
//! needs so that it does not have to depend on sub-crates directly.
//!
//! # Concepts
//!
//! - **Model**: a plain struct with `#[derive(Model)]`; its fields are the
//!   members maps bind columns to
//! - **DataMap**: binds one model type to one table, validated lazily against
//!   the live schema
//! - **DataRepository**: owns the maps, the identity indexes and the queue of
//!   pending operations for one [`DataLink`]
//! - **MetaOperation**: a pending insert, update or delete; submitting it
//!   cascades to parents and children
//!
//! # Example
//!
//! ```ignore
//! use datamap::prelude::*;
//!
//! #[derive(Debug, Default, Model)]
//! #[datamap(table = "customers")]
//! struct Customer {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! let repository = DataRepository::new(link);
//! let customers = repository.map::<Customer>()?;
//!
//! let ada = Entity::new(Customer { id: None, name: "Ada".into() });
//! customers.insert(&ada)?.submit()?;
//! repository.submit_changes()?;
//! assert!(ada.read().id.is_some());
//! ```

pub mod repository;

pub use datamap_core::{
    ColumnSet, Command, CompareOp, DataLink, DeleteCommand, EngineInfo, Error, ErrorKind,
    FromValue, InsertCommand, LinkScope, Model, NestableTransaction, Predicate, QueryCommand,
    Record, RecordSet, Result, Schema, SchemaColumn, UpdateCommand, Value,
};
pub use datamap_macros::Model;
pub use repository::{
    CollectorConfig, DataMap, DataRepository, DependencyMode, DiscoveryMode, Entity, EntityState,
    ErasedEntity, MapConfig, MetaEntity, MetaOperation, OperationKind, OperationState,
    PendingOperation, RepositoryConfig, RepositoryDebugInfo, UberMap,
};

/// The in-memory link, for tests and demos.
#[cfg(feature = "memory")]
pub use datamap_memory::{MemoryLink, TableDef};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        DataLink, DataMap, DataRepository, DependencyMode, DiscoveryMode, Entity, EntityState,
        Error, MapConfig, Model, OperationKind, Predicate, RepositoryConfig, Result, Value,
    };
}
