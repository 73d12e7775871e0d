//! Unit-of-work re-exports.
//!
//! `datamap::DataRepository` is the unit of work: maps, identity indexes and
//! the ordered queue of pending operations over one link.
//!
//! The implementation lives in the separate `datamap-session` crate. This
//! module exists so the facade can expose it without forcing users to depend
//! on sub-crates directly.

pub use datamap_session::{
    CollectorConfig, DataMap, DataRepository, DependencyMode, DiscoveryMode, Entity, EntityState,
    ErasedEntity, IdentityIndex, MapConfig, MetaEntity, MetaOperation, OperationKind,
    OperationState, PendingOperation, RepositoryConfig, RepositoryDebugInfo, Stringifier, UberMap,
};
