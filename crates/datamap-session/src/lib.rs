//! Identity tracking and unit of work for DataMap Rust.
//!
//! `datamap-session` is the **coordination layer**. It binds model types to
//! tables, keeps one tracked instance per materialized row, and turns entity
//! changes into an ordered queue of commands.
//!
//! # Design Philosophy
//!
//! - **Reference identity**: an [`Entity<T>`] is a shared handle; its
//!   [`MetaEntity`] lives beside it and holds it only weakly
//! - **One lock per repository**: identity indexes, map registry and the
//!   pending queue share the master lock
//! - **Explicit binding**: columns and members bind through closures or the
//!   [`Model`](datamap_core::Model) field surface, resolved once at validation
//! - **Ordered cascade**: submission walks parent and child members so the queue
//!   runs parents before children for writes and children before parents for
//!   deletes
//!
//! # Example
//!
//! ```ignore
//! let repository = DataRepository::new(link);
//! let orders = repository.register(
//!     MapConfig::<Order>::new()
//!         .parent("customer", |o: &Order| o.customer.clone())
//!         .child("lines", |o: &Order| o.lines.clone()),
//! )?;
//!
//! let order = orders.new_entity();
//! order.write().customer = Some(Entity::new(Customer::named("Ada")));
//!
//! // Queues the customer's insert ahead of the order's.
//! orders.insert(&order)?.submit()?;
//! repository.submit_changes()?;
//! ```

mod cascade;
mod collector;
pub mod config;
pub mod entity;
pub mod identity;
pub mod map;
mod map_config;
pub mod meta;
pub mod operation;
pub mod repository;

pub use config::{CollectorConfig, RepositoryConfig};
pub use entity::{Entity, ErasedEntity};
pub use identity::IdentityIndex;
pub use map::{DataMap, DependencyMode, DiscoveryMode, MapConfig, UberMap};
pub use map_config::Stringifier;
pub use meta::{EntityState, MetaEntity};
pub use operation::{MetaOperation, OperationKind, OperationState};
pub use repository::{DataRepository, PendingOperation, RepositoryDebugInfo};

#[cfg(test)]
pub(crate) mod fixtures;
