//! Core types and collaborator contracts for DataMap Rust.
//!
//! `datamap-core` is the **foundation layer** of the workspace. It defines the
//! value containers and the contracts every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: [`DataLink`] is implemented by engines; [`Model`] by
//!   mapped domain types.
//! - **Data model**: [`Value`], [`Schema`], [`Record`] and [`ColumnSet`] carry
//!   rows between the engine and the mapping layer.
//! - **Commands**: [`Predicate`] and the command structs are what maps
//!   generate and links execute.
//!
//! # Who Uses This Crate
//!
//! - `datamap-session` builds identity tracking and the unit of work on top of
//!   these contracts.
//! - `datamap-memory` implements [`DataLink`] in memory.
//!
//! Most applications should use the `datamap` facade.

pub mod column_set;
pub mod command;
pub mod error;
pub mod identifiers;
pub mod link;
pub mod model;
pub mod predicate;
pub mod record;
pub mod schema;
pub mod transaction;
pub mod value;

pub use column_set::ColumnSet;
pub use command::{Command, DeleteCommand, InsertCommand, QueryCommand, UpdateCommand};
pub use error::{Error, ErrorKind, Result};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use link::{DataLink, EngineInfo, LinkScope, RecordSet};
pub use model::Model;
pub use predicate::{CompareOp, Predicate, compare_values};
pub use record::Record;
pub use schema::{Schema, SchemaColumn};
pub use transaction::NestableTransaction;
pub use value::{FromValue, Value};
