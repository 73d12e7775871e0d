//! The link contract: connection, command execution and raw transactions.
//!
//! A link wraps one engine connection. The mapping layer only ever talks to
//! the database through this trait, so engines (and test doubles) plug in by
//! implementing it.

use std::sync::Arc;

use crate::command::{DeleteCommand, InsertCommand, QueryCommand, UpdateCommand};
use crate::error::Result;
use crate::record::Record;
use crate::schema::Schema;

/// Static facts about the engine behind a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    /// Engine name used in logs.
    pub name: String,
    /// Whether the engine treats column names case-sensitively.
    pub case_sensitive_names: bool,
}

impl EngineInfo {
    /// Engine with case-insensitive names.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            case_sensitive_names: false,
        }
    }

    /// Set case sensitivity of names.
    #[must_use]
    pub fn case_sensitive(mut self, value: bool) -> Self {
        self.case_sensitive_names = value;
        self
    }
}

/// Rows returned by a query together with their schema.
///
/// The schema is present even when no rows matched, which is what schema
/// discovery relies on.
#[derive(Debug, Clone)]
pub struct RecordSet {
    pub schema: Arc<Schema>,
    pub records: Vec<Record>,
}

impl RecordSet {
    /// First row, if any.
    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    /// Take the first row, if any.
    pub fn into_first(self) -> Option<Record> {
        self.records.into_iter().next()
    }
}

/// Connection to a database engine.
pub trait DataLink: Send + Sync {
    /// Facts about the engine.
    fn engine(&self) -> &EngineInfo;

    /// Open the connection.
    fn open(&self) -> Result<()>;

    /// Close the connection.
    fn close(&self) -> Result<()>;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Run a query.
    fn query(&self, command: &QueryCommand) -> Result<RecordSet>;

    /// Insert a row, returning the persisted row when the engine can.
    fn insert(&self, command: &InsertCommand) -> Result<Option<Record>>;

    /// Update rows, returning the persisted row when exactly one was touched
    /// and the engine can report it.
    fn update(&self, command: &UpdateCommand) -> Result<Option<Record>>;

    /// Delete rows, returning how many were removed.
    fn delete(&self, command: &DeleteCommand) -> Result<u64>;

    /// Start an engine transaction.
    fn begin(&self) -> Result<()>;

    /// Commit the engine transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the engine transaction.
    fn rollback(&self) -> Result<()>;
}

/// Keeps a link open for a scope, closing it on drop only if the scope opened it.
pub struct LinkScope<'a> {
    link: &'a dyn DataLink,
    opened: bool,
}

impl<'a> LinkScope<'a> {
    /// Open `link` unless it is already open.
    pub fn enter(link: &'a dyn DataLink) -> Result<Self> {
        let opened = if link.is_open() {
            false
        } else {
            link.open()?;
            true
        };
        Ok(Self { link, opened })
    }
}

impl Drop for LinkScope<'_> {
    fn drop(&mut self) {
        if self.opened {
            if let Err(e) = self.link.close() {
                tracing::warn!(error = %e, "Failed to close link");
            }
        }
    }
}
