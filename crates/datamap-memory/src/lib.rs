//! In-memory data link for DataMap Rust.
//!
//! `datamap-memory` implements [`DataLink`] over tables held in process
//! memory. It is small enough to reason about in tests and still behaves like
//! an engine where the mapping layer cares:
//!
//! - Queries return the table schema even when no row matches.
//! - An auto-increment column is filled on insert and returned to the caller.
//! - A row-version column starts at 1 and is bumped on every update.
//! - `begin`/`rollback` restore a snapshot of every table.
//! - Every command is appended to a trace log.
//!
//! # Example
//!
//! ```ignore
//! let link = Arc::new(MemoryLink::new());
//! link.create_table(
//!     TableDef::new("customers")
//!         .auto_increment("id")
//!         .column(SchemaColumn::new("name"))
//!         .row_version("row_version"),
//! )?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use datamap_core::{
    Command, DataLink, DeleteCommand, EngineInfo, Error, InsertCommand, Predicate, QueryCommand,
    Record, RecordSet, Result, Schema, SchemaColumn, UpdateCommand, Value,
};

// ============================================================================
// Table Definition
// ============================================================================

/// Definition of an in-memory table.
#[derive(Debug, Clone)]
pub struct TableDef {
    name: String,
    columns: Vec<SchemaColumn>,
    auto_increment: Option<String>,
    row_version: Option<String>,
}

impl TableDef {
    /// A table called `name` with no columns yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            auto_increment: None,
            row_version: None,
        }
    }

    /// Add a column.
    #[must_use]
    pub fn column(mut self, column: SchemaColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a read-only primary key filled from a counter on insert.
    #[must_use]
    pub fn auto_increment(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.columns
            .push(SchemaColumn::new(name.clone()).primary_key().read_only());
        self.auto_increment = Some(name);
        self
    }

    /// Add a read-only row-version column bumped on every update.
    #[must_use]
    pub fn row_version(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.columns.push(SchemaColumn::new(name.clone()).read_only());
        self.row_version = Some(name);
        self
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: Arc<Schema>,
    rows: Vec<Record>,
    next_id: i64,
    auto_increment: Option<usize>,
    row_version: Option<usize>,
}

impl Table {
    fn position(&self, column: &str) -> Result<usize> {
        self.schema
            .position(column)
            .ok_or_else(|| Error::link(format!("no such column '{column}'")))
    }

    fn check_unique(&self, candidate: &Record, skip: Option<usize>) -> Result<()> {
        let key = self.schema.identity_columns();
        if key.is_empty() {
            return Ok(());
        }
        // NULL never clashes, as in SQL unique constraints.
        let Some(candidate_key) = candidate.key(&key) else {
            return Ok(());
        };
        let clash = self
            .rows
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != skip)
            .any(|(_, row)| row.key(&key).as_deref() == Some(candidate_key.as_str()));
        if clash {
            return Err(Error::link(format!("duplicate key {candidate_key} in table")));
        }
        Ok(())
    }
}

// ============================================================================
// MemoryLink
// ============================================================================

type FailureRule = Box<dyn Fn(&Command) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    snapshot: Option<HashMap<String, Table>>,
    log: Vec<String>,
    failures: Vec<FailureRule>,
}

/// A [`DataLink`] over in-memory tables.
pub struct MemoryLink {
    engine: EngineInfo,
    open: AtomicBool,
    state: Mutex<MemoryState>,
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLink {
    /// An empty link with case-insensitive names.
    pub fn new() -> Self {
        Self::with_engine(EngineInfo::new("memory"))
    }

    /// An empty link reporting `engine`.
    pub fn with_engine(engine: EngineInfo) -> Self {
        Self {
            engine,
            open: AtomicBool::new(false),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::link("link is closed"))
        }
    }

    /// Create a table, replacing any table of the same name.
    pub fn create_table(&self, def: TableDef) -> Result<()> {
        let schema = Schema::new(def.columns).with_case_sensitivity(self.engine.case_sensitive_names);
        let auto_increment = match &def.auto_increment {
            Some(name) => Some(
                schema
                    .position(name)
                    .ok_or_else(|| Error::link(format!("no such column '{name}'")))?,
            ),
            None => None,
        };
        let row_version = match &def.row_version {
            Some(name) => Some(
                schema
                    .position(name)
                    .ok_or_else(|| Error::link(format!("no such column '{name}'")))?,
            ),
            None => None,
        };
        tracing::debug!(table = %def.name, columns = schema.len(), "Table created");
        self.lock().tables.insert(
            def.name,
            Table {
                schema: Arc::new(schema),
                rows: Vec::new(),
                next_id: 1,
                auto_increment,
                row_version,
            },
        );
        Ok(())
    }

    /// Insert a row directly, bypassing the log. Returns the stored row.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> Result<Record> {
        let command = InsertCommand {
            table: table.to_string(),
            columns: values
                .iter()
                .map(|(c, v)| ((*c).to_string(), v.clone()))
                .collect(),
        };
        let mut state = self.lock();
        insert_row(&mut state, &command)
    }

    /// Change matching rows directly, as another client would. The row
    /// version is bumped. Returns the number of rows changed.
    pub fn modify(&self, table: &str, predicate: &Predicate, values: &[(&str, Value)]) -> Result<usize> {
        let command = UpdateCommand {
            table: table.to_string(),
            columns: values
                .iter()
                .map(|(c, v)| ((*c).to_string(), v.clone()))
                .collect(),
            predicate: predicate.clone(),
        };
        let mut state = self.lock();
        Ok(update_rows(&mut state, &command)?.len())
    }

    /// Every row of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Trace strings of every command run through the link.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Forget the trace log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Fail every command for which `rule` returns true.
    pub fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&Command) -> bool + Send + Sync + 'static,
    {
        self.lock().failures.push(Box::new(rule));
    }

    /// Remove every failure rule.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Log `command` and apply failure rules.
    fn record(state: &mut MemoryState, command: Command) -> Result<()> {
        let trace = command.trace_string();
        tracing::trace!(command = %trace, "Memory command");
        state.log.push(trace.clone());
        if state.failures.iter().any(|rule| rule(&command)) {
            return Err(Error::link(format!("injected failure: {trace}")));
        }
        Ok(())
    }
}

fn table_mut<'a>(state: &'a mut MemoryState, name: &str) -> Result<&'a mut Table> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| Error::link(format!("no such table '{name}'")))
}

fn insert_row(state: &mut MemoryState, command: &InsertCommand) -> Result<Record> {
    let table = table_mut(state, &command.table)?;
    let mut row = Record::new(table.schema.clone());
    for (column, value) in &command.columns {
        let pos = table.position(column)?;
        row.set(pos, value.clone());
    }
    if let Some(pos) = table.auto_increment {
        match row.get(pos).and_then(Value::as_i64) {
            Some(id) => table.next_id = table.next_id.max(id + 1),
            None => {
                row.set(pos, Value::BigInt(table.next_id));
                table.next_id += 1;
            }
        }
    }
    if let Some(pos) = table.row_version {
        row.set(pos, Value::BigInt(1));
    }
    table.check_unique(&row, None)?;
    table.rows.push(row.clone());
    Ok(row)
}

fn update_rows(state: &mut MemoryState, command: &UpdateCommand) -> Result<Vec<Record>> {
    let table = table_mut(state, &command.table)?;
    let mut assignments = Vec::with_capacity(command.columns.len());
    for (column, value) in &command.columns {
        assignments.push((table.position(column)?, value.clone()));
    }
    let matching: Vec<usize> = table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| command.predicate.matches(row))
        .map(|(idx, _)| idx)
        .collect();

    let mut updated = Vec::with_capacity(matching.len());
    for idx in matching {
        let mut row = table.rows[idx].clone();
        for (pos, value) in &assignments {
            row.set(*pos, value.clone());
        }
        if let Some(pos) = table.row_version {
            let next = row.get(pos).and_then(Value::as_i64).unwrap_or(0) + 1;
            row.set(pos, Value::BigInt(next));
        }
        table.check_unique(&row, Some(idx))?;
        table.rows[idx] = row.clone();
        updated.push(row);
    }
    Ok(updated)
}

impl DataLink for MemoryLink {
    fn engine(&self) -> &EngineInfo {
        &self.engine
    }

    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn query(&self, command: &QueryCommand) -> Result<RecordSet> {
        self.ensure_open()?;
        let mut state = self.lock();
        Self::record(&mut state, Command::Query(command.clone()))?;
        let table = table_mut(&mut state, &command.table)?;
        let records: Vec<Record> = table
            .rows
            .iter()
            .filter(|row| command.predicate.as_ref().is_none_or(|p| p.matches(row)))
            .take(command.top.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(RecordSet {
            schema: table.schema.clone(),
            records,
        })
    }

    fn insert(&self, command: &InsertCommand) -> Result<Option<Record>> {
        self.ensure_open()?;
        let mut state = self.lock();
        Self::record(&mut state, Command::Insert(command.clone()))?;
        insert_row(&mut state, command).map(Some)
    }

    fn update(&self, command: &UpdateCommand) -> Result<Option<Record>> {
        self.ensure_open()?;
        let mut state = self.lock();
        Self::record(&mut state, Command::Update(command.clone()))?;
        Ok(update_rows(&mut state, command)?.into_iter().next())
    }

    fn delete(&self, command: &DeleteCommand) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.lock();
        Self::record(&mut state, Command::Delete(command.clone()))?;
        let table = table_mut(&mut state, &command.table)?;
        let before = table.rows.len();
        table.rows.retain(|row| !command.predicate.matches(row));
        Ok((before - table.rows.len()) as u64)
    }

    fn begin(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.lock();
        if state.snapshot.is_some() {
            return Err(Error::Transaction {
                message: "transaction already open".to_string(),
            });
        }
        state.log.push("BEGIN".to_string());
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if state.snapshot.take().is_none() {
            return Err(Error::Transaction {
                message: "no transaction to commit".to_string(),
            });
        }
        state.log.push("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(snapshot) = state.snapshot.take() else {
            return Err(Error::Transaction {
                message: "no transaction to roll back".to_string(),
            });
        };
        state.tables = snapshot;
        state.log.push("ROLLBACK".to_string());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryLink")
            .field("engine", &self.engine.name)
            .field("open", &self.is_open())
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("in_transaction", &state.snapshot.is_some())
            .finish()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> MemoryLink {
        let link = MemoryLink::new();
        link.create_table(
            TableDef::new("customers")
                .auto_increment("id")
                .column(SchemaColumn::new("name"))
                .row_version("row_version"),
        )
        .unwrap();
        link.open().unwrap();
        link
    }

    #[test]
    fn test_insert_assigns_id_and_version() {
        let link = link();
        let row = link
            .insert(&InsertCommand {
                table: "customers".to_string(),
                columns: vec![("name".to_string(), Value::from("Ada"))],
            })
            .unwrap()
            .unwrap();
        assert_eq!(row.get_named("id"), Some(&Value::BigInt(1)));
        assert_eq!(row.get_named("row_version"), Some(&Value::BigInt(1)));
        assert_eq!(link.row_count("customers"), 1);
    }

    #[test]
    fn test_update_bumps_version() {
        let link = link();
        link.seed("customers", &[("name", Value::from("Ada"))]).unwrap();
        let row = link
            .update(&UpdateCommand {
                table: "customers".to_string(),
                columns: vec![("name".to_string(), Value::from("Grace"))],
                predicate: Predicate::eq("id", 1i64),
            })
            .unwrap()
            .unwrap();
        assert_eq!(row.get_named("name"), Some(&Value::from("Grace")));
        assert_eq!(row.get_named("row_version"), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_query_returns_schema_without_rows() {
        let link = link();
        let set = link.query(&QueryCommand::new("customers").top(1)).unwrap();
        assert!(set.records.is_empty());
        assert_eq!(set.schema.len(), 3);
    }

    #[test]
    fn test_closed_link_rejects_commands() {
        let link = link();
        link.close().unwrap();
        assert!(link.query(&QueryCommand::new("customers")).is_err());
    }

    #[test]
    fn test_rollback_restores_tables() {
        let link = link();
        link.begin().unwrap();
        link.seed("customers", &[("name", Value::from("Ada"))]).unwrap();
        link.rollback().unwrap();
        assert_eq!(link.row_count("customers"), 0);
        assert_eq!(link.log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let link = link();
        link.seed("customers", &[("id", Value::BigInt(7))]).unwrap();
        assert!(link.seed("customers", &[("id", Value::BigInt(7))]).is_err());
        let next = link.seed("customers", &[("name", Value::from("x"))]).unwrap();
        assert_eq!(next.get_named("id"), Some(&Value::BigInt(8)));
    }

    #[test]
    fn test_null_unique_values_do_not_clash() {
        let link = MemoryLink::new();
        link.create_table(
            TableDef::new("tags")
                .column(SchemaColumn::new("code").unique().nullable())
                .column(SchemaColumn::new("label")),
        )
        .unwrap();
        link.seed("tags", &[("label", Value::from("a"))]).unwrap();
        link.seed("tags", &[("label", Value::from("b"))]).unwrap();
        link.seed("tags", &[("code", Value::from("x"))]).unwrap();
        assert!(link.seed("tags", &[("code", Value::from("x"))]).is_err());
        assert_eq!(link.row_count("tags"), 3);
    }

    #[test]
    fn test_failure_rule() {
        let link = link();
        link.fail_when(|c| matches!(c, Command::Delete(_)));
        let err = link
            .delete(&DeleteCommand {
                table: "customers".to_string(),
                predicate: Predicate::eq("id", 1i64),
            })
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        link.clear_failures();
        assert_eq!(
            link.delete(&DeleteCommand {
                table: "customers".to_string(),
                predicate: Predicate::eq("id", 1i64),
            })
            .unwrap(),
            0
        );
    }
}
