//! Rows of column values bound to a shared schema.

use std::sync::Arc;

use crate::column_set::ColumnSet;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::value::Value;

/// Separator between identity-key fragments.
const KEY_SEPARATOR: char = '|';

/// A row: a schema plus one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Record {
    /// A record of NULLs for `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = vec![Value::Null; schema.len()];
        Self { schema, values }
    }

    /// A record from explicit values; the count must match the schema.
    pub fn from_values(schema: Arc<Schema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(Error::CannotCreate {
                reason: format!(
                    "record has {} values for {} columns",
                    values.len(),
                    schema.len()
                ),
            });
        }
        Ok(Self { schema, values })
    }

    /// The shared schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a position.
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of the column called `name`.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.schema.position(name).and_then(|idx| self.values.get(idx))
    }

    /// Store a value at a position. Positions outside the schema are ignored.
    pub fn set(&mut self, idx: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(idx) {
            *slot = value;
        }
    }

    /// Store a value into the column called `name`.
    pub fn set_named(&mut self, name: &str, value: Value) -> Result<()> {
        let idx = self.schema.position(name).ok_or_else(|| Error::NotFound {
            entity: "record",
            what: "column",
            name: name.to_string(),
        })?;
        self.values[idx] = value;
        Ok(())
    }

    /// `(column name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    /// Positions whose value differs from the same-named column of `original`.
    ///
    /// A column missing from `original` counts as changed.
    pub fn changed_columns(&self, original: &Record) -> ColumnSet {
        let mut changed = ColumnSet::empty(self.len());
        for (idx, column) in self.schema.columns().iter().enumerate() {
            let before = if Arc::ptr_eq(&self.schema, &original.schema) {
                original.values.get(idx)
            } else {
                original.get_named(&column.name)
            };
            if before != self.values.get(idx) {
                changed.insert(idx);
            }
        }
        changed
    }

    /// The columns of `self` that differ from `original`, or `None` when equal.
    pub fn changes(&self, original: &Record) -> Option<Record> {
        let changed = self.changed_columns(original);
        if changed.is_empty() {
            return None;
        }
        Some(self.project(&changed.iter().collect::<Vec<_>>()))
    }

    /// A record holding only the columns at `positions`.
    #[must_use]
    pub fn project(&self, positions: &[usize]) -> Record {
        let schema = Arc::new(self.schema.project(positions));
        let values = positions
            .iter()
            .filter_map(|idx| self.values.get(*idx).cloned())
            .collect();
        Record { schema, values }
    }

    /// Deterministic key built from the values at `positions`, in that order.
    ///
    /// Returns `None` when `positions` is empty or any of those values is
    /// NULL; a row without a complete identity has no key yet.
    pub fn key(&self, positions: &[usize]) -> Option<String> {
        if positions.is_empty() {
            return None;
        }
        let mut key = String::new();
        for (n, idx) in positions.iter().enumerate() {
            let value = self.values.get(*idx)?;
            if value.is_null() {
                return None;
            }
            if n > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&value.key_fragment());
        }
        Some(key)
    }
}
