//! Low-level commands handed to a [`DataLink`](crate::link::DataLink).
//!
//! Commands are plain data. Maps build them from records and predicates; the
//! link decides how to run them. `trace_string` renders a SQL-like text used
//! only for logging and tests.

use std::fmt;

use crate::identifiers::quote_ident;
use crate::predicate::Predicate;
use crate::value::Value;

/// `SELECT` against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCommand {
    pub table: String,
    pub predicate: Option<Predicate>,
    pub top: Option<usize>,
}

impl QueryCommand {
    /// Select every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
            top: None,
        }
    }

    /// AND a predicate into the WHERE clause.
    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Predicate::and_opt(self.predicate.take(), Some(predicate));
        self
    }

    /// Limit the number of rows returned.
    #[must_use]
    pub fn top(mut self, n: usize) -> Self {
        self.top = Some(n);
        self
    }
}

/// `INSERT` of one row; the link returns the persisted row when it can.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub table: String,
    pub columns: Vec<(String, Value)>,
}

/// `UPDATE` of the rows matching `predicate`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub table: String,
    pub columns: Vec<(String, Value)>,
    pub predicate: Predicate,
}

/// `DELETE` of the rows matching `predicate`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub table: String,
    pub predicate: Predicate,
}

/// Any command a map can generate.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Query(QueryCommand),
    Insert(InsertCommand),
    Update(UpdateCommand),
    Delete(DeleteCommand),
}

impl Command {
    /// Whether the command has enough content to be sent.
    pub fn can_be_executed(&self) -> bool {
        match self {
            Command::Query(q) => !q.table.is_empty(),
            Command::Insert(i) => !i.table.is_empty() && !i.columns.is_empty(),
            Command::Update(u) => !u.table.is_empty() && !u.columns.is_empty(),
            Command::Delete(d) => !d.table.is_empty(),
        }
    }

    /// SQL-like rendering for logs.
    pub fn trace_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Query(q) => {
                f.write_str("SELECT ")?;
                if let Some(n) = q.top {
                    write!(f, "TOP({n}) ")?;
                }
                write!(f, "* FROM {}", quote_ident(&q.table))?;
                if let Some(p) = &q.predicate {
                    write!(f, " WHERE {p}")?;
                }
                Ok(())
            }
            Command::Insert(i) => {
                let names: Vec<String> = i.columns.iter().map(|(c, _)| quote_ident(c)).collect();
                let values: Vec<String> = i.columns.iter().map(|(_, v)| v.to_string()).collect();
                write!(
                    f,
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(&i.table),
                    names.join(", "),
                    values.join(", ")
                )
            }
            Command::Update(u) => {
                let sets: Vec<String> = u
                    .columns
                    .iter()
                    .map(|(c, v)| format!("{} = {}", quote_ident(c), v))
                    .collect();
                write!(
                    f,
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(&u.table),
                    sets.join(", "),
                    u.predicate
                )
            }
            Command::Delete(d) => {
                write!(f, "DELETE FROM {} WHERE {}", quote_ident(&d.table), d.predicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_trace() {
        let q = QueryCommand::new("orders")
            .filter(Predicate::eq("id", 1))
            .filter(Predicate::eq("kind", "x"))
            .top(1);
        assert_eq!(
            Command::Query(q).trace_string(),
            "SELECT TOP(1) * FROM \"orders\" WHERE (\"id\" = 1 AND \"kind\" = 'x')"
        );
    }

    #[test]
    fn test_update_requires_columns() {
        let u = UpdateCommand {
            table: "orders".to_string(),
            columns: vec![],
            predicate: Predicate::eq("id", 1),
        };
        assert!(!Command::Update(u).can_be_executed());
    }

    #[test]
    fn test_insert_trace() {
        let i = InsertCommand {
            table: "orders".to_string(),
            columns: vec![("customer_id".to_string(), Value::BigInt(3))],
        };
        let cmd = Command::Insert(i);
        assert!(cmd.can_be_executed());
        assert_eq!(
            cmd.trace_string(),
            "INSERT INTO \"orders\" (\"customer_id\") VALUES (3)"
        );
    }
}
