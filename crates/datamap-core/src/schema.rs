//! Column metadata for the rows a link returns.
//!
//! A [`Schema`] is produced by the link for every result set (even an empty
//! one) and shared by all records of that result through an `Arc`.

use serde::{Deserialize, Serialize};

/// A column of a table as reported by the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    /// Column name in the database.
    pub name: String,
    /// Whether this column is part of the primary key.
    pub primary_key: bool,
    /// Whether values of this column are unique.
    pub unique: bool,
    /// Whether the column is generated by the engine (identity, row version,
    /// computed) and therefore excluded from write commands.
    pub read_only: bool,
    /// Whether this column is nullable.
    pub nullable: bool,
}

impl SchemaColumn {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            unique: false,
            read_only: false,
            nullable: false,
        }
    }

    /// Mark as primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as engine-generated.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Ordered column list of a table or result set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<SchemaColumn>,
    case_sensitive: bool,
}

impl Schema {
    /// Create a schema with case-insensitive name lookup.
    pub fn new(columns: Vec<SchemaColumn>) -> Self {
        Self {
            columns,
            case_sensitive: false,
        }
    }

    /// Set whether column names are case-sensitive.
    #[must_use]
    pub fn with_case_sensitivity(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Whether column names are case-sensitive.
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Column definitions in order.
    pub fn columns(&self) -> &[SchemaColumn] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column at `idx`.
    pub fn column(&self, idx: usize) -> Option<&SchemaColumn> {
        self.columns.get(idx)
    }

    /// Position of the column called `name`.
    ///
    /// An exact match always wins. Without case sensitivity a single
    /// case-insensitive match is accepted; several are treated as not found.
    pub fn position(&self, name: &str) -> Option<usize> {
        if let Some(idx) = self.columns.iter().position(|c| c.name == name) {
            return Some(idx);
        }
        if self.case_sensitive {
            return None;
        }
        let mut matches = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.name.eq_ignore_ascii_case(name))
            .map(|(idx, _)| idx);
        match (matches.next(), matches.next()) {
            (Some(idx), None) => Some(idx),
            _ => None,
        }
    }

    /// Positions of the primary-key columns.
    pub fn primary_key_columns(&self) -> Vec<usize> {
        self.positions_where(|c| c.primary_key)
    }

    /// Positions of unique-valued columns that are not part of the primary key.
    pub fn unique_valued_columns(&self) -> Vec<usize> {
        self.positions_where(|c| c.unique && !c.primary_key)
    }

    /// Columns that identify a row: the primary key, else the unique columns.
    pub fn identity_columns(&self) -> Vec<usize> {
        let pk = self.primary_key_columns();
        if pk.is_empty() {
            self.unique_valued_columns()
        } else {
            pk
        }
    }

    /// A schema holding only the columns at `positions`, in that order.
    #[must_use]
    pub fn project(&self, positions: &[usize]) -> Schema {
        Schema {
            columns: positions
                .iter()
                .filter_map(|idx| self.columns.get(*idx).cloned())
                .collect(),
            case_sensitive: self.case_sensitive,
        }
    }

    fn positions_where(&self, pred: impl Fn(&SchemaColumn) -> bool) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| pred(c))
            .map(|(idx, _)| idx)
            .collect()
    }
}
