//! Structured WHERE predicates.
//!
//! Maps build predicates from identity values, discriminators and user
//! filters; links translate them into their dialect (or, for in-memory
//! engines, evaluate them directly with [`Predicate::matches`]).

use std::cmp::Ordering;
use std::fmt;

use crate::identifiers::quote_ident;
use crate::record::Record;
use crate::value::Value;

/// Comparison operator of a [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// SQL spelling of the operator.
    pub const fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A boolean expression over the columns of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column op value`
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    /// `column IS NULL`
    IsNull(String),
    /// All of the inner predicates.
    And(Vec<Predicate>),
    /// Any of the inner predicates.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    /// `column <> value`
    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    /// `column < value`
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    /// `column > value`
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    /// Generic comparison.
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::IsNull(column.into())
    }

    /// Negate this predicate.
    #[must_use]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Conjunction, flattening nested `And`s.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::And(parts) => parts,
            p => vec![p],
        };
        match other {
            Predicate::And(more) => parts.extend(more),
            p => parts.push(p),
        }
        Predicate::And(parts)
    }

    /// Disjunction.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(vec![self, other])
    }

    /// AND together an optional left side with an optional right side.
    pub fn and_opt(left: Option<Predicate>, right: Option<Predicate>) -> Option<Predicate> {
        match (left, right) {
            (Some(l), Some(r)) => Some(l.and(r)),
            (l, r) => l.or(r),
        }
    }

    /// `col1 = v1 AND col2 = v2 ...` for every column of `record`.
    pub fn from_record(record: &Record) -> Option<Predicate> {
        let mut parts: Vec<Predicate> = record
            .iter()
            .map(|(column, value)| {
                if value.is_null() {
                    Predicate::is_null(column)
                } else {
                    Predicate::eq(column, value.clone())
                }
            })
            .collect();
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Predicate::And(parts)),
        }
    }

    /// Evaluate against a row. Unknown columns compare as NULL.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Compare { column, op, value } => {
                let current = record.get_named(column).unwrap_or(&Value::Null);
                if current.is_null() || value.is_null() {
                    return false;
                }
                match compare_values(current, value) {
                    Some(ordering) => match op {
                        CompareOp::Eq => ordering == Ordering::Equal,
                        CompareOp::Ne => ordering != Ordering::Equal,
                        CompareOp::Lt => ordering == Ordering::Less,
                        CompareOp::Le => ordering != Ordering::Greater,
                        CompareOp::Gt => ordering == Ordering::Greater,
                        CompareOp::Ge => ordering != Ordering::Less,
                    },
                    None => *op == CompareOp::Ne,
                }
            }
            Predicate::IsNull(column) => record.get_named(column).is_none_or(Value::is_null),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Predicate::Not(inner) => !inner.matches(record),
        }
    }
}

/// Order two values, widening numerics; `None` when not comparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        return Some(l.cmp(&r));
    }
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Value::Text(l), Value::Text(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Bytes(l), Value::Bytes(r)) => Some(l.cmp(r)),
        (Value::Uuid(l), Value::Uuid(r)) => Some(l.cmp(r)),
        (l, r) if l == r => Some(Ordering::Equal),
        _ => None,
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => {
                write!(f, "{} {} {}", quote_ident(column), op.as_sql(), value)
            }
            Predicate::IsNull(column) => write!(f, "{} IS NULL", quote_ident(column)),
            Predicate::And(parts) => write_joined(f, parts, " AND "),
            Predicate::Or(parts) => write_joined(f, parts, " OR "),
            Predicate::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (n, part) in parts.iter().enumerate() {
        if n > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{part}")?;
    }
    f.write_str(")")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, SchemaColumn};
    use std::sync::Arc;

    fn row() -> Record {
        let schema = Arc::new(Schema::new(vec![
            SchemaColumn::new("id"),
            SchemaColumn::new("kind"),
            SchemaColumn::new("note").nullable(),
        ]));
        Record::from_values(schema, vec![Value::Int(5), "retail".into(), Value::Null]).unwrap()
    }

    #[test]
    fn test_matches_widened_integers() {
        assert!(Predicate::eq("id", 5_i64).matches(&row()));
        assert!(Predicate::gt("id", 4_i64).matches(&row()));
        assert!(!Predicate::lt("id", 5).matches(&row()));
    }

    #[test]
    fn test_matches_null_semantics() {
        assert!(Predicate::is_null("note").matches(&row()));
        assert!(!Predicate::eq("note", Value::Null).matches(&row()));
        assert!(Predicate::is_null("missing").matches(&row()));
    }

    #[test]
    fn test_and_flattens() {
        let p = Predicate::eq("id", 5)
            .and(Predicate::eq("kind", "retail"))
            .and(Predicate::is_null("note"));
        match &p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.matches(&row()));
        assert_eq!(
            p.to_string(),
            "(\"id\" = 5 AND \"kind\" = 'retail' AND \"note\" IS NULL)"
        );
    }

    #[test]
    fn test_and_opt() {
        assert!(Predicate::and_opt(None, None).is_none());
        let p = Predicate::and_opt(Some(Predicate::eq("id", 1)), None).unwrap();
        assert_eq!(p, Predicate::eq("id", 1));
    }

    #[test]
    fn test_from_record() {
        let p = Predicate::from_record(&row().project(&[0])).unwrap();
        assert_eq!(p, Predicate::eq("id", Value::Int(5)));
    }

    #[test]
    fn test_not_and_or() {
        assert!(Predicate::eq("kind", "wholesale").not().matches(&row()));
        assert!(
            Predicate::eq("kind", "wholesale")
                .or(Predicate::eq("id", 5))
                .matches(&row())
        );
    }
}
