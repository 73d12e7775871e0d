//! Error types shared by every DataMap crate.
//!
//! Errors fall into four families (see [`ErrorKind`]): configuration mistakes
//! are reported while a map is being built or validated, state errors when an
//! operation is used out of order, concurrency errors when a row-version check
//! fails, and execution errors when the underlying link rejects a command.

use thiserror::Error as ThisError;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Map or column configuration is invalid.
    Configuration,
    /// An operation was used in a state that does not permit it.
    State,
    /// Optimistic concurrency check failed.
    Concurrency,
    /// The link or the engine failed to run a command.
    Execution,
}

///
/// Error
///
/// Every failure the mapping layer can surface.
///
#[derive(Debug, ThisError)]
pub enum Error {
    /// Two columns or two members of one map share a name.
    #[error("duplicate {what} '{name}' in map for '{entity}'")]
    DuplicateName {
        entity: &'static str,
        what: &'static str,
        name: String,
    },

    /// A table, column or member name is not a valid identifier.
    #[error("invalid identifier '{name}' for {what}")]
    InvalidIdentifier { what: &'static str, name: String },

    /// A configured member or column cannot be resolved.
    #[error("{what} '{name}' not found for '{entity}'")]
    NotFound {
        entity: &'static str,
        what: &'static str,
        name: String,
    },

    /// Structural configuration was changed after validation.
    #[error("map for '{entity}' is validated and cannot be reconfigured")]
    MapValidated { entity: &'static str },

    /// An explicit map is already registered for the type.
    #[error("a map for '{entity}' is already registered")]
    MapAlreadyRegistered { entity: &'static str },

    /// No identity columns exist, so an identity key cannot be produced.
    #[error("no identity columns available for '{entity}'")]
    NoIdentity { entity: &'static str },

    /// An operation was submitted twice.
    #[error("{operation} operation for '{entity}' is already submitted")]
    AlreadySubmitted {
        entity: &'static str,
        operation: &'static str,
    },

    /// The entity is not attached to any map.
    #[error("entity of type '{entity}' is not attached to a map")]
    NotAttached { entity: &'static str },

    /// The entity is attached to a different map.
    #[error("entity of type '{entity}' is attached to another map")]
    AttachedElsewhere { entity: &'static str },

    /// An entity taking part in a cascade belongs to another repository.
    #[error("entity of type '{entity}' is not managed by this repository")]
    ForeignRepository { entity: &'static str },

    /// The row changed (or vanished) since it was captured.
    #[error("row in '{table}' changed: {column} was '{expected}', now '{found}'")]
    Changed {
        table: String,
        column: String,
        expected: String,
        found: String,
    },

    /// No command could be built.
    #[error("cannot create command: {reason}")]
    CannotCreate { reason: String },

    /// A record value cannot be converted into the member type.
    #[error("cannot convert column '{column}' from {found} to {expected}")]
    Conversion {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The link reported a failure.
    #[error("link error: {message}")]
    Link { message: String },

    /// Transaction bookkeeping failed.
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// The owning repository is gone.
    #[error("repository has been dropped")]
    Disposed,
}

impl Error {
    /// Build a link error from any message.
    pub fn link(message: impl Into<String>) -> Self {
        Error::Link {
            message: message.into(),
        }
    }

    /// Build a conversion error for a column.
    pub fn conversion(column: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Error::Conversion {
            column: column.into(),
            expected,
            found,
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateName { .. }
            | Error::InvalidIdentifier { .. }
            | Error::NotFound { .. }
            | Error::MapValidated { .. }
            | Error::MapAlreadyRegistered { .. }
            | Error::NoIdentity { .. }
            | Error::Conversion { .. } => ErrorKind::Configuration,
            Error::AlreadySubmitted { .. }
            | Error::NotAttached { .. }
            | Error::AttachedElsewhere { .. }
            | Error::ForeignRepository { .. }
            | Error::Disposed => ErrorKind::State,
            Error::Changed { .. } => ErrorKind::Concurrency,
            Error::CannotCreate { .. } | Error::Link { .. } | Error::Transaction { .. } => {
                ErrorKind::Execution
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        let err = Error::AlreadySubmitted {
            entity: "Order",
            operation: "insert",
        };
        assert_eq!(err.kind(), ErrorKind::State);

        let err = Error::Changed {
            table: "orders".to_string(),
            column: "version".to_string(),
            expected: "1".to_string(),
            found: "2".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Concurrency);
        assert_eq!(err.to_string(), "row in 'orders' changed: version was '1', now '2'");

        assert_eq!(Error::link("boom").kind(), ErrorKind::Execution);
        assert_eq!(
            Error::MapValidated { entity: "Order" }.kind(),
            ErrorKind::Configuration
        );
    }
}
