//! Database error types.
//!
//! Provides the error taxonomy shared by the storage core: structural,
//! referential-integrity, resource and not-found failures.

use std::fmt;
use thiserror::Error;

use crate::types::{StatementId, TableId};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug or broken invariant).
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,

    // Storage errors (0x0200 - 0x02FF)
    /// Unique index or unique constraint violated.
    UniqueViolation = 0x0200,
    /// Memory could not be reserved for an index build.
    OutOfMemory = 0x0201,
    /// Row has already been deleted.
    RowDeleted = 0x0202,
    /// An identity or row id counter has no values left.
    SequenceExhausted = 0x0203,

    // Integrity errors (0x0300 - 0x03FF)
    /// Foreign key integrity violated.
    IntegrityViolation = 0x0300,
    /// A cascade tried to change a row twice in conflicting ways.
    TriggeredDataChange = 0x0301,
    /// CHECK constraint violated.
    CheckViolation = 0x0302,
    /// NOT NULL violated.
    NullViolation = 0x0303,
    /// String value longer than its column.
    StringTruncation = 0x0304,

    // Schema errors (0x0400 - 0x04FF)
    /// Table not found.
    TableNotFound = 0x0400,
    /// Column not found.
    ColumnNotFound = 0x0401,
    /// Index not found.
    IndexNotFound = 0x0402,
    /// Constraint not found.
    ConstraintNotFound = 0x0403,
    /// Name already in use.
    AlreadyExists = 0x0404,
    /// Object is still referenced by another schema object.
    ObjectInUse = 0x0405,
    /// Type mismatch.
    TypeMismatch = 0x0406,

    // Statement errors (0x0500 - 0x05FF)
    /// Compiled statement not found.
    StatementNotFound = 0x0500,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Integrity",
            0x04 => "Schema",
            0x05 => "Statement",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for the ember storage core.
///
/// Each variant carries enough context (constraint, table, index or
/// column name) for the statement layer to report the failure precisely.
///
/// # Example
///
/// ```rust
/// use ember_common::error::{EmberError, EmberResult};
///
/// fn lookup(name: &str) -> EmberResult<()> {
///     Err(EmberError::IndexNotFound { index: name.to_string() })
/// }
/// assert!(lookup("IDX_1").is_err());
/// ```
#[derive(Debug, Error)]
pub enum EmberError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error. Indicates a broken invariant and is never recoverable.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Operation not supported.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Data corruption detected in a data file.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    /// Unique index violated by an insert.
    #[error("violation of unique index {index}")]
    UniqueIndexViolation {
        /// Name of the index.
        index: String,
    },

    /// Unique or primary key constraint violated by an insert.
    #[error("unique constraint violation: {constraint} in table {table}")]
    UniqueViolation {
        /// Name of the constraint.
        constraint: String,
        /// Name of the table.
        table: String,
    },

    /// Memory for an index build could not be reserved.
    #[error("out of memory: {message}")]
    OutOfMemory {
        /// What was being allocated.
        message: String,
    },

    /// A row handle no longer refers to a live row.
    #[error("row already deleted in table {table}")]
    RowDeleted {
        /// Name of the table.
        table: String,
    },

    /// The next identity or row id value would overflow.
    #[error("{sequence} values exhausted in table {table}")]
    SequenceExhausted {
        /// Which counter ran out.
        sequence: &'static str,
        /// Name of the table.
        table: String,
    },

    // ==========================================================================
    // Integrity Errors
    // ==========================================================================
    /// A foreign key check failed: a parent row is missing or a child
    /// row still references a parent being removed.
    #[error("integrity constraint violation: {constraint} table: {table}")]
    IntegrityViolation {
        /// Name of the foreign key.
        constraint: String,
        /// Table holding the offending row.
        table: String,
    },

    /// A cascade asked to change or delete a row in a way that conflicts
    /// with another change made by the same statement.
    #[error("triggered data change violation in table {table}")]
    TriggeredDataChange {
        /// Name of the table.
        table: String,
    },

    /// CHECK constraint evaluated to false.
    #[error("check constraint violation: {constraint} table: {table}")]
    CheckViolation {
        /// Name of the constraint.
        constraint: String,
        /// Name of the table.
        table: String,
    },

    /// Null value in a NOT NULL column.
    #[error("attempt to insert null into a non-nullable column: column: {column} table: {table}")]
    NullViolation {
        /// Name of the column.
        column: String,
        /// Name of the table.
        table: String,
    },

    /// String value too long for its column in strict size mode.
    #[error("string data, right truncation: column: {column} table: {table} length: {length} max: {max}")]
    StringTruncation {
        /// Name of the column.
        column: String,
        /// Name of the table.
        table: String,
        /// Length of the offending value.
        length: usize,
        /// Declared maximum length.
        max: usize,
    },

    // ==========================================================================
    // Schema Errors
    // ==========================================================================
    /// Table not found.
    #[error("table '{table}' not found")]
    TableNotFound {
        /// The missing table.
        table: String,
    },

    /// Table id does not refer to a registered table.
    #[error("table {table_id} not registered")]
    TableIdNotFound {
        /// The missing table id.
        table_id: TableId,
    },

    /// Column not found.
    #[error("column '{column}' not found in table '{table}'")]
    ColumnNotFound {
        /// The missing column.
        column: String,
        /// The table name.
        table: String,
    },

    /// Index not found.
    #[error("index '{index}' not found")]
    IndexNotFound {
        /// The missing index.
        index: String,
    },

    /// Constraint not found.
    #[error("constraint '{name}' not found in table '{table}'")]
    ConstraintNotFound {
        /// The missing constraint.
        name: String,
        /// The table name.
        table: String,
    },

    /// A schema object with this name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Kind of object ("table", "index", "constraint").
        kind: &'static str,
        /// The duplicate name.
        name: String,
    },

    /// An index cannot be dropped because a constraint depends on it.
    #[error("index '{index}' is used by a constraint and cannot be dropped")]
    IndexInUse {
        /// The index name.
        index: String,
    },

    /// A system-generated constraint cannot be dropped directly.
    #[error("a system constraint cannot be dropped: {name}")]
    DropSystemConstraint {
        /// The constraint name.
        name: String,
    },

    /// A primary key column cannot be dropped.
    #[error("column '{column}' is in the primary key of table '{table}'")]
    ColumnInPrimaryKey {
        /// The column name.
        column: String,
        /// The table name.
        table: String,
    },

    /// A column used by an index cannot be dropped.
    #[error("column '{column}' is used by index '{index}'")]
    ColumnInIndex {
        /// The column name.
        column: String,
        /// The index name.
        index: String,
    },

    /// A column referenced by a constraint cannot be dropped.
    #[error("column '{column}' is referenced by constraint '{constraint}'")]
    ColumnInConstraint {
        /// The column name.
        column: String,
        /// The constraint name.
        constraint: String,
    },

    /// A foreign key needs a unique constraint on the referenced columns.
    #[error("a unique constraint is required on the referenced columns of table '{table}'")]
    UniqueConstraintRequired {
        /// The referenced table.
        table: String,
    },

    /// Type mismatch.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type.
        expected: String,
        /// Actual type.
        actual: String,
    },

    // ==========================================================================
    // Statement Errors
    // ==========================================================================
    /// Compiled statement id unknown.
    #[error("statement {id} not found")]
    StatementNotFound {
        /// The statement id.
        id: StatementId,
    },
}

impl EmberError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::UniqueIndexViolation { .. } => ErrorCode::UniqueViolation,
            Self::UniqueViolation { .. } => ErrorCode::UniqueViolation,
            Self::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Self::RowDeleted { .. } => ErrorCode::RowDeleted,
            Self::SequenceExhausted { .. } => ErrorCode::SequenceExhausted,
            Self::IntegrityViolation { .. } => ErrorCode::IntegrityViolation,
            Self::TriggeredDataChange { .. } => ErrorCode::TriggeredDataChange,
            Self::CheckViolation { .. } => ErrorCode::CheckViolation,
            Self::NullViolation { .. } => ErrorCode::NullViolation,
            Self::StringTruncation { .. } => ErrorCode::StringTruncation,
            Self::TableNotFound { .. } => ErrorCode::TableNotFound,
            Self::TableIdNotFound { .. } => ErrorCode::TableNotFound,
            Self::ColumnNotFound { .. } => ErrorCode::ColumnNotFound,
            Self::IndexNotFound { .. } => ErrorCode::IndexNotFound,
            Self::ConstraintNotFound { .. } => ErrorCode::ConstraintNotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::IndexInUse { .. } => ErrorCode::ObjectInUse,
            Self::DropSystemConstraint { .. } => ErrorCode::ObjectInUse,
            Self::ColumnInPrimaryKey { .. } => ErrorCode::ObjectInUse,
            Self::ColumnInIndex { .. } => ErrorCode::ObjectInUse,
            Self::ColumnInConstraint { .. } => ErrorCode::ObjectInUse,
            Self::UniqueConstraintRequired { .. } => ErrorCode::ConstraintNotFound,
            Self::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Self::StatementNotFound { .. } => ErrorCode::StatementNotFound,
        }
    }

    /// Returns true if this error reports a broken internal invariant.
    ///
    /// Fatal errors leave the affected structure in an unknown state; the
    /// caller must not continue using it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::Corruption { .. })
    }

    /// Returns true if this error is a constraint or integrity failure.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::UniqueIndexViolation { .. }
                | Self::UniqueViolation { .. }
                | Self::IntegrityViolation { .. }
                | Self::TriggeredDataChange { .. }
                | Self::CheckViolation { .. }
                | Self::NullViolation { .. }
                | Self::StringTruncation { .. }
        )
    }

    /// Returns true for "unknown name or id" failures.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TableNotFound { .. }
                | Self::TableIdNotFound { .. }
                | Self::ColumnNotFound { .. }
                | Self::IndexNotFound { .. }
                | Self::ConstraintNotFound { .. }
                | Self::StatementNotFound { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = EmberError::UniqueViolation {
            constraint: "SYS_PK_1".into(),
            table: "T".into(),
        };
        assert_eq!(err.code(), ErrorCode::UniqueViolation);
        assert_eq!(err.code().category(), "Storage");

        let err = EmberError::TriggeredDataChange { table: "T".into() };
        assert_eq!(err.code().category(), "Integrity");
    }

    #[test]
    fn test_error_display() {
        let err = EmberError::IntegrityViolation {
            constraint: "FK_A".into(),
            table: "A".into(),
        };
        assert_eq!(
            err.to_string(),
            "integrity constraint violation: FK_A table: A"
        );
    }

    #[test]
    fn test_classification() {
        assert!(EmberError::internal("missing root").is_fatal());
        assert!(!EmberError::internal("x").is_integrity());
        assert!(EmberError::NullViolation {
            column: "C".into(),
            table: "T".into()
        }
        .is_integrity());
        assert!(EmberError::StatementNotFound {
            id: StatementId::new(3)
        }
        .is_not_found());
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EmberError = io_err.into();
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(!err.is_fatal());
    }
}
