//! Error taxonomy for the temporal core.
//!
//! Internally every fallible path returns `Result<T, SagaError>`. At each
//! `#[pg_extern]` boundary the error is handed to `pgrx::error!`, which
//! unwinds into a clean Postgres `ERROR` (see `lib.rs`, `catalog.rs`,
//! `foreign_key.rs`). `SagaError` itself never crosses an FFI boundary —
//! it exists so that every raised error names the offending object and, for
//! integrity violations, the literal interval that failed, per spec §7.

use std::fmt;

use thiserror::Error;

/// One variant per spec.md §7 error category.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Unknown column/table/era, duplicate era, NULL required argument,
    /// system column used.
    #[error("{message}")]
    Argument { message: String },

    /// Start/end columns disagree on type or collation; child/parent
    /// columns disagree.
    #[error("type mismatch on {object}: {message}")]
    TypeMismatch { object: String, message: String },

    /// RESTRICT drop with live dependents; forbidden FK action.
    #[error("cannot drop {object}: {reason}")]
    Dependency { object: String, reason: String },

    /// Overlap in a unique key's range, uncovered child range, MATCH FULL
    /// with partial NULLs.
    #[error("{constraint} violated on {table}: {detail}")]
    Integrity {
        constraint: String,
        table: String,
        detail: String,
    },

    /// Attempt to drop an era column/range type/backing object still
    /// referenced; a rename that cannot be reliably followed.
    #[error("catalog inconsistent after DDL on {object}: {reason}")]
    Consistency { object: String, reason: String },

    /// Unreachable plan row, generated-column conflict, or a host DBMS
    /// error surfaced with its plan_seq context.
    #[error("plan row {plan_op_seq} failed: {detail}")]
    PlanExecute { plan_op_seq: i64, detail: String },
}

impl SagaError {
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    pub fn type_mismatch(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            object: object.into(),
            message: message.into(),
        }
    }

    pub fn dependency(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dependency {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub fn integrity(
        constraint: impl Into<String>,
        table: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            constraint: constraint.into(),
            table: table.into(),
            detail: detail.into(),
        }
    }

    pub fn consistency(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Consistency {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub fn plan_execute(plan_op_seq: i64, detail: impl Into<String>) -> Self {
        Self::PlanExecute {
            plan_op_seq,
            detail: detail.into(),
        }
    }

    /// SQLSTATE-flavored class name, used by foreign_key.rs when raising
    /// FOREIGN_KEY_VIOLATION-class errors and by tests asserting on error shape.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Argument { .. } => "ARGUMENT_ERROR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Dependency { .. } => "DEPENDENCY_ERROR",
            Self::Integrity { .. } => "INTEGRITY_VIOLATION",
            Self::Consistency { .. } => "CONSISTENCY_ERROR",
            Self::PlanExecute { .. } => "PLAN_EXECUTE_ERROR",
        }
    }
}

/// Formats a half-open interval the way error messages should quote it,
/// e.g. `[2024-01-01, 2024-06-01)`. Mirrors `sweep::format_range`'s bracket
/// convention but keeps a space after the comma for prose-style messages.
pub fn fmt_interval(from: &str, until: &str) -> String {
    format!("[{}, {})", from, until)
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schema-qualified object name, used to build consistent "naming the
/// offending object" error text across catalog.rs/unique_key.rs/foreign_key.rs.
pub struct ObjectRef(pub String);

impl ObjectRef {
    pub fn table(schema: &str, table: &str) -> Self {
        Self(format!("{schema}.{table}"))
    }

    pub fn constraint(table: &str, name: &str) -> Self {
        Self(format!("{table}.{name}"))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ObjectRef> for String {
    fn from(object: ObjectRef) -> String {
        object.0
    }
}

pub type SagaResult<T> = Result<T, SagaError>;
