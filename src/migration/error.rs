//! Migration-specific error types

use crate::executor::StoreError;
use std::fmt;
use thiserror::Error;

/// Which half of a script an operation was running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Migration-specific errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A declared version has an empty script for the requested direction
    #[error("migration script {version} ({direction}) can't be blank")]
    BlankScript { version: i64, direction: Direction },

    /// The store recorded a version the registry does not know about
    #[error("no {direction} script registered for recorded migration version {version}")]
    MissingScript { version: i64, direction: Direction },

    /// The tracking table is absent or could not be probed
    #[error("migration table {table} not found: {source}")]
    TableMissing {
        table: &'static str,
        #[source]
        source: StoreError,
    },

    /// The backend has no meaningful implementation of the operation
    #[error("{0} is not supported by this backend")]
    NotSupported(&'static str),

    /// Reading or writing tracking state failed
    #[error("{operation} failed{}: {source}", version_suffix(.version))]
    Store {
        operation: &'static str,
        version: Option<i64>,
        #[source]
        source: StoreError,
    },

    /// A script failed and its effects were rolled back (relational) or left as-is (document)
    #[error("failed to execute migration {direction} script with version {version}: {source}")]
    Execution {
        direction: Direction,
        version: i64,
        #[source]
        source: StoreError,
    },

    /// Rolling back a failed version failed too; the store state is unknown
    #[error("failed to rollback migration with version {version}: {source} (after: {cause})")]
    RollbackFailed {
        version: i64,
        #[source]
        source: StoreError,
        cause: StoreError,
    },

    /// Known versions are missing from the tracking store
    #[error("migration with version {versions:?} is not migrated!")]
    NotMigrated { versions: Vec<i64> },

    /// Migration directory or file not found
    #[error("migration file not found: {0}")]
    FileNotFound(String),

    /// Invalid migration file name or layout
    #[error("invalid migration format: {0}")]
    InvalidFormat(String),
}

fn version_suffix(version: &Option<i64>) -> String {
    version.map_or_else(String::new, |v| format!(" for version {v}"))
}

impl MigrationError {
    pub(crate) fn store(operation: &'static str, version: Option<i64>, source: StoreError) -> Self {
        MigrationError::Store {
            operation,
            version,
            source,
        }
    }

    /// Version this error refers to, when there is exactly one
    pub fn version(&self) -> Option<i64> {
        match self {
            MigrationError::BlankScript { version, .. }
            | MigrationError::MissingScript { version, .. }
            | MigrationError::Execution { version, .. }
            | MigrationError::RollbackFailed { version, .. } => Some(*version),
            MigrationError::Store { version, .. } => *version,
            MigrationError::NotMigrated { versions } if versions.len() == 1 => Some(versions[0]),
            _ => None,
        }
    }

    /// Configuration errors are never worth retrying
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MigrationError::BlankScript { .. }
                | MigrationError::MissingScript { .. }
                | MigrationError::TableMissing { .. }
                | MigrationError::NotSupported(_)
                | MigrationError::FileNotFound(_)
                | MigrationError::InvalidFormat(_)
        )
    }
}
