//! `MigrationRecord` - one entry in the `migrations` table or collection

use crate::executor::{SqlRow, StoreError};
use serde::{Deserialize, Serialize};

/// A recorded (applied) migration version
///
/// Stored as a row of `migrations(version)` or a `{"version": n}` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
}

impl MigrationRecord {
    #[must_use]
    pub fn new(version: i64) -> Self {
        Self { version }
    }

    /// Expected column order: `version`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Parse` if the first column is not an integer.
    pub fn from_row(row: &SqlRow) -> Result<Self, StoreError> {
        Ok(Self {
            version: row.get_i64(0)?,
        })
    }
}
