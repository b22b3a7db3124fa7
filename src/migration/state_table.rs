//! Migration state table management
//!
//! The tracking table is deliberately minimal: one `BIGINT` column and no
//! primary key. Duplicate rows are tolerated and reverting deletes
//! with `>=` rather than `=`.

use super::{COLUMN_NAME, TABLE_NAME};
use sea_query::{ColumnDef, PostgresQueryBuilder, Table, TableCreateStatement};
use std::sync::LazyLock;

/// Build the `migrations` tracking table definition
pub fn create_state_table() -> TableCreateStatement {
    Table::create()
        .table(TABLE_NAME)
        .col(ColumnDef::new(COLUMN_NAME).big_integer().not_null())
        .to_owned()
}

/// `CREATE TABLE "migrations" ( "version" bigint NOT NULL )`
pub static CREATE_TABLE_SQL: LazyLock<String> =
    LazyLock::new(|| create_state_table().build(PostgresQueryBuilder));

/// Highest recorded version first
pub const SELECT_LATEST_SQL: &str = "SELECT version FROM migrations ORDER BY version DESC";

/// Every recorded version, ascending
pub const SELECT_ALL_SQL: &str = "SELECT version FROM migrations ORDER BY version";

pub const INSERT_VERSION_SQL: &str = "INSERT INTO migrations (version) VALUES ($1)";

/// Removes the reverted version and anything above it
pub const DELETE_FROM_VERSION_SQL: &str = "DELETE FROM migrations WHERE version >= $1";

pub const TRUNCATE_SQL: &str = "TRUNCATE TABLE migrations";
