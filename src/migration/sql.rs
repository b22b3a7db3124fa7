//! Relational migration runner
//!
//! Every version is applied (or reverted) inside its own transaction together
//! with the tracking-table write, so a failing version leaves neither schema
//! changes nor a tracking row behind. Versions that committed before the
//! failure stay applied.

use super::state_table::{
    CREATE_TABLE_SQL, DELETE_FROM_VERSION_SQL, INSERT_VERSION_SQL, SELECT_ALL_SQL,
    SELECT_LATEST_SQL, TRUNCATE_SQL,
};
use super::{
    Direction, MigrationError, MigrationRecord, MigrationStatus, MigrationTool, Registry,
    SqlScript, DOWN_TAG, TABLE_NAME, UP_TAG,
};
use crate::executor::{SqlValue, StoreError, StoreTransaction, TransactionalStore};
use log::{debug, error, info, warn};
#[cfg(feature = "metrics")]
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

const BACKEND: &str = "postgres";

/// Migration runner for a transactional SQL store
pub struct SqlMigrator<'a> {
    store: &'a dyn TransactionalStore,
    registry: Registry<SqlScript>,
}

impl<'a> SqlMigrator<'a> {
    pub fn new(store: &'a dyn TransactionalStore, registry: Registry<SqlScript>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Registry<SqlScript> {
        &self.registry
    }

    /// Fails with `TableMissing` unless the tracking table is present
    fn ensure_table(&self) -> Result<(), MigrationError> {
        match self.store.exists(TABLE_NAME) {
            Ok(true) => Ok(()),
            Ok(false) => Err(MigrationError::TableMissing {
                table: TABLE_NAME,
                source: StoreError::Query(format!("relation \"{TABLE_NAME}\" does not exist")),
            }),
            Err(source) => Err(MigrationError::TableMissing {
                table: TABLE_NAME,
                source,
            }),
        }
    }

    /// Highest recorded version, `None` when the table is empty
    fn latest_recorded(&self, operation: &'static str) -> Result<Option<i64>, MigrationError> {
        let rows = self
            .store
            .raw_query(SELECT_LATEST_SQL, &[])
            .map_err(|e| MigrationError::store(operation, None, e))?;

        rows.first()
            .map(MigrationRecord::from_row)
            .transpose()
            .map(|record| record.map(|r| r.version))
            .map_err(|e| MigrationError::store(operation, None, e))
    }

    fn recorded_versions(&self, operation: &'static str) -> Result<Vec<i64>, MigrationError> {
        let rows = self
            .store
            .raw_query(SELECT_ALL_SQL, &[])
            .map_err(|e| MigrationError::store(operation, None, e))?;

        rows.iter()
            .map(|row| MigrationRecord::from_row(row).map(|r| r.version))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MigrationError::store(operation, None, e))
    }

    /// Run `work` in a fresh transaction scoped to one version
    ///
    /// On failure the transaction is rolled back and the error names the
    /// version and direction. A failed rollback takes priority and carries
    /// both errors.
    fn in_transaction<F>(
        &self,
        version: i64,
        direction: Direction,
        work: F,
    ) -> Result<(), MigrationError>
    where
        F: FnOnce(&dyn StoreTransaction) -> Result<(), StoreError>,
    {
        let tx = self
            .store
            .begin()
            .map_err(|e| MigrationError::store("begin", Some(version), e))?;

        if let Err(cause) = work(&*tx) {
            let tag = tag(direction);
            error!("{tag} failed to execute migration {direction} script with version {version}: {cause}");
            return Err(match tx.rollback() {
                Ok(()) => MigrationError::Execution {
                    direction,
                    version,
                    source: cause,
                },
                Err(source) => {
                    error!("{tag} failed to rollback migration with version {version}: {source}");
                    MigrationError::RollbackFailed {
                        version,
                        source,
                        cause,
                    }
                }
            });
        }

        tx.commit()
            .map_err(|e| MigrationError::store("commit", Some(version), e))
    }

    fn apply(&self, script: &SqlScript) -> Result<(), MigrationError> {
        let version = script.version;
        if script.up.trim().is_empty() {
            return Err(MigrationError::BlankScript {
                version,
                direction: Direction::Up,
            });
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(BACKEND, "up", version).entered();

        info!("{UP_TAG} applying migration version {version}");
        self.in_transaction(version, Direction::Up, |tx| {
            tx.batch_execute(&script.up)?;
            tx.execute(INSERT_VERSION_SQL, &[SqlValue::BigInt(version)])?;
            Ok(())
        })
    }

    fn revert(&self, script: &SqlScript) -> Result<(), MigrationError> {
        let version = script.version;
        if script.down.trim().is_empty() {
            return Err(MigrationError::BlankScript {
                version,
                direction: Direction::Down,
            });
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(BACKEND, "down", version).entered();

        info!("{DOWN_TAG} reverting migration version {version}");
        self.in_transaction(version, Direction::Down, |tx| {
            tx.batch_execute(&script.down)?;
            tx.execute(DELETE_FROM_VERSION_SQL, &[SqlValue::BigInt(version)])?;
            Ok(())
        })
    }
}

fn tag(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => UP_TAG,
        Direction::Down => DOWN_TAG,
    }
}

impl MigrationTool for SqlMigrator<'_> {
    fn initialize(&self) -> Result<(), MigrationError> {
        match self.store.exists(TABLE_NAME) {
            Ok(true) => {
                info!("{UP_TAG} migration table {TABLE_NAME} already exists");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!("{UP_TAG} could not probe for table {TABLE_NAME}, creating it: {e}"),
        }

        let tx = self
            .store
            .begin()
            .map_err(|e| MigrationError::store("initialize", None, e))?;

        if let Err(cause) = tx.execute(&CREATE_TABLE_SQL, &[]) {
            error!("{UP_TAG} failed to create migration table {TABLE_NAME}: {cause}");
            return match tx.rollback() {
                Ok(()) => Ok(()),
                Err(source) => {
                    error!("{UP_TAG} failed to rollback creation of {TABLE_NAME}: {source}");
                    Err(MigrationError::store("initialize", None, source))
                }
            };
        }

        tx.commit()
            .map_err(|e| MigrationError::store("initialize", None, e))?;
        info!("{UP_TAG} created migration table {TABLE_NAME}");
        Ok(())
    }

    fn up(&self) -> Result<usize, MigrationError> {
        self.ensure_table()?;

        let Some(latest_known) = self.registry.latest_version() else {
            info!("{UP_TAG} no migrations registered");
            return Ok(0);
        };

        let latest = self.latest_recorded("up")?.unwrap_or(0);
        // Only the top version is compared; gaps below it are not detected here
        if latest == latest_known {
            info!("{UP_TAG} already up to date at version {latest}");
            return Ok(0);
        }

        let targets = self.registry.pending_after(latest);
        debug!("{UP_TAG} latest recorded version {latest}, pending {targets:?}");

        let mut applied = 0;
        for version in targets {
            let Some(script) = self.registry.get(version) else {
                continue;
            };

            #[cfg(feature = "metrics")]
            let start = Instant::now();

            if let Err(e) = self.apply(script) {
                #[cfg(feature = "metrics")]
                METRICS.record_failure(BACKEND, "up");
                return Err(e);
            }

            #[cfg(feature = "metrics")]
            METRICS.record_applied(BACKEND, start.elapsed());

            info!("{UP_TAG} migrated version {version}");
            applied += 1;
        }

        Ok(applied)
    }

    fn down(&self) -> Result<Option<i64>, MigrationError> {
        self.ensure_table()?;

        if self.registry.is_empty() {
            info!("{DOWN_TAG} no migrations registered");
            return Ok(None);
        }

        let Some(latest) = self.latest_recorded("down")? else {
            info!("{DOWN_TAG} nothing to revert");
            return Ok(None);
        };

        let script = self
            .registry
            .get(latest)
            .ok_or(MigrationError::MissingScript {
                version: latest,
                direction: Direction::Down,
            })?;

        #[cfg(feature = "metrics")]
        let start = Instant::now();

        if let Err(e) = self.revert(script) {
            #[cfg(feature = "metrics")]
            METRICS.record_failure(BACKEND, "down");
            return Err(e);
        }

        #[cfg(feature = "metrics")]
        METRICS.record_reverted(BACKEND, start.elapsed());

        info!("{DOWN_TAG} reverted version {latest}");
        Ok(Some(latest))
    }

    fn check(&self) -> Result<(), MigrationError> {
        self.ensure_table()?;

        let Some(latest_known) = self.registry.latest_version() else {
            return Ok(());
        };

        let recorded = self.recorded_versions("check")?;
        if !recorded.contains(&latest_known) {
            error!("{UP_TAG} migration with version {latest_known} is not migrated");
            return Err(MigrationError::NotMigrated {
                versions: vec![latest_known],
            });
        }

        Ok(())
    }

    fn truncate(&self) -> Result<(), MigrationError> {
        self.ensure_table()?;

        let tx = self
            .store
            .begin()
            .map_err(|e| MigrationError::store("truncate", None, e))?;

        if let Err(cause) = tx.execute(TRUNCATE_SQL, &[]) {
            error!("{DOWN_TAG} failed to truncate migration table {TABLE_NAME}: {cause}");
            let source = match tx.rollback() {
                Ok(()) => cause,
                Err(e) => {
                    error!("{DOWN_TAG} failed to rollback truncate of {TABLE_NAME}: {e}");
                    e
                }
            };
            return Err(MigrationError::store("truncate", None, source));
        }

        tx.commit()
            .map_err(|e| MigrationError::store("truncate", None, e))?;
        info!("{DOWN_TAG} truncated migration table {TABLE_NAME}");
        Ok(())
    }

    fn status(&self) -> Result<MigrationStatus, MigrationError> {
        self.ensure_table()?;
        let recorded = self.recorded_versions("status")?;
        Ok(MigrationStatus::compute(self.registry.versions(), recorded))
    }
}
