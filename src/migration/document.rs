//! Document-store migration runner
//!
//! Document stores give no multi-operation transactions, so nothing here is
//! rolled back. A failing `up` leaves earlier versions applied and recorded,
//! and leaves whatever the failing function already wrote.

use super::{
    Direction, DocumentScript, MigrationError, MigrationRecord, MigrationStatus, MigrationTool,
    Registry, COLUMN_NAME, NOSQL_DOWN_TAG, NOSQL_UP_TAG, TABLE_NAME,
};
use crate::document::{to_document, DocumentCursor, DocumentStore, Filter, FindOptions, SortOrder};
use crate::executor::StoreError;
use log::{debug, error, info};
#[cfg(feature = "metrics")]
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

const BACKEND: &str = "document";

/// Migration runner for a [`DocumentStore`]
pub struct DocumentMigrator<'a> {
    store: &'a dyn DocumentStore,
    registry: Registry<DocumentScript>,
}

impl<'a> DocumentMigrator<'a> {
    pub fn new(store: &'a dyn DocumentStore, registry: Registry<DocumentScript>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Registry<DocumentScript> {
        &self.registry
    }

    /// Recorded versions, highest first
    fn recorded_versions(&self) -> Result<Vec<i64>, StoreError> {
        let options = FindOptions::new().sort_by(COLUMN_NAME, SortOrder::Descending);
        let mut versions = Vec::new();

        let mut collect = |cursor: Result<DocumentCursor, StoreError>| -> Result<(), StoreError> {
            let mut cursor = cursor?;
            while let Some(record) = cursor.next_decoded::<MigrationRecord>() {
                versions.push(record?.version);
            }
            Ok(())
        };
        self.store
            .find(TABLE_NAME, &Filter::all(), &options, &mut collect)?;

        Ok(versions)
    }

    fn apply(&self, script: &DocumentScript) -> Result<(), MigrationError> {
        let version = script.version;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(BACKEND, "up", version).entered();

        info!("{NOSQL_UP_TAG} applying migration version {version}");
        if let Err(source) = script.run_up(self.store) {
            error!("{NOSQL_UP_TAG} failed to execute migration up script with version {version}: {source}");
            return Err(MigrationError::Execution {
                direction: Direction::Up,
                version,
                source,
            });
        }

        to_document(&MigrationRecord::new(version))
            .and_then(|record| self.store.insert_one(TABLE_NAME, record))
            .map_err(|e| {
                error!("{NOSQL_UP_TAG} failed to record migration version {version}: {e}");
                MigrationError::store("up", Some(version), e)
            })
    }
}

impl MigrationTool for DocumentMigrator<'_> {
    fn initialize(&self) -> Result<(), MigrationError> {
        Err(MigrationError::NotSupported("initialize"))
    }

    fn up(&self) -> Result<usize, MigrationError> {
        let Some(latest_known) = self.registry.latest_version() else {
            info!("{NOSQL_UP_TAG} no migrations registered");
            return Ok(0);
        };

        let recorded = self
            .recorded_versions()
            .map_err(|e| MigrationError::store("up", None, e))?;
        let latest = recorded.first().copied().unwrap_or(0);

        if latest >= latest_known {
            info!("{NOSQL_UP_TAG} already up to date at version {latest}");
            return Ok(0);
        }

        let targets = self.registry.pending_after(latest);
        debug!("{NOSQL_UP_TAG} latest recorded version {latest}, pending {targets:?}");

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

            info!("{NOSQL_UP_TAG} migrated version {version}");
            applied += 1;
        }

        Ok(applied)
    }

    fn down(&self) -> Result<Option<i64>, MigrationError> {
        if self.registry.is_empty() {
            info!("{NOSQL_DOWN_TAG} no migrations registered");
            return Ok(None);
        }

        let recorded = self
            .recorded_versions()
            .map_err(|e| MigrationError::store("down", None, e))?;
        let Some(&latest) = recorded.first() else {
            info!("{NOSQL_DOWN_TAG} nothing to revert");
            return Ok(None);
        };

        let script = self
            .registry
            .get(latest)
            .ok_or(MigrationError::MissingScript {
                version: latest,
                direction: Direction::Down,
            })?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(BACKEND, "down", latest).entered();
        #[cfg(feature = "metrics")]
        let start = Instant::now();

        info!("{NOSQL_DOWN_TAG} reverting migration version {latest}");
        if let Err(source) = script.run_down(self.store) {
            error!("{NOSQL_DOWN_TAG} failed to execute migration down script with version {latest}: {source}");
            #[cfg(feature = "metrics")]
            METRICS.record_failure(BACKEND, "down");
            return Err(MigrationError::Execution {
                direction: Direction::Down,
                version: latest,
                source,
            });
        }

        // Exact match: only rows equal to the reverted version are removed
        self.store
            .delete_many(TABLE_NAME, &Filter::matching(COLUMN_NAME, latest))
            .map_err(|e| {
                error!("{NOSQL_DOWN_TAG} failed to delete migration version {latest}: {e}");
                MigrationError::store("down", Some(latest), e)
            })?;

        #[cfg(feature = "metrics")]
        METRICS.record_reverted(BACKEND, start.elapsed());

        info!("{NOSQL_DOWN_TAG} reverted version {latest}");
        Ok(Some(latest))
    }

    fn check(&self) -> Result<(), MigrationError> {
        if self.registry.is_empty() {
            return Ok(());
        }

        let recorded = self.recorded_versions().map_err(|e| {
            error!("{NOSQL_UP_TAG} failed to read collection {TABLE_NAME}: {e}");
            MigrationError::store("check", None, e)
        })?;

        let status = MigrationStatus::compute(self.registry.versions(), recorded);
        if !status.pending.is_empty() {
            error!(
                "{NOSQL_UP_TAG} migration with version {:?} is not migrated",
                status.pending
            );
            return Err(MigrationError::NotMigrated {
                versions: status.pending,
            });
        }

        Ok(())
    }

    fn truncate(&self) -> Result<(), MigrationError> {
        let removed = self
            .store
            .delete_many(TABLE_NAME, &Filter::all())
            .map_err(|e| MigrationError::store("truncate", None, e))?;
        info!("{NOSQL_DOWN_TAG} removed {removed} records from {TABLE_NAME}");
        Ok(())
    }

    fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let recorded = self
            .recorded_versions()
            .map_err(|e| MigrationError::store("status", None, e))?;
        Ok(MigrationStatus::compute(self.registry.versions(), recorded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::test_helpers::MemoryDocumentStore;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        to_document(&value).unwrap()
    }

    /// Each version inserts `{"v": n}` into `items` and deletes it on the way down
    fn script(version: i64) -> DocumentScript {
        DocumentScript::new(
            version,
            move |store| store.insert_one("items", doc(json!({ "v": version }))),
            move |store| {
                store
                    .delete_many("items", &Filter::matching("v", version))
                    .map(|_| ())
            },
        )
    }

    fn failing(version: i64) -> DocumentScript {
        DocumentScript::new(
            version,
            |_| Err(StoreError::Other("boom".into())),
            |_| Err(StoreError::Other("boom".into())),
        )
    }

    fn registry(scripts: Vec<DocumentScript>) -> Registry<DocumentScript> {
        scripts.into_iter().collect()
    }

    fn recorded(store: &MemoryDocumentStore) -> Vec<i64> {
        let mut versions: Vec<i64> = store
            .documents(TABLE_NAME)
            .iter()
            .filter_map(|d| d.get("version").and_then(|v| v.as_i64()))
            .collect();
        versions.sort_unstable();
        versions
    }

    #[test]
    fn test_initialize_not_supported() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        assert!(matches!(
            migrator.initialize(),
            Err(MigrationError::NotSupported("initialize"))
        ));
    }

    #[test]
    fn test_up_is_idempotent() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2), script(3)]));

        assert_eq!(migrator.up().unwrap(), 3);
        assert_eq!(recorded(&store), vec![1, 2, 3]);
        assert_eq!(store.documents("items").len(), 3);

        assert_eq!(migrator.up().unwrap(), 0);
        assert_eq!(recorded(&store), vec![1, 2, 3]);
        assert_eq!(store.documents("items").len(), 3);
    }

    #[test]
    fn test_up_halts_without_rollback() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), failing(2), script(3)]));

        let err = migrator.up().unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Execution {
                direction: Direction::Up,
                version: 2,
                ..
            }
        ));
        assert_eq!(recorded(&store), vec![1]);
        assert_eq!(store.documents("items").len(), 1);
    }

    #[test]
    fn test_partial_writes_are_not_undone() {
        let store = MemoryDocumentStore::new();
        let half = DocumentScript::new(
            1,
            |store| {
                store.insert_one("items", doc(json!({ "v": "first" })))?;
                Err(StoreError::Other("second write failed".into()))
            },
            |_| Ok(()),
        );
        let migrator = DocumentMigrator::new(&store, registry(vec![half]));

        assert!(migrator.up().is_err());
        assert_eq!(store.documents("items").len(), 1);
        assert!(recorded(&store).is_empty());
    }

    #[test]
    fn test_up_tracking_write_failure_is_store_error() {
        let store = MemoryDocumentStore::new();
        store.fail_writes_to(TABLE_NAME);
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2)]));

        assert!(matches!(
            migrator.up(),
            Err(MigrationError::Store {
                operation: "up",
                version: Some(1),
                ..
            })
        ));
        // The script itself ran
        assert_eq!(store.documents("items").len(), 1);
    }

    #[test]
    fn test_up_resumes_after_latest() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 1 }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2), script(3)]));

        assert_eq!(migrator.up().unwrap(), 2);
        assert_eq!(recorded(&store), vec![1, 2, 3]);
    }

    #[test]
    fn test_down_reverts_latest_only() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2), script(3)]));
        migrator.up().unwrap();

        assert_eq!(migrator.down().unwrap(), Some(3));
        assert_eq!(recorded(&store), vec![1, 2]);
        let remaining: Vec<_> = store
            .documents("items")
            .iter()
            .filter_map(|d| d.get("v").and_then(|v| v.as_i64()))
            .collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[test]
    fn test_down_deletes_only_the_reverted_version() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 2 }))).unwrap();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 1 }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2)]));

        assert_eq!(migrator.down().unwrap(), Some(2));
        assert_eq!(recorded(&store), vec![1]);
    }

    #[test]
    fn test_down_failure_leaves_tracking_untouched() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 1 }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![failing(1)]));

        assert!(matches!(
            migrator.down(),
            Err(MigrationError::Execution {
                direction: Direction::Down,
                version: 1,
                ..
            })
        ));
        assert_eq!(recorded(&store), vec![1]);
    }

    #[test]
    fn test_down_unknown_version() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 5 }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        assert!(matches!(
            migrator.down(),
            Err(MigrationError::MissingScript { version: 5, .. })
        ));
    }

    #[test]
    fn test_down_nothing_recorded() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        assert_eq!(migrator.down().unwrap(), None);
    }

    #[test]
    fn test_check_names_every_missing_version() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 1 }))).unwrap();
        store.insert_one(TABLE_NAME, doc(json!({ "version": 3 }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2), script(3)]));

        match migrator.check().unwrap_err() {
            MigrationError::NotMigrated { versions } => assert_eq!(versions, vec![2]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_empty_collection_names_all() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2)]));
        match migrator.check().unwrap_err() {
            MigrationError::NotMigrated { versions } => assert_eq!(versions, vec![1, 2]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_unreadable_collection() {
        let store = MemoryDocumentStore::new();
        store.fail_reads();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        assert!(matches!(
            migrator.check(),
            Err(MigrationError::Store { operation: "check", .. })
        ));
    }

    #[test]
    fn test_check_rejects_malformed_record() {
        let store = MemoryDocumentStore::new();
        store.insert_one(TABLE_NAME, doc(json!({ "version": "one" }))).unwrap();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        assert!(matches!(
            migrator.check(),
            Err(MigrationError::Store { operation: "check", .. })
        ));
    }

    #[test]
    fn test_truncate_then_reapply() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1), script(2)]));
        migrator.up().unwrap();

        migrator.truncate().unwrap();
        assert!(recorded(&store).is_empty());
        assert!(migrator.check().is_err());

        assert_eq!(migrator.up().unwrap(), 2);
        // Scripts ran twice; data written by the first run is untouched
        assert_eq!(store.documents("items").len(), 4);
    }

    #[test]
    fn test_truncate_delete_failure_is_store_error() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, registry(vec![script(1)]));
        migrator.up().unwrap();
        store.fail_writes_to(TABLE_NAME);

        assert!(matches!(
            migrator.truncate(),
            Err(MigrationError::Store {
                operation: "truncate",
                version: None,
                ..
            })
        ));
        assert_eq!(recorded(&store), vec![1]);
    }

    #[test]
    fn test_empty_registry() {
        let store = MemoryDocumentStore::new();
        let migrator = DocumentMigrator::new(&store, Registry::default());
        assert_eq!(migrator.up().unwrap(), 0);
        assert_eq!(migrator.down().unwrap(), None);
        migrator.check().unwrap();
    }
}
