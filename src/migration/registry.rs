//! Version registry: the caller-supplied `version -> script` mapping.
//!
//! A [`Registry`] is built once and never mutated by a runner. It is cheap to
//! clone (the map sits behind an `Arc`), so one registry can back repeated
//! `up`/`down`/`check` calls or several runners.

use crate::document::DocumentStore;
use crate::executor::StoreError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Anything keyed by a migration version
pub trait VersionedScript {
    fn version(&self) -> i64;
}

/// A SQL migration: raw statements for each direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    pub version: i64,
    pub up: String,
    pub down: String,
}

impl SqlScript {
    pub fn new(version: i64, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            version,
            up: up.into(),
            down: down.into(),
        }
    }
}

impl VersionedScript for SqlScript {
    fn version(&self) -> i64 {
        self.version
    }
}

/// Function run against the document store for one direction of a migration
pub type DocumentFn = dyn Fn(&dyn DocumentStore) -> Result<(), StoreError> + Send + Sync;

/// A document migration: executable logic for each direction
///
/// There is no rollback for document stores. If a function performs several
/// writes and fails part way, the writes that succeeded stay. Write `up` and
/// `down` as a single write, or make them idempotent so that re-running after a
/// failure converges.
#[derive(Clone)]
pub struct DocumentScript {
    pub version: i64,
    up: Arc<DocumentFn>,
    down: Arc<DocumentFn>,
}

impl DocumentScript {
    pub fn new<U, D>(version: i64, up: U, down: D) -> Self
    where
        U: Fn(&dyn DocumentStore) -> Result<(), StoreError> + Send + Sync + 'static,
        D: Fn(&dyn DocumentStore) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        Self {
            version,
            up: Arc::new(up),
            down: Arc::new(down),
        }
    }

    /// # Errors
    ///
    /// Returns whatever the `up` function returns.
    pub fn run_up(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        (self.up)(store)
    }

    /// # Errors
    ///
    /// Returns whatever the `down` function returns.
    pub fn run_down(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        (self.down)(store)
    }
}

impl fmt::Debug for DocumentScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentScript")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl VersionedScript for DocumentScript {
    fn version(&self) -> i64 {
        self.version
    }
}

/// Immutable, ordered mapping of version to script
#[derive(Debug)]
pub struct Registry<S> {
    scripts: Arc<BTreeMap<i64, S>>,
}

impl<S> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            scripts: Arc::clone(&self.scripts),
        }
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            scripts: Arc::new(BTreeMap::new()),
        }
    }
}

impl<S> Registry<S> {
    /// Build from an explicit map (the key is authoritative)
    pub fn from_map(scripts: BTreeMap<i64, S>) -> Self {
        Self {
            scripts: Arc::new(scripts),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn get(&self, version: i64) -> Option<&S> {
        self.scripts.get(&version)
    }

    pub fn contains(&self, version: i64) -> bool {
        self.scripts.contains_key(&version)
    }

    /// All known versions, ascending
    pub fn versions(&self) -> Vec<i64> {
        self.scripts.keys().copied().collect()
    }

    /// Highest known version, `None` for an empty registry
    pub fn latest_version(&self) -> Option<i64> {
        self.scripts.keys().next_back().copied()
    }

    /// Versions to apply given the latest recorded version
    ///
    /// `0` means nothing has been recorded (first run or truncated table), so
    /// every known version is returned. Otherwise only versions strictly greater
    /// than `last_recorded`, ascending.
    pub fn pending_after(&self, last_recorded: i64) -> Vec<i64> {
        if last_recorded == 0 {
            return self.versions();
        }
        self.scripts
            .range(last_recorded.saturating_add(1)..)
            .map(|(version, _)| *version)
            .collect()
    }
}

impl<S: VersionedScript> FromIterator<S> for Registry<S> {
    /// Duplicate versions: the last script wins
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let scripts = iter
            .into_iter()
            .map(|script| (script.version(), script))
            .collect::<BTreeMap<_, _>>();
        Self::from_map(scripts)
    }
}
