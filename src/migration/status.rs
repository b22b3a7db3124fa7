//! Migration status tracking

use std::collections::BTreeSet;

/// Comparison of known (registered) versions against recorded (applied) ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Known and recorded, ascending
    pub applied: Vec<i64>,

    /// Known but not recorded, ascending
    pub pending: Vec<i64>,

    /// Recorded but not in the registry, ascending
    pub unknown: Vec<i64>,

    /// Highest recorded version (`None` when nothing is recorded)
    pub latest_recorded: Option<i64>,

    /// Highest known version (`None` for an empty registry)
    pub latest_known: Option<i64>,
}

impl MigrationStatus {
    /// Compute status from the two version sets; duplicates are collapsed
    #[must_use]
    pub fn compute(
        known: impl IntoIterator<Item = i64>,
        recorded: impl IntoIterator<Item = i64>,
    ) -> Self {
        let known: BTreeSet<i64> = known.into_iter().collect();
        let recorded: BTreeSet<i64> = recorded.into_iter().collect();

        Self {
            applied: known.intersection(&recorded).copied().collect(),
            pending: known.difference(&recorded).copied().collect(),
            unknown: recorded.difference(&known).copied().collect(),
            latest_recorded: recorded.last().copied(),
            latest_known: known.last().copied(),
        }
    }

    /// Check if all known migrations are recorded
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether the store and registry disagree in either direction
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.pending.is_empty() || !self.unknown.is_empty()
    }

    /// Get the next pending migration version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<i64> {
        self.pending.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_splits_versions() {
        let status = MigrationStatus::compute([1, 2, 3], [1, 3, 3, 9]);
        assert_eq!(status.applied, vec![1, 3]);
        assert_eq!(status.pending, vec![2]);
        assert_eq!(status.unknown, vec![9]);
        assert_eq!(status.latest_recorded, Some(9));
        assert_eq!(status.latest_known, Some(3));
        assert!(!status.is_up_to_date());
        assert!(status.has_drift());
        assert_eq!(status.next_pending_version(), Some(2));
    }

    #[test]
    fn test_up_to_date() {
        let status = MigrationStatus::compute([1, 2], [2, 1]);
        assert!(status.is_up_to_date());
        assert!(!status.has_drift());
        assert_eq!(status.next_pending_version(), None);
    }

    #[test]
    fn test_empty_store() {
        let status = MigrationStatus::compute([5, 6], []);
        assert_eq!(status.pending, vec![5, 6]);
        assert_eq!(status.latest_recorded, None);
    }
}
