//! Results reported by schema migration runs.

use std::time::Duration;

use super::MigrationDirection;

/// Applied and pending schema migration versions of a database.
///
/// # Example
///
/// ```rust
/// use plinth_database::MigrationStatus;
///
/// let status = MigrationStatus::new(vec!["0001".to_string()], vec!["0002".to_string()]);
/// assert_eq!(status.next_pending_version(), Some("0002"));
/// assert!(!status.is_up_to_date());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Versions recorded in the ledger, ascending.
    pub applied_versions: Vec<String>,
    /// Versions known to this build but not yet applied, in application order.
    pub pending_versions: Vec<String>,
}

impl MigrationStatus {
    pub fn new(
        applied_versions: impl Into<Vec<String>>,
        pending_versions: impl Into<Vec<String>>,
    ) -> Self {
        Self {
            applied_versions: applied_versions.into(),
            pending_versions: pending_versions.into(),
        }
    }

    /// Share of known migrations already applied, from 0.0 to 1.0.
    pub fn progress_ratio(&self) -> f64 {
        let total = self.applied_versions.len() + self.pending_versions.len();
        if total == 0 {
            1.0
        } else {
            self.applied_versions.len() as f64 / total as f64
        }
    }

    pub fn last_applied_version(&self) -> Option<&str> {
        self.applied_versions.last().map(String::as_str)
    }

    pub fn next_pending_version(&self) -> Option<&str> {
        self.pending_versions.first().map(String::as_str)
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending_versions.len()
    }

    #[inline]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_versions.is_empty()
    }
}

/// Outcome of a mutating schema migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Whether the run went through the lock or was forced.
    pub direction: MigrationDirection,
    /// Wall time spent, including waiting for the lock.
    pub duration: Duration,
    /// Versions applied by this instance, in order. Empty when another instance
    /// got there first or nothing was pending.
    pub applied_versions: Vec<String>,
}

impl MigrationResult {
    pub fn new(
        direction: MigrationDirection,
        duration: Duration,
        applied_versions: Vec<String>,
    ) -> Self {
        Self {
            direction,
            duration,
            applied_versions,
        }
    }

    /// Returns whether this run changed nothing.
    #[inline]
    pub fn is_no_op(&self) -> bool {
        self.applied_versions.is_empty()
    }

    pub fn last_applied_version(&self) -> Option<&str> {
        self.applied_versions.last().map(String::as_str)
    }

    /// Average time per applied migration.
    pub fn average_time_per_migration(&self) -> Option<Duration> {
        match self.applied_versions.len() as u32 {
            0 => None,
            count => Some(self.duration / count),
        }
    }
}

/// What a [`migrate`](super::migrate) call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// `Apply` or `Force` ran.
    Applied(MigrationResult),
    /// `Print` rendered the pending migrations without touching the database.
    Rendered {
        /// Pending versions in application order.
        versions: Vec<String>,
        /// Script that applies them and records them in the ledger.
        sql: String,
    },
}

impl MigrationOutcome {
    /// Returns whether the run found nothing to do.
    pub fn is_no_op(&self) -> bool {
        match self {
            Self::Applied(result) => result.is_no_op(),
            Self::Rendered { versions, .. } => versions.is_empty(),
        }
    }

    /// Versions applied, or pending when rendered.
    pub fn versions(&self) -> &[String] {
        match self {
            Self::Applied(result) => &result.applied_versions,
            Self::Rendered { versions, .. } => versions,
        }
    }

    /// Rendered SQL, if this outcome came from `Print`.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Rendered { sql, .. } => Some(sql),
            Self::Applied(_) => None,
        }
    }
}
