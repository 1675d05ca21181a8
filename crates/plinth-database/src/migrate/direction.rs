use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// What a schema migration run should do with the pending set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, IntoStaticStr)]
#[cfg_attr(feature = "config", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MigrationDirection {
    /// Apply pending migrations under the cluster lock.
    #[default]
    Apply,
    /// Render the pending migrations as SQL without touching the database.
    Print,
    /// Clear any migration lock and apply without taking it.
    ///
    /// Operator recovery path for a lock left behind by a crashed instance.
    Force,
}
