/*!
Snapshot period kinds.
*/

use crate::{Result, SnapKeepError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recurrence category of a snapshot.
///
/// The declaration order is the tie-break rank used when ordering snapshots
/// that share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPeriod {
    Frequent,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Manual,
    Temporary,
}

impl SnapshotPeriod {
    /// Periods taken and pruned on a schedule, shortest first
    pub const PERIODIC: [SnapshotPeriod; 6] = [
        SnapshotPeriod::Frequent,
        SnapshotPeriod::Hourly,
        SnapshotPeriod::Daily,
        SnapshotPeriod::Weekly,
        SnapshotPeriod::Monthly,
        SnapshotPeriod::Yearly,
    ];

    /// Whether snapshots of this period are scheduled and auto-pruned
    pub fn is_periodic(self) -> bool {
        !matches!(self, SnapshotPeriod::Manual | SnapshotPeriod::Temporary)
    }

    /// Lowercase name as stored in the `snapshotperiod` property
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotPeriod::Frequent => "frequent",
            SnapshotPeriod::Hourly => "hourly",
            SnapshotPeriod::Daily => "daily",
            SnapshotPeriod::Weekly => "weekly",
            SnapshotPeriod::Monthly => "monthly",
            SnapshotPeriod::Yearly => "yearly",
            SnapshotPeriod::Manual => "manual",
            SnapshotPeriod::Temporary => "temporary",
        }
    }
}

impl fmt::Display for SnapshotPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotPeriod {
    type Err = SnapKeepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "frequent" | "frequently" => Ok(SnapshotPeriod::Frequent),
            "hourly" => Ok(SnapshotPeriod::Hourly),
            "daily" => Ok(SnapshotPeriod::Daily),
            "weekly" => Ok(SnapshotPeriod::Weekly),
            "monthly" => Ok(SnapshotPeriod::Monthly),
            "yearly" => Ok(SnapshotPeriod::Yearly),
            "manual" => Ok(SnapshotPeriod::Manual),
            "temporary" => Ok(SnapshotPeriod::Temporary),
            other => Err(SnapKeepError::validation(format!(
                "unknown snapshot period '{other}'"
            ))),
        }
    }
}
