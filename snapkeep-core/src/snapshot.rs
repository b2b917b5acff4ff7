/*!
Point-in-time snapshot records.
*/

use crate::config::FormattingSettings;
use crate::property::{PropertyData, PropertyName, PropertySource, PropertyValue, RecursionMode};
use crate::{Result, SnapKeepError, SnapshotPeriod};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Longest fully-qualified object name the storage layer accepts
pub const MAX_NAME_LENGTH: usize = 255;

/// Separator between a dataset path and a snapshot's short name
pub const SNAPSHOT_DELIMITER: char = '@';

/// One snapshot of a dataset.
///
/// Records are never mutated after construction. They are owned by the
/// dataset they belong to and refer back to it by name only.
///
/// Records order by timestamp, then by period rank, then by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotRecord {
    name: String,
    period: SnapshotPeriod,
    timestamp: DateTime<Utc>,
    dataset: String,
    recursive: bool,
}

impl SnapshotRecord {
    /// Build a record from a fully-qualified `dataset@short` name
    pub fn new<S: Into<String>>(
        name: S,
        period: SnapshotPeriod,
        timestamp: DateTime<Utc>,
        recursive: bool,
    ) -> Result<Self> {
        let name = name.into();
        let (dataset, _) = validate_snapshot_name(&name)?;
        if timestamp.timestamp() < 0 {
            return Err(SnapKeepError::validation(format!(
                "snapshot {name} has a timestamp before the epoch"
            )));
        }

        Ok(Self {
            dataset: dataset.to_string(),
            name,
            period,
            timestamp,
            recursive,
        })
    }

    /// Build the record for a new snapshot of `dataset`, named by `formatting`
    pub fn for_dataset(
        dataset: &str,
        period: SnapshotPeriod,
        timestamp: DateTime<Utc>,
        formatting: &FormattingSettings,
        recursive: bool,
    ) -> Result<Self> {
        let short = formatting.snapshot_short_name(period, timestamp);
        Self::new(
            format!("{dataset}{SNAPSHOT_DELIMITER}{short}"),
            period,
            timestamp,
            recursive,
        )
    }

    /// Fully-qualified name, `dataset@short`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Portion after the snapshot delimiter
    pub fn short_name(&self) -> &str {
        &self.name[self.dataset.len() + 1..]
    }

    /// Name of the owning dataset
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn period(&self) -> SnapshotPeriod {
        self.period
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the snapshot was created by a single recursive command
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// The same snapshot as it appears on a descendant covered by a
    /// recursive command
    pub fn for_descendant(&self, descendant: &str) -> Result<Self> {
        Self::new(
            format!("{descendant}{SNAPSHOT_DELIMITER}{}", self.short_name()),
            self.period,
            self.timestamp,
            self.recursive,
        )
    }

    /// The same snapshot, addressed on its own dataset only
    pub fn non_recursive(&self) -> Self {
        Self {
            recursive: false,
            ..self.clone()
        }
    }

    /// Properties stamped onto the snapshot at creation time
    pub fn creation_properties(&self) -> Result<Vec<PropertyValue>> {
        let recursion = if self.recursive {
            RecursionMode::Zfs
        } else {
            RecursionMode::SnapKeep
        };

        Ok(vec![
            PropertyValue::new(
                PropertyName::SnapshotShortName,
                PropertyData::Text(self.short_name().to_string()),
                PropertySource::Local,
                self.name.as_str(),
            )?,
            PropertyValue::new(
                PropertyName::SnapshotKind,
                PropertyData::Text(self.period.to_string()),
                PropertySource::Local,
                self.name.as_str(),
            )?,
            PropertyValue::new(
                PropertyName::SnapshotTimestamp,
                PropertyData::Timestamp(self.timestamp),
                PropertySource::Local,
                self.name.as_str(),
            )?,
            PropertyValue::new(
                PropertyName::Recursion,
                PropertyData::Text(recursion.as_str().to_string()),
                PropertySource::Local,
                self.name.as_str(),
            )?,
        ])
    }
}

impl Ord for SnapshotRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.period.cmp(&other.period))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.recursive.cmp(&other.recursive))
    }
}

impl PartialOrd for SnapshotRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SnapshotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Validate a dataset path such as `pool1/data/home`
pub fn validate_dataset_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SnapKeepError::validation("dataset name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(SnapKeepError::validation(format!(
            "dataset name exceeds {MAX_NAME_LENGTH} bytes: {name}"
        )));
    }
    if name.split('/').any(|component| component.is_empty()) {
        return Err(SnapKeepError::validation(format!(
            "dataset name has an empty path component: {name}"
        )));
    }
    if let Some(bad) = name.chars().find(|c| !is_name_char(*c) && *c != '/') {
        return Err(SnapKeepError::validation(format!(
            "dataset name contains illegal character '{bad}': {name}"
        )));
    }
    Ok(())
}

/// Validate a `dataset@short` name and split it at the delimiter
pub fn validate_snapshot_name(name: &str) -> Result<(&str, &str)> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(SnapKeepError::validation(format!(
            "snapshot name exceeds {MAX_NAME_LENGTH} bytes: {name}"
        )));
    }
    let (dataset, short) = name.split_once(SNAPSHOT_DELIMITER).ok_or_else(|| {
        SnapKeepError::validation(format!("snapshot name lacks '{SNAPSHOT_DELIMITER}': {name}"))
    })?;

    validate_dataset_name(dataset)?;
    if short.is_empty() {
        return Err(SnapKeepError::validation(format!(
            "snapshot short name is empty: {name}"
        )));
    }
    if let Some(bad) = short.chars().find(|c| !is_name_char(*c)) {
        return Err(SnapKeepError::validation(format!(
            "snapshot name contains illegal character '{bad}': {name}"
        )));
    }
    Ok((dataset, short))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}
