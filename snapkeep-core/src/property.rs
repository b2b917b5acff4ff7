/*!
Typed, provenance-tracking properties.

Every attribute snapkeep reads from or writes to the storage layer is one of a
fixed set of [`PropertyName`]s. Values are held as a [`PropertyData`] sum type
so every consumer matches exhaustively on the four value kinds, and each
[`PropertyValue`] carries the [`PropertySource`] it was resolved from.
*/

use crate::{Result, SnapKeepError, SnapshotPeriod};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace prefix for snapkeep's user properties
pub const NAMESPACE: &str = "snapkeep:";

/// The fixed set of properties snapkeep understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertyName {
    Enabled,
    TakeSnapshots,
    PruneSnapshots,
    Recursion,
    Template,
    Retention(SnapshotPeriod),
    PruneDeferral,
    LastSnapshot(SnapshotPeriod),
    SnapshotShortName,
    SnapshotKind,
    SnapshotTimestamp,
    Type,
    Used,
    Available,
}

/// Value kind a property name carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Text,
    Timestamp,
}

impl PropertyName {
    /// Every known property, in the order used for bulk queries
    pub fn all() -> Vec<PropertyName> {
        let mut names = vec![
            PropertyName::Type,
            PropertyName::Used,
            PropertyName::Available,
            PropertyName::Enabled,
            PropertyName::TakeSnapshots,
            PropertyName::PruneSnapshots,
            PropertyName::Recursion,
            PropertyName::Template,
        ];
        names.extend(SnapshotPeriod::PERIODIC.iter().map(|p| PropertyName::Retention(*p)));
        names.push(PropertyName::PruneDeferral);
        names.extend(SnapshotPeriod::PERIODIC.iter().map(|p| PropertyName::LastSnapshot(*p)));
        names.extend([
            PropertyName::SnapshotShortName,
            PropertyName::SnapshotKind,
            PropertyName::SnapshotTimestamp,
        ]);
        names
    }

    /// Properties every pool root must carry so descendants can resolve a policy
    pub fn required_root_schema() -> Vec<PropertyName> {
        let mut names = vec![
            PropertyName::Enabled,
            PropertyName::TakeSnapshots,
            PropertyName::PruneSnapshots,
            PropertyName::Recursion,
            PropertyName::Template,
        ];
        names.extend(SnapshotPeriod::PERIODIC.iter().map(|p| PropertyName::Retention(*p)));
        names.push(PropertyName::PruneDeferral);
        names
    }

    /// Name as it appears on the storage command line
    pub fn wire_name(self) -> String {
        match self {
            PropertyName::Enabled => format!("{NAMESPACE}enabled"),
            PropertyName::TakeSnapshots => format!("{NAMESPACE}takesnapshots"),
            PropertyName::PruneSnapshots => format!("{NAMESPACE}prunesnapshots"),
            PropertyName::Recursion => format!("{NAMESPACE}recursion"),
            PropertyName::Template => format!("{NAMESPACE}template"),
            PropertyName::Retention(period) => format!("{NAMESPACE}retention:{period}"),
            PropertyName::PruneDeferral => format!("{NAMESPACE}retention:prunedeferral"),
            PropertyName::LastSnapshot(period) => format!("{NAMESPACE}last{period}snapshot"),
            PropertyName::SnapshotShortName => format!("{NAMESPACE}snapshotname"),
            PropertyName::SnapshotKind => format!("{NAMESPACE}snapshotperiod"),
            PropertyName::SnapshotTimestamp => format!("{NAMESPACE}snapshottimestamp"),
            PropertyName::Type => "type".to_string(),
            PropertyName::Used => "used".to_string(),
            PropertyName::Available => "available".to_string(),
        }
    }

    /// Resolve a name from a listing. The namespace prefix is optional and
    /// matching ignores ASCII case.
    pub fn from_wire(raw: &str) -> Option<PropertyName> {
        let lower = raw.to_ascii_lowercase();
        let bare = lower.strip_prefix(NAMESPACE).unwrap_or(lower.as_str());

        let name = match bare {
            "enabled" => PropertyName::Enabled,
            "takesnapshots" => PropertyName::TakeSnapshots,
            "prunesnapshots" => PropertyName::PruneSnapshots,
            "recursion" => PropertyName::Recursion,
            "template" => PropertyName::Template,
            "retention:prunedeferral" => PropertyName::PruneDeferral,
            "snapshotname" => PropertyName::SnapshotShortName,
            "snapshotperiod" => PropertyName::SnapshotKind,
            "snapshottimestamp" => PropertyName::SnapshotTimestamp,
            "type" => PropertyName::Type,
            "used" => PropertyName::Used,
            "available" => PropertyName::Available,
            other => {
                if let Some(period) = other.strip_prefix("retention:") {
                    PropertyName::Retention(periodic(period)?)
                } else if let Some(period) = other
                    .strip_prefix("last")
                    .and_then(|rest| rest.strip_suffix("snapshot"))
                {
                    PropertyName::LastSnapshot(periodic(period)?)
                } else {
                    return None;
                }
            }
        };
        Some(name)
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            PropertyName::Enabled | PropertyName::TakeSnapshots | PropertyName::PruneSnapshots => {
                ValueKind::Bool
            }
            PropertyName::Retention(_)
            | PropertyName::PruneDeferral
            | PropertyName::Used
            | PropertyName::Available => ValueKind::Int,
            PropertyName::Recursion
            | PropertyName::Template
            | PropertyName::SnapshotShortName
            | PropertyName::SnapshotKind
            | PropertyName::Type => ValueKind::Text,
            PropertyName::LastSnapshot(_) | PropertyName::SnapshotTimestamp => {
                ValueKind::Timestamp
            }
        }
    }

    /// Whether a descendant without a local value takes this property from
    /// its ancestors. Last-snapshot timestamps are informational per dataset.
    pub fn is_inheritable(self) -> bool {
        matches!(
            self,
            PropertyName::Enabled
                | PropertyName::TakeSnapshots
                | PropertyName::PruneSnapshots
                | PropertyName::Recursion
                | PropertyName::Template
                | PropertyName::Retention(_)
                | PropertyName::PruneDeferral
        )
    }

    /// Whether the property belongs in a dataset's policy property map
    pub fn is_dataset_property(self) -> bool {
        self.is_inheritable() || matches!(self, PropertyName::LastSnapshot(_))
    }

    /// Whether the value is maintained by the storage layer and cannot be set
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            PropertyName::Type | PropertyName::Used | PropertyName::Available
        )
    }
}

fn periodic(raw: &str) -> Option<SnapshotPeriod> {
    raw.parse::<SnapshotPeriod>()
        .ok()
        .filter(|period| period.is_periodic())
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

impl FromStr for PropertyName {
    type Err = SnapKeepError;

    fn from_str(s: &str) -> Result<Self> {
        PropertyName::from_wire(s)
            .ok_or_else(|| SnapKeepError::validation(format!("unknown property '{s}'")))
    }
}

/// Provenance of a property's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropertySource {
    Local,
    Inherited,
    Default,
    Temporary,
    None,
}

impl PropertySource {
    /// Classify a storage-layer source marker.
    ///
    /// Returns `Ok(None)` when the property is absent: the `none` marker, or
    /// the `-` marker paired with a `-` value (an unset user property). A `-`
    /// marker with a real value is a native read-only value with source
    /// [`PropertySource::None`].
    pub fn from_marker<'a>(
        raw_value: &str,
        marker: &'a str,
    ) -> Result<Option<(PropertySource, Option<&'a str>)>> {
        let classified = match marker {
            "none" => None,
            "-" if raw_value == "-" => None,
            "-" => Some((PropertySource::None, None)),
            "local" | "received" => Some((PropertySource::Local, None)),
            "default" => Some((PropertySource::Default, None)),
            "temporary" => Some((PropertySource::Temporary, None)),
            other => match other.strip_prefix("inherited") {
                Some(rest) => {
                    let from = rest.trim().strip_prefix("from").map(str::trim);
                    Some((PropertySource::Inherited, from.filter(|s| !s.is_empty())))
                }
                None => {
                    return Err(SnapKeepError::validation(format!(
                        "unknown property source '{other}'"
                    )))
                }
            },
        };
        Ok(classified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PropertySource::Local => "local",
            PropertySource::Inherited => "inherited",
            PropertySource::Default => "default",
            PropertySource::Temporary => "temporary",
            PropertySource::None => "-",
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How child datasets are covered by snapshot and destroy commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecursionMode {
    /// One recursive storage command at the top of the subtree
    Zfs,
    /// One command per dataset, walked by snapkeep
    SnapKeep,
}

impl RecursionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecursionMode::Zfs => "zfs",
            RecursionMode::SnapKeep => "snapkeep",
        }
    }
}

impl FromStr for RecursionMode {
    type Err = SnapKeepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zfs" => Ok(RecursionMode::Zfs),
            "snapkeep" => Ok(RecursionMode::SnapKeep),
            other => Err(SnapKeepError::validation(format!(
                "recursion must be 'zfs' or 'snapkeep', got '{other}'"
            ))),
        }
    }
}

/// Storage object kinds reported by the `type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    FileSystem,
    Volume,
    Snapshot,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::FileSystem => "filesystem",
            ObjectKind::Volume => "volume",
            ObjectKind::Snapshot => "snapshot",
        }
    }
}

impl FromStr for ObjectKind {
    type Err = SnapKeepError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "filesystem" => Ok(ObjectKind::FileSystem),
            "volume" => Ok(ObjectKind::Volume),
            "snapshot" => Ok(ObjectKind::Snapshot),
            other => Err(SnapKeepError::validation(format!(
                "unsupported object type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property value of one of the four supported kinds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertyData {
    Bool(bool),
    Int(u64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl PropertyData {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyData::Bool(_) => ValueKind::Bool,
            PropertyData::Int(_) => ValueKind::Int,
            PropertyData::Text(_) => ValueKind::Text,
            PropertyData::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyData::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            PropertyData::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyData::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyData::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Render the value the way the storage layer expects it in `set`
    pub fn to_wire_string(&self) -> String {
        match self {
            PropertyData::Bool(b) => b.to_string(),
            PropertyData::Int(i) => i.to_string(),
            PropertyData::Text(s) => s.clone(),
            PropertyData::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    /// Parse a raw value for `name`, applying that property's validator
    pub fn parse_for(name: PropertyName, raw: &str) -> Result<PropertyData> {
        let data = match name.value_kind() {
            ValueKind::Bool => match raw {
                "true" => PropertyData::Bool(true),
                "false" => PropertyData::Bool(false),
                other => {
                    return Err(SnapKeepError::validation(format!(
                        "{name} must be 'true' or 'false', got '{other}'"
                    )))
                }
            },
            ValueKind::Int => PropertyData::Int(raw.parse::<u64>().map_err(|_| {
                SnapKeepError::validation(format!(
                    "{name} must be a non-negative integer, got '{raw}'"
                ))
            })?),
            ValueKind::Text => PropertyData::Text(raw.to_string()),
            ValueKind::Timestamp => {
                let parsed = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                    SnapKeepError::validation(format!("{name} is not a valid timestamp '{raw}': {e}"))
                })?;
                PropertyData::Timestamp(parsed.with_timezone(&Utc))
            }
        };
        validate(name, &data)?;
        Ok(data)
    }
}

impl fmt::Display for PropertyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

/// Check `data` against the kind and range rules of `name`
pub fn validate(name: PropertyName, data: &PropertyData) -> Result<()> {
    if data.kind() != name.value_kind() {
        return Err(SnapKeepError::validation(format!(
            "{name} expects a {:?} value, got {:?}",
            name.value_kind(),
            data.kind()
        )));
    }

    match (name, data) {
        (PropertyName::PruneDeferral, PropertyData::Int(pct)) if *pct > 100 => Err(
            SnapKeepError::validation(format!("{name} must be between 0 and 100, got {pct}")),
        ),
        (PropertyName::Recursion, PropertyData::Text(s)) => s.parse::<RecursionMode>().map(|_| ()),
        (PropertyName::Type, PropertyData::Text(s)) => s.parse::<ObjectKind>().map(|_| ()),
        (PropertyName::SnapshotKind, PropertyData::Text(s)) => {
            s.parse::<SnapshotPeriod>().map(|_| ())
        }
        (PropertyName::Template | PropertyName::SnapshotShortName, PropertyData::Text(s))
            if s.trim().is_empty() =>
        {
            Err(SnapKeepError::validation(format!("{name} cannot be empty")))
        }
        (_, PropertyData::Timestamp(t)) if t.timestamp() < 0 => Err(SnapKeepError::validation(
            format!("{name} cannot be before the epoch, got {t}"),
        )),
        _ => Ok(()),
    }
}

/// One unparsed `(value, source)` pair from a property listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProperty {
    pub name: PropertyName,
    pub value: String,
    pub source: String,
}

/// An immutable property value together with its provenance.
///
/// `owner` is the object the value is defined on: the object itself for a
/// local value, the ancestor it came from for an inherited one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyValue {
    name: PropertyName,
    value: PropertyData,
    source: PropertySource,
    owner: String,
}

impl PropertyValue {
    /// Build a validated value
    pub fn new<S: Into<String>>(
        name: PropertyName,
        value: PropertyData,
        source: PropertySource,
        owner: S,
    ) -> Result<Self> {
        validate(name, &value)?;
        Ok(Self {
            name,
            value,
            source,
            owner: owner.into(),
        })
    }

    /// Parse one raw listing triple for `object`.
    ///
    /// Returns `Ok(None)` when the source marker says the property is absent;
    /// such values are never validated.
    pub fn parse(object: &str, raw: &RawProperty) -> Result<Option<Self>> {
        let Some((source, inherited_from)) = PropertySource::from_marker(&raw.value, &raw.source)?
        else {
            return Ok(None);
        };

        let value = PropertyData::parse_for(raw.name, &raw.value)?;

        Ok(Some(Self {
            name: raw.name,
            value,
            source,
            owner: inherited_from.unwrap_or(object).to_string(),
        }))
    }

    /// Produce a new value with the same name and owner
    pub fn with_value(&self, value: PropertyData, source: PropertySource) -> Result<Self> {
        Self::new(self.name, value, source, self.owner.clone())
    }

    /// The same value as seen from a descendant that inherits it
    pub fn as_inherited(&self) -> Self {
        Self {
            source: PropertySource::Inherited,
            ..self.clone()
        }
    }

    pub fn name(&self) -> PropertyName {
        self.name
    }

    pub fn value(&self) -> &PropertyData {
        &self.value
    }

    pub fn source(&self) -> PropertySource {
        self.source
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_local(&self) -> bool {
        self.source == PropertySource::Local
    }

    /// `name=value` as passed to `set` and `snapshot -o`
    pub fn set_argument(&self) -> String {
        format!("{}={}", self.name.wire_name(), self.value.to_wire_string())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.name, self.value, self.source)
    }
}
