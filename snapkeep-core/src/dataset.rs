/*!
The dataset/snapshot state graph.

Datasets live in a [`DatasetTree`] keyed by their fully-qualified name. A node
refers to its parent by name and to its children through a map of local name
to full name, so the tree has no owning cycles and ancestor walks are plain
map lookups. Inheritance is resolved by the tree, since only the tree can see
a node's ancestors.
*/

use crate::property::{
    ObjectKind, PropertyData, PropertyName, PropertySource, PropertyValue, RecursionMode,
};
use crate::schedule::{DatasetPolicy, RetentionCounts};
use crate::snapshot::{validate_dataset_name, SnapshotRecord};
use crate::{Result, SnapKeepError, SnapshotPeriod};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Kind of a dataset node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    FileSystem,
    Volume,
}

impl TryFrom<ObjectKind> for DatasetKind {
    type Error = SnapKeepError;

    fn try_from(kind: ObjectKind) -> Result<Self> {
        match kind {
            ObjectKind::FileSystem => Ok(DatasetKind::FileSystem),
            ObjectKind::Volume => Ok(DatasetKind::Volume),
            ObjectKind::Snapshot => Err(SnapKeepError::validation(
                "a snapshot is not a dataset",
            )),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::FileSystem => f.write_str("filesystem"),
            DatasetKind::Volume => f.write_str("volume"),
        }
    }
}

/// A filesystem or volume with its policy properties and snapshots
#[derive(Debug, Clone)]
pub struct DatasetNode {
    name: String,
    kind: DatasetKind,
    parent: Option<String>,
    properties: BTreeMap<PropertyName, PropertyValue>,
    children: BTreeMap<String, String>,
    snapshots: BTreeMap<SnapshotPeriod, BTreeMap<String, SnapshotRecord>>,
    used_bytes: u64,
    available_bytes: u64,
}

impl DatasetNode {
    /// Create an empty node. A name without `/` is a pool root.
    pub fn new<S: Into<String>>(name: S, kind: DatasetKind) -> Result<Self> {
        let name = name.into();
        validate_dataset_name(&name)?;
        let parent = name.rsplit_once('/').map(|(parent, _)| parent.to_string());

        Ok(Self {
            name,
            kind,
            parent,
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            used_bytes: 0,
            available_bytes: 0,
        })
    }

    /// Record the space accounting reported by the storage layer
    pub fn with_capacity(mut self, used_bytes: u64, available_bytes: u64) -> Self {
        self.used_bytes = used_bytes;
        self.available_bytes = available_bytes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_pool_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Last path component, the key in the parent's child map
    pub fn local_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Name of the pool this dataset lives in
    pub fn pool_name(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn available_bytes(&self) -> u64 {
        self.available_bytes
    }

    /// Value stored on this node, whatever its source
    pub fn local_property(&self, name: PropertyName) -> Option<&PropertyValue> {
        self.properties.get(&name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyValue> {
        self.properties.values()
    }

    /// Store a value read from the storage layer.
    ///
    /// Inherited copies of non-inheritable properties are dropped: they
    /// describe an ancestor, not this node.
    pub(crate) fn store_property(&mut self, value: PropertyValue) -> Result<()> {
        let name = value.name();
        if !name.is_dataset_property() {
            return Err(SnapKeepError::validation(format!(
                "{name} is not a dataset property"
            )));
        }
        if !name.is_inheritable() && value.source() == PropertySource::Inherited {
            debug!("{}: ignoring inherited copy of {}", self.name, name);
            return Ok(());
        }
        self.properties.insert(name, value);
        Ok(())
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &str)> {
        self.children
            .iter()
            .map(|(local, full)| (local.as_str(), full.as_str()))
    }

    /// Snapshots of one period, oldest first by name
    pub fn snapshots(&self, period: SnapshotPeriod) -> impl Iterator<Item = &SnapshotRecord> {
        self.snapshots
            .get(&period)
            .into_iter()
            .flat_map(|by_name| by_name.values())
    }

    pub fn all_snapshots(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.snapshots.values().flat_map(|by_name| by_name.values())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.values().map(BTreeMap::len).sum()
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots
            .values()
            .any(|by_name| by_name.contains_key(name))
    }

    /// Most recent recorded snapshot time for a period, if any
    pub fn last_snapshot_at(&self, period: SnapshotPeriod) -> Option<DateTime<Utc>> {
        self.local_property(PropertyName::LastSnapshot(period))
            .and_then(|value| value.value().as_timestamp())
    }

    /// Attach a snapshot and advance the period's last-observed timestamp
    /// when the snapshot is newer. The timestamp change is only in memory
    /// until it is written back.
    pub fn add_snapshot(&mut self, record: SnapshotRecord) -> Result<()> {
        if record.dataset() != self.name {
            return Err(SnapKeepError::validation(format!(
                "snapshot {} does not belong to {}",
                record.name(),
                self.name
            )));
        }

        let period = record.period();
        let timestamp = record.timestamp();
        self.snapshots
            .entry(period)
            .or_default()
            .insert(record.name().to_string(), record);

        if period.is_periodic() && self.last_snapshot_at(period).map_or(true, |last| timestamp > last) {
            let observed = PropertyValue::new(
                PropertyName::LastSnapshot(period),
                PropertyData::Timestamp(timestamp),
                PropertySource::Local,
                self.name.as_str(),
            )?;
            self.properties.insert(observed.name(), observed);
        }
        Ok(())
    }

    /// Detach a snapshot, returning it if it was present
    pub fn remove_snapshot(&mut self, record: &SnapshotRecord) -> Option<SnapshotRecord> {
        self.snapshots
            .get_mut(&record.period())
            .and_then(|by_name| by_name.remove(record.name()))
    }

    /// Local values that differ from `base`, i.e. what must be written back
    pub fn changed_properties(&self, base: &DatasetNode) -> Vec<PropertyValue> {
        self.properties
            .values()
            .filter(|value| value.is_local() && base.local_property(value.name()) != Some(*value))
            .cloned()
            .collect()
    }
}

/// Nodes compare by observable state: name, kind and properties.
impl PartialEq for DatasetNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind && self.properties == other.properties
    }
}

impl Eq for DatasetNode {}

/// All datasets of one parse pass, keyed by fully-qualified name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetTree {
    nodes: BTreeMap<String, DatasetNode>,
}

impl DatasetTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node under its already-present parent
    pub fn insert(&mut self, node: DatasetNode) -> Result<()> {
        if self.nodes.contains_key(node.name()) {
            return Err(SnapKeepError::validation(format!(
                "dataset {} already exists",
                node.name()
            )));
        }

        if let Some(parent_name) = node.parent_name() {
            let parent = self.nodes.get_mut(parent_name).ok_or_else(|| {
                SnapKeepError::validation(format!(
                    "parent {parent_name} of {} is not known",
                    node.name()
                ))
            })?;
            parent
                .children
                .insert(node.local_name().to_string(), node.name().to_string());
        }

        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&DatasetNode> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DatasetNode> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node, parents before their descendants
    pub fn iter(&self) -> impl Iterator<Item = &DatasetNode> {
        self.nodes.values()
    }

    pub fn pool_roots(&self) -> impl Iterator<Item = &DatasetNode> {
        self.nodes.values().filter(|node| node.is_pool_root())
    }

    /// Resolve `relative` (one or more `/`-separated components) below `name`
    pub fn get_child(&self, name: &str, relative: &str) -> Option<&DatasetNode> {
        let mut current = self.get(name)?;
        for component in relative.split('/') {
            let full = current.children.get(component)?;
            current = self.get(full)?;
        }
        Some(current)
    }

    /// Direct children of `name` in lexicographic order of their local names
    pub fn sorted_children(&self, name: &str) -> Vec<(&str, &DatasetNode)> {
        self.get(name)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|(local, full)| self.get(full).map(|child| (local.as_str(), child)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of every descendant of `name`, parents first
    pub fn descendant_names(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn node(&self, name: &str) -> Result<&DatasetNode> {
        self.get(name)
            .ok_or_else(|| SnapKeepError::validation(format!("unknown dataset {name}")))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut DatasetNode> {
        self.get_mut(name)
            .ok_or_else(|| SnapKeepError::validation(format!("unknown dataset {name}")))
    }

    /// The value in force on `name`: its own, or the nearest ancestor's.
    ///
    /// A pool root without the property is a schema violation.
    pub fn get_effective(&self, name: &str, property: PropertyName) -> Result<PropertyValue> {
        if !property.is_dataset_property() {
            return Err(SnapKeepError::validation(format!(
                "{property} is not a dataset property"
            )));
        }

        let mut current = self.node(name)?;
        loop {
            if let Some(value) = current
                .local_property(property)
                .filter(|value| value.source() != PropertySource::None)
            {
                return Ok(if current.name() == name {
                    value.clone()
                } else {
                    value.as_inherited()
                });
            }

            if !property.is_inheritable() {
                return Err(SnapKeepError::validation(format!(
                    "{name} has no value for {property}"
                )));
            }

            current = match current.parent_name() {
                Some(parent) => self.node(parent)?,
                None => {
                    return Err(SnapKeepError::schema(format!(
                        "pool root {} lacks required property {property}",
                        current.name()
                    )))
                }
            };
        }
    }

    /// Replace a property on `name`, marking it Local or Inherited.
    ///
    /// Descendants holding an inherited copy are refreshed.
    pub fn update_property(
        &mut self,
        name: &str,
        property: PropertyName,
        data: PropertyData,
        is_local: bool,
    ) -> Result<PropertyValue> {
        if property.is_read_only() || !property.is_dataset_property() {
            return Err(SnapKeepError::validation(format!(
                "{property} cannot be set on a dataset"
            )));
        }

        let (source, owner) = if is_local {
            (PropertySource::Local, name.to_string())
        } else {
            let owner = self
                .node(name)?
                .parent_name()
                .and_then(|parent| self.get_effective(parent, property).ok())
                .map(|value| value.owner().to_string())
                .unwrap_or_else(|| name.to_string());
            (PropertySource::Inherited, owner)
        };

        let value = PropertyValue::new(property, data, source, owner)?;
        self.node_mut(name)?
            .properties
            .insert(property, value.clone());

        if property.is_inheritable() {
            self.refresh_inherited(name, property)?;
        }
        Ok(value)
    }

    /// Drop any override on `name` and take the value from its ancestors
    pub fn inherit_property(&mut self, name: &str, property: PropertyName) -> Result<PropertyValue> {
        let node = self.node(name)?;
        if !property.is_inheritable() {
            return Err(SnapKeepError::inheritance(format!(
                "{property} is not inheritable"
            )));
        }
        let parent = node.parent_name().map(str::to_string).ok_or_else(|| {
            SnapKeepError::inheritance(format!(
                "{name} is a pool root and has nothing to inherit {property} from"
            ))
        })?;

        let value = self.get_effective(&parent, property)?.as_inherited();
        self.node_mut(name)?
            .properties
            .insert(property, value.clone());
        self.refresh_inherited(name, property)?;
        Ok(value)
    }

    fn refresh_inherited(&mut self, name: &str, property: PropertyName) -> Result<()> {
        for descendant in self.descendant_names(name) {
            let node = self.node(&descendant)?;
            let stale = node
                .local_property(property)
                .is_some_and(|value| value.source() == PropertySource::Inherited);
            let Some(parent) = node.parent_name().filter(|_| stale).map(str::to_string) else {
                continue;
            };

            let value = self.get_effective(&parent, property)?.as_inherited();
            self.node_mut(&descendant)?
                .properties
                .insert(property, value);
        }
        Ok(())
    }

    /// Attach a snapshot to the dataset it names
    pub fn add_snapshot(&mut self, record: SnapshotRecord) -> Result<()> {
        let dataset = record.dataset().to_string();
        self.node_mut(&dataset)?.add_snapshot(record)
    }

    pub fn remove_snapshot(&mut self, record: &SnapshotRecord) -> Option<SnapshotRecord> {
        self.get_mut(record.dataset())?.remove_snapshot(record)
    }

    fn effective_bool(&self, name: &str, property: PropertyName) -> Result<bool> {
        let value = self.get_effective(name, property)?;
        value.value().as_bool().ok_or_else(|| {
            SnapKeepError::validation(format!("{name}: {property} is not a boolean"))
        })
    }

    fn effective_int(&self, name: &str, property: PropertyName) -> Result<u64> {
        let value = self.get_effective(name, property)?;
        value.value().as_int().ok_or_else(|| {
            SnapKeepError::validation(format!("{name}: {property} is not an integer"))
        })
    }

    fn effective_text(&self, name: &str, property: PropertyName) -> Result<String> {
        let value = self.get_effective(name, property)?;
        value
            .value()
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| SnapKeepError::validation(format!("{name}: {property} is not text")))
    }

    /// Resolve every policy property of `name` through inheritance
    pub fn resolve_policy(&self, name: &str) -> Result<DatasetPolicy> {
        let retention = |period| self.effective_int(name, PropertyName::Retention(period));
        let prune_deferral = self.effective_int(name, PropertyName::PruneDeferral)?;

        Ok(DatasetPolicy {
            enabled: self.effective_bool(name, PropertyName::Enabled)?,
            take_snapshots: self.effective_bool(name, PropertyName::TakeSnapshots)?,
            prune_snapshots: self.effective_bool(name, PropertyName::PruneSnapshots)?,
            recursion: self
                .effective_text(name, PropertyName::Recursion)?
                .parse::<RecursionMode>()?,
            template: self.effective_text(name, PropertyName::Template)?,
            retention: RetentionCounts {
                frequent: retention(SnapshotPeriod::Frequent)?,
                hourly: retention(SnapshotPeriod::Hourly)?,
                daily: retention(SnapshotPeriod::Daily)?,
                weekly: retention(SnapshotPeriod::Weekly)?,
                monthly: retention(SnapshotPeriod::Monthly)?,
                yearly: retention(SnapshotPeriod::Yearly)?,
            },
            prune_deferral: u8::try_from(prune_deferral.min(100)).unwrap_or(100),
        })
    }

    /// Required properties a pool root does not carry
    pub fn missing_root_properties(&self, root: &str) -> Result<Vec<PropertyName>> {
        let node = self.node(root)?;
        Ok(PropertyName::required_root_schema()
            .into_iter()
            .filter(|property| {
                node.local_property(*property)
                    .map_or(true, |value| value.source() == PropertySource::None)
            })
            .collect())
    }

    /// Fail if any pool root lacks part of the required schema
    pub fn validate_schema(&self) -> Result<()> {
        for root in self.pool_roots() {
            let missing = self.missing_root_properties(root.name())?;
            if !missing.is_empty() {
                let names: Vec<String> = missing.iter().map(|p| p.wire_name()).collect();
                return Err(SnapKeepError::schema(format!(
                    "pool root {} lacks required properties: {}",
                    root.name(),
                    names.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Per-dataset local values that differ from `base`
    pub fn changed_properties(&self, base: &DatasetTree) -> Vec<(String, Vec<PropertyValue>)> {
        self.nodes
            .values()
            .filter_map(|node| {
                let changed = match base.get(node.name()) {
                    Some(base_node) => node.changed_properties(base_node),
                    None => node.properties().filter(|v| v.is_local()).cloned().collect(),
                };
                (!changed.is_empty()).then(|| (node.name().to_string(), changed))
            })
            .collect()
    }
}
