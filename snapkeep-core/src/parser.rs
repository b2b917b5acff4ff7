/*!
Ingestion of the storage layer's bulk property listing.

Each listing line describes one property of one object:

```text
objectName <TAB> propertyName <TAB> value <TAB> source
```

Lines are grouped into per-object bags first, since lines for one object
need not be contiguous. Once the listing is exhausted the bags are turned
into a [`DatasetTree`] in name order, which guarantees a parent is built
before its children, and snapshots are attached last.
*/

use crate::dataset::{DatasetKind, DatasetNode, DatasetTree};
use crate::property::{ObjectKind, PropertyName, PropertyValue, RawProperty};
use crate::snapshot::{SnapshotRecord, SNAPSHOT_DELIMITER};
use crate::{Result, SnapKeepError, SnapshotPeriod};
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Properties of one object as read from the listing, not yet validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawZfsObject {
    pub name: String,
    pub kind: Option<ObjectKind>,
    pub properties: BTreeMap<PropertyName, RawProperty>,
    first_line: usize,
}

impl RawZfsObject {
    fn new(name: &str, first_line: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            properties: BTreeMap::new(),
            first_line,
        }
    }

    /// Parse a property that must be set on this object itself
    fn local_value(&self, name: PropertyName) -> Result<Option<PropertyValue>> {
        let Some(raw) = self.properties.get(&name) else {
            return Ok(None);
        };
        Ok(PropertyValue::parse(&self.name, raw)?.filter(|value| value.is_local()))
    }

    fn native_int(&self, name: PropertyName) -> Result<u64> {
        let Some(raw) = self.properties.get(&name) else {
            return Ok(0);
        };
        Ok(PropertyValue::parse(&self.name, raw)?
            .and_then(|value| value.value().as_int())
            .unwrap_or(0))
    }
}

/// An object left out of the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedObject {
    pub name: String,
    pub reason: String,
}

/// Result of one parse pass
#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    /// The working tree, snapshots attached
    pub tree: DatasetTree,
    /// Dataset properties exactly as persisted in the storage layer, used as
    /// the base when computing what to write back
    pub persisted: DatasetTree,
    pub rejected: Vec<RejectedObject>,
}

/// Accumulates listing lines and materializes them into a tree
#[derive(Debug, Default)]
pub struct RawObjectParser {
    objects: BTreeMap<String, RawZfsObject>,
    line_number: usize,
}

impl RawObjectParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct objects seen so far
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Feed one listing line. Blank lines are ignored.
    pub fn push_line(&mut self, line: &str) -> Result<()> {
        self.line_number += 1;
        let line_number = self.line_number;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(());
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            return Err(SnapKeepError::parse(
                line_number,
                format!("expected 4 tab-separated fields, found {}", fields.len()),
            ));
        }

        let object_name = fields[0];
        let property_name = PropertyName::from_wire(fields[1]).ok_or_else(|| {
            SnapKeepError::parse(line_number, format!("unknown property '{}'", fields[1]))
        })?;
        let source = fields[fields.len() - 1];
        let value = fields[2..fields.len() - 1].join("\t");

        let object = self
            .objects
            .entry(object_name.to_string())
            .or_insert_with(|| RawZfsObject::new(object_name, line_number));

        if property_name == PropertyName::Type && object.kind.is_none() {
            object.kind = value.parse::<ObjectKind>().ok();
        }

        object.properties.insert(
            property_name,
            RawProperty {
                name: property_name,
                value,
                source: source.to_string(),
            },
        );
        Ok(())
    }

    /// Build the tree from every line pushed so far
    pub fn finish(self) -> Result<ParseOutput> {
        let mut tree = DatasetTree::new();
        let mut rejected = Vec::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        let mut snapshots = Vec::new();

        for (name, object) in self.objects {
            let kind = match object.kind {
                Some(ObjectKind::Snapshot) => {
                    snapshots.push(object);
                    continue;
                }
                Some(kind) => kind,
                None => {
                    warn!("{name}: missing or unsupported type, skipping");
                    rejected.push(RejectedObject {
                        name: name.clone(),
                        reason: "missing or unsupported object type".to_string(),
                    });
                    excluded.insert(name);
                    continue;
                }
            };

            if let Some((parent, _)) = name.rsplit_once('/') {
                if excluded.contains(parent) {
                    debug!("{name}: parent {parent} was rejected, skipping");
                    rejected.push(RejectedObject {
                        name: name.clone(),
                        reason: format!("ancestor {parent} was rejected"),
                    });
                    excluded.insert(name);
                    continue;
                }
                if !tree.contains(parent) {
                    return Err(SnapKeepError::parse(
                        object.first_line,
                        format!("parent {parent} of {name} is not in the listing"),
                    ));
                }
            }

            match build_dataset(&object, kind) {
                Ok(node) => tree.insert(node)?,
                Err(e) => {
                    warn!("{name}: rejected: {e}");
                    rejected.push(RejectedObject {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                    excluded.insert(name);
                }
            }
        }

        let persisted = tree.clone();

        let mut attached = 0usize;
        for object in snapshots {
            let (dataset, _) = object
                .name
                .split_once(SNAPSHOT_DELIMITER)
                .unwrap_or((object.name.as_str(), ""));

            if excluded.contains(dataset) {
                debug!("{}: dataset was rejected, skipping", object.name);
                continue;
            }
            if !tree.contains(dataset) {
                return Err(SnapKeepError::parse(
                    object.first_line,
                    format!("snapshot {} has no dataset {dataset} in the listing", object.name),
                ));
            }

            match build_snapshot(&object) {
                Ok(Some(record)) => {
                    tree.add_snapshot(record)?;
                    attached += 1;
                }
                Ok(None) => debug!("{}: not managed by snapkeep", object.name),
                Err(e) => {
                    warn!("{}: rejected: {e}", object.name);
                    rejected.push(RejectedObject {
                        name: object.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Parsed {} datasets and {} snapshots ({} rejected)",
            tree.len(),
            attached,
            rejected.len()
        );

        Ok(ParseOutput {
            tree,
            persisted,
            rejected,
        })
    }
}

fn build_dataset(object: &RawZfsObject, kind: ObjectKind) -> Result<DatasetNode> {
    let used = object.native_int(PropertyName::Used)?;
    let available = object.native_int(PropertyName::Available)?;
    let mut node = DatasetNode::new(&object.name, DatasetKind::try_from(kind)?)?
        .with_capacity(used, available);

    for raw in object.properties.values() {
        if !raw.name.is_dataset_property() {
            continue;
        }
        if let Some(value) = PropertyValue::parse(&object.name, raw)? {
            node.store_property(value)?;
        }
    }
    Ok(node)
}

/// Returns `Ok(None)` for snapshots that carry no period, i.e. ones snapkeep
/// did not create
fn build_snapshot(object: &RawZfsObject) -> Result<Option<SnapshotRecord>> {
    let Some(period) = object.local_value(PropertyName::SnapshotKind)? else {
        return Ok(None);
    };
    let period: SnapshotPeriod = period
        .value()
        .as_text()
        .unwrap_or_default()
        .parse()?;

    let timestamp = object
        .local_value(PropertyName::SnapshotTimestamp)?
        .and_then(|value| value.value().as_timestamp())
        .ok_or_else(|| {
            SnapKeepError::validation(format!("snapshot {} has no timestamp", object.name))
        })?;

    let recursive = object
        .local_value(PropertyName::Recursion)?
        .is_some_and(|value| value.value().as_text() == Some("zfs"));

    SnapshotRecord::new(object.name.as_str(), period, timestamp, recursive).map(Some)
}

/// Parse a complete listing held in memory
pub fn parse_lines<I, S>(lines: I) -> Result<ParseOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = RawObjectParser::new();
    for line in lines {
        parser.push_line(line.as_ref())?;
    }
    parser.finish()
}

/// Parse a listing as it is produced, so parsing overlaps the command that
/// emits it. The first error aborts the pass.
pub async fn parse_stream<S>(mut lines: S) -> Result<ParseOutput>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    let mut parser = RawObjectParser::new();
    while let Some(line) = lines.next().await {
        parser.push_line(&line?)?;
    }
    debug!("Listing complete, {} objects", parser.object_count());
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{PropertyData, PropertySource};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_unset_child_inherits_from_root() {
        let output = parse_lines([
            "pool1\ttype\tfilesystem\tlocal",
            "pool1\tenabled\ttrue\tlocal",
            "pool1/a\ttype\tfilesystem\tlocal",
            "pool1/a\tenabled\t-\t-",
        ])
        .unwrap();

        let value = output
            .tree
            .get_effective("pool1/a", PropertyName::Enabled)
            .unwrap();
        assert_eq!(value.value(), &PropertyData::Bool(true));
        assert_eq!(value.source(), PropertySource::Inherited);
        assert!(output.rejected.is_empty());
    }

    #[test]
    fn test_short_line_aborts_the_pass() {
        let err = parse_lines(["pool1\ttype\tfilesystem\tlocal", "pool1\tenabled"]).unwrap_err();
        assert!(matches!(err, SnapKeepError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_unknown_property_aborts_the_pass() {
        let err = parse_lines(["pool1\tcompression\tlz4\tlocal"]).unwrap_err();
        assert!(matches!(err, SnapKeepError::Parse { line: 1, .. }));
        assert!(err.to_string().contains("compression"));
    }

    #[test]
    fn test_missing_parent_is_a_parse_error() {
        let err = parse_lines(["pool1/a/b\ttype\tfilesystem\t-"]).unwrap_err();
        assert!(matches!(err, SnapKeepError::Parse { .. }));
    }

    #[test]
    fn test_lines_for_one_object_need_not_be_contiguous() {
        let output = parse_lines([
            "pool1/a\ttype\tfilesystem\t-",
            "pool1\ttype\tfilesystem\t-",
            "pool1\tsnapkeep:template\tdefault\tlocal",
            "pool1/a\tsnapkeep:template\tarchive\tlocal",
            "pool1\tused\t2048\t-",
            "pool1\tavailable\t8192\t-",
        ])
        .unwrap();

        let root = output.tree.get("pool1").unwrap();
        assert_eq!(root.used_bytes(), 2048);
        assert_eq!(root.available_bytes(), 8192);
        assert_eq!(
            output
                .tree
                .get_effective("pool1/a", PropertyName::Template)
                .unwrap()
                .value()
                .as_text(),
            Some("archive")
        );
    }

    #[test]
    fn test_snapshots_attach_to_their_dataset() {
        let output = parse_lines([
            "pool1\ttype\tfilesystem\t-",
            "pool1@autosnap_h\ttype\tsnapshot\t-",
            "pool1@autosnap_h\tsnapkeep:snapshotperiod\thourly\tlocal",
            "pool1@autosnap_h\tsnapkeep:snapshottimestamp\t2024-05-01T12:00:00Z\tlocal",
            "pool1@autosnap_h\tsnapkeep:recursion\tzfs\tlocal",
            "pool1@manual\ttype\tsnapshot\t-",
            "pool1@manual\tsnapkeep:snapshotperiod\t-\t-",
        ])
        .unwrap();

        let root = output.tree.get("pool1").unwrap();
        assert_eq!(root.snapshot_count(), 1);
        let record = root.snapshots(SnapshotPeriod::Hourly).next().unwrap();
        assert!(record.is_recursive());
        assert_eq!(
            root.last_snapshot_at(SnapshotPeriod::Hourly),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );

        // The observation made while attaching is not yet persisted
        assert!(output
            .persisted
            .get("pool1")
            .unwrap()
            .last_snapshot_at(SnapshotPeriod::Hourly)
            .is_none());
        assert_eq!(output.tree.changed_properties(&output.persisted).len(), 1);
    }

    #[test]
    fn test_inherited_recursion_does_not_mark_snapshot_recursive() {
        let output = parse_lines([
            "pool1\ttype\tfilesystem\t-",
            "pool1\tsnapkeep:recursion\tzfs\tlocal",
            "pool1@s\ttype\tsnapshot\t-",
            "pool1@s\tsnapkeep:snapshotperiod\tdaily\tlocal",
            "pool1@s\tsnapkeep:snapshottimestamp\t2024-05-01T00:00:00Z\tlocal",
            "pool1@s\tsnapkeep:recursion\tzfs\tinherited from pool1",
        ])
        .unwrap();

        let root = output.tree.get("pool1").unwrap();
        assert!(!root.snapshots(SnapshotPeriod::Daily).next().unwrap().is_recursive());
    }

    #[test]
    fn test_invalid_object_is_rejected_with_descendants() {
        let output = parse_lines([
            "pool1\ttype\tfilesystem\t-",
            "pool1/bad\ttype\tfilesystem\t-",
            "pool1/bad\tsnapkeep:enabled\tmaybe\tlocal",
            "pool1/bad/child\ttype\tfilesystem\t-",
            "pool1/bad@s\ttype\tsnapshot\t-",
            "pool1/good\ttype\tvolume\t-",
        ])
        .unwrap();

        assert!(output.tree.contains("pool1/good"));
        assert!(!output.tree.contains("pool1/bad"));
        assert!(!output.tree.contains("pool1/bad/child"));

        let names: Vec<&str> = output.rejected.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["pool1/bad", "pool1/bad/child"]);
    }

    #[test]
    fn test_snapshot_without_timestamp_is_rejected() {
        let output = parse_lines([
            "pool1\ttype\tfilesystem\t-",
            "pool1@s\ttype\tsnapshot\t-",
            "pool1@s\tsnapkeep:snapshotperiod\tdaily\tlocal",
        ])
        .unwrap();

        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.tree.get("pool1").unwrap().snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_stream() {
        let lines = futures::stream::iter(vec![
            Ok("pool1\ttype\tfilesystem\t-".to_string()),
            Ok("pool1/a\ttype\tfilesystem\t-".to_string()),
        ]);
        let output = parse_stream(lines).await.unwrap();
        assert_eq!(output.tree.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_error_aborts_the_pass() {
        let lines = futures::stream::iter(vec![
            Ok("pool1\ttype\tfilesystem\t-".to_string()),
            Err(SnapKeepError::operation("zfs get", "exit status 1")),
        ]);
        let err = parse_stream(lines).await.unwrap_err();
        assert!(matches!(err, SnapKeepError::OperationFailure { .. }));
    }
}
