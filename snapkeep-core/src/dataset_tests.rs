/*!
Tests for the dataset tree: inheritance, property updates and change detection.
*/

#[cfg(test)]
mod tests {
    use crate::dataset::{DatasetKind, DatasetNode, DatasetTree};
    use crate::property::{PropertyData, PropertyName, PropertySource, PropertyValue, RecursionMode};
    use crate::snapshot::SnapshotRecord;
    use crate::{SnapKeepError, SnapshotPeriod};
    use chrono::{DateTime, TimeZone, Utc};

    fn local(owner: &str, name: PropertyName, data: PropertyData) -> PropertyValue {
        PropertyValue::new(name, data, PropertySource::Local, owner).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    /// A pool root carrying the full schema, plus `pool1/a` and `pool1/a/b`
    fn tree() -> DatasetTree {
        let mut root = DatasetNode::new("pool1", DatasetKind::FileSystem)
            .unwrap()
            .with_capacity(100, 900);
        let mut values = vec![
            local("pool1", PropertyName::Enabled, PropertyData::Bool(true)),
            local("pool1", PropertyName::TakeSnapshots, PropertyData::Bool(true)),
            local("pool1", PropertyName::PruneSnapshots, PropertyData::Bool(true)),
            local("pool1", PropertyName::Recursion, PropertyData::Text("snapkeep".into())),
            local("pool1", PropertyName::Template, PropertyData::Text("default".into())),
            local("pool1", PropertyName::PruneDeferral, PropertyData::Int(0)),
        ];
        for (period, count) in SnapshotPeriod::PERIODIC.into_iter().zip([4, 48, 30, 8, 12, 2]) {
            values.push(local("pool1", PropertyName::Retention(period), PropertyData::Int(count)));
        }
        for value in values {
            root.store_property(value).unwrap();
        }

        let mut tree = DatasetTree::new();
        tree.insert(root).unwrap();
        tree.insert(DatasetNode::new("pool1/a", DatasetKind::FileSystem).unwrap())
            .unwrap();
        tree.insert(DatasetNode::new("pool1/a/b", DatasetKind::Volume).unwrap())
            .unwrap();
        tree
    }

    #[test]
    fn test_effective_value_walks_to_the_root() {
        let tree = tree();
        let value = tree.get_effective("pool1/a/b", PropertyName::Enabled).unwrap();

        assert_eq!(value.value(), &PropertyData::Bool(true));
        assert_eq!(value.source(), PropertySource::Inherited);
        assert_eq!(value.owner(), "pool1");
    }

    #[test]
    fn test_inheritance_is_transitive() {
        let mut tree = tree();
        tree.update_property(
            "pool1/a",
            PropertyName::Retention(SnapshotPeriod::Daily),
            PropertyData::Int(7),
            true,
        )
        .unwrap();

        for property in PropertyName::required_root_schema() {
            let child = tree.get_effective("pool1/a/b", property).unwrap();
            let parent = tree.get_effective("pool1/a", property).unwrap();
            assert_eq!(child.value(), parent.value(), "{property}");
        }
    }

    #[test]
    fn test_missing_root_value_is_a_schema_error() {
        let mut tree = DatasetTree::new();
        tree.insert(DatasetNode::new("tank", DatasetKind::FileSystem).unwrap())
            .unwrap();
        tree.insert(DatasetNode::new("tank/home", DatasetKind::FileSystem).unwrap())
            .unwrap();

        let err = tree.get_effective("tank/home", PropertyName::Template).unwrap_err();
        assert!(matches!(err, SnapKeepError::Schema(_)));
        assert!(tree.validate_schema().is_err());
        assert_eq!(
            tree.missing_root_properties("tank").unwrap().len(),
            PropertyName::required_root_schema().len()
        );
    }

    #[test]
    fn test_full_root_schema_validates() {
        assert!(tree().validate_schema().is_ok());
    }

    #[test]
    fn test_update_refreshes_inherited_descendants() {
        let mut tree = tree();
        tree.update_property(
            "pool1/a",
            PropertyName::Template,
            PropertyData::Text("production".into()),
            true,
        )
        .unwrap();
        // Pretend the storage layer had already reported an inherited copy
        tree.inherit_property("pool1/a/b", PropertyName::Template).unwrap();

        tree.update_property(
            "pool1/a",
            PropertyName::Template,
            PropertyData::Text("archive".into()),
            true,
        )
        .unwrap();

        let stored = tree
            .get("pool1/a/b")
            .unwrap()
            .local_property(PropertyName::Template)
            .unwrap();
        assert_eq!(stored.value().as_text(), Some("archive"));
        assert_eq!(stored.source(), PropertySource::Inherited);
        assert_eq!(stored.owner(), "pool1/a");
    }

    #[test]
    fn test_update_stops_at_local_override() {
        let mut tree = tree();
        tree.update_property("pool1/a/b", PropertyName::Enabled, PropertyData::Bool(false), true)
            .unwrap();
        tree.update_property("pool1/a", PropertyName::Enabled, PropertyData::Bool(true), true)
            .unwrap();

        let value = tree.get_effective("pool1/a/b", PropertyName::Enabled).unwrap();
        assert_eq!(value.value(), &PropertyData::Bool(false));
        assert!(value.is_local());
    }

    #[test]
    fn test_update_rejects_read_only_and_invalid_values() {
        let mut tree = tree();
        assert!(tree
            .update_property("pool1/a", PropertyName::Used, PropertyData::Int(1), true)
            .is_err());
        assert!(tree
            .update_property("pool1/a", PropertyName::PruneDeferral, PropertyData::Int(101), true)
            .is_err());
        assert!(tree
            .update_property("pool1/missing", PropertyName::Enabled, PropertyData::Bool(true), true)
            .is_err());
    }

    #[test]
    fn test_inherit_discards_local_override() {
        let mut tree = tree();
        tree.update_property(
            "pool1/a",
            PropertyName::Recursion,
            PropertyData::Text("zfs".into()),
            true,
        )
        .unwrap();

        let inherited = tree.inherit_property("pool1/a", PropertyName::Recursion).unwrap();
        assert_eq!(inherited.source(), PropertySource::Inherited);
        assert_eq!(inherited.value().as_text(), Some("snapkeep"));
        assert_eq!(
            tree.resolve_policy("pool1/a/b").unwrap().recursion,
            RecursionMode::SnapKeep
        );
    }

    #[test]
    fn test_inherit_is_idempotent() {
        let mut tree = tree();
        let first = tree.inherit_property("pool1/a", PropertyName::Template).unwrap();
        let second = tree.inherit_property("pool1/a", PropertyName::Template).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_inherit_misuse_is_an_inheritance_error() {
        let mut tree = tree();

        let err = tree.inherit_property("pool1", PropertyName::Enabled).unwrap_err();
        assert!(matches!(err, SnapKeepError::Inheritance(_)));

        let err = tree
            .inherit_property("pool1/a", PropertyName::LastSnapshot(SnapshotPeriod::Daily))
            .unwrap_err();
        assert!(matches!(err, SnapKeepError::Inheritance(_)));
    }

    #[test]
    fn test_last_snapshot_is_never_inherited() {
        let mut tree = tree();
        tree.add_snapshot(
            SnapshotRecord::new("pool1@d1", SnapshotPeriod::Daily, at(1), false).unwrap(),
        )
        .unwrap();

        assert!(tree
            .get_effective("pool1/a", PropertyName::LastSnapshot(SnapshotPeriod::Daily))
            .is_err());
        assert_eq!(tree.get("pool1/a").unwrap().last_snapshot_at(SnapshotPeriod::Daily), None);
    }

    #[test]
    fn test_inherited_copy_of_last_snapshot_is_dropped() {
        let mut node = DatasetNode::new("pool1/a", DatasetKind::FileSystem).unwrap();
        let inherited = PropertyValue::new(
            PropertyName::LastSnapshot(SnapshotPeriod::Hourly),
            PropertyData::Timestamp(at(1)),
            PropertySource::Inherited,
            "pool1",
        )
        .unwrap();

        node.store_property(inherited).unwrap();
        assert_eq!(node.last_snapshot_at(SnapshotPeriod::Hourly), None);
    }

    #[test]
    fn test_add_snapshot_tracks_newest_observation() {
        let mut node = DatasetNode::new("pool1", DatasetKind::FileSystem).unwrap();
        node.add_snapshot(SnapshotRecord::new("pool1@b", SnapshotPeriod::Daily, at(3), false).unwrap())
            .unwrap();
        node.add_snapshot(SnapshotRecord::new("pool1@a", SnapshotPeriod::Daily, at(2), false).unwrap())
            .unwrap();

        assert_eq!(node.last_snapshot_at(SnapshotPeriod::Daily), Some(at(3)));
        assert_eq!(node.snapshot_count(), 2);
        assert!(node.has_snapshot("pool1@a"));

        node.add_snapshot(SnapshotRecord::new("pool1@m", SnapshotPeriod::Manual, at(9), false).unwrap())
            .unwrap();
        assert!(node
            .local_property(PropertyName::LastSnapshot(SnapshotPeriod::Manual))
            .is_none());
    }

    #[test]
    fn test_add_snapshot_rejects_foreign_record() {
        let mut node = DatasetNode::new("pool1/a", DatasetKind::FileSystem).unwrap();
        let foreign = SnapshotRecord::new("pool1/b@x", SnapshotPeriod::Daily, at(1), false).unwrap();
        assert!(node.add_snapshot(foreign).is_err());
    }

    #[test]
    fn test_remove_snapshot() {
        let mut tree = tree();
        let record = SnapshotRecord::new("pool1/a@x", SnapshotPeriod::Hourly, at(1), false).unwrap();
        tree.add_snapshot(record.clone()).unwrap();

        assert_eq!(tree.remove_snapshot(&record), Some(record.clone()));
        assert_eq!(tree.remove_snapshot(&record), None);
        assert_eq!(tree.get("pool1/a").unwrap().snapshot_count(), 0);
    }

    #[test]
    fn test_structural_equality_drives_change_detection() {
        let base = tree();
        let mut working = base.clone();
        assert_eq!(base, working);

        working
            .add_snapshot(
                SnapshotRecord::new("pool1/a@h", SnapshotPeriod::Hourly, at(4), false).unwrap(),
            )
            .unwrap();
        assert_ne!(base, working);

        let changes = working.changed_properties(&base);
        assert_eq!(changes.len(), 1);
        let (dataset, values) = &changes[0];
        assert_eq!(dataset, "pool1/a");
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].name(),
            PropertyName::LastSnapshot(SnapshotPeriod::Hourly)
        );
        assert_eq!(
            values[0].set_argument(),
            "snapkeep:lasthourlysnapshot=2024-05-04T00:00:00Z"
        );
    }

    #[test]
    fn test_nodes_compare_by_observable_state_only() {
        let mut a = DatasetNode::new("pool1", DatasetKind::FileSystem).unwrap();
        let b = DatasetNode::new("pool1", DatasetKind::FileSystem).unwrap();

        // Snapshot maps are not part of equality, but the observation they cause is
        a.add_snapshot(SnapshotRecord::new("pool1@x", SnapshotPeriod::Manual, at(1), false).unwrap())
            .unwrap();
        assert_eq!(a, b);

        let volume = DatasetNode::new("pool1", DatasetKind::Volume).unwrap();
        assert_ne!(b, volume);
    }

    #[test]
    fn test_child_lookup_and_ordering() {
        let mut tree = tree();
        tree.insert(DatasetNode::new("pool1/0", DatasetKind::FileSystem).unwrap())
            .unwrap();
        tree.insert(DatasetNode::new("pool1/Z", DatasetKind::FileSystem).unwrap())
            .unwrap();

        assert_eq!(tree.get_child("pool1", "a/b").unwrap().name(), "pool1/a/b");
        assert!(tree.get_child("pool1", "a/missing").is_none());

        let names: Vec<&str> = tree
            .sorted_children("pool1")
            .into_iter()
            .map(|(local, _)| local)
            .collect();
        assert_eq!(names, vec!["0", "Z", "a"]);

        assert_eq!(
            tree.descendant_names("pool1/a"),
            vec!["pool1/a/b".to_string()]
        );
    }

    #[test]
    fn test_insert_requires_known_parent() {
        let mut tree = DatasetTree::new();
        let orphan = DatasetNode::new("pool1/a", DatasetKind::FileSystem).unwrap();
        assert!(tree.insert(orphan).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_resolve_policy() {
        let mut tree = tree();
        tree.update_property("pool1/a", PropertyName::PruneDeferral, PropertyData::Int(75), true)
            .unwrap();

        let policy = tree.resolve_policy("pool1/a/b").unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.template, "default");
        assert_eq!(policy.retention.hourly, 48);
        assert_eq!(policy.retention.yearly, 2);
        assert_eq!(policy.prune_deferral, 75);
    }

    #[test]
    fn test_pool_and_local_names() {
        let node = DatasetNode::new("pool1/a/b", DatasetKind::FileSystem).unwrap();
        assert_eq!(node.local_name(), "b");
        assert_eq!(node.pool_name(), "pool1");
        assert_eq!(node.parent_name(), Some("pool1/a"));
        assert!(!node.is_pool_root());
    }
}
