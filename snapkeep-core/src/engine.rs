/*!
Run orchestration.

The engine ties the pieces together for one take/prune pass: it takes the
process lock, loads the dataset tree through the command executor, takes due
snapshots, writes observed timestamps back to the storage layer and prunes
snapshots that have aged out of retention.
*/

use crate::command::{CommandExecutor, OperationStatus};
use crate::config::SnapKeepConfig;
use crate::dataset::{DatasetNode, DatasetTree};
use crate::error::MutexError;
use crate::mutex::{MutexHandle, MutexRegistry, MutexState};
use crate::parser::{parse_stream, ParseOutput};
use crate::property::{PropertyData, PropertyName, RecursionMode};
use crate::schedule::{due_periods, snapshots_to_prune, DatasetPolicy, PoolCapacityDeferral, PruneDeferral};
use crate::snapshot::{SnapshotRecord, SNAPSHOT_DELIMITER};
use crate::{Result, SnapKeepError, SnapshotPeriod};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counts from one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub taken: usize,
    pub take_failed: usize,
    pub pruned: usize,
    pub prune_failed: usize,
    /// Dataset/period pairs over retention whose pruning was deferred
    pub deferred: usize,
    pub property_writes_failed: usize,
    /// Objects the parser left out of the tree
    pub rejected: usize,
    /// Datasets whose policy could not be resolved
    pub skipped: Vec<String>,
}

impl RunSummary {
    fn skip(&mut self, dataset: &str, reason: &SnapKeepError) {
        warn!("{dataset}: skipped: {reason}");
        if !self.skipped.iter().any(|name| name == dataset) {
            self.skipped.push(dataset.to_string());
        }
    }

    pub fn failures(&self) -> usize {
        self.take_failed + self.prune_failed + self.property_writes_failed
    }
}

/// Orchestrates snapshot runs against one command executor
pub struct SnapshotEngine<E>
where
    E: CommandExecutor,
{
    executor: E,
    config: SnapKeepConfig,
    locks: MutexRegistry,
}

impl<E> SnapshotEngine<E>
where
    E: CommandExecutor,
{
    /// Create an engine locking under `config.lock_dir`
    pub fn new(executor: E, config: SnapKeepConfig) -> Self {
        let locks = MutexRegistry::new(&config.lock_dir);
        Self::with_registry(executor, config, locks)
    }

    pub fn with_registry(executor: E, config: SnapKeepConfig, locks: MutexRegistry) -> Self {
        Self {
            executor,
            config,
            locks,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &SnapKeepConfig {
        &self.config
    }

    async fn acquire_lock(&self) -> Result<MutexHandle> {
        let locks = self.locks.clone();
        let name = self.config.mutex_name.clone();
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);

        let handle = tokio::task::spawn_blocking(move || locks.acquire(&name, timeout))
            .await
            .map_err(|e| MutexError::Fatal {
                name: self.config.mutex_name.clone(),
                reason: e.to_string(),
            })??;

        if handle.state() == MutexState::AbandonedRecoverable {
            warn!("Proceeding after recovering abandoned lock '{}'", handle.name());
        }
        Ok(handle)
    }

    /// List and parse every object the storage layer reports
    pub async fn load_tree(&self) -> Result<ParseOutput> {
        let lines = self
            .executor
            .get_all_properties(&PropertyName::all())
            .await?;
        parse_stream(lines).await
    }

    /// Load the tree and check every pool root's schema
    pub async fn check(&self) -> Result<ParseOutput> {
        let output = self.load_tree().await?;
        output.tree.validate_schema()?;
        Ok(output)
    }

    fn policy(
        &self,
        tree: &DatasetTree,
        name: &str,
        summary: &mut RunSummary,
    ) -> Result<Option<DatasetPolicy>> {
        match tree.resolve_policy(name) {
            Ok(policy) => Ok(Some(policy)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                summary.skip(name, &e);
                Ok(None)
            }
        }
    }

    /// The nearest ancestor whose recursive snapshots already cover `node`
    fn covering_ancestor<'a>(tree: &DatasetTree, node: &'a DatasetNode) -> Option<&'a str> {
        let mut name = node.name();
        while let Some((parent, _)) = name.rsplit_once('/') {
            let covers = tree.resolve_policy(parent).is_ok_and(|policy| {
                policy.enabled && policy.take_snapshots && policy.recursion == RecursionMode::Zfs
            });
            if covers {
                return Some(parent);
            }
            name = parent;
        }
        None
    }

    /// Take every due snapshot and record it in `tree`
    pub async fn take_due_snapshots(
        &self,
        tree: &mut DatasetTree,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut plan = Vec::new();
        for node in tree.iter() {
            let Some(policy) = self.policy(tree, node.name(), summary)? else {
                continue;
            };
            if !policy.enabled || !policy.take_snapshots {
                continue;
            }
            if let Some(ancestor) = Self::covering_ancestor(tree, node) {
                debug!("{}: covered by recursive snapshots of {ancestor}", node.name());
                continue;
            }

            let template = match self.config.template(&policy.template) {
                Ok(template) => template,
                Err(e) => {
                    summary.skip(node.name(), &e);
                    continue;
                }
            };

            for period in due_periods(node, &policy, &template.timing, now) {
                plan.push((
                    node.name().to_string(),
                    period,
                    policy.clone(),
                    template.formatting.clone(),
                ));
            }
        }

        for (name, period, policy, formatting) in plan {
            let Some(node) = tree.get(&name) else {
                continue;
            };
            let (status, record) = self
                .executor
                .take_snapshot(self.config.dry_run, node, period, now, &formatting, &policy)
                .await;

            match (status, record) {
                (OperationStatus::Success, Some(record)) => {
                    info!("Took {period} snapshot {record}");
                    summary.taken += 1;
                    Self::record_snapshot(tree, record)?;
                }
                (status, _) => {
                    warn!("{name}: {period} snapshot failed: {status:?}");
                    summary.take_failed += 1;
                }
            }
        }
        Ok(())
    }

    fn record_snapshot(tree: &mut DatasetTree, record: SnapshotRecord) -> Result<()> {
        if record.is_recursive() {
            for descendant in tree.descendant_names(record.dataset()) {
                tree.add_snapshot(record.for_descendant(&descendant)?)?;
            }
        }
        tree.add_snapshot(record)
    }

    /// Write back local properties that differ from `base`
    pub async fn write_back(&self, tree: &DatasetTree, base: &DatasetTree, summary: &mut RunSummary) {
        for (dataset, values) in tree.changed_properties(base) {
            let status = self
                .executor
                .set_properties(self.config.dry_run, &dataset, &values)
                .await;
            if !status.is_success() {
                warn!("{dataset}: writing {} properties failed: {status:?}", values.len());
                summary.property_writes_failed += 1;
            }
        }
    }

    /// Names of the copies of a recursive `record` that exist below its dataset
    fn descendant_copies(tree: &DatasetTree, record: &SnapshotRecord) -> Vec<String> {
        if !record.is_recursive() {
            return Vec::new();
        }
        tree.descendant_names(record.dataset())
            .into_iter()
            .filter_map(|descendant| {
                let name = format!("{descendant}{SNAPSHOT_DELIMITER}{}", record.short_name());
                tree.get(&descendant)
                    .is_some_and(|node| node.has_snapshot(&name))
                    .then_some(name)
            })
            .collect()
    }

    /// Whether `record` should be destroyed with `-r`: it has copies below
    /// and every one of them is expired too
    fn destroys_recursively(
        tree: &DatasetTree,
        record: &SnapshotRecord,
        expired: &BTreeSet<String>,
    ) -> bool {
        let copies = Self::descendant_copies(tree, record);
        !copies.is_empty() && copies.iter().all(|name| expired.contains(name))
    }

    /// Whether an ancestor's planned `-r` destroy already removes `record`
    fn pruned_with_ancestor(
        tree: &DatasetTree,
        record: &SnapshotRecord,
        expired: &BTreeSet<String>,
    ) -> bool {
        if !record.is_recursive() {
            return false;
        }
        let mut dataset = record.dataset();
        while let Some((parent, _)) = dataset.rsplit_once('/') {
            let name = format!("{parent}{SNAPSHOT_DELIMITER}{}", record.short_name());
            let removed = expired.contains(&name)
                && tree
                    .get(parent)
                    .and_then(|node| node.all_snapshots().find(|r| r.name() == name))
                    .is_some_and(|copy| Self::destroys_recursively(tree, copy, expired));
            if removed {
                return true;
            }
            dataset = parent;
        }
        false
    }

    /// Destroy every snapshot beyond its period's retention count.
    ///
    /// A recursive snapshot is destroyed with `-r` from the highest dataset
    /// where every copy below is also expired. Otherwise each expired copy is
    /// destroyed on its own dataset, so a descendant's own retention count
    /// holds in both directions.
    pub async fn prune_expired_snapshots(
        &self,
        tree: &mut DatasetTree,
        deferral: &dyn PruneDeferral,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut expired = Vec::new();
        for node in tree.iter() {
            let Some(policy) = self.policy(tree, node.name(), summary)? else {
                continue;
            };
            if !policy.enabled || !policy.prune_snapshots {
                continue;
            }

            for period in SnapshotPeriod::PERIODIC {
                let records = snapshots_to_prune(node, &policy, period, deferral);
                let over_retention =
                    node.snapshots(period).count() as u64 > policy.retention.for_period(period);
                if records.is_empty() && over_retention {
                    summary.deferred += 1;
                }
                expired.extend(records);
            }
        }

        let expired_names: BTreeSet<String> =
            expired.iter().map(|record| record.name().to_string()).collect();
        let plan: Vec<SnapshotRecord> = expired
            .iter()
            .filter(|record| !Self::pruned_with_ancestor(tree, record, &expired_names))
            .map(|record| {
                if Self::destroys_recursively(tree, record, &expired_names) {
                    record.clone()
                } else {
                    record.non_recursive()
                }
            })
            .collect();

        for record in plan {
            let status = self
                .executor
                .destroy_snapshot(self.config.dry_run, &record)
                .await;
            if !status.is_success() {
                warn!("Pruning {record} failed: {status:?}");
                summary.prune_failed += 1;
                continue;
            }

            info!("Pruned {} snapshot {record}", record.period());
            summary.pruned += 1;
            if record.is_recursive() {
                for descendant in tree.descendant_names(record.dataset()) {
                    if let Ok(copy) = record.for_descendant(&descendant) {
                        tree.remove_snapshot(&copy);
                    }
                }
            }
            tree.remove_snapshot(&record);
        }
        Ok(())
    }

    /// One full pass: lock, load, take, write back, prune.
    ///
    /// Pruning is deferred by pool capacity unless another `deferral` is
    /// given. A busy lock or an invalid schema stops the run before anything
    /// is changed.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        deferral: Option<&dyn PruneDeferral>,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary {
            dry_run: self.config.dry_run,
            ..RunSummary::default()
        };

        let _lock = self.acquire_lock().await?;

        let ParseOutput {
            mut tree,
            persisted,
            rejected,
        } = self.load_tree().await?;
        summary.rejected = rejected.len();
        tree.validate_schema()?;

        if self.config.take_snapshots {
            self.take_due_snapshots(&mut tree, now, &mut summary).await?;
        }
        self.write_back(&tree, &persisted, &mut summary).await;

        if self.config.prune_snapshots {
            let capacity = PoolCapacityDeferral::from_tree(&tree);
            let deferral = deferral.unwrap_or(&capacity);
            self.prune_expired_snapshots(&mut tree, deferral, &mut summary)
                .await?;
        }

        #[cfg(feature = "metrics")]
        match crate::observability::SnapKeepMetrics::global() {
            Ok(metrics) => metrics.record_run(&summary, now),
            Err(e) => warn!("Metrics unavailable: {e}"),
        }

        info!(
            "Run complete: {} taken, {} pruned, {} deferred, {} failures{}",
            summary.taken,
            summary.pruned,
            summary.deferred,
            summary.failures(),
            if summary.dry_run { " (dry run)" } else { "" }
        );
        Ok(summary)
    }

    /// Set a property on a dataset, validating it against the current tree
    pub async fn set_property(
        &self,
        dataset: &str,
        property: PropertyName,
        raw_value: &str,
    ) -> Result<OperationStatus> {
        let data = PropertyData::parse_for(property, raw_value)?;
        let _lock = self.acquire_lock().await?;

        let ParseOutput { mut tree, .. } = self.load_tree().await?;
        let value = tree.update_property(dataset, property, data, true)?;
        Ok(self
            .executor
            .set_properties(self.config.dry_run, dataset, &[value])
            .await)
    }

    /// Drop a dataset's local value so it inherits from its parent
    pub async fn inherit_property(
        &self,
        dataset: &str,
        property: PropertyName,
    ) -> Result<OperationStatus> {
        let _lock = self.acquire_lock().await?;

        let ParseOutput { mut tree, .. } = self.load_tree().await?;
        tree.inherit_property(dataset, property)?;
        Ok(self
            .executor
            .inherit_property(self.config.dry_run, dataset, property)
            .await)
    }
}
