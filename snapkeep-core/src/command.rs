/*!
The boundary between snapkeep and the storage command-line tool.

[`CommandExecutor`] is implemented by [`ZfsCommandRunner`], which spawns the
real tool, and by [`MemoryZfs`], a deterministic in-memory stand-in. Both build
their argument lists with the same helpers, so a command logged by the
in-memory executor is exactly what the real one would run.
*/

use crate::config::{FormattingSettings, SnapKeepConfig};
use crate::dataset::DatasetNode;
use crate::property::{ObjectKind, PropertyName, PropertyValue, RecursionMode};
use crate::schedule::DatasetPolicy;
use crate::snapshot::{validate_dataset_name, validate_snapshot_name, SnapshotRecord, SNAPSHOT_DELIMITER};
use crate::{Result, SnapKeepError, SnapshotPeriod};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Listing lines produced while the underlying command is still running
pub type LineStream = BoxStream<'static, Result<String>>;

/// Outcome of a mutating command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Success,
    /// Nothing to write: every value came from somewhere other than the target
    SourceIsReadOnly,
    Failure(String),
}

impl OperationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::SourceIsReadOnly)
    }
}

/// Commands snapkeep issues against the storage layer.
///
/// Every mutating call honors `dry_run`: arguments are built and validated and
/// the command is logged, but nothing is executed and the call succeeds.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Names of every object of the given kinds
    async fn list_objects(&self, kinds: &[ObjectKind]) -> Result<Vec<String>>;

    /// Recursive, tab-separated listing of `properties` for every object
    async fn get_all_properties(&self, properties: &[PropertyName]) -> Result<LineStream>;

    /// Write the local values among `properties` to `path`
    async fn set_properties(
        &self,
        dry_run: bool,
        path: &str,
        properties: &[PropertyValue],
    ) -> OperationStatus;

    async fn inherit_property(
        &self,
        dry_run: bool,
        path: &str,
        property: PropertyName,
    ) -> OperationStatus;

    /// Create a snapshot of `node`, stamped with its own metadata properties.
    ///
    /// The record is returned only when the snapshot exists afterwards.
    async fn take_snapshot(
        &self,
        dry_run: bool,
        node: &DatasetNode,
        period: SnapshotPeriod,
        timestamp: DateTime<Utc>,
        formatting: &FormattingSettings,
        policy: &DatasetPolicy,
    ) -> (OperationStatus, Option<SnapshotRecord>);

    async fn destroy_snapshot(&self, dry_run: bool, record: &SnapshotRecord) -> OperationStatus;
}

fn to_args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

fn validate_object_name(path: &str) -> Result<()> {
    if path.contains(SNAPSHOT_DELIMITER) {
        validate_snapshot_name(path).map(|_| ())
    } else {
        validate_dataset_name(path)
    }
}

/// `get` arguments for a full recursive listing
pub fn get_arguments(properties: &[PropertyName]) -> Vec<String> {
    let names: Vec<String> = properties.iter().map(|p| p.wire_name()).collect();
    let mut args = to_args([
        "get",
        "-H",
        "-p",
        "-r",
        "-t",
        "filesystem,volume,snapshot",
        "-o",
        "name,property,value,source",
    ]);
    args.push(names.join(","));
    args
}

/// `list` arguments for the given kinds
pub fn list_arguments(kinds: &[ObjectKind]) -> Vec<String> {
    let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    let mut args = to_args(["list", "-H", "-o", "name", "-t"]);
    args.push(kinds.join(","));
    args
}

/// `set` arguments, or `None` when no value is local to `path`
pub fn set_arguments(path: &str, properties: &[PropertyValue]) -> Result<Option<Vec<String>>> {
    validate_object_name(path)?;
    let assignments: Vec<String> = properties
        .iter()
        .filter(|value| value.is_local())
        .map(PropertyValue::set_argument)
        .collect();
    if assignments.is_empty() {
        return Ok(None);
    }

    let mut args = to_args(["set"]);
    args.extend(assignments);
    args.push(path.to_string());
    Ok(Some(args))
}

pub fn inherit_arguments(path: &str, property: PropertyName) -> Result<Vec<String>> {
    validate_object_name(path)?;
    if !property.is_inheritable() {
        return Err(SnapKeepError::inheritance(format!(
            "{property} is not inheritable"
        )));
    }
    Ok(to_args(["inherit".to_string(), property.wire_name(), path.to_string()]))
}

/// `snapshot` arguments with the record's metadata as creation properties
pub fn snapshot_arguments(record: &SnapshotRecord) -> Result<Vec<String>> {
    let mut args = to_args(["snapshot"]);
    if record.is_recursive() {
        args.push("-r".to_string());
    }
    for property in record.creation_properties()? {
        args.push("-o".to_string());
        args.push(property.set_argument());
    }
    args.push(record.name().to_string());
    Ok(args)
}

pub fn destroy_arguments(record: &SnapshotRecord) -> Vec<String> {
    let mut args = to_args(["destroy"]);
    if record.is_recursive() {
        args.push("-r".to_string());
    }
    args.push(record.name().to_string());
    args
}

fn new_snapshot_record(
    node: &DatasetNode,
    period: SnapshotPeriod,
    timestamp: DateTime<Utc>,
    formatting: &FormattingSettings,
    policy: &DatasetPolicy,
) -> Result<SnapshotRecord> {
    SnapshotRecord::for_dataset(
        node.name(),
        period,
        timestamp,
        formatting,
        policy.recursion == RecursionMode::Zfs,
    )
}

/// Executes commands by spawning the storage tool
#[derive(Debug, Clone)]
pub struct ZfsCommandRunner {
    program: String,
    base_args: Vec<String>,
}

impl ZfsCommandRunner {
    /// `command` is the program followed by any leading arguments, e.g.
    /// `["sudo", "zfs"]`
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, base_args) = command
            .split_first()
            .ok_or_else(|| SnapKeepError::config("zfs command cannot be empty"))?;
        Ok(Self {
            program: program.clone(),
            base_args: base_args.to_vec(),
        })
    }

    pub fn from_config(config: &SnapKeepConfig) -> Result<Self> {
        Self::new(&config.zfs_command)
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once(&self.program)
            .chain(&self.base_args)
            .chain(args)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and return stdout
    async fn run(&self, args: &[String]) -> Result<String> {
        let description = self.describe(args);
        debug!("Running {description}");

        let output = self.command(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SnapKeepError::operation(
                description,
                failure_reason(output.status, &stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_mutation(&self, dry_run: bool, args: &[String]) -> OperationStatus {
        if dry_run {
            info!("[dry run] {}", self.describe(args));
            return OperationStatus::Success;
        }

        info!("{}", self.describe(args));
        match self.run(args).await {
            Ok(_) => OperationStatus::Success,
            Err(e) => {
                warn!("{e}");
                OperationStatus::Failure(e.to_string())
            }
        }
    }
}

/// Read a child's stderr to the end; unreadable output becomes empty text
async fn drain_stderr<R>(mut reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut text = String::new();
    if let Err(e) = reader.read_to_string(&mut text).await {
        debug!("Reading stderr failed: {e}");
        text.clear();
    }
    text
}

fn failure_reason(status: ExitStatus, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {status}")
    } else {
        stderr.to_string()
    }
}

#[async_trait]
impl CommandExecutor for ZfsCommandRunner {
    async fn list_objects(&self, kinds: &[ObjectKind]) -> Result<Vec<String>> {
        let stdout = self.run(&list_arguments(kinds)).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn get_all_properties(&self, properties: &[PropertyName]) -> Result<LineStream> {
        let args = get_arguments(properties);
        let description = self.describe(&args);
        debug!("Streaming {description}");

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SnapKeepError::operation(description.as_str(), "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SnapKeepError::operation(description.as_str(), "stderr was not captured"))?;

        // Drained concurrently so a chatty stderr cannot stall stdout
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let lines: LineStream = Box::pin(try_stream! {
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                yield line;
            }

            let status = child.wait().await?;
            if !status.success() {
                let stderr = stderr_task.await.unwrap_or_default();
                Err::<(), SnapKeepError>(SnapKeepError::operation(
                    description.clone(),
                    failure_reason(status, &stderr),
                ))?;
            }
        });
        Ok(lines)
    }

    async fn set_properties(
        &self,
        dry_run: bool,
        path: &str,
        properties: &[PropertyValue],
    ) -> OperationStatus {
        match set_arguments(path, properties) {
            Ok(Some(args)) => self.run_mutation(dry_run, &args).await,
            Ok(None) => OperationStatus::SourceIsReadOnly,
            Err(e) => OperationStatus::Failure(e.to_string()),
        }
    }

    async fn inherit_property(
        &self,
        dry_run: bool,
        path: &str,
        property: PropertyName,
    ) -> OperationStatus {
        match inherit_arguments(path, property) {
            Ok(args) => self.run_mutation(dry_run, &args).await,
            Err(e) => OperationStatus::Failure(e.to_string()),
        }
    }

    async fn take_snapshot(
        &self,
        dry_run: bool,
        node: &DatasetNode,
        period: SnapshotPeriod,
        timestamp: DateTime<Utc>,
        formatting: &FormattingSettings,
        policy: &DatasetPolicy,
    ) -> (OperationStatus, Option<SnapshotRecord>) {
        let prepared = new_snapshot_record(node, period, timestamp, formatting, policy)
            .and_then(|record| snapshot_arguments(&record).map(|args| (record, args)));
        let (record, args) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return (OperationStatus::Failure(e.to_string()), None),
        };

        match self.run_mutation(dry_run, &args).await {
            OperationStatus::Success => (OperationStatus::Success, Some(record)),
            status => (status, None),
        }
    }

    async fn destroy_snapshot(&self, dry_run: bool, record: &SnapshotRecord) -> OperationStatus {
        self.run_mutation(dry_run, &destroy_arguments(record)).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// object name -> wire property name -> (value, source)
    objects: BTreeMap<String, BTreeMap<String, (String, String)>>,
    /// Lines that do not split into four fields, replayed verbatim
    malformed: Vec<String>,
    commands: Vec<String>,
    failing: Vec<String>,
}

impl MemoryState {
    fn insert_line(&mut self, line: &str) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            self.malformed.push(line.to_string());
            return;
        }
        self.objects
            .entry(fields[0].to_string())
            .or_default()
            .insert(fields[1].to_string(), (fields[2].to_string(), fields[3].to_string()));
    }

    fn set(&mut self, object: &str, property: &str, value: &str, source: &str) {
        self.objects
            .entry(object.to_string())
            .or_default()
            .insert(property.to_string(), (value.to_string(), source.to_string()));
    }

    fn is_dataset(&self, name: &str) -> bool {
        self.objects
            .get(name)
            .and_then(|props| props.get("type"))
            .is_some_and(|(kind, _)| kind == "filesystem" || kind == "volume")
    }

    /// Log the command, then report whether it was set up to fail
    fn record(&mut self, args: &[String]) -> Option<String> {
        let command = args.join(" ");
        self.commands.push(command.clone());
        self.failing
            .iter()
            .find(|needle| command.contains(needle.as_str()))
            .map(|needle| format!("injected failure matching '{needle}'"))
    }

    fn apply_snapshot(&mut self, record: &SnapshotRecord) -> Result<()> {
        let mut covered = vec![record.dataset().to_string()];
        if record.is_recursive() {
            let prefix = format!("{}/", record.dataset());
            covered.extend(
                self.objects
                    .keys()
                    .filter(|name| name.starts_with(&prefix) && !name.contains(SNAPSHOT_DELIMITER))
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }

        let covered: Vec<String> = covered
            .into_iter()
            .filter(|name| self.is_dataset(name))
            .collect();
        let names: Vec<String> = covered
            .iter()
            .map(|dataset| format!("{dataset}{SNAPSHOT_DELIMITER}{}", record.short_name()))
            .collect();
        if let Some(existing) = names.iter().find(|name| self.objects.contains_key(name.as_str())) {
            return Err(SnapKeepError::operation(
                "snapshot",
                format!("cannot create snapshot '{existing}': dataset already exists"),
            ));
        }

        let properties = record.creation_properties()?;
        for name in names {
            self.set(&name, "type", "snapshot", "-");
            for property in &properties {
                self.set(
                    &name,
                    &property.name().wire_name(),
                    &property.value().to_wire_string(),
                    "local",
                );
            }
        }
        Ok(())
    }

    fn apply_destroy(&mut self, record: &SnapshotRecord) {
        let suffix = format!("{SNAPSHOT_DELIMITER}{}", record.short_name());
        let prefix = format!("{}/", record.dataset());
        let recursive = record.is_recursive();
        self.objects.retain(|name, _| {
            let Some(dataset) = name.strip_suffix(suffix.as_str()) else {
                return true;
            };
            !(dataset == record.dataset() || (recursive && dataset.starts_with(&prefix)))
        });
    }
}

/// In-memory executor holding a property listing.
///
/// Mutations are applied to the listing, so a later `get_all_properties`
/// reflects them. Every command is logged, and commands can be made to fail
/// with [`MemoryZfs::fail_commands_containing`].
#[derive(Debug, Default)]
pub struct MemoryZfs {
    state: Mutex<MemoryState>,
}

impl MemoryZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let zfs = Self::new();
        zfs.add_lines(lines);
        zfs
    }

    pub fn add_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state();
        for line in lines {
            state.insert_line(line.as_ref());
        }
    }

    /// Make every later command whose text contains `needle` fail
    pub fn fail_commands_containing<S: Into<String>>(&self, needle: S) {
        self.state().failing.push(needle.into());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Commands issued so far, excluding dry runs
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Current `(value, source)` of a property on an object
    pub fn property(&self, object: &str, property: PropertyName) -> Option<(String, String)> {
        self.state()
            .objects
            .get(object)
            .and_then(|props| props.get(&property.wire_name()))
            .cloned()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate<F>(&self, dry_run: bool, args: &[String], apply: F) -> OperationStatus
    where
        F: FnOnce(&mut MemoryState) -> Result<()>,
    {
        if dry_run {
            info!("[dry run] zfs {}", args.join(" "));
            return OperationStatus::Success;
        }

        let mut state = self.state();
        if let Some(reason) = state.record(args) {
            return OperationStatus::Failure(reason);
        }
        match apply(&mut *state) {
            Ok(()) => OperationStatus::Success,
            Err(e) => OperationStatus::Failure(e.to_string()),
        }
    }
}

#[async_trait]
impl CommandExecutor for MemoryZfs {
    async fn list_objects(&self, kinds: &[ObjectKind]) -> Result<Vec<String>> {
        let args = list_arguments(kinds);
        let mut state = self.state();
        if let Some(reason) = state.record(&args) {
            return Err(SnapKeepError::operation(args.join(" "), reason));
        }

        let wanted: BTreeSet<&str> = kinds.iter().map(|k| k.as_str()).collect();
        Ok(state
            .objects
            .iter()
            .filter(|(_, props)| {
                props
                    .get("type")
                    .is_some_and(|(kind, _)| wanted.contains(kind.as_str()))
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_all_properties(&self, properties: &[PropertyName]) -> Result<LineStream> {
        let args = get_arguments(properties);
        let wanted: BTreeSet<PropertyName> = properties.iter().copied().collect();
        let mut state = self.state();
        let failure = state.record(&args);

        let mut lines: Vec<Result<String>> = Vec::new();
        for (object, props) in &state.objects {
            for (property, (value, source)) in props {
                // Unknown names are passed through for the parser to reject
                let requested = PropertyName::from_wire(property).map_or(true, |p| wanted.contains(&p));
                if requested {
                    lines.push(Ok(format!("{object}\t{property}\t{value}\t{source}")));
                }
            }
        }
        lines.extend(state.malformed.iter().cloned().map(Ok));
        if let Some(reason) = failure {
            lines.push(Err(SnapKeepError::operation(args.join(" "), reason)));
        }

        Ok(stream::iter(lines).boxed())
    }

    async fn set_properties(
        &self,
        dry_run: bool,
        path: &str,
        properties: &[PropertyValue],
    ) -> OperationStatus {
        let args = match set_arguments(path, properties) {
            Ok(Some(args)) => args,
            Ok(None) => return OperationStatus::SourceIsReadOnly,
            Err(e) => return OperationStatus::Failure(e.to_string()),
        };

        self.mutate(dry_run, &args, |state| {
            for value in properties.iter().filter(|value| value.is_local()) {
                state.set(
                    path,
                    &value.name().wire_name(),
                    &value.value().to_wire_string(),
                    "local",
                );
            }
            Ok(())
        })
    }

    async fn inherit_property(
        &self,
        dry_run: bool,
        path: &str,
        property: PropertyName,
    ) -> OperationStatus {
        let args = match inherit_arguments(path, property) {
            Ok(args) => args,
            Err(e) => return OperationStatus::Failure(e.to_string()),
        };

        self.mutate(dry_run, &args, |state| {
            if let Some(props) = state.objects.get_mut(path) {
                props.insert(property.wire_name(), ("-".to_string(), "-".to_string()));
            }
            Ok(())
        })
    }

    async fn take_snapshot(
        &self,
        dry_run: bool,
        node: &DatasetNode,
        period: SnapshotPeriod,
        timestamp: DateTime<Utc>,
        formatting: &FormattingSettings,
        policy: &DatasetPolicy,
    ) -> (OperationStatus, Option<SnapshotRecord>) {
        let prepared = new_snapshot_record(node, period, timestamp, formatting, policy)
            .and_then(|record| snapshot_arguments(&record).map(|args| (record, args)));
        let (record, args) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return (OperationStatus::Failure(e.to_string()), None),
        };

        match self.mutate(dry_run, &args, |state| state.apply_snapshot(&record)) {
            OperationStatus::Success => (OperationStatus::Success, Some(record)),
            status => (status, None),
        }
    }

    async fn destroy_snapshot(&self, dry_run: bool, record: &SnapshotRecord) -> OperationStatus {
        self.mutate(dry_run, &destroy_arguments(record), |state| {
            state.apply_destroy(record);
            Ok(())
        })
    }
}
