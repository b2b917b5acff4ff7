/*!
# snapkeep core

Policy-driven snapshot lifecycle management for ZFS-style storage.

Snapshot policy lives in the storage layer itself, as user properties on
datasets that descendants inherit. This crate provides:

- A typed property model with inheritance sources
- An in-memory dataset tree built from the storage tool's property listing
- Retention scheduling: which periodic snapshots are due and which expired
- A command executor seam with a process-spawning implementation and an
  in-memory double
- A cross-process mutex so only one instance mutates at a time
- A run engine tying these together

## Architecture

Decisions are made against the in-memory tree; every mutation is issued
through a [`CommandExecutor`], so the engine can be driven against
[`MemoryZfs`] in tests and against the real tool in production.

## Usage

```rust,no_run
use snapkeep_core::{SnapKeepConfig, SnapshotEngine, ZfsCommandRunner};

# async fn example() -> snapkeep_core::Result<()> {
let config = SnapKeepConfig::from_json_file("/etc/snapkeep/snapkeep.json")?;
let runner = ZfsCommandRunner::from_config(&config)?;
let engine = SnapshotEngine::new(runner, config);

let summary = engine.run(chrono::Utc::now(), None).await?;
println!("took {} snapshots, pruned {}", summary.taken, summary.pruned);
# Ok(())
# }
```
*/

pub mod command;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod mutex;
pub mod observability;
pub mod parser;
pub mod period;
pub mod property;
pub mod schedule;
pub mod snapshot;

#[cfg(test)]
mod dataset_tests;

pub use command::{CommandExecutor, MemoryZfs, OperationStatus, ZfsCommandRunner};
pub use config::{FormattingSettings, SnapKeepConfig, SnapshotTiming, TemplateSettings};
pub use dataset::{DatasetKind, DatasetNode, DatasetTree};
pub use engine::{RunSummary, SnapshotEngine};
pub use error::{MutexError, Result, SnapKeepError};
pub use mutex::{MutexHandle, MutexRegistry, MutexState};
pub use parser::{parse_lines, parse_stream, ParseOutput, RawObjectParser};
pub use period::SnapshotPeriod;
pub use property::{PropertyData, PropertyName, PropertySource, PropertyValue, RecursionMode};
pub use schedule::{DatasetPolicy, NoDeferral, PoolCapacityDeferral, PruneDeferral, RetentionCounts};
pub use snapshot::SnapshotRecord;
