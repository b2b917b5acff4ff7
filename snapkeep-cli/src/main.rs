/*!
snapkeep CLI - command-line interface for the snapkeep snapshot manager.

This CLI runs take/prune passes and inspects or edits the snapshot policy
stored as properties on datasets.
*/

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use snapkeep_core::{
    observability::init_observability, DatasetTree, MutexError, OperationStatus, PropertyName,
    PropertySource, SnapKeepConfig, SnapKeepError, SnapshotEngine, ZfsCommandRunner,
};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "Policy-driven ZFS snapshot lifecycle manager")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "SNAPKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Log every mutation instead of issuing it
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take due snapshots and prune expired ones
    Run {
        /// Skip taking snapshots
        #[arg(long)]
        no_take: bool,
        /// Skip pruning snapshots
        #[arg(long)]
        no_prune: bool,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        print_metrics: bool,
    },
    /// List datasets and their resolved policy
    List {
        /// List managed snapshots instead
        #[arg(short, long)]
        snapshots: bool,
    },
    /// Show every snapkeep property of a dataset with its source
    Show {
        /// Dataset path, e.g. pool/data
        dataset: String,
    },
    /// Set a property on a dataset
    Set {
        dataset: String,
        /// Property name, with or without the snapkeep: prefix
        property: String,
        value: String,
    },
    /// Clear a local property so it inherits from the parent
    Inherit {
        dataset: String,
        property: String,
    },
    /// Check that every pool root carries the full policy schema
    Check,
}

#[derive(Tabled)]
struct DatasetInfo {
    #[tabled(rename = "Dataset")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Recursion")]
    recursion: String,
    #[tabled(rename = "Template")]
    template: String,
    #[tabled(rename = "Used")]
    used: String,
    #[tabled(rename = "Snapshots")]
    snapshots: usize,
}

#[derive(Tabled)]
struct SnapshotInfo {
    #[tabled(rename = "Snapshot")]
    name: String,
    #[tabled(rename = "Period")]
    period: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Recursive")]
    recursive: bool,
}

#[derive(Tabled)]
struct PropertyInfo {
    #[tabled(rename = "Property")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Source")]
    source: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_observability(cli.json_logs, cli.verbose)?;

    let mut config = load_config(cli.config.as_ref())?;
    if cli.dry_run {
        config.dry_run = true;
    }

    match cli.command {
        Commands::Run {
            no_take,
            no_prune,
            print_metrics,
        } => {
            config.take_snapshots &= !no_take;
            config.prune_snapshots &= !no_prune;
            run(config, print_metrics).await?
        }
        Commands::List { snapshots } => list(config, snapshots).await?,
        Commands::Show { dataset } => show(config, &dataset).await?,
        Commands::Set {
            dataset,
            property,
            value,
        } => set(config, &dataset, &property, &value).await?,
        Commands::Inherit { dataset, property } => inherit(config, &dataset, &property).await?,
        Commands::Check => check(config).await?,
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SnapKeepConfig, anyhow::Error> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(SnapKeepConfig::from_json_file(path)?)
        }
        None => Ok(SnapKeepConfig::default()),
    }
}

fn create_engine(config: SnapKeepConfig) -> Result<SnapshotEngine<ZfsCommandRunner>, anyhow::Error> {
    let runner = ZfsCommandRunner::from_config(&config)?;
    Ok(SnapshotEngine::new(runner, config))
}

fn parse_property(raw: &str) -> Result<PropertyName, anyhow::Error> {
    PropertyName::from_wire(raw).ok_or_else(|| anyhow::anyhow!("unknown property '{raw}'"))
}

async fn run(config: SnapKeepConfig, print_metrics: bool) -> Result<(), anyhow::Error> {
    let engine = create_engine(config)?;

    let summary = match engine.run(Utc::now(), None).await {
        Ok(summary) => summary,
        Err(SnapKeepError::Mutex(MutexError::Busy { name })) => {
            warn!("Another instance holds lock '{name}', skipping this run");
            return Ok(());
        }
        Err(e) => {
            error!("Run failed: {e}");
            return Err(e.into());
        }
    };

    println!(
        "taken: {}  pruned: {}  deferred: {}  failures: {}",
        summary.taken,
        summary.pruned,
        summary.deferred,
        summary.failures()
    );
    if !summary.skipped.is_empty() {
        println!("skipped: {}", summary.skipped.join(", "));
    }

    if print_metrics {
        print_run_metrics()?;
    }

    if summary.failures() > 0 {
        return Err(anyhow::anyhow!("{} operations failed", summary.failures()));
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn print_run_metrics() -> Result<(), anyhow::Error> {
    let metrics = snapkeep_core::observability::SnapKeepMetrics::global()?;
    print!("{}", metrics.gather_metrics()?);
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn print_run_metrics() -> Result<(), anyhow::Error> {
    Err(anyhow::anyhow!("metrics support not enabled"))
}

async fn list(config: SnapKeepConfig, snapshots: bool) -> Result<(), anyhow::Error> {
    let engine = create_engine(config)?;
    let output = engine.load_tree().await?;
    for rejected in &output.rejected {
        warn!("{}: not managed: {}", rejected.name, rejected.reason);
    }

    if snapshots {
        list_snapshots(&output.tree);
    } else {
        list_datasets(&output.tree);
    }
    Ok(())
}

fn list_datasets(tree: &DatasetTree) {
    let rows: Vec<DatasetInfo> = tree
        .iter()
        .map(|node| {
            let policy = tree.resolve_policy(node.name()).ok();
            DatasetInfo {
                name: node.name().to_string(),
                kind: node.kind().to_string(),
                enabled: policy
                    .as_ref()
                    .map_or("?".to_string(), |p| p.enabled.to_string()),
                recursion: policy
                    .as_ref()
                    .map_or("?".to_string(), |p| p.recursion.as_str().to_string()),
                template: policy.as_ref().map_or("?".to_string(), |p| p.template.clone()),
                used: format_size(node.used_bytes()),
                snapshots: node.snapshot_count(),
            }
        })
        .collect();

    if rows.is_empty() {
        println!("No datasets found");
    } else {
        println!("{}", Table::new(rows));
    }
}

fn list_snapshots(tree: &DatasetTree) {
    let mut rows: Vec<(DateTime<Utc>, SnapshotInfo)> = tree
        .iter()
        .flat_map(|node| node.all_snapshots())
        .map(|record| {
            (
                record.timestamp(),
                SnapshotInfo {
                    name: record.name().to_string(),
                    period: record.period().to_string(),
                    created: format_timestamp(record.timestamp()),
                    recursive: record.is_recursive(),
                },
            )
        })
        .collect();

    if rows.is_empty() {
        println!("No managed snapshots found");
    } else {
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        println!("{}", Table::new(rows.into_iter().map(|(_, info)| info)));
    }
}

async fn show(config: SnapKeepConfig, dataset: &str) -> Result<(), anyhow::Error> {
    let engine = create_engine(config)?;
    let output = engine.load_tree().await?;
    let node = output
        .tree
        .get(dataset)
        .ok_or_else(|| anyhow::anyhow!("dataset '{dataset}' not found"))?;

    println!("Dataset: {}", node.name());
    println!("  Kind: {}", node.kind());
    println!(
        "  Used: {}  Available: {}",
        format_size(node.used_bytes()),
        format_size(node.available_bytes())
    );

    let mut rows = Vec::new();
    for property in PropertyName::all()
        .into_iter()
        .filter(|p| p.is_dataset_property())
    {
        match output.tree.get_effective(dataset, property) {
            Ok(value) => {
                let source = match value.source() {
                    PropertySource::Inherited => format!("inherited from {}", value.owner()),
                    other => other.to_string(),
                };
                rows.push(PropertyInfo {
                    name: property.wire_name(),
                    value: value.value().to_wire_string(),
                    source,
                });
            }
            Err(e) => warn!("{dataset}: {property}: {e}"),
        }
    }
    println!("{}", Table::new(rows));
    Ok(())
}

async fn set(
    config: SnapKeepConfig,
    dataset: &str,
    property: &str,
    value: &str,
) -> Result<(), anyhow::Error> {
    let property = parse_property(property)?;
    let engine = create_engine(config)?;
    let status = engine.set_property(dataset, property, value).await?;
    report(status, &format!("set {property}={value} on {dataset}"))
}

async fn inherit(config: SnapKeepConfig, dataset: &str, property: &str) -> Result<(), anyhow::Error> {
    let property = parse_property(property)?;
    let engine = create_engine(config)?;
    let status = engine.inherit_property(dataset, property).await?;
    report(status, &format!("inherit {property} on {dataset}"))
}

fn report(status: OperationStatus, action: &str) -> Result<(), anyhow::Error> {
    match status {
        OperationStatus::Success => {
            println!("✓ {action}");
            Ok(())
        }
        OperationStatus::SourceIsReadOnly => Err(anyhow::anyhow!("{action}: value is not local")),
        OperationStatus::Failure(reason) => Err(anyhow::anyhow!("{action}: {reason}")),
    }
}

async fn check(config: SnapKeepConfig) -> Result<(), anyhow::Error> {
    let engine = create_engine(config)?;
    match engine.check().await {
        Ok(output) => {
            println!(
                "✓ {} datasets, {} pool roots with a complete schema",
                output.tree.len(),
                output.tree.pool_roots().count()
            );
            for rejected in &output.rejected {
                println!("✗ {}: {}", rejected.name, rejected.reason);
            }
            Ok(())
        }
        Err(e) => {
            error!("✗ {e}");
            Err(e.into())
        }
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
