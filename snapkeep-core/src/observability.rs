/*!
Observability infrastructure for snapkeep.

This module provides:
- Structured logging setup (JSON or plain text)
- Prometheus counters describing each run
*/

#[cfg(feature = "metrics")]
use crate::engine::RunSummary;
#[cfg(feature = "metrics")]
use chrono::{DateTime, Utc};
#[cfg(feature = "metrics")]
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapKeepError};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<std::result::Result<SnapKeepMetrics, String>> = OnceLock::new();

/// Metrics collected across runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SnapKeepMetrics {
    pub snapshots_taken_total: IntCounter,
    pub snapshots_take_failed_total: IntCounter,
    pub snapshots_pruned_total: IntCounter,
    pub snapshots_prune_failed_total: IntCounter,
    pub property_writes_failed_total: IntCounter,
    pub last_run_timestamp_seconds: Gauge,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| SnapKeepError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| SnapKeepError::config(format!("Failed to register {name} metric: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl SnapKeepMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let snapshots_taken_total = register_counter(
            &registry,
            "snapkeep_snapshots_taken_total",
            "Snapshots taken by snapkeep",
        )?;
        let snapshots_take_failed_total = register_counter(
            &registry,
            "snapkeep_snapshots_take_failed_total",
            "Snapshot commands that failed",
        )?;
        let snapshots_pruned_total = register_counter(
            &registry,
            "snapkeep_snapshots_pruned_total",
            "Snapshots destroyed after leaving retention",
        )?;
        let snapshots_prune_failed_total = register_counter(
            &registry,
            "snapkeep_snapshots_prune_failed_total",
            "Destroy commands that failed",
        )?;
        let property_writes_failed_total = register_counter(
            &registry,
            "snapkeep_property_writes_failed_total",
            "Property write-backs that failed",
        )?;

        let last_run_timestamp_seconds = Gauge::new(
            "snapkeep_last_run_timestamp_seconds",
            "Unix time of the last completed run",
        )
        .map_err(|e| {
            SnapKeepError::config(format!("Failed to create last_run_timestamp metric: {e}"))
        })?;
        registry
            .register(Box::new(last_run_timestamp_seconds.clone()))
            .map_err(|e| {
                SnapKeepError::config(format!("Failed to register last_run_timestamp metric: {e}"))
            })?;

        Ok(Self {
            snapshots_taken_total,
            snapshots_take_failed_total,
            snapshots_pruned_total,
            snapshots_prune_failed_total,
            property_writes_failed_total,
            last_run_timestamp_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Result<&'static SnapKeepMetrics> {
        METRICS
            .get_or_init(|| Self::new().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| SnapKeepError::config(e.clone()))
    }

    /// Add a finished run to the counters. Dry runs only move the timestamp.
    pub fn record_run(&self, summary: &RunSummary, finished_at: DateTime<Utc>) {
        if !summary.dry_run {
            self.snapshots_taken_total.inc_by(summary.taken as u64);
            self.snapshots_take_failed_total
                .inc_by(summary.take_failed as u64);
            self.snapshots_pruned_total.inc_by(summary.pruned as u64);
            self.snapshots_prune_failed_total
                .inc_by(summary.prune_failed as u64);
            self.property_writes_failed_total
                .inc_by(summary.property_writes_failed as u64);
        }
        self.last_run_timestamp_seconds
            .set(finished_at.timestamp() as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| SnapKeepError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            SnapKeepError::config(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr so command output on stdout stays clean. `RUST_LOG`
/// directives are honoured on top of the default `snapkeep=info`
/// (`snapkeep=debug` when `verbose`).
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of plain text
/// * `verbose` - Lower the default level for snapkeep crates to debug
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    let directive = if verbose { "snapkeep=debug" } else { "snapkeep=info" };
    let directive = directive
        .parse()
        .map_err(|e| SnapKeepError::config(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        set_global_default(
            registry.with(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };
    installed.map_err(|e| {
        SnapKeepError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("snapkeep logging initialized");
    Ok(())
}
