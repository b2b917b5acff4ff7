//! Configuration for a snapkeep run
//!
//! Templates describe how snapshots are named and when each period falls due.
//! A dataset selects its template through the `snapkeep:template` property;
//! every other policy setting lives in the storage layer's own properties.

use crate::{Result, SnapKeepError, SnapshotPeriod};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the template every configuration must define
pub const DEFAULT_TEMPLATE: &str = "default";

/// Per-period name suffixes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodSuffixes {
    pub frequent: String,
    pub hourly: String,
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
    pub yearly: String,
    pub manual: String,
    pub temporary: String,
}

impl PeriodSuffixes {
    pub fn for_period(&self, period: SnapshotPeriod) -> &str {
        match period {
            SnapshotPeriod::Frequent => &self.frequent,
            SnapshotPeriod::Hourly => &self.hourly,
            SnapshotPeriod::Daily => &self.daily,
            SnapshotPeriod::Weekly => &self.weekly,
            SnapshotPeriod::Monthly => &self.monthly,
            SnapshotPeriod::Yearly => &self.yearly,
            SnapshotPeriod::Manual => &self.manual,
            SnapshotPeriod::Temporary => &self.temporary,
        }
    }
}

impl Default for PeriodSuffixes {
    fn default() -> Self {
        Self {
            frequent: "frequently".to_string(),
            hourly: "hourly".to_string(),
            daily: "daily".to_string(),
            weekly: "weekly".to_string(),
            monthly: "monthly".to_string(),
            yearly: "yearly".to_string(),
            manual: "manual".to_string(),
            temporary: "temporary".to_string(),
        }
    }
}

/// How snapshot short names are composed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormattingSettings {
    pub prefix: String,
    /// strftime-style format applied to the UTC snapshot timestamp
    pub timestamp_format: String,
    pub component_separator: String,
    pub suffixes: PeriodSuffixes,
}

impl FormattingSettings {
    /// `prefix<sep>timestamp<sep>suffix`
    pub fn snapshot_short_name(&self, period: SnapshotPeriod, timestamp: DateTime<Utc>) -> String {
        format!(
            "{prefix}{sep}{ts}{sep}{suffix}",
            prefix = self.prefix,
            sep = self.component_separator,
            ts = timestamp.format(&self.timestamp_format),
            suffix = self.suffixes.for_period(period),
        )
    }
}

impl Default for FormattingSettings {
    fn default() -> Self {
        Self {
            prefix: "autosnap".to_string(),
            timestamp_format: "%Y-%m-%d_%H:%M:%S".to_string(),
            component_separator: "_".to_string(),
            suffixes: PeriodSuffixes::default(),
        }
    }
}

/// When each periodic snapshot falls due
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotTiming {
    /// Minutes between frequent snapshots; must divide 60
    pub frequent_period: u32,
    pub hourly_minute: u32,
    pub daily_time: NaiveTime,
    pub weekly_day: Weekday,
    pub weekly_time: NaiveTime,
    /// Clamped to the last day of shorter months
    pub monthly_day: u32,
    pub monthly_time: NaiveTime,
    pub yearly_month: u32,
    pub yearly_day: u32,
    pub yearly_time: NaiveTime,
    /// Evaluate boundaries in the host's local time zone instead of UTC
    pub use_local_time: bool,
}

impl Default for SnapshotTiming {
    fn default() -> Self {
        Self {
            frequent_period: 15,
            hourly_minute: 0,
            daily_time: NaiveTime::MIN,
            weekly_day: Weekday::Mon,
            weekly_time: NaiveTime::MIN,
            monthly_day: 1,
            monthly_time: NaiveTime::MIN,
            yearly_month: 1,
            yearly_day: 1,
            yearly_time: NaiveTime::MIN,
            use_local_time: true,
        }
    }
}

impl SnapshotTiming {
    /// UTC timing with default boundaries, mostly useful in tests
    pub fn utc() -> Self {
        Self {
            use_local_time: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequent_period == 0 || 60 % self.frequent_period != 0 {
            return Err(SnapKeepError::config(format!(
                "frequent_period must divide 60, got {}",
                self.frequent_period
            )));
        }
        if self.hourly_minute > 59 {
            return Err(SnapKeepError::config(format!(
                "hourly_minute must be 0-59, got {}",
                self.hourly_minute
            )));
        }
        for (field, day) in [("monthly_day", self.monthly_day), ("yearly_day", self.yearly_day)] {
            if !(1..=31).contains(&day) {
                return Err(SnapKeepError::config(format!(
                    "{field} must be 1-31, got {day}"
                )));
            }
        }
        if !(1..=12).contains(&self.yearly_month) {
            return Err(SnapKeepError::config(format!(
                "yearly_month must be 1-12, got {}",
                self.yearly_month
            )));
        }
        Ok(())
    }
}

/// A named bundle of naming and timing settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    pub formatting: FormattingSettings,
    pub timing: SnapshotTiming,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapKeepConfig {
    /// Validate and log every mutation without issuing it
    pub dry_run: bool,
    pub take_snapshots: bool,
    pub prune_snapshots: bool,
    /// Program and leading arguments used to invoke the storage CLI
    pub zfs_command: Vec<String>,
    /// Directory holding the process lock files
    pub lock_dir: PathBuf,
    pub mutex_name: String,
    pub lock_timeout_ms: u64,
    pub templates: BTreeMap<String, TemplateSettings>,
}

impl Default for SnapKeepConfig {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(DEFAULT_TEMPLATE.to_string(), TemplateSettings::default());

        Self {
            dry_run: false,
            take_snapshots: true,
            prune_snapshots: true,
            zfs_command: vec!["zfs".to_string()],
            lock_dir: PathBuf::from("/run/snapkeep"),
            mutex_name: "snapkeep-global".to_string(),
            lock_timeout_ms: 5000,
            templates,
        }
    }
}

impl SnapKeepConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SnapKeepError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: SnapKeepConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a template by the name a dataset's `template` property carries
    pub fn template(&self, name: &str) -> Result<&TemplateSettings> {
        self.templates
            .get(name)
            .ok_or_else(|| SnapKeepError::validation(format!("unknown template '{name}'")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.zfs_command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(SnapKeepError::config("zfs_command cannot be empty"));
        }
        if self.mutex_name.trim().is_empty() {
            return Err(SnapKeepError::config("mutex_name cannot be empty"));
        }
        if !self.templates.contains_key(DEFAULT_TEMPLATE) {
            return Err(SnapKeepError::config(format!(
                "a '{DEFAULT_TEMPLATE}' template is required"
            )));
        }
        for (name, template) in &self.templates {
            if template.formatting.prefix.is_empty() {
                return Err(SnapKeepError::config(format!(
                    "template '{name}' has an empty prefix"
                )));
            }
            template.timing.validate()?;
        }
        Ok(())
    }
}
