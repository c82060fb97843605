use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Section directories per container.
pub const DEFAULT_SECTIONS_PER_CONTAINER: usize = 1024;

/// Hard ceiling on how large a pooled resource claim may grow.
pub const MAX_APPENDABLE_CLAIM_CEILING: u64 = 100 * 1024 * 1024;

/// Expiration never runs more often than this.
pub const MIN_CLEANUP_FREQUENCY: Duration = Duration::from_secs(1);

/// Margin added to the max archive usage when no back-pressure
/// percentage is configured.
const BACKPRESSURE_MARGIN: f64 = 0.02;

/// Repository configuration as written in a TOML file.
///
/// Sizes, durations and percentages are kept as strings here and parsed by
/// [`RepositoryConfig::validate`], so that a bad value fails at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Container name -> root directory.
    pub containers: BTreeMap<String, PathBuf>,
    pub sections_per_container: usize,
    pub archive_enabled: bool,
    /// e.g. `"50%"`.
    pub archive_max_usage_percentage: String,
    /// Defaults to the max usage plus 2% when unset.
    pub archive_backpressure_percentage: Option<String>,
    /// e.g. `"12 hours"`.
    pub archive_max_retention_period: String,
    /// e.g. `"1 sec"`. Clamped to at least one second.
    pub archive_cleanup_frequency: String,
    /// e.g. `"1 MB"`. Clamped to 100 MB.
    pub max_appendable_claim_size: String,
    pub max_pooled_claims: usize,
    /// `fsync` resource claim files whenever a content stream is closed.
    pub always_sync: bool,
    pub destruction_interval: String,
    pub reclaim_queue_capacity: usize,
    pub reclaim_offer_timeout: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            containers: BTreeMap::new(),
            sections_per_container: DEFAULT_SECTIONS_PER_CONTAINER,
            archive_enabled: true,
            archive_max_usage_percentage: "50%".into(),
            archive_backpressure_percentage: None,
            archive_max_retention_period: "12 hours".into(),
            archive_cleanup_frequency: "1 sec".into(),
            max_appendable_claim_size: "1 MB".into(),
            max_pooled_claims: 100,
            always_sync: false,
            destruction_interval: "1 sec".into(),
            reclaim_queue_capacity: 10_000,
            reclaim_offer_timeout: "10 mins".into(),
        }
    }
}

impl RepositoryConfig {
    /// Default configuration with a single container.
    pub fn single(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.containers.insert(name.into(), root.into());
        config
    }

    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and check every setting.
    pub fn validate(&self) -> StoreResult<ResolvedConfig> {
        if self.containers.is_empty() {
            return Err(StoreError::Config("at least one container is required".into()));
        }
        for (name, root) in &self.containers {
            if name.trim().is_empty() {
                return Err(StoreError::Config("container names must be non-empty".into()));
            }
            if root.as_os_str().is_empty() {
                return Err(StoreError::Config(format!("container {name} has an empty path")));
            }
        }
        if self.sections_per_container == 0 {
            return Err(StoreError::Config("sections_per_container must be at least 1".into()));
        }
        if self.max_pooled_claims == 0 {
            return Err(StoreError::Config("max_pooled_claims must be at least 1".into()));
        }
        if self.reclaim_queue_capacity == 0 {
            return Err(StoreError::Config("reclaim_queue_capacity must be at least 1".into()));
        }

        let max_archive_ratio = parse_percentage(&self.archive_max_usage_percentage)?;
        if self.archive_enabled && max_archive_ratio <= 0.0 {
            return Err(StoreError::Config(
                "archive_max_usage_percentage must be greater than 0% when archiving is enabled"
                    .into(),
            ));
        }
        let backpressure_ratio = match &self.archive_backpressure_percentage {
            Some(text) => parse_percentage(text)?,
            None => max_archive_ratio + BACKPRESSURE_MARGIN,
        };

        let max_retention = parse_duration(&self.archive_max_retention_period)?;

        let mut cleanup_frequency = parse_duration(&self.archive_cleanup_frequency)?;
        if cleanup_frequency < MIN_CLEANUP_FREQUENCY {
            warn!(
                configured = %self.archive_cleanup_frequency,
                "archive cleanup frequency below one second; using one second"
            );
            cleanup_frequency = MIN_CLEANUP_FREQUENCY;
        }

        let mut max_appendable_claim_size = parse_data_size(&self.max_appendable_claim_size)?;
        if max_appendable_claim_size > MAX_APPENDABLE_CLAIM_CEILING {
            warn!(
                configured = %self.max_appendable_claim_size,
                ceiling = MAX_APPENDABLE_CLAIM_CEILING,
                "max appendable claim size above ceiling; clamping"
            );
            max_appendable_claim_size = MAX_APPENDABLE_CLAIM_CEILING;
        }

        let destruction_interval = parse_duration(&self.destruction_interval)?;
        if destruction_interval.is_zero() {
            return Err(StoreError::Config("destruction_interval must be non-zero".into()));
        }

        Ok(ResolvedConfig {
            containers: self
                .containers
                .iter()
                .map(|(name, root)| (name.clone(), root.clone()))
                .collect(),
            sections_per_container: self.sections_per_container,
            archive_enabled: self.archive_enabled,
            max_archive_ratio,
            backpressure_ratio,
            max_retention,
            cleanup_frequency,
            max_appendable_claim_size,
            max_pooled_claims: self.max_pooled_claims,
            always_sync: self.always_sync,
            destruction_interval,
            reclaim_queue_capacity: self.reclaim_queue_capacity,
            reclaim_offer_timeout: parse_duration(&self.reclaim_offer_timeout)?,
        })
    }
}

/// Validated settings used by the repository at runtime.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub containers: Vec<(String, PathBuf)>,
    pub sections_per_container: usize,
    pub archive_enabled: bool,
    /// Fraction of capacity archived data may occupy.
    pub max_archive_ratio: f64,
    /// Fraction of capacity in use at which `create()` blocks.
    pub backpressure_ratio: f64,
    pub max_retention: Duration,
    pub cleanup_frequency: Duration,
    pub max_appendable_claim_size: u64,
    pub max_pooled_claims: usize,
    pub always_sync: bool,
    pub destruction_interval: Duration,
    pub reclaim_queue_capacity: usize,
    pub reclaim_offer_timeout: Duration,
}

/// Parse `"NN%"` (one or two digits) into a ratio in `[0, 0.99]`.
pub fn parse_percentage(text: &str) -> StoreResult<f64> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_suffix('%')
        .filter(|d| (1..=2).contains(&d.len()) && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| {
            StoreError::Config(format!("invalid percentage {text:?}: expected format <XX>%"))
        })?;
    let value: u32 = digits
        .parse()
        .map_err(|_| StoreError::Config(format!("invalid percentage {text:?}")))?;
    Ok(f64::from(value) / 100.0)
}

/// Parse a duration such as `"12 hours"`, `"1 sec"`, `"250ms"` or `"30"`
/// (bare numbers are seconds).
pub fn parse_duration(text: &str) -> StoreResult<Duration> {
    let (value, unit) = split_quantity(text)
        .ok_or_else(|| StoreError::Config(format!("invalid duration {text:?}")))?;
    const NANOS_PER_SEC: f64 = 1e9;
    let nanos_per_unit = match unit.to_ascii_lowercase().as_str() {
        "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => 1e6,
        "" | "s" | "sec" | "secs" | "second" | "seconds" => NANOS_PER_SEC,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0 * NANOS_PER_SEC,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600.0 * NANOS_PER_SEC,
        "d" | "day" | "days" => 86_400.0 * NANOS_PER_SEC,
        other => {
            return Err(StoreError::Config(format!(
                "invalid duration {text:?}: unknown unit {other:?}"
            )))
        }
    };
    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

/// Parse a data size such as `"1 MB"`, `"512 KB"` or `"4096"` (bytes).
/// Units are binary multiples.
pub fn parse_data_size(text: &str) -> StoreResult<u64> {
    let (value, unit) = split_quantity(text)
        .ok_or_else(|| StoreError::Config(format!("invalid data size {text:?}")))?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" | "BYTES" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        other => {
            return Err(StoreError::Config(format!(
                "invalid data size {text:?}: unknown unit {other:?}"
            )))
        }
    };
    Ok((value * multiplier as f64) as u64)
}

/// Split `"<number> <unit>"` into its parts. The number must be finite and
/// non-negative.
fn split_quantity(text: &str) -> Option<(f64, &str)> {
    let trimmed = text.trim();
    let split_at = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value, unit.trim()))
}
