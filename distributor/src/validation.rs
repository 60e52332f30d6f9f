use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::api::{Entry, EntryError, PushError, Stream};
use crate::prometheus::report_mutated_samples;

// Discard/mutation reasons, used as the `reason` label on the shared
// per-tenant counters.
pub const INVALID_LABELS: &str = "invalid_labels";
pub const RATE_LIMITED: &str = "rate_limited";
pub const LINE_TOO_LONG: &str = "line_too_long";
pub const GREATER_THAN_MAX_SAMPLE_AGE: &str = "greater_than_max_sample_age";
pub const TOO_FAR_IN_FUTURE: &str = "too_far_in_future";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionRateStrategy {
    /// Each process enforces the configured rate on its own state.
    Local,
    /// Each process enforces rate/N where N is the number of healthy
    /// distributors registered in the distributor ring.
    Global,
}

impl FromStr for IngestionRateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(IngestionRateStrategy::Local),
            "global" => Ok(IngestionRateStrategy::Global),
            other => Err(format!(
                "invalid ingestion rate strategy '{other}', expected 'local' or 'global'"
            )),
        }
    }
}

/// Per-tenant ingestion limits. Tenants without an explicit override use the
/// defaults; a partial override JSON object falls back field-by-field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    pub ingestion_rate_strategy: IngestionRateStrategy,
    /// Bytes per second admitted past the rate limiter.
    pub ingestion_rate_bytes: u32,
    pub ingestion_burst_bytes: u32,
    pub max_label_name_length: usize,
    pub max_label_value_length: usize,
    pub max_label_names_per_series: usize,
    /// Longest accepted line in bytes. Zero disables the check.
    pub max_line_size: usize,
    /// Truncate over-long lines instead of rejecting them.
    pub max_line_size_truncate: bool,
    /// How far in the future an entry timestamp may lie.
    pub creation_grace_period_secs: i64,
    /// How far in the past an entry timestamp may lie.
    pub reject_old_samples_max_age_secs: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ingestion_rate_strategy: IngestionRateStrategy::Local,
            ingestion_rate_bytes: 4 << 20,
            ingestion_burst_bytes: 6 << 20,
            max_label_name_length: 1024,
            max_label_value_length: 2048,
            max_label_names_per_series: 30,
            max_line_size: 256 << 10,
            max_line_size_truncate: false,
            creation_grace_period_secs: 10 * 60,
            reject_old_samples_max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Tenant -> limits registry. The strategy is read from the defaults because
/// it is fixed at startup for the whole process.
#[derive(Debug, Default)]
pub struct Overrides {
    defaults: Limits,
    tenants: HashMap<String, Limits>,
}

impl Overrides {
    pub fn new(defaults: Limits, tenants: HashMap<String, Limits>) -> Self {
        Self { defaults, tenants }
    }

    pub fn limits(&self, tenant: &str) -> &Limits {
        self.tenants.get(tenant).unwrap_or(&self.defaults)
    }

    pub fn ingestion_rate_strategy(&self) -> IngestionRateStrategy {
        self.defaults.ingestion_rate_strategy
    }
}

/// Snapshot of one tenant's limits taken at the start of a push, so every
/// stream in the request is judged against the same rules and the same
/// `now`.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub tenant: String,
    pub now: OffsetDateTime,
    pub max_line_size: usize,
    pub max_line_size_truncate: bool,
    pub max_label_name_length: usize,
    pub max_label_value_length: usize,
    pub max_label_names_per_series: usize,
    pub creation_grace_period: Duration,
    pub reject_old_samples_max_age: Duration,
}

pub struct Validator {
    overrides: Arc<Overrides>,
}

impl Validator {
    pub fn new(overrides: Arc<Overrides>) -> Self {
        Self { overrides }
    }

    pub fn validation_context(&self, now: OffsetDateTime, tenant: &str) -> ValidationContext {
        let limits = self.overrides.limits(tenant);
        ValidationContext {
            tenant: tenant.to_string(),
            now,
            max_line_size: limits.max_line_size,
            max_line_size_truncate: limits.max_line_size_truncate,
            max_label_name_length: limits.max_label_name_length,
            max_label_value_length: limits.max_label_value_length,
            max_label_names_per_series: limits.max_label_names_per_series,
            creation_grace_period: Duration::seconds(limits.creation_grace_period_secs),
            reject_old_samples_max_age: Duration::seconds(limits.reject_old_samples_max_age_secs),
        }
    }

    /// Validate a parsed, sorted label set. `raw` is the label string as the
    /// client sent it, used for error messages.
    pub fn validate_labels(
        &self,
        ctx: &ValidationContext,
        labels: &[(String, String)],
        raw: &str,
    ) -> Result<(), PushError> {
        if labels.is_empty() {
            return Err(invalid_labels(raw, "at least one label pair is required"));
        }
        if labels.len() > ctx.max_label_names_per_series {
            return Err(invalid_labels(
                raw,
                &format!(
                    "{} label names, limit {}",
                    labels.len(),
                    ctx.max_label_names_per_series
                ),
            ));
        }
        let mut last_name: Option<&str> = None;
        for (name, value) in labels {
            if name.len() > ctx.max_label_name_length {
                return Err(invalid_labels(raw, &format!("label name '{name}' too long")));
            }
            if value.len() > ctx.max_label_value_length {
                return Err(invalid_labels(
                    raw,
                    &format!("value for label '{name}' too long"),
                ));
            }
            // labels arrive sorted, so duplicates are adjacent
            if last_name == Some(name.as_str()) {
                return Err(invalid_labels(raw, &format!("duplicate label name '{name}'")));
            }
            last_name = Some(name);
        }
        Ok(())
    }

    /// Validate one entry against the tenant's timestamp window and line
    /// limit. Runs after truncation, so the length check sees the
    /// post-truncation size.
    pub fn validate_entry(
        &self,
        ctx: &ValidationContext,
        labels: &str,
        entry: &Entry,
    ) -> Result<(), EntryError> {
        let ts = entry.timestamp as i128;
        let now = ctx.now.unix_timestamp_nanos();

        let earliest = now - ctx.reject_old_samples_max_age.whole_nanoseconds();
        if ts < earliest {
            return Err(EntryError::TooOld {
                labels: labels.to_string(),
                timestamp: entry.timestamp,
            });
        }

        let latest = now + ctx.creation_grace_period.whole_nanoseconds();
        if ts > latest {
            return Err(EntryError::TooNew {
                labels: labels.to_string(),
                timestamp: entry.timestamp,
            });
        }

        if ctx.max_line_size != 0
            && entry.line.len() > ctx.max_line_size
            && !ctx.max_line_size_truncate
        {
            return Err(EntryError::LineTooLong {
                limit: ctx.max_line_size,
                actual: entry.line.len(),
                labels: labels.to_string(),
            });
        }

        Ok(())
    }

    /// Truncate over-long lines in place when the tenant opted in. Runs
    /// before entry validation so no line is rejected solely for length once
    /// truncation is on. Truncated sample and byte totals are accumulated
    /// across the whole stream and reported once.
    pub fn truncate_lines(&self, ctx: &ValidationContext, stream: &mut Stream) {
        if !ctx.max_line_size_truncate || ctx.max_line_size == 0 {
            return;
        }

        let mut truncated_samples = 0usize;
        let mut truncated_bytes = 0usize;
        for entry in &mut stream.entries {
            if entry.line.len() <= ctx.max_line_size {
                continue;
            }
            // cut on a char boundary at or below the byte limit
            let mut cut = ctx.max_line_size;
            while !entry.line.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated_samples += 1;
            truncated_bytes += entry.line.len() - cut;
            entry.line.truncate(cut);
        }

        if truncated_samples > 0 {
            report_mutated_samples(LINE_TOO_LONG, &ctx.tenant, truncated_samples, truncated_bytes);
        }
    }
}

fn invalid_labels(raw: &str, message: &str) -> PushError {
    PushError::InvalidLabels {
        labels: raw.to_string(),
        message: message.to_string(),
    }
}
