//! Schedule option translation.
//!
//! Callers describe scheduling abstractly (`at`, `delay`, `repeat`, retry
//! strategies, skip rules); the translator renders that into queue-level
//! enqueue options. Advanced repeat rules are not resolved here: they are
//! preserved under `metadata.advancedScheduling` and enforced by the worker
//! at dispatch time.

use crate::record::{BackoffSpec, CustomBackoff, RepeatSpec};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc};
use igniter_core::{IgniterError, IgniterResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Business-hours window for advanced scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHours {
    /// First working hour (inclusive), 0-23.
    pub start: u32,
    /// First non-working hour (exclusive), 0-23.
    pub end: u32,
    /// Fixed-offset timezone, e.g. `+02:00`; UTC when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Dispatch-time gating rules, carried in `metadata.advancedScheduling`.
///
/// Weekdays use the JavaScript numbering: 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedScheduling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_business_hours: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_weekends: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_hours: Option<BusinessHours>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_dates: Option<Vec<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_weekdays: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub between: Option<[String; 2]>,
}

impl AdvancedScheduling {
    fn is_empty(&self) -> bool {
        self.only_business_hours.is_none()
            && self.skip_weekends.is_none()
            && self.business_hours.is_none()
            && self.skip_dates.is_none()
            && self.only_weekdays.is_none()
            && self.between.is_none()
    }

    /// Evaluates the rules at `now`; a `Some` reason means the dispatch
    /// must be skipped.
    #[must_use]
    pub fn skip_reason(&self, now: DateTime<Utc>) -> Option<String> {
        let offset = self
            .business_hours
            .as_ref()
            .and_then(|bh| bh.timezone.as_deref())
            .and_then(parse_fixed_offset)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        let local = now.with_timezone(&offset);
        let weekday_js = local.weekday().num_days_from_sunday() as u8;

        if self.skip_weekends.unwrap_or(false) && (weekday_js == 0 || weekday_js == 6) {
            return Some("weekend".to_string());
        }

        if let Some(allowed) = &self.only_weekdays {
            if !allowed.contains(&weekday_js) {
                return Some(format!("weekday {weekday_js} not allowed"));
            }
        }

        if self.only_business_hours.unwrap_or(false) || self.business_hours.is_some() {
            let (start, end) = self
                .business_hours
                .as_ref()
                .map(|bh| (bh.start, bh.end))
                .unwrap_or((9, 17));
            let hour = local.hour();
            if hour < start || hour >= end {
                return Some(format!("outside business hours {start}-{end}"));
            }
        }

        if let Some(dates) = &self.skip_dates {
            if dates.contains(&local.date_naive()) {
                return Some(format!("skipped date {}", local.date_naive()));
            }
        }

        if let Some([start, end]) = &self.between {
            let start = parse_hh_mm(start)?;
            let end = parse_hh_mm(end)?;
            let time = local.time();
            if time < start || time > end {
                return Some(format!("outside window {start}-{end}"));
            }
        }

        None
    }
}

/// Parses a `+HH:MM` / `-HH:MM` / `UTC` offset string.
#[must_use]
pub fn parse_fixed_offset(s: &str) -> Option<FixedOffset> {
    if s.eq_ignore_ascii_case("utc") || s == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1i32, &s[1..]),
        b'-' => (-1i32, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_hh_mm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Recurrence as callers declare it, including the advanced gate rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub advanced: AdvancedScheduling,
}

impl RepeatOptions {
    /// A cron recurrence.
    #[must_use]
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            cron: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// A fixed-interval recurrence.
    #[must_use]
    pub fn every_ms(interval: u64) -> Self {
        Self {
            every: Some(interval),
            ..Self::default()
        }
    }

    /// Renders down to the broker-level spec (advanced rules excluded; they
    /// travel in metadata).
    #[must_use]
    pub fn to_spec(&self) -> RepeatSpec {
        RepeatSpec {
            cron: self.cron.clone(),
            every: self.every,
            limit: self.limit,
            until: self.until,
            tz: self.tz.clone(),
            start_date: self.start_date,
            count: 0,
        }
    }
}

/// Retry strategy shorthand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
    Custom { delays: Vec<u64> },
}

/// Dedup shorthand: `true` generates an id, a string is used as the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkipIfRunning {
    Flag(bool),
    Key(String),
}

/// Abstract schedule options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_if_running: Option<SkipIfRunning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_boost: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

/// A schedule specifier: a named preset or explicit options.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// A recognized preset name, e.g. `hourly`.
    Preset(String),
    /// Explicit options.
    Options(ScheduleOptions),
}

impl From<ScheduleOptions> for ScheduleSpec {
    fn from(options: ScheduleOptions) -> Self {
        ScheduleSpec::Options(options)
    }
}

/// Queue-level enqueue options produced by the translator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub delay: Option<u64>,
    pub priority: Option<i32>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffSpec>,
    pub job_id: Option<String>,
    pub repeat: Option<RepeatSpec>,
    pub metadata: Option<Value>,
}

fn preset_body(name: &str) -> Option<ScheduleOptions> {
    let cron = match name {
        "every_minute" => "* * * * *",
        "hourly" => "0 * * * *",
        "daily" => "0 0 * * *",
        "weekly" => "0 0 * * 0",
        "monthly" => "0 0 1 * *",
        _ => return None,
    };
    Some(ScheduleOptions {
        repeat: Some(RepeatOptions::cron(cron)),
        ..ScheduleOptions::default()
    })
}

/// Translates a schedule specifier into enqueue options.
pub fn translate(spec: ScheduleSpec) -> IgniterResult<EnqueueOptions> {
    translate_at(spec, Utc::now())
}

/// Translation with an explicit clock, the testable entry point.
pub fn translate_at(spec: ScheduleSpec, now: DateTime<Utc>) -> IgniterResult<EnqueueOptions> {
    let options = match spec {
        ScheduleSpec::Preset(name) => preset_body(&name).ok_or_else(|| {
            IgniterError::InvalidScheduleOptions(format!("Unknown schedule preset '{name}'"))
        })?,
        ScheduleSpec::Options(options) => options,
    };

    if options.at.is_some() && options.delay.is_some() {
        return Err(IgniterError::InvalidScheduleOptions(
            "'at' and 'delay' are mutually exclusive".to_string(),
        ));
    }

    let delay = match options.at {
        Some(at) => {
            if at <= now {
                return Err(IgniterError::InvalidScheduleTime(format!(
                    "'at' is in the past: {at}"
                )));
            }
            Some((at - now).num_milliseconds().max(0) as u64)
        }
        None => options.delay,
    };

    let mut metadata = Map::new();

    let repeat = options.repeat.as_ref().map(RepeatOptions::to_spec);
    if let Some(repeat_options) = &options.repeat {
        if !repeat_options.advanced.is_empty() {
            metadata.insert(
                "advancedScheduling".to_string(),
                serde_json::to_value(&repeat_options.advanced)?,
            );
        }
    }

    let backoff = options.retry_strategy.as_ref().map(|strategy| match strategy {
        RetryStrategy::Exponential => BackoffSpec::Exponential {
            multiplier: options.backoff_multiplier.unwrap_or(2.0),
            max: options.max_retry_delay.unwrap_or(60_000),
        },
        RetryStrategy::Linear => BackoffSpec::Fixed { delay: 5_000 },
        RetryStrategy::Fixed => BackoffSpec::Fixed {
            delay: options.delay.unwrap_or(1_000),
        },
        RetryStrategy::Custom { delays } => BackoffSpec::Custom {
            settings: CustomBackoff {
                delays: delays.clone(),
            },
        },
    });

    if let Some(jitter) = options.jitter_factor {
        if jitter > 0.0 {
            metadata.insert("jitterFactor".to_string(), jitter.into());
        }
    }

    let job_id = match &options.skip_if_running {
        Some(SkipIfRunning::Key(key)) => Some(key.clone()),
        Some(SkipIfRunning::Flag(true)) => Some(generated_dedup_id(now)),
        _ => None,
    };

    let priority = match (options.priority, options.priority_boost) {
        (Some(priority), Some(boost)) => Some(priority + boost),
        (None, Some(boost)) => Some(boost),
        (priority, None) => priority,
    };

    if let Some(webhook_url) = &options.webhook_url {
        metadata.insert("webhookUrl".to_string(), webhook_url.clone().into());
    }
    if let Some(tags) = &options.tags {
        metadata.insert("tags".to_string(), serde_json::to_value(tags)?);
    }
    if let Some(timeout) = options.timeout {
        metadata.insert("timeout".to_string(), timeout.into());
    }
    if let Some(max_concurrency) = options.max_concurrency {
        metadata.insert("maxConcurrency".to_string(), max_concurrency.into());
    }

    Ok(EnqueueOptions {
        delay,
        priority,
        attempts: options.attempts,
        backoff,
        job_id,
        repeat,
        metadata: (!metadata.is_empty()).then(|| Value::Object(metadata)),
    })
}

/// Pseudo-unique id for `skip_if_running: true`.
fn generated_dedup_id(now: DateTime<Utc>) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    format!("skip_{}_{}", base36(now.timestamp_millis() as u64), nanos % 46_656)
}

/// Renders a number in base 36.
#[must_use]
pub fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}
