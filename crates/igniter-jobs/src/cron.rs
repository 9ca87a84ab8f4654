//! Cron expression validation, naming, and occurrence computation.
//!
//! Validation is syntactic and strict: 5 or 6 whitespace-separated fields,
//! only `0-9 * / , -` per field, numeric minute/hour fields range-checked.
//! Occurrence computation hands the (normalized) expression to the `cron`
//! crate, which wants a leading seconds field.

use crate::definition::{JobDefinition, JobExecutionContext};
use crate::schedule::{base36, parse_fixed_offset, RepeatOptions};
use chrono::{DateTime, Utc};
use cron::Schedule;
use igniter_core::{IgniterError, IgniterResult};
use serde_json::Value;
use std::str::FromStr;

const FIELD_CHARSET: &str = "0123456789*/,-";

/// Validates a cron expression against the syntactic rules.
pub fn validate_cron(expression: &str) -> IgniterResult<()> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(IgniterError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 or 6 fields, got {}", fields.len()),
        });
    }

    for field in &fields {
        if !field.chars().all(|c| FIELD_CHARSET.contains(c)) {
            return Err(IgniterError::InvalidCronField {
                field: (*field).to_string(),
            });
        }
    }

    // With 6 fields the leading one is seconds; minute/hour shift right.
    let minute_index = fields.len() - 5;
    check_numeric_range(fields[minute_index], 59, |value| {
        IgniterError::InvalidMinuteValue { value }
    })?;
    check_numeric_range(fields[minute_index + 1], 23, |value| {
        IgniterError::InvalidHourValue { value }
    })?;

    Ok(())
}

/// Range-checks a field only when it is purely numeric (no specials).
fn check_numeric_range(
    field: &str,
    max: u32,
    make_error: impl Fn(String) -> IgniterError,
) -> IgniterResult<()> {
    if field.chars().all(|c| c.is_ascii_digit()) {
        let value: u32 = field
            .parse()
            .map_err(|_| make_error(field.to_string()))?;
        if value > max {
            return Err(make_error(field.to_string()));
        }
    }
    Ok(())
}

/// Computes the next occurrence of a validated expression strictly after
/// `after`, optionally in a fixed-offset timezone.
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
    tz: Option<&str>,
) -> IgniterResult<Option<DateTime<Utc>>> {
    let normalized = normalize_for_parser(expression);
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        IgniterError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })?;

    match tz.and_then(parse_fixed_offset) {
        Some(offset) => Ok(schedule
            .after(&after.with_timezone(&offset))
            .next()
            .map(|next| next.with_timezone(&Utc))),
        None => Ok(schedule.after(&after).next()),
    }
}

/// The parser wants a seconds field; 5-field expressions get a zero.
fn normalize_for_parser(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Options for [`cron_job`].
#[derive(Debug, Clone, Default)]
pub struct CronJobOptions {
    /// Explicit definition name; a unique one is generated when absent.
    pub job_name: Option<String>,
    /// Fixed-offset timezone for the schedule.
    pub tz: Option<String>,
}

/// Creates a repeating job definition from a cron schedule and a handler.
///
/// Without an explicit name, uniqueness across rapid successive calls comes
/// from the millisecond timestamp plus a random suffix.
pub fn cron_job<F, Fut>(
    schedule: &str,
    handler: F,
    options: CronJobOptions,
) -> IgniterResult<JobDefinition>
where
    F: Fn(JobExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = IgniterResult<Value>> + Send + 'static,
{
    validate_cron(schedule)?;

    let name = options
        .job_name
        .unwrap_or_else(|| generate_cron_name(schedule));

    let mut repeat = RepeatOptions::cron(schedule);
    repeat.tz = options.tz;

    Ok(JobDefinition::builder(name.as_str())
        .name(name.as_str())
        .handler(handler)
        .repeat(repeat)
        .build())
}

/// `cron_<sanitizedSchedule>_<base36 millis>_<random6>`.
#[must_use]
pub fn generate_cron_name(schedule: &str) -> String {
    let sanitized: String = schedule
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "cron_{}_{}_{}",
        sanitized,
        base36(Utc::now().timestamp_millis() as u64),
        random_suffix()
    )
}

/// Six alphanumeric characters from a time-seeded LCG.
fn random_suffix() -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut seed = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let mut out = Vec::with_capacity(6);
    for _ in 0..6 {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push(DIGITS[(seed >> 33) as usize % 36]);
    }
    String::from_utf8(out).expect("suffix digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_field_count() {
        assert!(validate_cron("0 9 * * *").is_ok());
        assert!(validate_cron("0 0 9 * * *").is_ok());

        let err = validate_cron("0 9 * *").unwrap_err();
        assert!(err.is("INVALID_CRON_EXPRESSION"));
        let err = validate_cron("0 9 * * * * *").unwrap_err();
        assert!(err.is("INVALID_CRON_EXPRESSION"));
    }

    #[test]
    fn test_charset() {
        let err = validate_cron("0 9 * * MON").unwrap_err();
        assert!(err.is("INVALID_CRON_FIELD"));
        let err = validate_cron("0 9 * * ?").unwrap_err();
        assert!(err.is("INVALID_CRON_FIELD"));
    }

    #[test]
    fn test_minute_range() {
        let err = validate_cron("60 9 * * *").unwrap_err();
        assert!(err.is("INVALID_MINUTE_VALUE"));
        assert!(validate_cron("59 9 * * *").is_ok());
        // Specials bypass the numeric check.
        assert!(validate_cron("*/5 9 * * *").is_ok());
    }

    #[test]
    fn test_hour_range() {
        let err = validate_cron("0 25 * * *").unwrap_err();
        assert!(err.is("INVALID_HOUR_VALUE"));
        assert!(validate_cron("0 23 * * *").is_ok());
    }

    #[test]
    fn test_six_field_shifts_minute_and_hour() {
        let err = validate_cron("0 60 9 * * *").unwrap_err();
        assert!(err.is("INVALID_MINUTE_VALUE"));
        let err = validate_cron("0 0 24 * * *").unwrap_err();
        assert!(err.is("INVALID_HOUR_VALUE"));
    }

    #[test]
    fn test_next_occurrence() {
        let after = Utc.with_ymd_and_hms(2025, 6, 11, 8, 0, 0).unwrap();
        let next = next_occurrence("0 9 * * *", after, None).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 11, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_with_offset() {
        let after = Utc.with_ymd_and_hms(2025, 6, 11, 5, 0, 0).unwrap();
        // 09:00 at +02:00 is 07:00 UTC.
        let next = next_occurrence("0 9 * * *", after, Some("+02:00"))
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 11, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_cron_job_named() {
        let def = cron_job(
            "0 9 * * 1-5",
            |_ctx| async { Ok(json!(null)) },
            CronJobOptions {
                job_name: Some("daily-report".into()),
                tz: None,
            },
        )
        .unwrap();
        assert_eq!(def.name, "daily-report");
        assert_eq!(def.repeat.as_ref().unwrap().cron.as_deref(), Some("0 9 * * 1-5"));
    }

    #[test]
    fn test_cron_job_invalid_schedule() {
        let err = cron_job(
            "60 9 * * *",
            |_ctx| async { Ok(json!(null)) },
            CronJobOptions::default(),
        )
        .unwrap_err();
        assert!(err.is("INVALID_MINUTE_VALUE"));
    }

    #[test]
    fn test_generated_names_are_unique() {
        let a = generate_cron_name("0 9 * * *");
        let b = generate_cron_name("0 9 * * *");
        assert!(a.starts_with("cron_0_9______"));
        assert_ne!(a, b);
    }
}
