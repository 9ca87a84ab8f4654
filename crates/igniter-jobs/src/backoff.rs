//! Retry backoff computation.

use crate::record::BackoffSpec;
use std::time::Duration;

/// Base delay for exponential growth when no explicit delay is configured.
const EXPONENTIAL_BASE_MS: u64 = 1_000;

/// Computes the delay before retry number `attempt` (1-based).
///
/// `jitter_factor` spreads the delay by up to that fraction around the
/// computed value; 0 disables jitter.
#[must_use]
pub fn delay_for_attempt(spec: &BackoffSpec, attempt: u32, jitter_factor: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base = match spec {
        BackoffSpec::Exponential { multiplier, max } => {
            let delay = EXPONENTIAL_BASE_MS as f64 * multiplier.powi(attempt as i32 - 1);
            (delay as u64).min(*max)
        }
        BackoffSpec::Fixed { delay } => *delay,
        BackoffSpec::Custom { settings } => {
            if settings.delays.is_empty() {
                EXPONENTIAL_BASE_MS
            } else {
                let index = (attempt as usize - 1).min(settings.delays.len() - 1);
                settings.delays[index]
            }
        }
    };

    let with_jitter = if jitter_factor > 0.0 {
        let range = (base as f64 * jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = rand_jitter(range);
        base.saturating_add(jitter).saturating_sub(range / 2)
    } else {
        base
    };

    Duration::from_millis(with_jitter)
}

/// Pseudo-random jitter from a time-seeded LCG; good enough to spread
/// retries, no crypto requirements.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let a: u64 = 6364136223846793005;
    let c: u64 = 1442695040888963407;

    seed.wrapping_mul(a).wrapping_add(c) % range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CustomBackoff;

    #[test]
    fn test_exponential_growth() {
        let spec = BackoffSpec::Exponential { multiplier: 2.0, max: 300_000 };
        assert_eq!(delay_for_attempt(&spec, 1, 0.0), Duration::from_millis(1_000));
        assert_eq!(delay_for_attempt(&spec, 2, 0.0), Duration::from_millis(2_000));
        assert_eq!(delay_for_attempt(&spec, 3, 0.0), Duration::from_millis(4_000));
    }

    #[test]
    fn test_exponential_cap() {
        let spec = BackoffSpec::Exponential { multiplier: 2.0, max: 3_000 };
        assert_eq!(delay_for_attempt(&spec, 10, 0.0), Duration::from_millis(3_000));
    }

    #[test]
    fn test_fixed() {
        let spec = BackoffSpec::Fixed { delay: 5_000 };
        assert_eq!(delay_for_attempt(&spec, 1, 0.0), Duration::from_millis(5_000));
        assert_eq!(delay_for_attempt(&spec, 7, 0.0), Duration::from_millis(5_000));
    }

    #[test]
    fn test_custom_table_last_entry_repeats() {
        let spec = BackoffSpec::Custom {
            settings: CustomBackoff { delays: vec![100, 200, 400] },
        };
        assert_eq!(delay_for_attempt(&spec, 1, 0.0), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(&spec, 3, 0.0), Duration::from_millis(400));
        assert_eq!(delay_for_attempt(&spec, 9, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let spec = BackoffSpec::Fixed { delay: 10_000 };
        for _ in 0..20 {
            let delay = delay_for_attempt(&spec, 1, 0.5).as_millis() as u64;
            assert!((7_500..=12_500).contains(&delay));
        }
    }

    #[test]
    fn test_zero_attempt_is_immediate() {
        let spec = BackoffSpec::Fixed { delay: 5_000 };
        assert_eq!(delay_for_attempt(&spec, 0, 0.0), Duration::ZERO);
    }
}
