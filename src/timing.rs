use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;

/// Parameters for the humanized pre-claim delay.
#[derive(Debug, Clone, Copy)]
pub struct HumanDelayConfig {
    pub hesitation_probability: f64,
    pub hesitation_secs: f64,
    pub fast_min_secs: f64,
    pub fast_max_secs: f64,
}

/// Which branch the human delay took, with its length in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HumanDelay {
    Hesitation(f64),
    Fast(f64),
}

impl HumanDelay {
    pub fn secs(self) -> f64 {
        match self {
            HumanDelay::Hesitation(s) | HumanDelay::Fast(s) => s,
        }
    }
}

/// Pseudo-random value in `[min, max)`. Returns `min` for empty ranges.
pub fn uniform_delay<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    rng.gen_range(min..max)
}

/// Seconds elapsed between an ISO-8601 timestamp and `now`.
///
/// Negative when the source clock runs ahead of ours.
pub fn elapsed_seconds(timestamp: &str, now: DateTime<Utc>) -> Result<f64> {
    let created = DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("invalid timestamp {timestamp:?}"))?;
    let delta = now.signed_duration_since(created.with_timezone(&Utc));
    Ok(delta.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0)
}

/// Time still to wait before a question of `age` reaches `min_lock_age`.
pub fn catchup_delay(age: f64, min_lock_age: f64) -> f64 {
    (min_lock_age - age).max(0.0)
}

/// Pick a humanized delay: a fixed hesitation with the configured
/// probability, otherwise a short uniform "fast" delay.
pub fn human_delay<R: Rng>(rng: &mut R, cfg: &HumanDelayConfig) -> HumanDelay {
    if rng.gen_bool(cfg.hesitation_probability.clamp(0.0, 1.0)) {
        HumanDelay::Hesitation(cfg.hesitation_secs)
    } else {
        HumanDelay::Fast(uniform_delay(rng, cfg.fast_min_secs, cfg.fast_max_secs))
    }
}

/// Convert fractional seconds to a `Duration`, clamping negatives to zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn default_cfg() -> HumanDelayConfig {
        HumanDelayConfig {
            hesitation_probability: 0.10,
            hesitation_secs: 2.0,
            fast_min_secs: 0.2,
            fast_max_secs: 0.5,
        }
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let v = uniform_delay(&mut rng, 60.0, 90.0);
            assert!((60.0..90.0).contains(&v));
        }
    }

    #[test]
    fn uniform_degenerate_range() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(uniform_delay(&mut rng, 5.0, 5.0), 5.0);
        assert_eq!(uniform_delay(&mut rng, 5.0, 1.0), 5.0);
    }

    #[test]
    fn elapsed_parses_z_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let age = elapsed_seconds("2024-05-01T12:00:00.000Z", now).unwrap();
        assert!((age - 10.0).abs() < 1e-9);
    }

    #[test]
    fn elapsed_parses_offset_and_fraction() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let age = elapsed_seconds("2024-05-01T11:59:58.500+00:00", now).unwrap();
        assert!((age - 1.5).abs() < 1e-9);
    }

    #[test]
    fn elapsed_negative_on_skew() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let age = elapsed_seconds("2024-05-01T12:00:03Z", now).unwrap();
        assert!((age + 3.0).abs() < 1e-9);
    }

    #[test]
    fn elapsed_rejects_garbage() {
        assert!(elapsed_seconds("yesterday", Utc::now()).is_err());
        assert!(elapsed_seconds("", Utc::now()).is_err());
    }

    #[test]
    fn catchup_never_negative() {
        assert!((catchup_delay(0.05, 0.2) - 0.15).abs() < 1e-9);
        assert_eq!(catchup_delay(0.2, 0.2), 0.0);
        assert_eq!(catchup_delay(5.0, 0.2), 0.0);
        assert!((catchup_delay(-1.0, 0.2) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn fast_branch_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let cfg = default_cfg();
        for _ in 0..1_000 {
            match human_delay(&mut rng, &cfg) {
                HumanDelay::Fast(s) => assert!((0.2..0.5).contains(&s)),
                HumanDelay::Hesitation(s) => assert_eq!(s, 2.0),
            }
        }
    }

    #[test]
    fn hesitation_frequency_converges() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let cfg = default_cfg();
        let trials = 20_000;
        let hesitations = (0..trials)
            .filter(|_| matches!(human_delay(&mut rng, &cfg), HumanDelay::Hesitation(_)))
            .count();
        let fraction = hesitations as f64 / trials as f64;
        // Binomial stddev at p=0.1, n=20k is ~0.0021; allow ~5 sigma.
        assert!((fraction - 0.10).abs() < 0.011, "fraction = {fraction}");
    }

    #[test]
    fn probability_extremes() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut cfg = default_cfg();
        cfg.hesitation_probability = 0.0;
        assert!((0..500).all(|_| matches!(human_delay(&mut rng, &cfg), HumanDelay::Fast(_))));
        cfg.hesitation_probability = 1.0;
        assert!(
            (0..500).all(|_| human_delay(&mut rng, &cfg) == HumanDelay::Hesitation(2.0))
        );
    }

    #[test]
    fn duration_clamps() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(1.5), Duration::from_millis(1500));
    }
}
