use rand::Rng;
use std::time::Duration;

use crate::config::FetchCfg;

/// Retry schedule for transient fetch failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn from_cfg(cfg: &FetchCfg) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_ms: cfg.backoff_base_ms,
            factor: cfg.backoff_factor,
            jitter_ms: cfg.backoff_jitter_ms,
        }
    }

    /// Delay before retrying after failed `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(backoff_ms(attempt, self.base_ms, self.factor, self.jitter_ms))
    }
}

pub fn backoff_ms(attempt: u32, base_ms: u64, factor: f64, jitter_ms: u64) -> u64 {
    let pow = factor.powi((attempt.saturating_sub(1)) as i32);
    let core = (base_ms as f64 * pow).round() as u64;
    let jitter = if jitter_ms > 0 { rand::rng().random_range(0..=jitter_ms) } else { 0 };
    core + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_without_jitter() {
        assert_eq!(backoff_ms(1, 100, 2.0, 0), 100);
        assert_eq!(backoff_ms(2, 100, 2.0, 0), 200);
        assert_eq!(backoff_ms(4, 100, 2.0, 0), 800);
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..50 {
            let ms = backoff_ms(1, 100, 2.0, 25);
            assert!((100..=125).contains(&ms));
        }
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        let mut cfg = FetchCfg::default();
        cfg.max_attempts = 0;
        assert_eq!(RetryPolicy::from_cfg(&cfg).max_attempts, 1);
    }
}
