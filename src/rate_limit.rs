use std::time::Duration;
use tokio::time::Instant;

/// Spaces consecutive calls at least `min_interval` apart. The first call
/// never waits.
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn fixed(min_interval: Duration) -> Self {
        Self { min_interval, last: None }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::fixed(Duration::from_millis(ms))
    }

    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let next_ok = last + self.min_interval;
            if Instant::now() < next_ok {
                tokio::time::sleep_until(next_ok).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_calls() {
        let mut t = Throttle::from_millis(100);
        let start = Instant::now();
        t.wait().await;
        assert!(start.elapsed() < Duration::from_millis(1));
        t.wait().await;
        t.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_never_sleeps() {
        let mut t = Throttle::from_millis(0);
        let start = Instant::now();
        for _ in 0..5 {
            t.wait().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
