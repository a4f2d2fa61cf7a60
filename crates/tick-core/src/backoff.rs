//! 지수 백오프 (± 지터).
//!
//! 지연 = `min(base · 2^attempt, max)` 에 `±jitter` 비율의 난수를 곱합니다.
//! 수신기 재연결과 싱크 재시도가 함께 사용합니다.

use rand::Rng;
use std::time::Duration;

/// 지수 백오프 상태.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// 새 백오프를 생성합니다. `jitter`는 0.0..1.0 범위로 고정됩니다.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 0.99),
            attempt: 0,
        }
    }

    /// 지터 없는 상한 지연.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(32) as i32);
        let millis = (self.base.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// `unit` (-1.0..=1.0)을 지터 방향으로 사용한 지연.
    pub fn delay_for(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.capped_delay(attempt).as_millis() as f64;
        let jittered = capped * (1.0 + unit.clamp(-1.0, 1.0) * self.jitter);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// 다음 지연을 계산하고 시도 횟수를 증가시킵니다.
    pub fn next_delay(&mut self) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = self.delay_for(self.attempt, unit);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// 시도 횟수를 초기화합니다.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 지금까지의 시도 횟수.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_capped() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), 0.2);
        assert_eq!(backoff.capped_delay(0), Duration::from_secs(2));
        assert_eq!(backoff.capped_delay(1), Duration::from_secs(4));
        assert_eq!(backoff.capped_delay(5), Duration::from_secs(64));
        assert_eq!(backoff.capped_delay(8), Duration::from_secs(300));
        assert_eq!(backoff.capped_delay(100), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), 0.2);
        assert_eq!(backoff.delay_for(0, -1.0), Duration::from_millis(1_600));
        assert_eq!(backoff.delay_for(0, 1.0), Duration::from_millis(2_400));
        assert_eq!(backoff.delay_for(0, 0.0), Duration::from_secs(2));
    }

    #[test]
    fn test_next_delay_within_range_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 0.2);
        for attempt in 0..10 {
            let capped = backoff.capped_delay(attempt).as_millis() as f64;
            let delay = backoff.next_delay().as_millis() as f64;
            assert!(delay >= capped * 0.8 - 1.0 && delay <= capped * 1.2 + 1.0);
        }
        assert_eq!(backoff.attempt(), 10);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
