//! 단조 시계와 시퀀스 생성기.
//!
//! 모든 순서 판단은 수신 시각 기준입니다. 원천 타임스탬프는 신뢰하지 않습니다.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 프로세스 단조 시계.
///
/// 생성 시점의 `Instant`와 벽시계를 함께 기록해 두고, 단조 오프셋(ns)을
/// `received_at` 같은 벽시계 시각으로 변환할 수 있게 합니다.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    inner: Arc<ClockAnchor>,
}

#[derive(Debug)]
struct ClockAnchor {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl MonotonicClock {
    /// 현재 시각을 기준점으로 새 시계를 만듭니다.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockAnchor {
                instant: Instant::now(),
                wall: Utc::now(),
            }),
        }
    }

    /// 기준점 이후 경과 시간 (ns).
    pub fn now_ns(&self) -> u64 {
        self.inner.instant.elapsed().as_nanos() as u64
    }

    /// 기준점의 벽시계 시각.
    pub fn anchor_wall(&self) -> DateTime<Utc> {
        self.inner.wall
    }

    /// 단조 시각(ns)을 벽시계 시각으로 변환합니다.
    pub fn to_wall(&self, timestamp_ns: u64) -> DateTime<Utc> {
        self.inner.wall + ChronoDuration::nanoseconds(timestamp_ns.min(i64::MAX as u64) as i64)
    }

    /// 주어진 단조 시각 이후 경과 시간 (ns). 미래 시각이면 0.
    pub fn age_ns(&self, timestamp_ns: u64) -> u64 {
        self.now_ns().saturating_sub(timestamp_ns)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// `source_seq` 생성기.
///
/// 프로세스 수명 동안 재연결과 무관하게 단조 증가합니다. 시작값은 기동 시각의
/// 벽시계 마이크로초로 잡아, 재기동한 프로세스가 이전 실행의 `(symbol, source_seq)`
/// 키를 재사용하지 않도록 합니다.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// 지정한 값부터 시작하는 생성기.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// 벽시계 마이크로초에서 시작하는 생성기.
    pub fn seeded_from_wall_clock() -> Self {
        let micros = Utc::now().timestamp_micros().max(1) as u64;
        Self::starting_at(micros)
    }

    /// 다음 시퀀스를 발급합니다.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 다음에 발급될 값 (발급하지 않음).
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_to_wall_offsets_anchor() {
        let clock = MonotonicClock::new();
        let wall = clock.to_wall(1_500_000_000);
        assert_eq!((wall - clock.anchor_wall()).num_milliseconds(), 1_500);
    }

    #[test]
    fn test_sequence_generator() {
        let seq = SequenceGenerator::starting_at(10);
        assert_eq!(seq.next(), 10);
        assert_eq!(seq.next(), 11);
        assert_eq!(seq.peek(), 12);
    }

    #[test]
    fn test_seeded_sequence_is_large() {
        let seq = SequenceGenerator::seeded_from_wall_clock();
        // 2020-01-01 이후의 마이크로초
        assert!(seq.peek() > 1_577_836_800_000_000);
    }
}
