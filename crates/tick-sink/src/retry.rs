//! 원격 쓰기 재시도.
//!
//! 일시적 에러만 재시도하고, 시도마다 타임아웃을 적용합니다. 마감 시각이 주어지면
//! 다음 대기가 마감을 넘는 순간 마지막 에러를 돌려줍니다 (종료 경로용).

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use tick_core::{Backoff, SinkConfig};

use crate::error::SinkError;

/// 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 첫 재시도 대기
    pub base: Duration,
    /// 최대 대기
    pub max: Duration,
    /// 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: u32,
    /// 지터 비율
    pub jitter: f64,
    /// 시도당 타임아웃
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_sink(&SinkConfig::default())
    }
}

impl RetryConfig {
    /// 싱크 설정에서 생성합니다.
    pub fn from_sink(config: &SinkConfig) -> Self {
        Self {
            base: config.retry_base(),
            max: config.retry_max(),
            max_attempts: config.retry_max_attempts.max(1),
            jitter: 0.2,
            attempt_timeout: config.write_timeout(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.base, self.max, self.jitter)
    }
}

/// 한 번의 재시도 루프 결과 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// 실제 수행한 시도 수
    pub attempts: u32,
    /// 재시도 횟수 (attempts - 1, 최소 0)
    pub retries: u32,
}

/// 일시적 에러를 재시도합니다.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    deadline: Option<Instant>,
    op: F,
) -> (Result<T, SinkError>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
{
    with_retry_if(config, deadline, op, SinkError::is_transient).await
}

/// `should_retry`가 참인 에러만 재시도합니다.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    deadline: Option<Instant>,
    mut op: F,
    should_retry: P,
) -> (Result<T, SinkError>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
    P: Fn(&SinkError) -> bool,
{
    let mut backoff = config.backoff();
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;

        let timeout = match deadline {
            Some(deadline) => config
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => config.attempt_timeout,
        };

        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout.as_millis() as u64)),
        };

        let err = match result {
            Ok(value) => return (Ok(value), stats),
            Err(err) => err,
        };

        if !should_retry(&err) || stats.attempts >= config.max_attempts {
            return (Err(err), stats);
        }

        let delay = backoff.next_delay();
        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                return (Err(err), stats);
            }
        }

        debug!(
            attempt = stats.attempts,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "쓰기 재시도 예정"
        );
        stats.retries += 1;
        tokio::time::sleep(delay).await;
    }
}
