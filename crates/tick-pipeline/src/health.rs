//! 파이프라인 헬스 판정.
//!
//! - `failing`: 인증 거부, 수신기 재시도 소진
//! - `degraded`: 최근 재연결, 스필 잔량, 파서 거부율 초과
//! - `stopped`: 종료 완료

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use tick_ingest::ConnectionState;

/// 헬스 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    Stopped,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failing => "failing",
            HealthStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 헬스 보고서.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// 판정 사유
    pub reasons: Vec<String>,
    /// 현재 수신기 엔드포인트
    pub endpoint: String,
    /// 수신기 연결 상태
    pub connection: String,
    /// 최근 창의 파서 거부율
    pub reject_rate: f64,
    pub spill_bytes: u64,
    pub symbols: usize,
    pub subscriptions: usize,
}

/// 헬스 판정 입력.
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub stopped: bool,
    pub fatal: Option<String>,
    pub exhausted: Option<String>,
    pub connection: ConnectionState,
    /// 마지막 재연결 이후 경과 시간 (없으면 None)
    pub since_reconnect_ns: Option<u64>,
    pub window_ns: u64,
    pub spill_bytes: u64,
    pub reject_rate: f64,
    pub reject_rate_threshold: f64,
}

/// 입력에서 상태와 사유를 판정합니다.
pub fn evaluate(inputs: &HealthInputs) -> (HealthStatus, Vec<String>) {
    let mut reasons = Vec::new();

    if let Some(fatal) = &inputs.fatal {
        reasons.push(format!("치명적 오류: {}", fatal));
        return (HealthStatus::Failing, reasons);
    }
    if inputs.stopped {
        return (HealthStatus::Stopped, reasons);
    }
    if let Some(exhausted) = &inputs.exhausted {
        reasons.push(format!("수신기 재시도 소진: {}", exhausted));
        return (HealthStatus::Failing, reasons);
    }

    if inputs
        .since_reconnect_ns
        .is_some_and(|age| age <= inputs.window_ns)
    {
        reasons.push("최근 재연결".to_string());
    }
    if inputs.spill_bytes > 0 {
        reasons.push(format!("스필 잔량 {} 바이트", inputs.spill_bytes));
    }
    if inputs.reject_rate > inputs.reject_rate_threshold {
        reasons.push(format!("파서 거부율 {:.2}%", inputs.reject_rate * 100.0));
    }

    if reasons.is_empty() {
        (HealthStatus::Healthy, reasons)
    } else {
        (HealthStatus::Degraded, reasons)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at_ns: u64,
    parsed: u64,
    rejected: u64,
}

/// 시간 창 파서 거부율.
///
/// 누적 카운터 표본을 모아 창 시작 표본과의 차이로 비율을 계산합니다.
#[derive(Debug)]
pub struct RejectRateWindow {
    window_ns: u64,
    samples: Mutex<VecDeque<Sample>>,
}

impl RejectRateWindow {
    pub fn new(window_ns: u64) -> Self {
        Self {
            window_ns,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// 누적 카운터 표본을 추가합니다.
    pub fn record(&self, now_ns: u64, parsed: u64, rejected: u64) {
        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            at_ns: now_ns,
            parsed,
            rejected,
        });
        // 창 경계 직전 표본 하나는 기준점으로 남김
        while samples.len() > 2
            && samples
                .get(1)
                .is_some_and(|s| now_ns.saturating_sub(s.at_ns) >= self.window_ns)
        {
            samples.pop_front();
        }
    }

    /// 창 안의 거부율 (0.0..=1.0).
    pub fn rate(&self) -> f64 {
        let samples = self.samples.lock();
        let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let parsed = last.parsed.saturating_sub(first.parsed);
        let rejected = last.rejected.saturating_sub(first.rejected);
        let total = parsed + rejected;
        if total == 0 {
            0.0
        } else {
            rejected as f64 / total as f64
        }
    }
}
