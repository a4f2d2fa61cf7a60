//! 파이프라인 카운터.
//!
//! 모든 카운터는 `Relaxed` 원자 연산입니다. 스냅샷은 트랜잭션 일관성을
//! 보장하지 않으며, 관측용으로만 사용합니다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 파서 거부 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// 필드 수 부족
    TooFewFields,
    /// 빈 종목코드
    EmptySymbol,
    /// `0000` 으로 시작하는 센티널 종목코드
    SentinelSymbol,
    /// 정규화 후에도 형식이 맞지 않는 종목코드
    InvalidSymbol,
    /// 빈 종목명
    EmptyName,
    /// 현재가 ≤ 0
    NonpositivePrice,
    /// 음수 거래량/거래대금/가격
    NegativeField,
    /// 고가/저가가 현재가와 모순
    InconsistentRange,
    /// UTF-8 이 아닌 레코드
    InvalidUtf8,
    /// 저장 스키마 정밀도를 넘는 숫자
    OutOfRange,
}

impl RejectReason {
    /// 전체 사유 목록 (카운터 배열 순서).
    pub const ALL: [RejectReason; 10] = [
        RejectReason::TooFewFields,
        RejectReason::EmptySymbol,
        RejectReason::SentinelSymbol,
        RejectReason::InvalidSymbol,
        RejectReason::EmptyName,
        RejectReason::NonpositivePrice,
        RejectReason::NegativeField,
        RejectReason::InconsistentRange,
        RejectReason::InvalidUtf8,
        RejectReason::OutOfRange,
    ];

    /// 메트릭 라벨.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::TooFewFields => "too_few_fields",
            RejectReason::EmptySymbol => "empty_symbol",
            RejectReason::SentinelSymbol => "sentinel_symbol",
            RejectReason::InvalidSymbol => "invalid_symbol",
            RejectReason::EmptyName => "empty_name",
            RejectReason::NonpositivePrice => "nonpositive_price",
            RejectReason::NegativeField => "negative_field",
            RejectReason::InconsistentRange => "inconsistent_range",
            RejectReason::InvalidUtf8 => "invalid_utf8",
            RejectReason::OutOfRange => "out_of_range",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 종료 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownStage {
    Receiver,
    Parser,
    Fanout,
    Sink,
    Spill,
}

impl ShutdownStage {
    pub const ALL: [ShutdownStage; 5] = [
        ShutdownStage::Receiver,
        ShutdownStage::Parser,
        ShutdownStage::Fanout,
        ShutdownStage::Sink,
        ShutdownStage::Spill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStage::Receiver => "receiver",
            ShutdownStage::Parser => "parser",
            ShutdownStage::Fanout => "fanout",
            ShutdownStage::Sink => "sink",
            ShutdownStage::Spill => "spill",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 파이프라인 전역 카운터.
///
/// `Arc<PipelineMetrics>`로 모든 단계가 공유합니다.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // ==================== 수신기 ====================
    /// 수신기가 큐에 넣은 프레임 수
    pub received: AtomicU64,
    /// 큐 포화로 버린 프레임 수
    pub receiver_drops: AtomicU64,
    /// 재연결 횟수
    pub receiver_reconnects: AtomicU64,
    /// 마지막 재연결 시각 (단조 ns, 0이면 없음)
    pub last_reconnect_ns: AtomicU64,
    /// 프레임 무결성 에러 수
    pub frame_errors: AtomicU64,

    // ==================== 파서 ====================
    /// 마이크로 배치로 하류에 넘긴 틱 수
    pub parsed: AtomicU64,
    /// 파싱됐지만 아직 배치로 넘기지 않은 틱 수 (게이지)
    pub parser_inflight: AtomicU64,
    /// 숫자 파싱 실패로 0을 대입한 필드 수
    pub parser_numeric_defaults: AtomicU64,
    /// 파서 태스크 재시작 횟수
    pub parser_restarts: AtomicU64,
    parser_rejects: [AtomicU64; 10],

    // ==================== 상태 저장소 ====================
    /// 종목 수 상한으로 거부된 틱 수
    pub state_symbol_cap_reached: AtomicU64,
    /// 이미 본 시퀀스라서 무시된 틱 수
    pub state_stale_ignored: AtomicU64,

    // ==================== 허브 ====================
    /// 구독자 메일박스에 전달된 틱 수
    pub hub_delivered: AtomicU64,
    /// 메일박스 포화로 버린 틱 수
    pub hub_dropped: AtomicU64,
    /// 허브 입력 큐 대기 초과로 버린 틱 수
    pub hub_intake_drops: AtomicU64,
    /// 허브 입력 큐가 가득 차 파서가 대기한 횟수
    pub hub_backpressure_stalls: AtomicU64,
    /// close_on_full 정책으로 닫힌 구독 수
    pub hub_closed: AtomicU64,

    // ==================== 싱크 ====================
    /// 원격 저장소에 기록된 행 수
    pub sink_written: AtomicU64,
    /// 대기 중인 행 수 (게이지)
    pub sink_pending: AtomicU64,
    /// 스필된 행 수
    pub sink_spilled: AtomicU64,
    /// 큐 포화로 버린 행 수
    pub sink_drops: AtomicU64,
    /// 데드레터로 보낸 행 수
    pub sink_dead_letter: AtomicU64,
    /// 재시도 횟수
    pub sink_retries: AtomicU64,
    /// 스필 디렉토리 크기 (게이지)
    pub sink_spill_bytes: AtomicU64,
    /// 용량 초과나 손상으로 버린 스필 세그먼트 수
    pub sink_spill_drops: AtomicU64,
    /// 재전송에 성공한 스필 행 수
    pub sink_reclaimed: AtomicU64,

    unclean_shutdown: [AtomicU64; 5],
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// 게이지를 감소시킵니다. 0 아래로 내려가지 않습니다.
    #[inline]
    pub fn sub(counter: &AtomicU64, n: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }

    #[inline]
    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// 거부 사유별 카운터를 증가시킵니다.
    #[inline]
    pub fn record_reject(&self, reason: RejectReason) {
        self.parser_rejects[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejects(&self, reason: RejectReason) -> u64 {
        self.parser_rejects[reason.index()].load(Ordering::Relaxed)
    }

    /// 전체 거부 수.
    pub fn total_rejects(&self) -> u64 {
        self.parser_rejects
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// 유예 시간 안에 끝나지 않은 종료 단계를 기록합니다.
    pub fn record_unclean_shutdown(&self, stage: ShutdownStage) {
        self.unclean_shutdown[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn unclean_shutdowns(&self, stage: ShutdownStage) -> u64 {
        self.unclean_shutdown[stage.index()].load(Ordering::Relaxed)
    }

    /// 재연결을 기록합니다.
    pub fn record_reconnect(&self, now_ns: u64) {
        self.receiver_reconnects.fetch_add(1, Ordering::Relaxed);
        // 0은 "없음"으로 예약
        self.last_reconnect_ns.store(now_ns.max(1), Ordering::Relaxed);
    }

    /// 현재 값을 복사합니다.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MetricsSnapshot {
            received: get(&self.received),
            receiver_drops: get(&self.receiver_drops),
            receiver_reconnects: get(&self.receiver_reconnects),
            frame_errors: get(&self.frame_errors),
            parsed: get(&self.parsed),
            parser_inflight: get(&self.parser_inflight),
            parser_numeric_defaults: get(&self.parser_numeric_defaults),
            parser_restarts: get(&self.parser_restarts),
            parser_rejects: RejectReason::ALL
                .iter()
                .map(|r| (r.as_str().to_string(), self.rejects(*r)))
                .collect(),
            state_symbol_cap_reached: get(&self.state_symbol_cap_reached),
            state_stale_ignored: get(&self.state_stale_ignored),
            hub_delivered: get(&self.hub_delivered),
            hub_dropped: get(&self.hub_dropped),
            hub_intake_drops: get(&self.hub_intake_drops),
            hub_backpressure_stalls: get(&self.hub_backpressure_stalls),
            hub_closed: get(&self.hub_closed),
            sink_written: get(&self.sink_written),
            sink_pending: get(&self.sink_pending),
            sink_spilled: get(&self.sink_spilled),
            sink_drops: get(&self.sink_drops),
            sink_dead_letter: get(&self.sink_dead_letter),
            sink_retries: get(&self.sink_retries),
            sink_spill_bytes: get(&self.sink_spill_bytes),
            sink_spill_drops: get(&self.sink_spill_drops),
            sink_reclaimed: get(&self.sink_reclaimed),
            unclean_shutdown: ShutdownStage::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.unclean_shutdowns(*s)))
                .collect(),
        }
    }
}

/// 카운터 스냅샷.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub receiver_drops: u64,
    pub receiver_reconnects: u64,
    pub frame_errors: u64,
    pub parsed: u64,
    pub parser_inflight: u64,
    pub parser_numeric_defaults: u64,
    pub parser_restarts: u64,
    /// 사유별 거부 수
    pub parser_rejects: BTreeMap<String, u64>,
    pub state_symbol_cap_reached: u64,
    pub state_stale_ignored: u64,
    pub hub_delivered: u64,
    pub hub_dropped: u64,
    pub hub_intake_drops: u64,
    pub hub_backpressure_stalls: u64,
    pub hub_closed: u64,
    pub sink_written: u64,
    pub sink_pending: u64,
    pub sink_spilled: u64,
    pub sink_drops: u64,
    pub sink_dead_letter: u64,
    pub sink_retries: u64,
    pub sink_spill_bytes: u64,
    pub sink_spill_drops: u64,
    pub sink_reclaimed: u64,
    /// 단계별 비정상 종료 수 (`unclean_shutdown_stage_<name>`)
    pub unclean_shutdown: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// 전체 거부 수.
    pub fn total_rejects(&self) -> u64 {
        self.parser_rejects.values().sum()
    }

    /// 요약 로그를 출력합니다.
    pub fn log_summary(&self) {
        tracing::info!(
            received = self.received,
            parsed = self.parsed,
            rejects = self.total_rejects(),
            receiver_drops = self.receiver_drops,
            reconnects = self.receiver_reconnects,
            hub_delivered = self.hub_delivered,
            hub_dropped = self.hub_dropped,
            hub_stalls = self.hub_backpressure_stalls,
            sink_written = self.sink_written,
            sink_pending = self.sink_pending,
            sink_spilled = self.sink_spilled,
            sink_spill_bytes = self.sink_spill_bytes,
            sink_dead_letter = self.sink_dead_letter,
            "파이프라인 통계"
        );
    }
}
