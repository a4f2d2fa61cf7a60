//! 프로세스 내 행 저장소.
//!
//! 드라이런과 테스트용입니다. 실패 주입, 쓰기 지연, 동시 쓰기 최대치 추적을 지원합니다.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::RowStore;
use crate::error::{SinkError, SinkResult};
use crate::row::TickRow;

/// 주입할 실패 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// 일시적 실패 (재시도/스필 대상)
    Transient,
    /// 영구적 실패 (데드레터 대상)
    Permanent,
}

impl FailureMode {
    fn to_error(self) -> SinkError {
        match self {
            FailureMode::Transient => SinkError::Transient("주입된 일시적 실패".to_string()),
            FailureMode::Permanent => SinkError::Permanent("주입된 영구적 실패".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// 앞으로 n번 실패
    remaining: u64,
    /// 해제할 때까지 계속 실패
    persistent: Option<FailureMode>,
    mode: Option<FailureMode>,
}

/// 메모리 행 저장소.
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    rows: Mutex<BTreeMap<(String, i64), TickRow>>,
    batches: Mutex<Vec<Vec<i64>>>,
    failures: Mutex<FailurePlan>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
    inflight: AtomicUsize,
    peak_inflight: AtomicUsize,
}

impl MemoryRowStore {
    /// 빈 저장소.
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 `count`번의 쓰기를 실패시킵니다.
    pub fn fail_next(&self, count: u64, mode: FailureMode) {
        let mut plan = self.failures.lock();
        plan.remaining = count;
        plan.mode = Some(mode);
    }

    /// 해제할 때까지 모든 쓰기를 실패시킵니다. `None`이면 해제.
    pub fn set_failing(&self, mode: Option<FailureMode>) {
        self.failures.lock().persistent = mode;
    }

    /// 쓰기마다 지연을 추가합니다.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// 저장된 행 (키 순).
    pub fn rows(&self) -> Vec<TickRow> {
        self.rows.lock().values().cloned().collect()
    }

    /// 저장된 행 수.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// 키로 행을 조회합니다.
    pub fn get(&self, symbol: &str, source_seq: i64) -> Option<TickRow> {
        self.rows
            .lock()
            .get(&(symbol.to_string(), source_seq))
            .cloned()
    }

    /// 성공한 쓰기마다 기록한 `source_seq` 순서.
    pub fn batches(&self) -> Vec<Vec<i64>> {
        self.batches.lock().clone()
    }

    /// 전체 쓰기 호출 수 (실패 포함).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// 관측된 최대 동시 쓰기 수.
    pub fn peak_inflight(&self) -> usize {
        self.peak_inflight.load(Ordering::Relaxed)
    }

    fn next_failure(&self) -> Option<SinkError> {
        let mut plan = self.failures.lock();
        if let Some(mode) = plan.persistent {
            return Some(mode.to_error());
        }
        if plan.remaining > 0 {
            plan.remaining -= 1;
            return plan.mode.map(FailureMode::to_error);
        }
        None
    }
}

struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, rows: &[TickRow]) -> SinkResult<u64> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let current = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_inflight.fetch_max(current, Ordering::Relaxed);
        let _guard = InflightGuard(&self.inflight);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.next_failure() {
            return Err(err);
        }

        let mut stored = self.rows.lock();
        for row in rows {
            stored.insert((row.symbol.clone(), row.source_seq), row.clone());
        }
        drop(stored);

        self.batches
            .lock()
            .push(rows.iter().map(|r| r.source_seq).collect());
        Ok(rows.len() as u64)
    }
}
