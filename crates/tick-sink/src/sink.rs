//! 배치 싱크.
//!
//! 파서가 넘긴 틱을 메모리 큐에 모았다가 크기/시간 조건에 맞춰 원격 저장소에
//! 업서트합니다.
//!
//! # 흐름
//!
//! ```text
//! enqueue ─▶ [BatchBuffer] ─▶ flusher ─▶ write(retry) ─┬─▶ RowStore
//!  (drop-oldest)                    ▲                  ├─▶ spill (일시적 실패)
//!                                   │                  └─▶ dead-letter (영구적 실패)
//!                       reclaimer ◀─┘ spill 재전송
//! ```
//!
//! 동시 쓰기는 `max_inflight_batches` 세마포어로 제한합니다. 연속으로 스필이
//! 이어지면 원격 시도를 멈추고 스필 전용으로 전환하며, 재전송이 성공하면 복귀합니다.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tick_core::{MonotonicClock, PipelineMetrics, SharedTick, SinkConfig};

use crate::error::{SinkError, SinkResult};
use crate::retry::{with_retry, RetryConfig};
use crate::row::TickRow;
use crate::spill::{SegmentLog, SegmentMeta};
use crate::store::RowStore;

/// 스필 전용 모드로 전환하는 연속 스필 배치 수.
const SPILL_ONLY_THRESHOLD: u32 = 3;

/// 종료 시 스필 I/O에 추가로 허용하는 시간.
const SPILL_CLOSE_MARGIN: Duration = Duration::from_secs(1);

/// 싱크 상태 요약.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// 큐 대기 틱
    pub queued: usize,
    /// 쓰기 진행 중 행
    pub inflight_rows: u64,
    pub spill_segments: usize,
    pub spill_bytes: u64,
    pub dead_letter_segments: usize,
    pub dead_letter_bytes: u64,
    /// 스필 전용 모드 여부
    pub spill_only: bool,
}

#[derive(Debug, Default)]
struct BatchBuffer {
    pending: VecDeque<(Instant, SharedTick)>,
}

impl BatchBuffer {
    fn oldest(&self) -> Option<Instant> {
        self.pending.front().map(|(at, _)| *at)
    }
}

/// 한 배치의 처리 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Written,
    Spilled,
    DeadLettered,
    Dropped,
}

struct SinkInner {
    config: SinkConfig,
    retry: RetryConfig,
    store: Arc<dyn RowStore>,
    clock: MonotonicClock,
    metrics: Arc<PipelineMetrics>,
    buffer: Mutex<BatchBuffer>,
    notify: Notify,
    permits: Arc<Semaphore>,
    spill: Arc<Mutex<SegmentLog>>,
    dead_letter: Arc<Mutex<SegmentLog>>,
    spill_only: AtomicBool,
    consecutive_spills: AtomicU32,
    inflight_rows: AtomicU64,
}

/// 배치 싱크.
pub struct BatchSink {
    inner: Arc<SinkInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchSink {
    /// 스필/데드레터 로그를 열고 flusher와 reclaimer 태스크를 시작합니다.
    ///
    /// 이전 실행에서 남은 스필 세그먼트는 reclaimer가 재전송합니다.
    pub async fn start(
        config: SinkConfig,
        store: Arc<dyn RowStore>,
        clock: MonotonicClock,
        metrics: Arc<PipelineMetrics>,
    ) -> SinkResult<Self> {
        let spill_dir = config.spill_dir.clone();
        let dead_letter_dir = config.dead_letter_dir();
        let (spill_cap, segment_max, dead_letter_cap) = (
            config.spill_cap_bytes,
            config.spill_segment_max_bytes,
            config.dead_letter_cap_bytes,
        );

        let (spill, dead_letter) = tokio::task::spawn_blocking(move || {
            let spill = SegmentLog::open(spill_dir, spill_cap, segment_max)?;
            let dead_letter = SegmentLog::open(dead_letter_dir, dead_letter_cap, segment_max)?;
            Ok::<_, SinkError>((spill, dead_letter))
        })
        .await
        .map_err(|e| SinkError::Spill(format!("스필 로그 열기 실패: {}", e)))??;

        PipelineMetrics::set(&metrics.sink_spill_bytes, spill.total_bytes());

        info!(
            backend = store.name(),
            batch_size = config.batch_size,
            max_inflight = config.max_inflight_batches,
            spill_dir = %config.spill_dir.display(),
            spill_segments = spill.segments().len(),
            "배치 싱크 시작"
        );

        let inner = Arc::new(SinkInner {
            retry: RetryConfig::from_sink(&config),
            permits: Arc::new(Semaphore::new(config.max_inflight_batches.max(1))),
            config,
            store,
            clock,
            metrics,
            buffer: Mutex::new(BatchBuffer::default()),
            notify: Notify::new(),
            spill: Arc::new(Mutex::new(spill)),
            dead_letter: Arc::new(Mutex::new(dead_letter)),
            spill_only: AtomicBool::new(false),
            consecutive_spills: AtomicU32::new(0),
            inflight_rows: AtomicU64::new(0),
        });

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(flush_loop(inner.clone(), cancel.child_token()));
        let reclaimer = tokio::spawn(reclaim_loop(inner.clone(), cancel.child_token()));

        Ok(Self {
            inner,
            cancel,
            tasks: Mutex::new(vec![flusher, reclaimer]),
        })
    }

    /// 틱을 큐에 넣습니다. 블로킹하지 않습니다.
    ///
    /// 큐가 가득 차면 가장 오래된 틱을 버리고 `sink_drops`를 증가시킵니다.
    pub fn enqueue(&self, tick: SharedTick) {
        self.enqueue_batch(std::slice::from_ref(&tick));
    }

    /// 여러 틱을 큐에 넣습니다.
    pub fn enqueue_batch(&self, ticks: &[SharedTick]) {
        if ticks.is_empty() {
            return;
        }

        let inner = &self.inner;
        let now = Instant::now();
        let mut dropped = 0u64;
        let queued = {
            let mut buffer = inner.buffer.lock();
            for tick in ticks {
                if buffer.pending.len() >= inner.config.queue_cap {
                    buffer.pending.pop_front();
                    dropped += 1;
                }
                buffer.pending.push_back((now, tick.clone()));
            }
            buffer.pending.len()
        };

        if dropped > 0 {
            PipelineMetrics::add(&inner.metrics.sink_drops, dropped);
            debug!(dropped = dropped, "싱크 큐 가득 참, 오래된 틱 삭제");
        }
        inner.publish_pending(queued);

        if queued >= inner.config.batch_size {
            inner.notify.notify_one();
        }
    }

    /// 상태 요약.
    pub fn stats(&self) -> SinkStats {
        let inner = &self.inner;
        let queued = inner.buffer.lock().pending.len();
        let spill = inner.spill.lock();
        let dead_letter = inner.dead_letter.lock();
        SinkStats {
            queued,
            inflight_rows: inner.inflight_rows.load(Ordering::Relaxed),
            spill_segments: spill.segments().len(),
            spill_bytes: spill.total_bytes(),
            dead_letter_segments: dead_letter.segments().len(),
            dead_letter_bytes: dead_letter.total_bytes(),
            spill_only: inner.spill_only.load(Ordering::Relaxed),
        }
    }

    /// 스필 전용 모드 여부.
    pub fn is_spill_only(&self) -> bool {
        self.inner.spill_only.load(Ordering::Relaxed)
    }

    /// 스필 세그먼트 목록.
    pub fn spill_segments(&self) -> Vec<SegmentMeta> {
        self.inner.spill.lock().segments().to_vec()
    }

    /// reclaimer 주기를 기다리지 않고 스필 재전송을 한 번 수행합니다.
    pub async fn reclaim_now(&self) -> u64 {
        self.inner.reclaim_pass().await
    }

    /// 큐를 비우고 싱크를 종료합니다.
    ///
    /// `grace` 안에 쓰지 못한 틱은 스필합니다. 진행 중인 쓰기가 마감까지 끝나지
    /// 않으면 `false`를 반환합니다.
    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "싱크 태스크 종료 에러");
            }
        }

        let inner = &self.inner;
        loop {
            let batch = inner.take_batch();
            if batch.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                inner.spill_batch(batch).await;
                continue;
            }

            match tokio::time::timeout_at(deadline, inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        inner.write_batch(batch, Some(deadline)).await;
                        drop(permit);
                    });
                }
                _ => {
                    inner.spill_batch(batch).await;
                }
            }
        }

        let all = inner.config.max_inflight_batches.max(1) as u32;
        let clean = matches!(
            tokio::time::timeout_at(deadline + SPILL_CLOSE_MARGIN, inner.permits.acquire_many(all))
                .await,
            Ok(Ok(_))
        );

        let stats = self.stats();
        if clean {
            info!(
                spill_segments = stats.spill_segments,
                spill_bytes = stats.spill_bytes,
                "배치 싱크 종료 완료"
            );
        } else {
            warn!(
                inflight_rows = stats.inflight_rows,
                "배치 싱크 종료 시간 초과, 진행 중 쓰기 포기"
            );
        }
        clean
    }

    /// 스필/데드레터 MANIFEST를 동기화합니다.
    pub async fn close_spill(&self) -> SinkResult<()> {
        let spill = self.inner.spill.clone();
        let dead_letter = self.inner.dead_letter.clone();
        tokio::task::spawn_blocking(move || {
            spill.lock().sync()?;
            dead_letter.lock().sync()
        })
        .await
        .map_err(|e| SinkError::Spill(format!("스필 닫기 실패: {}", e)))?
    }
}

impl Drop for BatchSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SinkInner {
    /// `sink_pending` = 큐 대기 + 쓰기 진행 중.
    fn publish_pending(&self, queued: usize) {
        let inflight = self.inflight_rows.load(Ordering::Relaxed);
        PipelineMetrics::set(&self.metrics.sink_pending, queued as u64 + inflight);
    }

    /// 큐 앞에서 최대 `batch_size`개를 꺼냅니다.
    fn take_batch(&self) -> Vec<SharedTick> {
        let (batch, queued) = {
            let mut buffer = self.buffer.lock();
            let count = buffer.pending.len().min(self.config.batch_size.max(1));
            let batch: Vec<SharedTick> = buffer.pending.drain(..count).map(|(_, t)| t).collect();
            (batch, buffer.pending.len())
        };
        self.inflight_rows
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.publish_pending(queued);
        batch
    }

    /// 다음 플러시까지 대기 시간. 즉시 플러시할 수 있으면 `None`.
    fn flush_wait(&self) -> Option<Duration> {
        let buffer = self.buffer.lock();
        if buffer.pending.len() >= self.config.batch_size {
            return None;
        }
        match buffer.oldest() {
            Some(oldest) => {
                let due = oldest + self.config.flush_interval();
                let now = Instant::now();
                (due > now).then(|| due - now)
            }
            None => Some(self.config.flush_interval()),
        }
    }

    fn to_rows(&self, mut batch: Vec<SharedTick>) -> Vec<TickRow> {
        batch.sort_by_key(|t| t.source_seq);
        batch
            .iter()
            .filter_map(|tick| match TickRow::from_tick(tick, &self.clock) {
                Ok(row) => Some(row),
                Err(e) => {
                    error!(symbol = %tick.symbol, error = %e, "행 변환 실패");
                    PipelineMetrics::incr(&self.metrics.sink_drops);
                    None
                }
            })
            .collect()
    }

    fn finish_inflight(&self, count: usize) {
        let previous = self
            .inflight_rows
            .fetch_sub(count as u64, Ordering::Relaxed);
        debug_assert!(previous >= count as u64);
        let queued = self.buffer.lock().pending.len();
        self.publish_pending(queued);
    }

    /// 배치 하나를 씁니다. 실패하면 분류에 따라 스필 또는 데드레터로 보냅니다.
    #[instrument(skip(self, batch), fields(count = batch.len()))]
    async fn write_batch(&self, batch: Vec<SharedTick>, deadline: Option<Instant>) -> BatchOutcome {
        let taken = batch.len();
        let rows = self.to_rows(batch);
        let outcome = self.write_rows(rows, deadline).await;
        self.finish_inflight(taken);
        outcome
    }

    async fn write_rows(&self, rows: Vec<TickRow>, deadline: Option<Instant>) -> BatchOutcome {
        if rows.is_empty() {
            return BatchOutcome::Written;
        }

        if self.spill_only.load(Ordering::Relaxed) {
            return self.spill_rows(rows).await;
        }

        let (result, stats) = with_retry(&self.retry, deadline, || self.store.upsert(&rows)).await;
        if stats.retries > 0 {
            PipelineMetrics::add(&self.metrics.sink_retries, stats.retries as u64);
        }

        match result {
            Ok(_) => {
                PipelineMetrics::add(&self.metrics.sink_written, rows.len() as u64);
                self.consecutive_spills.store(0, Ordering::Relaxed);
                debug!(rows = rows.len(), attempts = stats.attempts, "배치 쓰기 완료");
                BatchOutcome::Written
            }
            Err(e) if e.is_permanent() => {
                error!(rows = rows.len(), error = %e, "영구적 쓰기 실패, 데드레터로 이동");
                self.dead_letter_rows(rows).await
            }
            Err(e) => {
                warn!(
                    rows = rows.len(),
                    attempts = stats.attempts,
                    error = %e,
                    "쓰기 재시도 소진, 스필"
                );
                let outcome = self.spill_rows(rows).await;
                let streak = self.consecutive_spills.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= SPILL_ONLY_THRESHOLD && !self.spill_only.swap(true, Ordering::Relaxed) {
                    error!(streak = streak, "원격 저장소 장애, 스필 전용 모드로 전환");
                }
                outcome
            }
        }
    }

    async fn spill_batch(&self, batch: Vec<SharedTick>) -> BatchOutcome {
        let taken = batch.len();
        let rows = self.to_rows(batch);
        let outcome = self.spill_rows(rows).await;
        self.finish_inflight(taken);
        outcome
    }

    async fn spill_rows(&self, rows: Vec<TickRow>) -> BatchOutcome {
        if rows.is_empty() {
            return BatchOutcome::Spilled;
        }
        let count = rows.len() as u64;
        let log = self.spill.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut log = log.lock();
            let outcome = log.append(&rows)?;
            Ok::<_, SinkError>((outcome, log.total_bytes()))
        })
        .await
        .map_err(|e| SinkError::Spill(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok((outcome, total_bytes)) => {
                let metrics = &self.metrics;
                PipelineMetrics::add(&metrics.sink_spilled, count);
                PipelineMetrics::set(&metrics.sink_spill_bytes, total_bytes);
                if !outcome.evicted.is_empty() {
                    PipelineMetrics::add(&metrics.sink_spill_drops, outcome.evicted.len() as u64);
                    PipelineMetrics::sub(&metrics.sink_spilled, outcome.evicted_own_rows());
                }
                BatchOutcome::Spilled
            }
            Err(e) => {
                error!(rows = count, error = %e, "스필 실패, 배치 유실");
                PipelineMetrics::add(&self.metrics.sink_drops, count);
                BatchOutcome::Dropped
            }
        }
    }

    async fn dead_letter_rows(&self, rows: Vec<TickRow>) -> BatchOutcome {
        let count = rows.len() as u64;
        let log = self.dead_letter.clone();

        let result = tokio::task::spawn_blocking(move || log.lock().append(&rows))
            .await
            .map_err(|e| SinkError::Spill(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(_) => {
                PipelineMetrics::add(&self.metrics.sink_dead_letter, count);
                BatchOutcome::DeadLettered
            }
            Err(e) => {
                error!(rows = count, error = %e, "데드레터 기록 실패, 배치 유실");
                PipelineMetrics::add(&self.metrics.sink_drops, count);
                BatchOutcome::Dropped
            }
        }
    }

    /// 스필 세그먼트를 오래된 순으로 재전송합니다. 재전송한 행 수를 반환합니다.
    ///
    /// 한 세그먼트라도 실패하면 멈추고 다음 주기에 다시 시도합니다.
    async fn reclaim_pass(&self) -> u64 {
        let mut reclaimed = 0;

        loop {
            let Some(meta) = self.spill.lock().oldest().cloned() else {
                break;
            };

            let log = self.spill.clone();
            let read_meta = meta.clone();
            let rows = match tokio::task::spawn_blocking(move || log.lock().read(&read_meta))
                .await
                .map_err(|e| SinkError::Spill(e.to_string()))
                .and_then(|r| r)
            {
                Ok(rows) => rows,
                Err(e) => {
                    error!(file = %meta.file_name, error = %e, "스필 세그먼트 손상, 삭제");
                    PipelineMetrics::incr(&self.metrics.sink_spill_drops);
                    self.forget_segment(&meta, meta.rows).await;
                    continue;
                }
            };

            let Ok(permit) = self.permits.acquire().await else {
                break;
            };
            let result = tokio::time::timeout(self.config.write_timeout(), self.store.upsert(&rows))
                .await
                .unwrap_or_else(|_| Err(SinkError::Timeout(self.config.write_timeout_ms)));
            drop(permit);

            match result {
                Ok(_) => {
                    let count = rows.len() as u64;
                    PipelineMetrics::add(&self.metrics.sink_reclaimed, count);
                    if !meta.inherited {
                        PipelineMetrics::add(&self.metrics.sink_written, count);
                    }
                    self.forget_segment(&meta, count).await;
                    reclaimed += count;

                    self.consecutive_spills.store(0, Ordering::Relaxed);
                    if self.spill_only.swap(false, Ordering::Relaxed) {
                        info!("원격 저장소 복구, 스필 전용 모드 해제");
                    }
                    debug!(file = %meta.file_name, rows = count, "스필 세그먼트 재전송 완료");
                }
                Err(e) if e.is_permanent() => {
                    error!(file = %meta.file_name, error = %e, "스필 세그먼트 영구적 실패, 데드레터로 이동");
                    let count = rows.len() as u64;
                    self.dead_letter_rows(rows).await;
                    self.forget_segment(&meta, count).await;
                }
                Err(e) => {
                    debug!(file = %meta.file_name, error = %e, "스필 재전송 실패, 다음 주기에 재시도");
                    break;
                }
            }
        }

        reclaimed
    }

    /// 세그먼트를 삭제하고 스필 계측을 갱신합니다.
    async fn forget_segment(&self, meta: &SegmentMeta, rows: u64) {
        let log = self.spill.clone();
        let target = meta.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut log = log.lock();
            log.remove(&target)?;
            Ok::<_, SinkError>(log.total_bytes())
        })
        .await
        .map_err(|e| SinkError::Spill(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(total_bytes) => {
                PipelineMetrics::set(&self.metrics.sink_spill_bytes, total_bytes);
                if !meta.inherited {
                    PipelineMetrics::sub(&self.metrics.sink_spilled, rows);
                }
            }
            Err(e) => error!(file = %meta.file_name, error = %e, "스필 세그먼트 삭제 실패"),
        }
    }
}

async fn flush_loop(inner: Arc<SinkInner>, cancel: CancellationToken) {
    debug!("flusher 시작");
    loop {
        if let Some(wait) = inner.flush_wait() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.notify.notified() => continue,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let batch = inner.take_batch();
        if batch.is_empty() {
            drop(permit);
            continue;
        }

        let writer = inner.clone();
        tokio::spawn(async move {
            writer.write_batch(batch, None).await;
            drop(permit);
        });
    }
    debug!("flusher 종료");
}

async fn reclaim_loop(inner: Arc<SinkInner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.reclaim_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 첫 tick은 즉시 반환
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let has_segments = !inner.spill.lock().is_empty();
                if has_segments {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        count = inner.reclaim_pass() => {
                            if count > 0 {
                                info!(rows = count, "스필 재전송");
                            }
                        }
                    }
                }
            }
        }
    }
    debug!("reclaimer 종료");
}
