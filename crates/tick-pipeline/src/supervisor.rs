//! 파이프라인 수퍼바이저.
//!
//! 수신기 → 파서 → (상태 저장소, 허브, 싱크) 를 조립하고 장애를 처리합니다.
//!
//! - 수신기 재시도 소진: 다음 엔드포인트로 교체 (순환)
//! - 인증 거부: 치명적, 파이프라인 종료 신호
//! - 파서 패닉: 파서 태스크 재시작
//! - 싱크 장애: 수집 유지, 스필 전용
//!
//! 종료 순서는 수신기 → 파서 → 팬아웃 → 싱크 → 스필이며, 각 단계는 유예 시간
//! 안에 끝나지 않으면 포기하고 `unclean_shutdown_stage_<name>`으로 집계합니다.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tick_core::{
    FeedResult, MetricsSnapshot, MonotonicClock, PipelineConfig, PipelineMetrics,
    SequenceGenerator, ShutdownStage,
};
use tick_ingest::{ConnectionState, RawFrame, Receiver, TickParser};
use tick_sink::{BatchSink, RowStore};
use tick_state::{DropPolicy, FanoutHub, StateStore, Subscription, SubscriptionFilter};

use crate::health::{evaluate, HealthInputs, HealthReport, HealthStatus, RejectRateWindow};
use crate::stages::{run_dispatcher, ParseStage, PendingBatch};
use crate::telemetry;

/// 종료 결과.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// 모든 단계가 유예 시간 안에 끝났는지
    pub clean: bool,
    /// 포기한 단계
    pub unclean_stages: Vec<String>,
    pub elapsed_ms: u64,
}

/// 태스크 간 공유 상태.
struct Shared {
    config: PipelineConfig,
    clock: MonotonicClock,
    metrics: Arc<PipelineMetrics>,
    endpoint: RwLock<String>,
    connection: RwLock<ConnectionState>,
    fatal: Mutex<Option<String>>,
    exhausted: Mutex<Option<String>>,
    stopped: AtomicBool,
    fatal_token: CancellationToken,
    reject_window: RejectRateWindow,
}

impl Shared {
    fn set_connection(&self, state: ConnectionState) {
        *self.connection.write() = state;
        if state == ConnectionState::Streaming {
            self.exhausted.lock().take();
        }
    }

    fn set_fatal(&self, reason: String) {
        *self.fatal.lock() = Some(reason);
        self.fatal_token.cancel();
    }

    fn health_inputs(&self) -> HealthInputs {
        self.sample_rejects();
        let now = self.clock.now_ns();
        let last_reconnect = PipelineMetrics::get(&self.metrics.last_reconnect_ns);
        HealthInputs {
            stopped: self.stopped.load(Ordering::Relaxed),
            fatal: self.fatal.lock().clone(),
            exhausted: self.exhausted.lock().clone(),
            connection: *self.connection.read(),
            since_reconnect_ns: (last_reconnect > 0).then(|| now.saturating_sub(last_reconnect)),
            window_ns: self.config.supervisor.health_window().as_nanos() as u64,
            spill_bytes: PipelineMetrics::get(&self.metrics.sink_spill_bytes),
            reject_rate: self.reject_window.rate(),
            reject_rate_threshold: self.config.supervisor.reject_rate_degraded,
        }
    }

    fn sample_rejects(&self) {
        self.reject_window.record(
            self.clock.now_ns(),
            PipelineMetrics::get(&self.metrics.parsed),
            self.metrics.total_rejects(),
        );
    }
}

/// 파이프라인 수퍼바이저.
pub struct Supervisor {
    shared: Arc<Shared>,
    store: Arc<StateStore>,
    hub: Arc<FanoutHub>,
    sink: Arc<BatchSink>,
    receiver_cancel: CancellationToken,
    background_cancel: CancellationToken,
    receiver_task: Option<JoinHandle<()>>,
    parser_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// 모든 단계를 조립하고 시작합니다.
    #[instrument(name = "supervisor", skip_all, fields(endpoint = %config.upstream.endpoint))]
    pub async fn start(config: PipelineConfig, row_store: Arc<dyn RowStore>) -> FeedResult<Self> {
        config.validate()?;

        let clock = MonotonicClock::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let sequence = Arc::new(SequenceGenerator::seeded_from_wall_clock());

        let sink = Arc::new(
            BatchSink::start(config.sink.clone(), row_store, clock.clone(), metrics.clone())
                .await?,
        );
        let store = Arc::new(StateStore::new(&config.state, clock.clone(), metrics.clone()));
        let hub = Arc::new(FanoutHub::new(config.hub.mailbox_cap_default, metrics.clone()));

        let (raw_tx, raw_rx) = mpsc::channel::<RawFrame>(config.upstream.raw_queue_cap);
        let (hub_tx, hub_rx) = mpsc::channel(config.parser.hub_queue_batches());

        let shared = Arc::new(Shared {
            endpoint: RwLock::new(config.upstream.endpoint.clone()),
            connection: RwLock::new(ConnectionState::Disconnected),
            fatal: Mutex::new(None),
            exhausted: Mutex::new(None),
            stopped: AtomicBool::new(false),
            fatal_token: CancellationToken::new(),
            reject_window: RejectRateWindow::new(
                config.supervisor.health_window().as_nanos() as u64,
            ),
            clock: clock.clone(),
            metrics: metrics.clone(),
            config,
        });
        let config = &shared.config;

        let receiver_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let receiver_task = tokio::spawn(run_receivers(
            shared.clone(),
            raw_tx,
            receiver_cancel.clone(),
        ));

        let stage = ParseStage {
            config: config.parser.clone(),
            parser: TickParser::new(clock.clone(), sequence, metrics.clone()),
            raw_rx: Arc::new(tokio::sync::Mutex::new(raw_rx)),
            pending: PendingBatch::default(),
            store: store.clone(),
            hub_tx,
            sink: sink.clone(),
            metrics: metrics.clone(),
        };
        let restart_delay = config.supervisor.parser_restart_delay();
        let parser_metrics = metrics.clone();
        let parser_task = tokio::spawn(async move {
            let restarts =
                restart_on_panic(move || stage.clone().run(), restart_delay, parser_metrics).await;
            if restarts > 0 {
                info!(restarts = restarts, "파서 감독 종료");
            }
        });

        let dispatch_hub = hub.clone();
        let prune_interval = config.hub.prune_interval();
        let dispatch_task = tokio::spawn(async move {
            run_dispatcher(dispatch_hub, hub_rx, prune_interval).await;
        });

        let background_tasks = vec![tokio::spawn(run_telemetry(
            shared.clone(),
            background_cancel.clone(),
        ))];

        info!(
            endpoints = config.upstream.endpoints().len(),
            raw_queue_cap = config.upstream.raw_queue_cap,
            max_symbols = config.state.max_symbols,
            "파이프라인 시작"
        );

        Ok(Self {
            shared,
            store,
            hub,
            sink,
            receiver_cancel,
            background_cancel,
            receiver_task: Some(receiver_task),
            parser_task: Some(parser_task),
            dispatch_task: Some(dispatch_task),
            background_tasks,
        })
    }

    /// 상태 저장소.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// 팬아웃 허브.
    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    /// 배치 싱크.
    pub fn sink(&self) -> &Arc<BatchSink> {
        &self.sink
    }

    /// 구독을 등록합니다.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        mailbox_cap: usize,
        drop_policy: DropPolicy,
    ) -> Subscription {
        self.hub.subscribe(filter, mailbox_cap, drop_policy)
    }

    /// 현재 수신기 엔드포인트.
    pub fn endpoint(&self) -> String {
        self.shared.endpoint.read().clone()
    }

    /// 현재 연결 상태.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.read()
    }

    /// 치명적 오류 사유.
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().clone()
    }

    /// 치명적 오류가 발생할 때까지 대기합니다.
    pub async fn wait_fatal(&self) {
        self.shared.fatal_token.cancelled().await;
    }

    /// 카운터 스냅샷.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// 공유 카운터.
    pub fn pipeline_metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// 헬스 보고서.
    pub fn health(&self) -> HealthReport {
        let inputs = self.shared.health_inputs();
        let (status, reasons) = evaluate(&inputs);

        HealthReport {
            status,
            reasons,
            endpoint: self.endpoint(),
            connection: inputs.connection.to_string(),
            reject_rate: inputs.reject_rate,
            spill_bytes: inputs.spill_bytes,
            symbols: self.store.len(),
            subscriptions: self.hub.subscription_count(),
        }
    }

    /// 단계별로 파이프라인을 종료합니다. 두 번째 호출부터는 아무것도 하지 않습니다.
    #[instrument(name = "supervisor_shutdown", skip(self))]
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let started = Instant::now();
        if self.shared.stopped.load(Ordering::Relaxed) {
            return ShutdownReport {
                clean: true,
                unclean_stages: Vec::new(),
                elapsed_ms: 0,
            };
        }

        let grace = self.shared.config.supervisor.stage_grace();
        let mut unclean = Vec::new();
        info!(grace_ms = grace.as_millis() as u64, "파이프라인 종료 시작");

        // 1. 수신기 정지 → raw 큐 송신측 해제
        self.receiver_cancel.cancel();
        if !join_stage(self.receiver_task.take(), grace).await {
            unclean.push(ShutdownStage::Receiver);
        }

        // 2. raw 큐 소진
        if !join_stage(self.parser_task.take(), grace).await {
            unclean.push(ShutdownStage::Parser);
        }

        // 3. 허브 입력 큐 소진
        if !join_stage(self.dispatch_task.take(), grace).await {
            unclean.push(ShutdownStage::Fanout);
        }
        self.hub.close_all();

        // 4. 싱크 소진 (자체 유예 시간)
        let sink_grace = self.shared.config.sink.shutdown_grace();
        if !self.sink.shutdown(sink_grace).await {
            unclean.push(ShutdownStage::Sink);
        }

        // 5. 스필 닫기
        match tokio::time::timeout(grace, self.sink.close_spill()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "스필 닫기 실패");
                unclean.push(ShutdownStage::Spill);
            }
            Err(_) => unclean.push(ShutdownStage::Spill),
        }

        self.background_cancel.cancel();
        let background = self
            .background_tasks
            .drain(..)
            .map(|task| join_stage(Some(task), grace));
        join_all(background).await;

        let metrics = &self.shared.metrics;
        for stage in &unclean {
            metrics.record_unclean_shutdown(*stage);
            warn!(stage = %stage, "종료 단계 유예 시간 초과, 포기");
        }

        self.shared.set_connection(ConnectionState::Stopped);
        self.shared.stopped.store(true, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        telemetry::export_snapshot(&snapshot);
        telemetry::export_health(HealthStatus::Stopped);
        snapshot.log_summary();

        let report = ShutdownReport {
            clean: unclean.is_empty(),
            unclean_stages: unclean.iter().map(|s| s.as_str().to_string()).collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            clean = report.clean,
            elapsed_ms = report.elapsed_ms,
            "파이프라인 종료 완료"
        );
        report
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.receiver_cancel.cancel();
        self.background_cancel.cancel();
    }
}

/// 유예 시간 안에 태스크가 끝나면 true. 아니면 중단시키고 false.
async fn join_stage(handle: Option<JoinHandle<()>>, grace: Duration) -> bool {
    let Some(mut handle) = handle else {
        return true;
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "단계 태스크 비정상 종료");
            false
        }
        Err(_) => {
            handle.abort();
            false
        }
    }
}

// ============================================================================
// 수신기 관리
// ============================================================================

/// 엔드포인트를 순환하며 수신기를 실행합니다.
async fn run_receivers(shared: Arc<Shared>, raw_tx: mpsc::Sender<RawFrame>, cancel: CancellationToken) {
    let endpoints = shared.config.upstream.endpoints();
    let mut index = 0usize;

    while !cancel.is_cancelled() {
        let Some(endpoint) = endpoints.get(index % endpoints.len().max(1)).cloned() else {
            error!("설정된 엔드포인트 없음");
            shared.set_fatal("엔드포인트 없음".to_string());
            break;
        };
        *shared.endpoint.write() = endpoint.clone();

        let receiver = Receiver::new(
            endpoint.clone(),
            shared.config.upstream.clone(),
            raw_tx.clone(),
            shared.metrics.clone(),
            shared.clock.clone(),
            cancel.child_token(),
        );
        let mut state_rx = receiver.subscribe_state();
        let run = receiver.run();
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    shared.set_connection(state);
                }
            }
        };

        match result {
            Ok(()) => break,
            Err(err) if err.is_fatal() => {
                error!(endpoint = %endpoint, error = %err, "치명적 수신기 오류, 파이프라인 중단");
                shared.set_fatal(err.to_string());
                break;
            }
            Err(err) => {
                index += 1;
                let next = endpoints.get(index % endpoints.len()).cloned().unwrap_or_default();
                warn!(endpoint = %endpoint, next = %next, error = %err, "수신기 재시도 소진, 엔드포인트 교체");
                *shared.exhausted.lock() = Some(err.to_string());
            }
        }
    }

    shared.set_connection(ConnectionState::Stopped);
}

// ============================================================================
// 파서 재시작
// ============================================================================

/// 드롭되면 태스크를 중단시킵니다.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 태스크가 패닉하면 `delay` 후 다시 시작합니다. 재시작 횟수를 반환합니다.
///
/// 정상 종료하면 끝납니다. 이 future가 드롭되면 실행 중인 태스크도 중단됩니다.
pub async fn restart_on_panic<F, Fut>(
    mut factory: F,
    delay: Duration,
    metrics: Arc<PipelineMetrics>,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts = 0u64;
    loop {
        let handle = tokio::spawn(factory());
        let _guard = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(()) => return restarts,
            Err(e) if e.is_panic() => {
                restarts += 1;
                PipelineMetrics::incr(&metrics.parser_restarts);
                error!(restarts = restarts, "파서 태스크 패닉, 재시작");
                tokio::time::sleep(delay).await;
            }
            Err(_) => return restarts,
        }
    }
}

// ============================================================================
// 주기 작업
// ============================================================================

/// 카운터를 메트릭 파사드에 반영하고 주기적으로 요약을 로그합니다.
async fn run_telemetry(shared: Arc<Shared>, cancel: CancellationToken) {
    let supervisor = &shared.config.supervisor;
    let mut export = tokio::time::interval(shared.config.telemetry.export_interval());
    let mut summary = tokio::time::interval(supervisor.metrics_log_interval());
    export.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    summary.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    summary.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = export.tick() => {
                let (status, _) = evaluate(&shared.health_inputs());
                telemetry::export_snapshot(&shared.metrics.snapshot());
                telemetry::export_health(status);
            }
            _ = summary.tick() => {
                shared.metrics.snapshot().log_summary();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_restart_on_panic() {
        let metrics = Arc::new(PipelineMetrics::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let restarts = restart_on_panic(
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                        panic!("injected parser panic");
                    }
                }
            },
            Duration::from_millis(1),
            metrics.clone(),
        )
        .await;

        assert_eq!(restarts, 2);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        assert_eq!(PipelineMetrics::get(&metrics.parser_restarts), 2);
    }

    #[tokio::test]
    async fn test_join_stage_timeout_aborts() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!join_stage(Some(handle), Duration::from_millis(20)).await);
        assert!(join_stage(None, Duration::from_millis(20)).await);

        let quick = tokio::spawn(async {});
        assert!(join_stage(Some(quick), Duration::from_secs(1)).await);
    }
}
