//! 파이프라인 통합 테스트.
//!
//! 프로세스 내 업스트림 서버 → 수퍼바이저 → 메모리 저장소 경로를 검증합니다.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

use common::{record, test_config, wait_until, within, Behavior, MockUpstream};
use tick_core::PipelineMetrics;
use tick_pipeline::{HealthStatus, Supervisor};
use tick_sink::{FailureMode, MemoryRowStore};
use tick_state::{DropPolicy, SubscriptionFilter};

const WAIT: Duration = Duration::from_secs(10);

fn symbols() -> Vec<&'static str> {
    vec!["SH600000", "SZ000001", "SZ300750", "SH688981", "BJ830799"]
}

fn records(count: usize) -> Vec<String> {
    let symbols = symbols();
    (0..count)
        .map(|i| record(symbols[i % symbols.len()], &format!("10.{:02}", i % 90)))
        .collect()
}

#[tokio::test]
async fn test_steady_stream_reaches_state_hub_and_sink() {
    let dir = TempDir::new().unwrap();
    let upstream = MockUpstream::start(Behavior::Stream).await;
    let rows = Arc::new(MemoryRowStore::new());

    let mut supervisor = Supervisor::start(test_config(&upstream.endpoint, dir.path()), rows.clone())
        .await
        .unwrap();
    let all = supervisor.subscribe(SubscriptionFilter::All, 1_000, DropPolicy::DropOldest);
    let shenzhen = supervisor.subscribe(SubscriptionFilter::market("SZ"), 1_000, DropPolicy::DropOldest);

    upstream.send_all(records(50));
    let metrics = supervisor.pipeline_metrics().clone();
    wait_until("rows written", WAIT, || {
        rows.len() == 50 && PipelineMetrics::get(&metrics.sink_written) == 50
    })
    .await;
    wait_until("ticks delivered", WAIT, || all.len() == 50).await;

    assert_eq!(supervisor.state().len(), 5);
    assert_eq!(shenzhen.len(), 20);

    let mut delivered = Vec::new();
    while let Some(tick) = all.try_recv() {
        delivered.push(tick.source_seq);
    }
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));

    let health = supervisor.health();
    assert_eq!(health.status, HealthStatus::Healthy, "{:?}", health.reasons);
    assert_eq!(health.symbols, 5);
    assert_eq!(health.endpoint, upstream.endpoint);

    let snapshot = supervisor.metrics();
    assert_eq!(snapshot.received, 50);
    assert_eq!(snapshot.parsed, 50);
    assert_eq!(snapshot.sink_written, 50);

    let report = within(WAIT, supervisor.shutdown()).await;
    assert!(report.clean, "{:?}", report.unclean_stages);
    assert_eq!(supervisor.health().status, HealthStatus::Stopped);
}

#[tokio::test]
async fn test_sink_outage_spills_then_recovers_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let upstream = MockUpstream::start(Behavior::Stream).await;
    let rows = Arc::new(MemoryRowStore::new());
    rows.set_failing(Some(FailureMode::Transient));

    let mut supervisor = Supervisor::start(test_config(&upstream.endpoint, dir.path()), rows.clone())
        .await
        .unwrap();

    upstream.send_all(records(40));
    let metrics = supervisor.pipeline_metrics().clone();
    wait_until("all ticks spilled", WAIT, || {
        PipelineMetrics::get(&metrics.sink_spilled) == 40
    })
    .await;

    // 수집은 계속되고 헬스는 degraded
    assert_eq!(supervisor.state().len(), 5);
    assert!(supervisor.sink().stats().spill_bytes > 0);
    let health = supervisor.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.spill_bytes > 0);

    rows.set_failing(None);
    wait_until("spill reclaimed", WAIT, || {
        rows.len() == 40
            && supervisor.sink().stats().spill_segments == 0
            && PipelineMetrics::get(&metrics.sink_written) == 40
    })
    .await;

    let written: usize = rows.batches().iter().map(|b| b.len()).sum();
    assert_eq!(written, 40, "각 행은 정확히 한 번 기록");

    let snapshot = supervisor.metrics();
    assert_eq!(snapshot.sink_written, 40);
    assert_eq!(snapshot.sink_spilled, 0);
    assert_eq!(snapshot.sink_drops, 0);
    assert!(snapshot.sink_reclaimed > 0);
    assert!(snapshot.sink_retries > 0);

    let report = within(WAIT, supervisor.shutdown()).await;
    assert!(report.clean);
}

#[tokio::test]
async fn test_auth_rejection_is_fatal() {
    let dir = TempDir::new().unwrap();
    let upstream = MockUpstream::start(Behavior::Reject).await;
    let rows = Arc::new(MemoryRowStore::new());

    let mut supervisor = Supervisor::start(test_config(&upstream.endpoint, dir.path()), rows)
        .await
        .unwrap();

    within(WAIT, supervisor.wait_fatal()).await;
    assert!(supervisor.fatal_error().is_some());
    assert_eq!(upstream.accepted(), 3);

    let health = supervisor.health();
    assert_eq!(health.status, HealthStatus::Failing);

    within(WAIT, supervisor.shutdown()).await;
    // 치명적 오류는 종료 후에도 유지
    assert_eq!(supervisor.health().status, HealthStatus::Failing);
}

#[tokio::test]
async fn test_rotates_to_fallback_after_retries_exhausted() {
    let dir = TempDir::new().unwrap();
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_endpoint = dead.local_addr().unwrap().to_string();
    drop(dead);

    let upstream = MockUpstream::start(Behavior::Stream).await;
    let rows = Arc::new(MemoryRowStore::new());

    let mut config = test_config(&dead_endpoint, dir.path());
    config.upstream.fallback_endpoints = vec![upstream.endpoint.clone()];
    config.upstream.max_retries = 2;

    let mut supervisor = Supervisor::start(config, rows.clone()).await.unwrap();
    upstream.send_all(records(10));

    wait_until("fallback streaming", WAIT, || rows.len() == 10).await;
    assert_eq!(supervisor.endpoint(), upstream.endpoint);

    let health = supervisor.health();
    assert_ne!(health.status, HealthStatus::Failing, "{:?}", health.reasons);
    // 죽은 엔드포인트는 스트리밍한 적이 없으므로 재연결로 세지 않는다
    assert_eq!(supervisor.metrics().receiver_reconnects, 0);

    let report = within(WAIT, supervisor.shutdown()).await;
    assert!(report.clean);
}

#[tokio::test]
async fn test_graceful_shutdown_drains_in_flight_ticks() {
    let dir = TempDir::new().unwrap();
    let upstream = MockUpstream::start(Behavior::Stream).await;
    let rows = Arc::new(MemoryRowStore::new());

    let mut config = test_config(&upstream.endpoint, dir.path());
    // 주기 플러시 없이 종료 시 소진에만 의존
    config.sink.flush_interval_ms = 60_000;
    config.sink.batch_size = 1_000;

    let mut supervisor = Supervisor::start(config, rows.clone()).await.unwrap();
    let all = supervisor.subscribe(SubscriptionFilter::All, 1_000, DropPolicy::DropOldest);

    upstream.send_all(records(100));
    let metrics = supervisor.pipeline_metrics().clone();
    wait_until("ticks parsed", WAIT, || PipelineMetrics::get(&metrics.parsed) == 100).await;
    assert!(rows.is_empty());

    let report = within(WAIT, supervisor.shutdown()).await;
    assert!(report.clean, "{:?}", report.unclean_stages);
    assert_eq!(rows.len(), 100);
    assert_eq!(all.len(), 100);
    assert!(all.is_closed());

    let snapshot = supervisor.metrics();
    assert_eq!(snapshot.sink_written, 100);
    assert_eq!(snapshot.sink_pending, 0);
    assert!(snapshot.unclean_shutdown.values().all(|&n| n == 0));
}

#[tokio::test]
async fn test_high_reject_rate_degrades_health() {
    let dir = TempDir::new().unwrap();
    let upstream = MockUpstream::start(Behavior::Stream).await;
    let rows = Arc::new(MemoryRowStore::new());

    let mut supervisor = Supervisor::start(test_config(&upstream.endpoint, dir.path()), rows)
        .await
        .unwrap();
    // 초기 표본이 잡힐 때까지
    tokio::time::sleep(Duration::from_millis(100)).await;

    upstream.send_all(records(10));
    upstream.send_all((0..10).map(|_| "bad$record".to_string()));

    let metrics = supervisor.pipeline_metrics().clone();
    wait_until("records parsed", WAIT, || {
        PipelineMetrics::get(&metrics.parsed) == 10 && metrics.total_rejects() == 10
    })
    .await;

    let health = supervisor.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.reject_rate > 0.4);
    assert!(health.reasons.iter().any(|r| r.contains("거부율")));

    within(WAIT, supervisor.shutdown()).await;
}
