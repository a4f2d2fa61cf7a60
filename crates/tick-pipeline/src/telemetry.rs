//! Prometheus 메트릭 노출.
//!
//! 파이프라인 카운터는 원자 변수에 쌓이고, 주기적으로 스냅샷을 떠서 `metrics`
//! 파사드에 반영합니다. 익스포터는 `/metrics` 로 노출합니다.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use tick_core::{FeedError, FeedResult, MetricsSnapshot};

use crate::health::HealthStatus;

/// Prometheus HTTP 리스너를 설치합니다.
pub fn install_exporter(listen: &str) -> FeedResult<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| FeedError::Config(format!("metrics_listen 주소 오류 {}: {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| FeedError::Config(format!("Prometheus 익스포터 설치 실패: {}", e)))?;

    describe_metrics();
    info!(listen = %addr, "Prometheus 익스포터 시작");
    Ok(())
}

fn describe_metrics() {
    describe_counter!("tickfeed_received_total", "수신한 프레임 수");
    describe_counter!("tickfeed_parsed_total", "파싱에 성공한 틱 수");
    describe_counter!("tickfeed_parser_rejects_total", "사유별 파서 거부 수");
    describe_counter!(
        "tickfeed_hub_backpressure_stalls_total",
        "허브 입력 큐 포화로 파서가 대기한 횟수"
    );
    describe_counter!("tickfeed_sink_written_total", "원격 저장소에 쓴 행 수");
    describe_gauge!("tickfeed_sink_pending", "싱크 대기 + 쓰기 중 행 수");
    describe_gauge!("tickfeed_sink_spill_bytes", "스필 디렉터리 바이트");
    describe_gauge!("tickfeed_health", "헬스 상태 (0 healthy, 1 degraded, 2 failing, 3 stopped)");
}

// ============================================================================
// 스냅샷 반영
// ============================================================================

/// 스냅샷을 메트릭 파사드에 반영합니다.
pub fn export_snapshot(snapshot: &MetricsSnapshot) {
    // 수신기
    counter!("tickfeed_received_total").absolute(snapshot.received);
    counter!("tickfeed_receiver_drops_total").absolute(snapshot.receiver_drops);
    counter!("tickfeed_receiver_reconnects_total").absolute(snapshot.receiver_reconnects);
    counter!("tickfeed_frame_errors_total").absolute(snapshot.frame_errors);

    // 파서
    counter!("tickfeed_parsed_total").absolute(snapshot.parsed);
    gauge!("tickfeed_parser_inflight").set(snapshot.parser_inflight as f64);
    counter!("tickfeed_parser_numeric_defaults_total").absolute(snapshot.parser_numeric_defaults);
    counter!("tickfeed_parser_restarts_total").absolute(snapshot.parser_restarts);
    for (reason, count) in &snapshot.parser_rejects {
        counter!("tickfeed_parser_rejects_total", "reason" => reason.clone()).absolute(*count);
    }

    // 상태 저장소, 허브
    counter!("tickfeed_state_symbol_cap_reached_total").absolute(snapshot.state_symbol_cap_reached);
    counter!("tickfeed_state_stale_ignored_total").absolute(snapshot.state_stale_ignored);
    counter!("tickfeed_hub_delivered_total").absolute(snapshot.hub_delivered);
    counter!("tickfeed_hub_dropped_total").absolute(snapshot.hub_dropped);
    counter!("tickfeed_hub_intake_drops_total").absolute(snapshot.hub_intake_drops);
    counter!("tickfeed_hub_backpressure_stalls_total").absolute(snapshot.hub_backpressure_stalls);
    counter!("tickfeed_hub_closed_total").absolute(snapshot.hub_closed);

    // 싱크
    counter!("tickfeed_sink_written_total").absolute(snapshot.sink_written);
    gauge!("tickfeed_sink_pending").set(snapshot.sink_pending as f64);
    gauge!("tickfeed_sink_spilled").set(snapshot.sink_spilled as f64);
    counter!("tickfeed_sink_drops_total").absolute(snapshot.sink_drops);
    counter!("tickfeed_sink_dead_letter_total").absolute(snapshot.sink_dead_letter);
    counter!("tickfeed_sink_retries_total").absolute(snapshot.sink_retries);
    gauge!("tickfeed_sink_spill_bytes").set(snapshot.sink_spill_bytes as f64);
    counter!("tickfeed_sink_spill_drops_total").absolute(snapshot.sink_spill_drops);
    counter!("tickfeed_sink_reclaimed_total").absolute(snapshot.sink_reclaimed);

    for (stage, count) in &snapshot.unclean_shutdown {
        counter!("tickfeed_unclean_shutdown_total", "stage" => stage.clone()).absolute(*count);
    }
}

/// 헬스 상태를 게이지로 반영합니다.
pub fn export_health(status: HealthStatus) {
    gauge!("tickfeed_health").set(health_code(status));
}

fn health_code(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Failing => 2.0,
        HealthStatus::Stopped => 3.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_listen_address() {
        let err = install_exporter("not-an-address").unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn test_export_without_recorder_is_noop() {
        // 레코더가 없으면 no-op 레코더로 기록됨
        export_snapshot(&MetricsSnapshot::default());
        export_health(HealthStatus::Healthy);
    }

    #[test]
    fn test_health_codes_ordered() {
        assert!(health_code(HealthStatus::Healthy) < health_code(HealthStatus::Degraded));
        assert!(health_code(HealthStatus::Degraded) < health_code(HealthStatus::Failing));
    }
}
