//! 파이프라인 설정.
//!
//! TOML 파일과 `TICKFEED__` 접두사 환경 변수를 겹쳐서 로드합니다.
//! 예: `TICKFEED__UPSTREAM__ENDPOINT=10.0.0.5:7709`, `TICKFEED__SINK__BATCH_SIZE=500`.
//!
//! 시간 값은 모두 `*_ms` 정수로 저장하고 `Duration` 접근자를 제공합니다.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FeedError, FeedResult};

/// 단일 프레임 상한의 절대 최대값 (10 MiB).
pub const MAX_FRAME_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// 파이프라인 전체 설정.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 업스트림 수신 설정
    pub upstream: UpstreamConfig,
    /// 파서 설정
    pub parser: ParserConfig,
    /// 상태 저장소 설정
    pub state: StateConfig,
    /// 팬아웃 허브 설정
    pub hub: HubConfig,
    /// 배치 싱크 설정
    pub sink: SinkConfig,
    /// 수퍼바이저 설정
    pub supervisor: SupervisorConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
    /// 메트릭 노출 설정
    pub telemetry: TelemetryConfig,
}

/// 인증 토큰. 로그와 Debug 출력에 노출되지 않습니다.
#[derive(Clone)]
pub struct AuthToken(Arc<SecretString>);

impl AuthToken {
    /// 문자열에서 토큰을 만듭니다.
    pub fn new(token: impl Into<String>) -> Self {
        let token: String = token.into();
        Self(Arc::new(SecretString::new(token.into_boxed_str())))
    }

    /// 토큰 원문. 전송 직전에만 사용합니다.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

impl<'de> Deserialize<'de> for AuthToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(AuthToken::new)
    }
}

/// 업스트림 수신기 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// 푸시 서버 주소 (host:port)
    pub endpoint: String,
    /// 재시도 소진 시 순환할 예비 주소
    pub fallback_endpoints: Vec<String>,
    /// 인증 토큰
    pub token: AuthToken,
    /// 단일 프레임 최대 크기 (바이트)
    pub max_frame_size: usize,
    /// 수신기 → 파서 큐 용량 (프레임 수)
    pub raw_queue_cap: usize,
    /// 하트비트 전송 주기
    pub heartbeat_interval_ms: u64,
    /// 무수신 판정 시간
    pub idle_timeout_ms: u64,
    /// 토큰 전송 후 최대 무응답 시간
    pub auth_grace_timeout_ms: u64,
    /// 연속 인증 거부 허용 횟수
    pub auth_fail_max: u32,
    /// 인증 단계에서 허용하는 비프레임 안내문 크기
    pub auth_notice_window: usize,
    /// `ReceiverExhausted` 전 최대 재연결 시도 횟수
    pub max_retries: u32,
    /// 백오프 기본 지연
    pub backoff_base_ms: u64,
    /// 백오프 최대 지연
    pub backoff_max_ms: u64,
    /// 백오프 지터 비율 (0.2 = ±20%)
    pub backoff_jitter: f64,
    /// 이 시간 이상 스트리밍하면 시도 횟수 초기화
    pub backoff_reset_after_ms: u64,
    /// 큐가 가득 찼을 때 최대 대기 시간
    pub enqueue_wait_ms: u64,
    /// DNS 조회 타임아웃
    pub dns_timeout_ms: u64,
    /// TCP 연결 타임아웃
    pub connect_timeout_ms: u64,
    /// 하트비트 프레임 본문
    pub heartbeat_payload: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            fallback_endpoints: Vec::new(),
            token: AuthToken::default(),
            max_frame_size: MAX_FRAME_SIZE_LIMIT,
            raw_queue_cap: 100_000,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 90_000,
            auth_grace_timeout_ms: 10_000,
            auth_fail_max: 3,
            auth_notice_window: 4 * 1024,
            max_retries: 10,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.2,
            backoff_reset_after_ms: 60_000,
            enqueue_wait_ms: 250,
            dns_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            heartbeat_payload: "ping".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn auth_grace_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_grace_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_millis(self.backoff_reset_after_ms)
    }

    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 소켓 수신 버퍼 크기: `max(64 KiB, max_frame_size / 4)`.
    pub fn recv_buffer_size(&self) -> usize {
        (self.max_frame_size / 4).max(64 * 1024)
    }

    /// 기본 주소와 예비 주소를 순서대로 반환합니다.
    pub fn endpoints(&self) -> Vec<String> {
        std::iter::once(self.endpoint.clone())
            .chain(self.fallback_endpoints.iter().cloned())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

/// 파서 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// 마이크로 배치 크기 (틱 수)
    pub micro_batch_size: usize,
    /// 마이크로 배치 최대 대기 시간
    pub micro_batch_interval_ms: u64,
    /// 파서 → (저장소, 허브, 싱크) 구간 용량 (틱 수)
    pub parsed_batch_cap: usize,
    /// 허브 입력 큐가 가득 찼을 때 최대 대기 시간
    pub hub_enqueue_wait_ms: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: 256,
            micro_batch_interval_ms: 5,
            parsed_batch_cap: 200_000,
            hub_enqueue_wait_ms: 100,
        }
    }
}

impl ParserConfig {
    pub fn micro_batch_interval(&self) -> Duration {
        Duration::from_millis(self.micro_batch_interval_ms)
    }

    pub fn hub_enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.hub_enqueue_wait_ms)
    }

    /// 허브 입력 큐 용량 (배치 수).
    pub fn hub_queue_batches(&self) -> usize {
        (self.parsed_batch_cap / self.micro_batch_size.max(1)).max(1)
    }
}

/// 상태 저장소 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// 종목별 롤링 히스토리 길이
    pub history_depth: usize,
    /// 최대 종목 수
    pub max_symbols: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_depth: 100,
            max_symbols: 10_000,
        }
    }
}

/// 팬아웃 허브 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 구독별 기본 메일박스 용량
    pub mailbox_cap_default: usize,
    /// 닫힌 구독 정리 주기 (ms)
    pub prune_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_cap_default: 10_000,
            prune_interval_ms: 1_000,
        }
    }
}

impl HubConfig {
    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// 원격 저장소 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackendKind {
    /// PostgreSQL (sqlx)
    #[default]
    Postgres,
    /// HTTP/JSON upsert API
    Http,
    /// 프로세스 내 메모리 (dry-run, 테스트)
    Memory,
}

/// 배치 싱크 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// 저장소 종류
    pub backend: SinkBackendKind,
    /// PostgreSQL URL
    pub database_url: Option<String>,
    /// HTTP upsert 엔드포인트
    pub http_url: Option<String>,
    /// 대상 테이블
    pub table: String,
    /// DB 풀 최대 연결 수
    pub max_connections: u32,
    /// 배치 크기 (flush 트리거)
    pub batch_size: usize,
    /// 시간 기반 flush 주기
    pub flush_interval_ms: u64,
    /// 메모리 큐 용량 (틱 수)
    pub queue_cap: usize,
    /// 동시 쓰기 배치 수
    pub max_inflight_batches: usize,
    /// 원격 쓰기 타임아웃
    pub write_timeout_ms: u64,
    /// 재시도 기본 지연
    pub retry_base_ms: u64,
    /// 재시도 최대 지연
    pub retry_max_ms: u64,
    /// 최대 시도 횟수 (첫 시도 포함)
    pub retry_max_attempts: u32,
    /// 스필 디렉토리
    pub spill_dir: PathBuf,
    /// 스필 전체 용량 상한
    pub spill_cap_bytes: u64,
    /// 스필 세그먼트 하나의 최대 크기
    pub spill_segment_max_bytes: u64,
    /// 데드레터 전체 용량 상한
    pub dead_letter_cap_bytes: u64,
    /// 스필 재전송 주기
    pub reclaim_interval_ms: u64,
    /// 종료 시 드레인 유예 시간
    pub shutdown_grace_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            backend: SinkBackendKind::Postgres,
            database_url: None,
            http_url: None,
            table: "tick_quotes".to_string(),
            max_connections: 8,
            batch_size: 1_000,
            flush_interval_ms: 2_000,
            queue_cap: 200_000,
            max_inflight_batches: 4,
            write_timeout_ms: 15_000,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            retry_max_attempts: 5,
            spill_dir: PathBuf::from("./spill"),
            spill_cap_bytes: 100 * 1024 * 1024,
            spill_segment_max_bytes: 8 * 1024 * 1024,
            dead_letter_cap_bytes: 100 * 1024 * 1024,
            reclaim_interval_ms: 10_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// 데드레터 디렉토리.
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.spill_dir.join("dead-letter")
    }
}

/// 수퍼바이저 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// 종료 단계별 유예 시간 (싱크 제외)
    pub stage_grace_ms: u64,
    /// 헬스 판정 창
    pub health_window_ms: u64,
    /// degraded 판정 파서 거부율
    pub reject_rate_degraded: f64,
    /// 메트릭 요약 로그 주기
    pub metrics_log_interval_ms: u64,
    /// 파서 패닉 후 재시작 지연
    pub parser_restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stage_grace_ms: 5_000,
            health_window_ms: 60_000,
            reject_rate_degraded: 0.01,
            metrics_log_interval_ms: 30_000,
            parser_restart_delay_ms: 100,
        }
    }
}

impl SupervisorConfig {
    pub fn stage_grace(&self) -> Duration {
        Duration::from_millis(self.stage_grace_ms)
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_millis(self.health_window_ms)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_log_interval_ms)
    }

    pub fn parser_restart_delay(&self) -> Duration {
        Duration::from_millis(self.parser_restart_delay_ms)
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨 또는 필터 지시문
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
    /// span 진입/종료 이벤트 출력
    pub span_events: bool,
    /// 파일명/줄 번호 포함
    pub with_file: bool,
    /// 스레드 ID 포함
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            span_events: false,
            with_file: false,
            with_thread_ids: false,
        }
    }
}

/// 메트릭 노출 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Prometheus 리스너 주소 (None이면 노출하지 않음)
    pub metrics_listen: Option<String>,
    /// 카운터 → 메트릭 파사드 반영 주기
    pub export_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_listen: Some("0.0.0.0:9464".to_string()),
            export_interval_ms: 1_000,
        }
    }
}

impl TelemetryConfig {
    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }
}

impl PipelineConfig {
    /// 파일(선택)과 환경 변수에서 설정을 로드합니다.
    pub fn load(path: Option<&Path>) -> FeedResult<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TICKFEED")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("upstream.fallback_endpoints")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 로드합니다 (환경 변수 미적용).
    pub fn from_toml_str(source: &str) -> FeedResult<Self> {
        let config: PipelineConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 설정 값의 일관성을 검증합니다.
    pub fn validate(&self) -> FeedResult<()> {
        let up = &self.upstream;
        let sink = &self.sink;

        if up.endpoint.trim().is_empty() {
            return Err(config_err("upstream.endpoint는 필수입니다"));
        }
        if up.token.is_empty() {
            return Err(config_err("upstream.token은 필수입니다"));
        }
        if up.max_frame_size == 0 || up.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(config_err(format!(
                "upstream.max_frame_size는 1..={} 범위여야 합니다",
                MAX_FRAME_SIZE_LIMIT
            )));
        }
        if up.raw_queue_cap == 0 {
            return Err(config_err("upstream.raw_queue_cap은 0보다 커야 합니다"));
        }
        if up.auth_fail_max == 0 {
            return Err(config_err("upstream.auth_fail_max는 0보다 커야 합니다"));
        }
        if up.backoff_base_ms == 0 || up.backoff_base_ms > up.backoff_max_ms {
            return Err(config_err("upstream.backoff_base_ms는 (0, backoff_max_ms] 범위여야 합니다"));
        }
        if !(0.0..1.0).contains(&up.backoff_jitter) {
            return Err(config_err("upstream.backoff_jitter는 [0, 1) 범위여야 합니다"));
        }
        if up.idle_timeout_ms <= up.heartbeat_interval_ms {
            return Err(config_err(
                "upstream.idle_timeout_ms는 heartbeat_interval_ms보다 커야 합니다",
            ));
        }
        if self.parser.micro_batch_size == 0 || self.parser.parsed_batch_cap == 0 {
            return Err(config_err("parser 용량 값은 0보다 커야 합니다"));
        }
        if self.state.history_depth == 0 || self.state.max_symbols == 0 {
            return Err(config_err("state 용량 값은 0보다 커야 합니다"));
        }
        if self.hub.mailbox_cap_default == 0 || self.hub.prune_interval_ms == 0 {
            return Err(config_err("hub 용량/정리 주기 값은 0보다 커야 합니다"));
        }
        if sink.batch_size == 0 || sink.batch_size > sink.queue_cap {
            return Err(config_err("sink.batch_size는 (0, queue_cap] 범위여야 합니다"));
        }
        if sink.max_inflight_batches == 0 || sink.retry_max_attempts == 0 {
            return Err(config_err("sink 동시성/재시도 값은 0보다 커야 합니다"));
        }
        if sink.spill_segment_max_bytes == 0 || sink.spill_segment_max_bytes > sink.spill_cap_bytes {
            return Err(config_err(
                "sink.spill_segment_max_bytes는 (0, spill_cap_bytes] 범위여야 합니다",
            ));
        }
        match sink.backend {
            SinkBackendKind::Postgres if sink.database_url.is_none() => {
                return Err(config_err("postgres 백엔드에는 sink.database_url이 필요합니다"));
            }
            SinkBackendKind::Http if sink.http_url.is_none() => {
                return Err(config_err("http 백엔드에는 sink.http_url이 필요합니다"));
            }
            _ => {}
        }
        if !sink.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return Err(config_err("sink.table에 허용되지 않는 문자가 있습니다"));
        }

        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> FeedError {
    FeedError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [upstream]
        endpoint = "127.0.0.1:7709"
        token = "secret-token"

        [sink]
        backend = "memory"
    "#;

    #[test]
    fn test_defaults_match_contract() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.upstream.max_frame_size, 10 * 1024 * 1024);
        assert_eq!(config.upstream.raw_queue_cap, 100_000);
        assert_eq!(config.upstream.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.upstream.idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.upstream.auth_fail_max, 3);
        assert_eq!(config.upstream.max_retries, 10);
        assert_eq!(config.upstream.backoff_max(), Duration::from_secs(300));
        assert_eq!(config.parser.parsed_batch_cap, 200_000);
        assert_eq!(config.state.history_depth, 100);
        assert_eq!(config.state.max_symbols, 10_000);
        assert_eq!(config.sink.batch_size, 1_000);
        assert_eq!(config.sink.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.sink.max_inflight_batches, 4);
        assert_eq!(config.sink.spill_cap_bytes, 100 * 1024 * 1024);
        assert_eq!(config.hub.mailbox_cap_default, 10_000);
        assert_eq!(config.hub.prune_interval_ms, 1_000);
    }

    #[test]
    fn test_token_is_redacted() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.upstream.token.expose(), "secret-token");
        let debug = format!("{:?}", config.upstream);
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let err = PipelineConfig::from_toml_str("[sink]\nbackend = \"memory\"").unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let source = format!("{}\n", MINIMAL).replace(
            "token = \"secret-token\"",
            "token = \"secret-token\"\nmax_frame_size = 20000000",
        );
        assert!(PipelineConfig::from_toml_str(&source).is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        let source = MINIMAL.replace("backend = \"memory\"", "backend = \"postgres\"");
        assert!(PipelineConfig::from_toml_str(&source).is_err());
    }

    #[test]
    fn test_endpoints_order() {
        let mut config = UpstreamConfig::default();
        config.endpoint = "a:1".to_string();
        config.fallback_endpoints = vec!["b:2".to_string(), String::new()];
        assert_eq!(config.endpoints(), vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn test_recv_buffer_floor() {
        let mut config = UpstreamConfig::default();
        config.max_frame_size = 1024;
        assert_eq!(config.recv_buffer_size(), 64 * 1024);
        config.max_frame_size = MAX_FRAME_SIZE_LIMIT;
        assert_eq!(config.recv_buffer_size(), MAX_FRAME_SIZE_LIMIT / 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.upstream.endpoint, "127.0.0.1:7709");
        assert_eq!(config.sink.backend, SinkBackendKind::Memory);
    }

    #[test]
    fn test_shipped_default_file_parses() {
        let source = include_str!("../../../config/default.toml")
            .replace("# token = \"...\"", "token = \"t\"")
            .replace("backend = \"postgres\"", "backend = \"memory\"");
        let config = PipelineConfig::from_toml_str(&source).unwrap();
        let defaults = PipelineConfig::default();
        assert_eq!(config.upstream.raw_queue_cap, defaults.upstream.raw_queue_cap);
        assert_eq!(config.sink.spill_cap_bytes, defaults.sink.spill_cap_bytes);
        assert_eq!(config.supervisor.stage_grace_ms, defaults.supervisor.stage_grace_ms);
    }
}
