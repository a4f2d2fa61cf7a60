//! tracing 기반 로깅 초기화.
//!
//! 출력 형식은 세 가지를 지원합니다:
//! - **pretty**: 개발용
//! - **json**: 로그 수집기 연동용 (운영)
//! - **compact**: 한 줄 형식
//!
//! `RUST_LOG`가 설정되어 있으면 설정 파일의 레벨보다 우선합니다.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// 파이프라인 크레이트들의 기본 필터.
const DEFAULT_DIRECTIVES: &str =
    "tick_core={level},tick_ingest={level},tick_state={level},tick_sink={level},tick_pipeline={level},warn";

/// 로그 출력 형식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// 색상 포함 여러 줄 형식
    #[default]
    Pretty,
    /// JSON 한 줄 형식
    Json,
    /// 간결한 한 줄 형식
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(format!("알 수 없는 로그 형식: {}", other)),
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 기본 레벨 (예: "info") 또는 완전한 필터 지시문
    pub level: String,
    /// 출력 형식
    pub format: LogFormat,
    /// span 진입/종료 이벤트 출력 여부
    pub with_span_events: bool,
    /// 파일명/줄 번호 포함 여부
    pub with_file: bool,
    /// 스레드 ID 포함 여부
    pub with_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file: false,
            with_thread_ids: false,
        }
    }
}

impl LogConfig {
    /// 주어진 레벨로 설정을 생성합니다.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// 출력 형식을 지정합니다.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// span 이벤트 출력을 지정합니다.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// 파이프라인 설정의 `[logging]` 섹션에서 생성합니다.
    pub fn from_section(section: &LoggingConfig) -> Self {
        Self {
            level: section.level.clone(),
            format: section.format.parse().unwrap_or_default(),
            with_span_events: section.span_events,
            with_file: section.with_file,
            with_thread_ids: section.with_thread_ids,
        }
    }

    /// 레벨 문자열을 필터 지시문으로 확장합니다.
    ///
    /// 단일 레벨("debug")이면 파이프라인 크레이트에만 적용하고 나머지는 warn으로 둡니다.
    /// `=`나 `,`가 포함되어 있으면 이미 완전한 지시문으로 간주합니다.
    pub fn directives(&self) -> String {
        if self.level.contains('=') || self.level.contains(',') {
            self.level.clone()
        } else {
            DEFAULT_DIRECTIVES.replace("{level}", &self.level)
        }
    }
}

/// 로깅 시스템을 초기화합니다.
///
/// # 예제
///
/// ```no_run
/// use tick_core::logging::{init_logging, LogConfig, LogFormat};
///
/// init_logging(LogConfig::new("debug").with_format(LogFormat::Json)).unwrap();
/// ```
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.directives()))?;

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_thread_ids(config.with_thread_ids)
        .with_span_events(span_events);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Json => base.json().flatten_event(true).boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()?;

    tracing::info!(format = ?config.format, level = %config.level, "로깅 초기화 완료");
    Ok(())
}

/// 연결 단위 컨텍스트 필드가 포함된 span을 생성하는 매크로.
#[macro_export]
macro_rules! connection_span {
    ($name:expr, $endpoint:expr) => {
        tracing::info_span!($name, endpoint = %$endpoint)
    };
    ($name:expr, $endpoint:expr, $connection_id:expr) => {
        tracing::info_span!($name, endpoint = %$endpoint, connection_id = $connection_id)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_directives_expand_single_level() {
        let config = LogConfig::new("debug");
        let directives = config.directives();
        assert!(directives.contains("tick_ingest=debug"));
        assert!(directives.ends_with(",warn"));
    }

    #[test]
    fn test_directives_keep_full_filter() {
        let config = LogConfig::new("tick_sink=trace,info");
        assert_eq!(config.directives(), "tick_sink=trace,info");
    }

    #[test]
    fn test_from_section() {
        let section = LoggingConfig {
            level: "warn".to_string(),
            format: "json".to_string(),
            span_events: true,
            with_file: false,
            with_thread_ids: true,
        };
        let config = LogConfig::from_section(&section);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert!(config.with_thread_ids);
    }
}
