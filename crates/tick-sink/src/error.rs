//! 싱크 에러 타입.
//!
//! 원격 쓰기 실패는 재시도 여부에 따라 두 갈래로 나뉩니다:
//! - **일시적**: 재시도 후 스필 (연결 끊김, 타임아웃, 5xx, 429, 락 경합)
//! - **영구적**: 즉시 데드레터 (4xx, 스키마 불일치, 제약 위반)

use thiserror::Error;

use tick_core::FeedError;

/// 싱크 에러.
#[derive(Debug, Error)]
pub enum SinkError {
    /// 재시도하면 성공할 수 있는 원격 저장소 에러
    #[error("일시적 저장소 에러: {0}")]
    Transient(String),

    /// 재시도해도 실패하는 원격 저장소 에러
    #[error("영구적 저장소 에러: {0}")]
    Permanent(String),

    /// 원격 쓰기 타임아웃
    #[error("쓰기 타임아웃: {0}ms")]
    Timeout(u64),

    /// 스필 세그먼트 에러
    #[error("스필 에러: {0}")]
    Spill(String),

    /// 파일 I/O 에러
    #[error("I/O 에러: {0}")]
    Io(#[from] std::io::Error),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 설정 에러
    #[error("싱크 설정 에러: {0}")]
    Config(String),
}

/// 싱크 작업 Result 타입.
pub type SinkResult<T> = Result<T, SinkError>;

impl SinkError {
    /// 재시도 대상인지 확인합니다.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_) | SinkError::Timeout(_))
    }

    /// 데드레터로 보내야 하는지 확인합니다.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SinkError::Permanent(_) | SinkError::Serialization(_))
    }
}

/// PostgreSQL SQLSTATE를 일시적/영구적으로 분류합니다.
///
/// - 08xxx 연결, 40001/40P01 직렬화/교착, 53xxx 자원 부족, 57xxx 운영자 개입,
///   55P03 락 획득 실패: 일시적
/// - 21xxx 카디널리티, 22xxx 데이터, 23xxx 무결성, 42xxx 스키마/문법: 영구적
/// - 그 외: 일시적 (스필로 보존)
pub fn classify_sqlstate(code: &str) -> bool {
    let class = code.get(..2).unwrap_or("");
    !matches!(class, "21" | "22" | "23" | "42")
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().unwrap_or_default().to_string();
                let message = format!("[{}] {}", code, db_err.message());
                if classify_sqlstate(&code) {
                    SinkError::Transient(message)
                } else {
                    SinkError::Permanent(message)
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => SinkError::Transient(err.to_string()),
            _ => SinkError::Permanent(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            SinkError::Transient(err.to_string())
        } else {
            SinkError::Permanent(err.to_string())
        }
    }
}

/// HTTP 상태 코드 분류: 429와 5xx는 일시적, 나머지 4xx는 영구적.
pub fn classify_status(status: u16, message: String) -> SinkError {
    if status == 429 || status >= 500 {
        SinkError::Transient(format!("HTTP {}: {}", status, message))
    } else {
        SinkError::Permanent(format!("HTTP {}: {}", status, message))
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err.to_string())
    }
}

impl From<SinkError> for FeedError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Spill(msg) => FeedError::Spill(msg),
            SinkError::Io(e) => FeedError::Io(e),
            SinkError::Serialization(msg) => FeedError::Serialization(msg),
            SinkError::Config(msg) => FeedError::Config(msg),
            SinkError::Timeout(ms) => FeedError::Timeout(format!("쓰기 {}ms", ms)),
            other => FeedError::Storage(other.to_string()),
        }
    }
}
