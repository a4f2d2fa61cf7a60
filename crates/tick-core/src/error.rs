//! 파이프라인 공통 에러 타입.
//!
//! 컴포넌트별 세부 에러(`FrameError`, `SinkError` 등)는 각 크레이트에 있고,
//! 이 모듈은 컴포넌트 경계를 넘어 전달되는 에러를 정의합니다.

use thiserror::Error;

/// 파이프라인 공통 에러.
#[derive(Debug, Error)]
pub enum FeedError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 네트워크 에러 (연결 거부, DNS 실패, 소켓 리셋)
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 인증 거부
    #[error("인증 에러: {0}")]
    Auth(String),

    /// 프레임 무결성 에러
    #[error("프레임 에러: {0}")]
    Frame(String),

    /// 레코드 파싱 에러
    #[error("파싱 에러: {0}")]
    Parse(String),

    /// 원격 저장소 에러
    #[error("저장소 에러: {0}")]
    Storage(String),

    /// 스필 세그먼트 에러
    #[error("스필 에러: {0}")]
    Spill(String),

    /// 파일 I/O 에러
    #[error("I/O 에러: {0}")]
    Io(#[from] std::io::Error),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),

    /// 타임아웃
    #[error("타임아웃: {0}")]
    Timeout(String),

    /// 종료 진행 중
    #[error("종료 중: {0}")]
    Shutdown(String),
}

/// 파이프라인 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Network(_) | FeedError::Timeout(_) | FeedError::Frame(_)
        )
    }

    /// 파이프라인을 종료시켜야 하는 치명적인 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Auth(_) | FeedError::Config(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        FeedError::Config(err.to_string())
    }
}
