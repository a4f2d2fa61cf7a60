//! # Tick Core
//!
//! 실시간 시세 수집 파이프라인의 핵심 타입을 제공합니다.
//!
//! 이 크레이트는 파이프라인 전반에서 사용되는 기본 요소를 제공합니다:
//! - 틱(Tick) 데이터 모델 및 호가 레벨
//! - A주 종목코드 규칙 (SH/SZ/BJ)
//! - 단조 시계 및 시퀀스 생성기
//! - 지수 백오프
//! - 파이프라인 설정 관리
//! - 로깅 인프라
//! - 파이프라인 카운터 (relaxed atomic)

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod symbol;
pub mod tick;

pub use backoff::Backoff;
pub use clock::{MonotonicClock, SequenceGenerator};
pub use config::*;
pub use error::*;
pub use logging::*;
pub use metrics::{MetricsSnapshot, PipelineMetrics, RejectReason, ShutdownStage};
pub use symbol::{market_prefix, normalize_symbol, Market};
pub use tick::{QuoteLevel, SharedTick, Tick, LADDER_DEPTH};
