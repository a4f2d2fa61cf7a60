//! # Tick Pipeline
//!
//! 수신기 → 파서 → 상태 저장소/허브/싱크를 하나의 파이프라인으로 조립하고
//! 감독합니다.
//!
//! - [`supervisor`]: 단계 조립, 엔드포인트 교체, 파서 재시작, 단계별 종료
//! - [`stages`]: 파서 단계와 허브 디스패처
//! - [`health`]: 헬스 판정과 파서 거부율 창
//! - [`telemetry`]: Prometheus 익스포터

pub mod health;
pub mod stages;
pub mod supervisor;
pub mod telemetry;

pub use health::{evaluate, HealthInputs, HealthReport, HealthStatus, RejectRateWindow};
pub use stages::{run_dispatcher, ParseStage, PendingBatch, SharedRawQueue};
pub use supervisor::{restart_on_panic, ShutdownReport, Supervisor};
