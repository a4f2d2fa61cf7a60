//! 배치 싱크 및 저장소.
//!
//! 이 crate는 다음을 제공합니다:
//! - 크기/시간 조건 배치 플러시와 동시 쓰기 제한
//! - `(symbol, source_seq)` 멱등 업서트 저장소 (PostgreSQL, HTTP, 메모리)
//! - 일시적 실패 재시도와 디스크 스필, 재전송
//! - 영구적 실패 데드레터 로그

pub mod error;
pub mod retry;
pub mod row;
pub mod sink;
pub mod spill;
pub mod store;

pub use error::{SinkError, SinkResult};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryStats};
pub use row::TickRow;
pub use sink::{BatchSink, SinkStats};
pub use spill::{AppendOutcome, SegmentLog, SegmentMeta, MANIFEST_FILE};
pub use store::{
    connect_store, FailureMode, HttpRowStore, MemoryRowStore, PgRowStore, RowStore,
};
