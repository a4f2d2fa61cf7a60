//! 파이프라인 단계 태스크.

pub mod dispatch;
pub mod parse;

pub use dispatch::run_dispatcher;
pub use parse::{ParseStage, PendingBatch, SharedRawQueue};
