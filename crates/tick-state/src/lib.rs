//! # Tick State
//!
//! 검증된 틱의 메모리 내 상태와 구독자 분배를 담당합니다.
//!
//! - [`store`]: 종목별 최신 시세와 롤링 히스토리 (샤드 맵)
//! - [`hub`]: 필터/메일박스/드롭 정책을 갖춘 팬아웃 허브

pub mod hub;
pub mod store;

pub use hub::{DropPolicy, FanoutHub, HubStats, Subscription, SubscriptionFilter, SubscriptionId};
pub use store::{ApplyOutcome, StateStore, StoreStats, SymbolState};
