//! 틱 데이터 모델.
//!
//! - `Tick` - 검증을 통과한 단일 종목 시세 (생성 후 불변)
//! - `QuoteLevel` - 5단계 매수/매도 호가의 한 레벨
//! - `SharedTick` - 여러 소비자가 공유하는 `Arc<Tick>`

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::symbol::market_prefix;

/// 호가 단계 수.
pub const LADDER_DEPTH: usize = 5;

/// 여러 단계가 공유하는 불변 틱.
pub type SharedTick = Arc<Tick>;

/// 호가 레벨.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLevel {
    /// 호가
    pub price: Decimal,
    /// 잔량
    pub volume: i64,
}

/// 검증된 시세 틱.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// 정규화된 종목코드 (예: SH600000)
    pub symbol: String,
    /// 종목명
    pub name: String,
    /// 원천 타임스탬프 원문 (정렬에는 사용하지 않음)
    pub source_time: String,
    /// 시가
    pub open_price: Decimal,
    /// 고가 (0이면 미제공)
    pub high_price: Decimal,
    /// 저가 (0이면 미제공)
    pub low_price: Decimal,
    /// 현재가
    pub price: Decimal,
    /// 누적 거래량
    pub volume: i64,
    /// 누적 거래대금
    pub amount: Decimal,
    /// 등락률(%)
    pub change_percent: Decimal,
    /// 전일 종가
    pub prev_close: Decimal,
    /// 52주 최고가
    pub high_52w: Decimal,
    /// 52주 최저가
    pub low_52w: Decimal,
    /// 매수 호가 1~5단계
    pub bids: [QuoteLevel; LADDER_DEPTH],
    /// 매도 호가 1~5단계
    pub asks: [QuoteLevel; LADDER_DEPTH],
    /// 수신 시각 (프로세스 단조 시계, ns)
    pub timestamp_ns: u64,
    /// 정렬 기준 시퀀스
    pub source_seq: u64,
}

impl Tick {
    /// 필수 필드만으로 틱을 생성합니다. 나머지 수치 필드는 0입니다.
    pub fn new(symbol: impl Into<String>, name: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            source_time: String::new(),
            open_price: Decimal::ZERO,
            high_price: Decimal::ZERO,
            low_price: Decimal::ZERO,
            price,
            volume: 0,
            amount: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            prev_close: Decimal::ZERO,
            high_52w: Decimal::ZERO,
            low_52w: Decimal::ZERO,
            bids: [QuoteLevel::default(); LADDER_DEPTH],
            asks: [QuoteLevel::default(); LADDER_DEPTH],
            timestamp_ns: 0,
            source_seq: 0,
        }
    }

    /// 시퀀스와 수신 시각을 지정합니다.
    pub fn with_sequence(mut self, source_seq: u64, timestamp_ns: u64) -> Self {
        self.source_seq = source_seq;
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// 두 글자 시장 접두사.
    pub fn market_prefix(&self) -> Option<[u8; 2]> {
        market_prefix(&self.symbol)
    }

    /// 최우선 매수 호가.
    pub fn best_bid(&self) -> Option<Decimal> {
        let level = self.bids[0];
        (!level.price.is_zero()).then_some(level.price)
    }

    /// 최우선 매도 호가.
    pub fn best_ask(&self) -> Option<Decimal> {
        let level = self.asks[0];
        (!level.price.is_zero()).then_some(level.price)
    }

    /// 매수/매도 스프레드.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// 가격 범위 불변식을 확인합니다.
    ///
    /// 고가는 현재가 이상(또는 0), 저가는 현재가 이하(또는 0)이고,
    /// 둘 다 0보다 크면 고가 ≥ 저가여야 합니다.
    pub fn has_consistent_range(&self) -> bool {
        let high_ok = self.high_price.is_zero() || self.high_price >= self.price;
        let low_ok = self.low_price.is_zero() || self.low_price <= self.price;
        let order_ok = self.high_price.is_zero()
            || self.low_price.is_zero()
            || self.high_price >= self.low_price;
        high_ok && low_ok && order_ok
    }

    /// 메모리 사용량 근사치 (바이트). 싱크 버퍼 계측용.
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Tick>() + self.symbol.len() + self.name.len() + self.source_time.len()
    }
}
