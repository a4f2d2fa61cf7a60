//! `$` 구분 레코드 파서.
//!
//! 필드 순서 (0부터):
//!
//! | 인덱스 | 필드 |
//! |---|---|
//! | 0 | 종목코드 |
//! | 1 | 종목명 |
//! | 2 | 원천 타임스탬프 |
//! | 3..=8 | 시가, 고가, 저가, 현재가, 거래량, 거래대금 |
//! | 9..=18 | 매수 1~5호가 (가격, 잔량) |
//! | 19..=28 | 매도 1~5호가 (가격, 잔량) |
//! | 29 | 등락률 |
//! | 30 | 전일 종가 |
//! | 31, 32 | 52주 최고가, 최저가 |
//!
//! 최소 10개 필드가 필요하며 뒤쪽 누락 필드는 0/빈 값입니다.
//! 숫자 파싱 실패는 거부가 아니라 0으로 대입하고 카운트합니다.
//! 현재가, 거래대금, 등락률은 저장 컬럼 정밀도 안에 있어야 합니다.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use tick_core::{
    normalize_symbol, MonotonicClock, PipelineMetrics, QuoteLevel, RejectReason,
    SequenceGenerator, SharedTick, Tick, LADDER_DEPTH,
};

use crate::codec::RawFrame;

/// 필드 구분자.
pub const FIELD_SEPARATOR: char = '$';

/// 최소 필드 수.
pub const MIN_FIELDS: usize = 10;

/// 인코딩 시 필드 수.
pub const FIELD_COUNT: usize = 33;

const IDX_SYMBOL: usize = 0;
const IDX_NAME: usize = 1;
const IDX_SOURCE_TS: usize = 2;
const IDX_OPEN: usize = 3;
const IDX_HIGH: usize = 4;
const IDX_LOW: usize = 5;
const IDX_PRICE: usize = 6;
const IDX_VOLUME: usize = 7;
const IDX_AMOUNT: usize = 8;
const IDX_BIDS: usize = 9;
const IDX_ASKS: usize = IDX_BIDS + LADDER_DEPTH * 2;
const IDX_CHANGE_PERCENT: usize = 29;
const IDX_PREV_CLOSE: usize = 30;
const IDX_HIGH_52W: usize = 31;
const IDX_LOW_52W: usize = 32;

/// 센티널(패딩) 종목코드 접두사.
const SENTINEL_PREFIX: &str = "0000";

/// 계산된 등락률의 소수 자릿수.
const CHANGE_PERCENT_DP: u32 = 4;

/// 저장 컬럼 정밀도 `(소수 자릿수, 정수부 자릿수)`.
const PRICE_PRECISION: (u32, u32) = (3, 7);
const AMOUNT_PRECISION: (u32, u32) = (2, 16);
const CHANGE_PERCENT_PRECISION: (u32, u32) = (CHANGE_PERCENT_DP, 4);

/// 레코드 하나를 파싱한 결과 (시퀀스/수신 시각 미지정).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub tick: Tick,
    /// 0으로 대입된 숫자 필드 수
    pub numeric_defaults: u32,
}

/// 숫자 필드 읽기. 실패 횟수를 누적합니다.
struct Fields<'a> {
    fields: Vec<&'a str>,
    numeric_defaults: u32,
}

impl<'a> Fields<'a> {
    fn get(&self, idx: usize) -> &'a str {
        self.fields.get(idx).copied().unwrap_or("")
    }

    fn decimal(&mut self, idx: usize) -> Decimal {
        self.try_decimal(idx).unwrap_or(Decimal::ZERO)
    }

    /// 비어 있으면 `None` (카운트하지 않음), 파싱 실패도 `None` (카운트).
    fn try_decimal(&mut self, idx: usize) -> Option<Decimal> {
        let raw = self.get(idx);
        if raw.is_empty() {
            return None;
        }
        match parse_decimal(raw) {
            Some(value) => Some(value),
            None => {
                self.numeric_defaults += 1;
                None
            }
        }
    }

    fn integer(&mut self, idx: usize) -> i64 {
        let raw = self.get(idx);
        if raw.is_empty() {
            return 0;
        }
        if let Ok(value) = raw.parse::<i64>() {
            return value;
        }
        // "1200.0" 같은 소수 표기 거래량
        match parse_decimal(raw).and_then(|d| d.trunc().to_i64()) {
            Some(value) => value,
            None => {
                self.numeric_defaults += 1;
                0
            }
        }
    }
}

/// 컬럼 스케일로 반올림한 값의 정수부가 자릿수 안에 들어가는지.
fn fits_precision(value: Decimal, (scale, integer_digits): (u32, u32)) -> bool {
    value.round_dp(scale).abs() < Decimal::from(10i64.pow(integer_digits))
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// 레코드 문자열을 틱으로 파싱합니다.
///
/// `timestamp_ns`와 `source_seq`는 0으로 남습니다. 스트림 처리에는
/// [`TickParser::parse_frame`]을 사용합니다.
pub fn parse_record(record: &str) -> Result<ParsedRecord, RejectReason> {
    let fields: Vec<&str> = record.split(FIELD_SEPARATOR).map(str::trim).collect();
    if fields.len() < MIN_FIELDS {
        return Err(RejectReason::TooFewFields);
    }
    let mut f = Fields {
        fields,
        numeric_defaults: 0,
    };

    let raw_symbol = f.get(IDX_SYMBOL);
    if raw_symbol.is_empty() {
        return Err(RejectReason::EmptySymbol);
    }
    if raw_symbol.starts_with(SENTINEL_PREFIX) {
        return Err(RejectReason::SentinelSymbol);
    }
    let symbol = normalize_symbol(raw_symbol).ok_or(RejectReason::InvalidSymbol)?;

    let name = f.get(IDX_NAME);
    if name.is_empty() {
        return Err(RejectReason::EmptyName);
    }

    let price = f.decimal(IDX_PRICE);
    if price <= Decimal::ZERO {
        return Err(RejectReason::NonpositivePrice);
    }

    let open_price = f.decimal(IDX_OPEN);
    let high_price = f.decimal(IDX_HIGH);
    let low_price = f.decimal(IDX_LOW);
    let volume = f.integer(IDX_VOLUME);
    let amount = f.decimal(IDX_AMOUNT);

    let mut bids = [QuoteLevel::default(); LADDER_DEPTH];
    let mut asks = [QuoteLevel::default(); LADDER_DEPTH];
    for level in 0..LADDER_DEPTH {
        bids[level] = QuoteLevel {
            price: f.decimal(IDX_BIDS + level * 2),
            volume: f.integer(IDX_BIDS + level * 2 + 1),
        };
        asks[level] = QuoteLevel {
            price: f.decimal(IDX_ASKS + level * 2),
            volume: f.integer(IDX_ASKS + level * 2 + 1),
        };
    }

    let explicit_change = f.try_decimal(IDX_CHANGE_PERCENT);
    let prev_close = f.decimal(IDX_PREV_CLOSE);
    let high_52w = f.decimal(IDX_HIGH_52W);
    let low_52w = f.decimal(IDX_LOW_52W);

    if volume < 0
        || amount < Decimal::ZERO
        || open_price < Decimal::ZERO
        || prev_close < Decimal::ZERO
        || high_price < Decimal::ZERO
        || low_price < Decimal::ZERO
    {
        return Err(RejectReason::NegativeField);
    }

    let change_percent = explicit_change.unwrap_or_else(|| {
        derive_change_percent(price, prev_close, open_price)
    });

    if !fits_precision(price, PRICE_PRECISION)
        || !fits_precision(amount, AMOUNT_PRECISION)
        || !fits_precision(change_percent, CHANGE_PERCENT_PRECISION)
    {
        return Err(RejectReason::OutOfRange);
    }

    let tick = Tick {
        symbol,
        name: name.to_string(),
        source_time: f.get(IDX_SOURCE_TS).to_string(),
        open_price,
        high_price,
        low_price,
        price,
        volume,
        amount,
        change_percent,
        prev_close,
        high_52w,
        low_52w,
        bids,
        asks,
        timestamp_ns: 0,
        source_seq: 0,
    };

    if !tick.has_consistent_range() {
        return Err(RejectReason::InconsistentRange);
    }

    Ok(ParsedRecord {
        tick,
        numeric_defaults: f.numeric_defaults,
    })
}

/// 등락률 계산: 전일 종가 기준, 없으면 시가 기준, 둘 다 없으면 0.
pub fn derive_change_percent(price: Decimal, prev_close: Decimal, open_price: Decimal) -> Decimal {
    let reference = if prev_close > Decimal::ZERO {
        prev_close
    } else if open_price > Decimal::ZERO {
        open_price
    } else {
        return Decimal::ZERO;
    };
    ((price - reference) / reference * Decimal::ONE_HUNDRED).round_dp(CHANGE_PERCENT_DP)
}

/// 틱을 와이어 레코드로 인코딩합니다.
///
/// `parse_record(&encode_record(t))`는 `timestamp_ns`/`source_seq`를 제외하고 `t`와 같습니다.
pub fn encode_record(tick: &Tick) -> String {
    let mut fields: Vec<String> = Vec::with_capacity(FIELD_COUNT);
    fields.push(tick.symbol.clone());
    fields.push(tick.name.clone());
    fields.push(tick.source_time.clone());
    fields.push(tick.open_price.to_string());
    fields.push(tick.high_price.to_string());
    fields.push(tick.low_price.to_string());
    fields.push(tick.price.to_string());
    fields.push(tick.volume.to_string());
    fields.push(tick.amount.to_string());
    for level in tick.bids.iter().chain(tick.asks.iter()) {
        fields.push(level.price.to_string());
        fields.push(level.volume.to_string());
    }
    fields.push(tick.change_percent.to_string());
    fields.push(tick.prev_close.to_string());
    fields.push(tick.high_52w.to_string());
    fields.push(tick.low_52w.to_string());
    fields.join("$")
}

/// 스트림 파서.
///
/// 수신 시각과 `source_seq`를 부여하고 카운터를 갱신합니다. 파싱된 틱은
/// `parser_inflight`에 잡히고, 하류로 넘긴 뒤 [`TickParser::commit`]으로
/// `parsed`에 옮겨집니다.
#[derive(Debug, Clone)]
pub struct TickParser {
    clock: MonotonicClock,
    sequence: Arc<SequenceGenerator>,
    metrics: Arc<PipelineMetrics>,
}

impl TickParser {
    pub fn new(
        clock: MonotonicClock,
        sequence: Arc<SequenceGenerator>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            clock,
            sequence,
            metrics,
        }
    }

    /// 프레임 하나를 파싱합니다. 거부된 레코드는 `None`.
    pub fn parse_frame(&self, frame: &RawFrame) -> Option<SharedTick> {
        let record = match std::str::from_utf8(&frame.payload) {
            Ok(record) => record,
            Err(_) => {
                self.metrics.record_reject(RejectReason::InvalidUtf8);
                return None;
            }
        };

        match parse_record(record) {
            Ok(parsed) => {
                if parsed.numeric_defaults > 0 {
                    PipelineMetrics::add(
                        &self.metrics.parser_numeric_defaults,
                        parsed.numeric_defaults as u64,
                    );
                }
                let tick = parsed
                    .tick
                    .with_sequence(self.sequence.next(), self.clock.now_ns());
                PipelineMetrics::incr(&self.metrics.parser_inflight);
                Some(Arc::new(tick))
            }
            Err(reason) => {
                self.metrics.record_reject(reason);
                tracing::trace!(
                    connection_id = frame.connection_id,
                    reason = %reason,
                    "레코드 거부"
                );
                None
            }
        }
    }

    /// 하류로 넘긴 틱 `count`개를 in-flight에서 parsed로 옮깁니다.
    pub fn commit(&self, count: u64) {
        PipelineMetrics::sub(&self.metrics.parser_inflight, count);
        PipelineMetrics::add(&self.metrics.parsed, count);
    }
}
