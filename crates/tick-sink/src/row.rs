//! 다운스트림 행 모델.
//!
//! `tick_quotes` 테이블 스키마와 1:1로 대응합니다:
//! `symbol, source_seq, price numeric(10,3), volume bigint, amount numeric(18,2),
//! change_percent numeric(8,4), received_at timestamptz, payload jsonb`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tick_core::{MonotonicClock, Tick};

/// 쓰기 단위 행. 스필 세그먼트에도 이 형태 그대로 직렬화됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRow {
    pub symbol: String,
    pub source_seq: i64,
    pub price: Decimal,
    pub volume: i64,
    pub amount: Decimal,
    pub change_percent: Decimal,
    pub received_at: DateTime<Utc>,
    /// 전체 틱 (호가 포함)
    pub payload: serde_json::Value,
}

impl TickRow {
    /// 틱을 행으로 변환합니다. 수치는 컬럼 스케일에 맞춰 반올림합니다.
    pub fn from_tick(tick: &Tick, clock: &MonotonicClock) -> Result<Self, serde_json::Error> {
        Ok(Self {
            symbol: tick.symbol.clone(),
            source_seq: tick.source_seq.min(i64::MAX as u64) as i64,
            price: tick.price.round_dp(3),
            volume: tick.volume,
            amount: tick.amount.round_dp(2),
            change_percent: tick.change_percent.round_dp(4),
            received_at: clock.to_wall(tick.timestamp_ns),
            payload: serde_json::to_value(tick)?,
        })
    }

    /// 업서트 키.
    pub fn key(&self) -> (&str, i64) {
        (&self.symbol, self.source_seq)
    }
}

/// 배치의 시퀀스 범위 `(first, last)`.
pub fn seq_range(rows: &[TickRow]) -> Option<(i64, i64)> {
    let first = rows.iter().map(|r| r.source_seq).min()?;
    let last = rows.iter().map(|r| r.source_seq).max()?;
    Some((first, last))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn sample_row(symbol: &str, seq: i64) -> TickRow {
        TickRow {
            symbol: symbol.to_string(),
            source_seq: seq,
            price: dec!(10.123),
            volume: 1_000,
            amount: dec!(10123.00),
            change_percent: dec!(1.2300),
            received_at: DateTime::<Utc>::from_timestamp(1_709_256_603, 0).unwrap_or_default(),
            payload: serde_json::json!({ "symbol": symbol }),
        }
    }

    pub fn sample_rows(count: usize, first_seq: i64) -> Vec<TickRow> {
        (0..count)
            .map(|i| sample_row("SH600000", first_seq + i as i64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_from_tick_rounds_to_column_scale() {
        let clock = MonotonicClock::new();
        let mut tick = Tick::new("SZ000001", "平安银行", dec!(12.34567)).with_sequence(42, 1_000);
        tick.amount = dec!(100.456);
        tick.change_percent = dec!(0.123456);

        let row = TickRow::from_tick(&tick, &clock).unwrap();
        assert_eq!(row.price, dec!(12.346));
        assert_eq!(row.amount, dec!(100.46));
        assert_eq!(row.change_percent, dec!(0.1235));
        assert_eq!(row.key(), ("SZ000001", 42));
        assert_eq!(row.received_at, clock.to_wall(1_000));
        assert_eq!(row.payload["name"], "平安银行");
    }

    #[test]
    fn test_seq_range() {
        let rows = fixtures::sample_rows(3, 10);
        assert_eq!(seq_range(&rows), Some((10, 12)));
        assert_eq!(seq_range(&[]), None);
    }
}
