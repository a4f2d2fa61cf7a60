//! 종목별 최신 시세 저장소.
//!
//! `DashMap` 샤드 락으로 종목별 `apply`를 직렬화하고, 조회는 `Arc<Tick>` 복사본을
//! 반환하므로 읽기 측이 락을 오래 잡지 않습니다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use tick_core::{MonotonicClock, PipelineMetrics, SharedTick, StateConfig};

/// 종목 하나의 상태.
#[derive(Debug, Clone)]
pub struct SymbolState {
    /// 최신 틱
    pub latest: SharedTick,
    /// 이전 틱 (오래된 것부터, 최대 `history_depth`개)
    pub history: VecDeque<SharedTick>,
    /// 마지막 갱신 시각 (단조 ns)
    pub last_update_ns: u64,
}

impl SymbolState {
    fn new(tick: SharedTick) -> Self {
        Self {
            last_update_ns: tick.timestamp_ns,
            latest: tick,
            history: VecDeque::new(),
        }
    }
}

/// `apply` 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 새 종목 등록
    Inserted,
    /// 기존 종목 갱신
    Updated,
    /// 이미 반영된 시퀀스 (무시)
    Stale,
    /// 종목 수 상한 도달 (거부)
    SymbolCapReached,
}

impl ApplyOutcome {
    /// 상태에 반영되었는지 여부.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated)
    }
}

/// 저장소 통계.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub symbol_count: usize,
    pub total_updates: u64,
    /// 가장 오래 갱신되지 않은 종목의 경과 시간 (종목이 없으면 None)
    pub oldest_update_age_ns: Option<u64>,
}

/// 종목별 상태 저장소.
pub struct StateStore {
    symbols: DashMap<String, SymbolState>,
    symbol_count: AtomicUsize,
    total_updates: AtomicU64,
    history_depth: usize,
    max_symbols: usize,
    clock: MonotonicClock,
    metrics: Arc<PipelineMetrics>,
}

impl StateStore {
    /// 새 저장소를 생성합니다.
    pub fn new(config: &StateConfig, clock: MonotonicClock, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            symbols: DashMap::with_capacity(config.max_symbols.min(16_384)),
            symbol_count: AtomicUsize::new(0),
            total_updates: AtomicU64::new(0),
            history_depth: config.history_depth,
            max_symbols: config.max_symbols,
            clock,
            metrics,
        }
    }

    /// 틱을 반영합니다.
    ///
    /// `source_seq`가 저장된 최신 값 이하이면 무시합니다 (멱등).
    pub fn apply(&self, tick: SharedTick) -> ApplyOutcome {
        if let Some(mut state) = self.symbols.get_mut(&tick.symbol) {
            return self.update(&mut state, tick);
        }

        match self.symbols.entry(tick.symbol.clone()) {
            Entry::Occupied(mut occupied) => self.update(occupied.get_mut(), tick),
            Entry::Vacant(vacant) => {
                if !self.reserve_symbol() {
                    PipelineMetrics::incr(&self.metrics.state_symbol_cap_reached);
                    return ApplyOutcome::SymbolCapReached;
                }
                vacant.insert(SymbolState::new(tick));
                self.total_updates.fetch_add(1, Ordering::Relaxed);
                ApplyOutcome::Inserted
            }
        }
    }

    /// 배치를 순서대로 반영하고, 반영된 틱만 반환합니다.
    pub fn apply_batch(&self, ticks: &[SharedTick]) -> Vec<SharedTick> {
        ticks
            .iter()
            .filter(|tick| self.apply(Arc::clone(tick)).is_accepted())
            .cloned()
            .collect()
    }

    fn update(&self, state: &mut SymbolState, tick: SharedTick) -> ApplyOutcome {
        if tick.source_seq <= state.latest.source_seq {
            PipelineMetrics::incr(&self.metrics.state_stale_ignored);
            return ApplyOutcome::Stale;
        }

        let previous = std::mem::replace(&mut state.latest, tick);
        state.last_update_ns = state.latest.timestamp_ns;
        if self.history_depth > 0 {
            state.history.push_back(previous);
            while state.history.len() > self.history_depth {
                state.history.pop_front();
            }
        }
        self.total_updates.fetch_add(1, Ordering::Relaxed);
        ApplyOutcome::Updated
    }

    fn reserve_symbol(&self) -> bool {
        self.symbol_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_symbols).then_some(count + 1)
            })
            .is_ok()
    }

    /// 종목의 최신 틱.
    pub fn snapshot(&self, symbol: &str) -> Option<SharedTick> {
        self.symbols.get(symbol).map(|state| Arc::clone(&state.latest))
    }

    /// 시장 접두사(예: "SH")에 해당하는 모든 종목의 최신 틱. 순서는 보장하지 않습니다.
    pub fn snapshot_market(&self, prefix: &str) -> Vec<SharedTick> {
        let prefix = prefix.as_bytes();
        if prefix.len() != 2 {
            return Vec::new();
        }
        self.symbols
            .iter()
            .filter(|entry| entry.key().as_bytes().starts_with(prefix))
            .map(|entry| Arc::clone(&entry.value().latest))
            .collect()
    }

    /// 최근 최대 `n`개 틱 (오래된 것부터, 최신 포함).
    pub fn history(&self, symbol: &str, n: usize) -> Vec<SharedTick> {
        let Some(state) = self.symbols.get(symbol) else {
            return Vec::new();
        };
        if n == 0 {
            return Vec::new();
        }
        let from_history = (n - 1).min(state.history.len());
        let skip = state.history.len() - from_history;
        state
            .history
            .iter()
            .skip(skip)
            .cloned()
            .chain(std::iter::once(Arc::clone(&state.latest)))
            .collect()
    }

    /// 등록된 종목코드 (정렬).
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.symbol_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 저장소 통계.
    pub fn stats(&self) -> StoreStats {
        let oldest = self
            .symbols
            .iter()
            .map(|entry| entry.value().last_update_ns)
            .min();

        StoreStats {
            symbol_count: self.len(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            oldest_update_age_ns: oldest.map(|ns| self.clock.age_ns(ns)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tick_core::Tick;

    fn store(history_depth: usize, max_symbols: usize) -> (StateStore, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let config = StateConfig {
            history_depth,
            max_symbols,
        };
        (
            StateStore::new(&config, MonotonicClock::new(), metrics.clone()),
            metrics,
        )
    }

    fn tick(symbol: &str, seq: u64) -> SharedTick {
        Arc::new(Tick::new(symbol, "테스트", dec!(10.5)).with_sequence(seq, seq * 10))
    }

    #[test]
    fn test_apply_and_snapshot() {
        let (store, _) = store(10, 100);
        assert_eq!(store.apply(tick("SH600000", 1)), ApplyOutcome::Inserted);
        assert_eq!(store.apply(tick("SH600000", 2)), ApplyOutcome::Updated);

        let latest = store.snapshot("SH600000").unwrap();
        assert_eq!(latest.source_seq, 2);
        assert!(store.snapshot("SZ000001").is_none());
        assert_eq!(store.stats().total_updates, 2);
    }

    #[test]
    fn test_apply_is_idempotent_on_sequence() {
        let (store, metrics) = store(10, 100);
        store.apply(tick("SH600000", 5));
        assert_eq!(store.apply(tick("SH600000", 5)), ApplyOutcome::Stale);
        assert_eq!(store.apply(tick("SH600000", 3)), ApplyOutcome::Stale);

        assert_eq!(store.snapshot("SH600000").unwrap().source_seq, 5);
        assert_eq!(store.history("SH600000", 10).len(), 1);
        assert_eq!(PipelineMetrics::get(&metrics.state_stale_ignored), 2);
    }

    #[test]
    fn test_history_bounded_and_ordered() {
        let (store, _) = store(3, 100);
        for seq in 1..=10 {
            store.apply(tick("SZ000001", seq));
        }

        let history = store.history("SZ000001", 100);
        let seqs: Vec<u64> = history.iter().map(|t| t.source_seq).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);

        let recent: Vec<u64> = store
            .history("SZ000001", 2)
            .iter()
            .map(|t| t.source_seq)
            .collect();
        assert_eq!(recent, vec![9, 10]);
        assert!(store.history("SZ000001", 0).is_empty());
    }

    #[test]
    fn test_symbol_cap() {
        let (store, metrics) = store(5, 2);
        assert!(store.apply(tick("SH600000", 1)).is_accepted());
        assert!(store.apply(tick("SH600001", 2)).is_accepted());
        assert_eq!(store.apply(tick("SH600002", 3)), ApplyOutcome::SymbolCapReached);
        // 기존 종목 갱신은 계속 허용
        assert!(store.apply(tick("SH600000", 4)).is_accepted());

        assert_eq!(store.len(), 2);
        assert_eq!(PipelineMetrics::get(&metrics.state_symbol_cap_reached), 1);
    }

    #[test]
    fn test_snapshot_market_and_symbols() {
        let (store, _) = store(5, 100);
        store.apply(tick("SH600000", 1));
        store.apply(tick("SZ000001", 2));
        store.apply(tick("SZ300750", 3));
        store.apply(tick("BJ830799", 4));

        assert_eq!(store.snapshot_market("SZ").len(), 2);
        assert_eq!(store.snapshot_market("BJ").len(), 1);
        assert!(store.snapshot_market("S").is_empty());
        assert_eq!(
            store.symbols(),
            vec!["BJ830799", "SH600000", "SZ000001", "SZ300750"]
        );
    }

    #[test]
    fn test_apply_batch_returns_accepted() {
        let (store, _) = store(5, 100);
        let batch = vec![tick("SH600000", 2), tick("SH600000", 1), tick("SH600000", 3)];
        let accepted = store.apply_batch(&batch);
        let seqs: Vec<u64> = accepted.iter().map(|t| t.source_seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_stats_oldest_age() {
        let (store, _) = store(5, 100);
        assert_eq!(store.stats().oldest_update_age_ns, None);
        store.apply(tick("SH600000", 1));
        let stats = store.stats();
        assert_eq!(stats.symbol_count, 1);
        assert!(stats.oldest_update_age_ns.is_some());
    }

    #[test]
    fn test_concurrent_apply_preserves_latest() {
        let (store, _) = store(100, 10_000);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for seq in 0..1000u64 {
                        store.apply(tick("SH600000", seq * 4 + worker + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.snapshot("SH600000").unwrap().source_seq, 4000);
        let history = store.history("SH600000", 101);
        assert!(history.windows(2).all(|w| w[0].source_seq < w[1].source_seq));
    }
}
