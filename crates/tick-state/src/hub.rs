//! 팬아웃 허브.
//!
//! 구독마다 용량이 제한된 메일박스를 두고, 가득 찼을 때의 동작은 구독자가
//! 선택한 [`DropPolicy`]를 따릅니다. 구독자는 발행자를 막을 수 없습니다.
//!
//! 필터는 구독 시점에 색인으로 컴파일됩니다:
//! - 전체: 검사 없음
//! - 종목 집합: 종목코드 해시 조회
//! - 시장 접두사: 앞 두 바이트 비교
//!
//! 발행 경로는 copy-on-write 색인(`Arc<HubIndex>`)을 복제해 락 없이 순회하므로
//! 비용은 일치하는 구독 수에 비례합니다.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

use tick_core::{PipelineMetrics, SharedTick};

/// 구독 ID.
pub type SubscriptionId = u64;

/// 메일박스가 가득 찼을 때의 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// 가장 오래된 항목을 버리고 새 틱을 넣음
    #[default]
    DropOldest,
    /// 새 틱을 버림
    DropNewest,
    /// 메일박스를 닫고 구독을 제거
    CloseOnFull,
}

/// 구독 필터.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// 모든 종목
    All,
    /// 지정한 종목만
    Symbols(HashSet<String>),
    /// 두 글자 시장 접두사 (SH, SZ, BJ)
    Market(String),
}

impl SubscriptionFilter {
    /// 종목 집합 필터를 생성합니다.
    pub fn symbols<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SubscriptionFilter::Symbols(symbols.into_iter().map(Into::into).collect())
    }

    /// 시장 접두사 필터를 생성합니다.
    pub fn market(prefix: impl Into<String>) -> Self {
        SubscriptionFilter::Market(prefix.into().to_ascii_uppercase())
    }

    /// 틱이 필터에 해당하는지 확인합니다.
    pub fn matches(&self, symbol: &str) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Symbols(set) => set.contains(symbol),
            SubscriptionFilter::Market(prefix) => symbol.as_bytes().starts_with(prefix.as_bytes()),
        }
    }
}

/// 메일박스 제출 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Delivered,
    DeliveredEvicting,
    Dropped,
    ClosedOnFull,
    Inactive,
}

/// 구독 하나의 메일박스.
#[derive(Debug)]
struct Mailbox {
    id: SubscriptionId,
    capacity: usize,
    policy: DropPolicy,
    queue: Mutex<VecDeque<SharedTick>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(id: SubscriptionId, capacity: usize, policy: DropPolicy) -> Self {
        Self {
            id,
            capacity,
            policy,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn offer(&self, tick: &SharedTick) -> Offer {
        if self.is_closed() {
            return Offer::Inactive;
        }

        let mut queue = self.queue.lock();
        if queue.len() < self.capacity {
            queue.push_back(Arc::clone(tick));
            drop(queue);
            self.notify.notify_one();
            return Offer::Delivered;
        }

        match self.policy {
            DropPolicy::DropOldest => {
                queue.pop_front();
                queue.push_back(Arc::clone(tick));
                drop(queue);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                Offer::DeliveredEvicting
            }
            DropPolicy::DropNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped
            }
            DropPolicy::CloseOnFull => {
                drop(queue);
                self.close();
                Offer::ClosedOnFull
            }
        }
    }
}

/// 구독 핸들.
///
/// 핸들을 드롭하면 메일박스가 닫히고 허브가 다음 발행 때 제거합니다.
#[derive(Debug)]
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.mailbox.id
    }

    /// 다음 틱을 기다립니다. 닫히고 비어 있으면 `None`.
    pub async fn recv(&self) -> Option<SharedTick> {
        loop {
            let notified = self.mailbox.notify.notified();
            if let Some(tick) = self.mailbox.queue.lock().pop_front() {
                return Some(tick);
            }
            if self.mailbox.is_closed() {
                // 다른 대기자도 깨운다
                self.mailbox.notify.notify_one();
                return None;
            }
            notified.await;
        }
    }

    /// 대기 없이 꺼냅니다.
    pub fn try_recv(&self) -> Option<SharedTick> {
        self.mailbox.queue.lock().pop_front()
    }

    /// 현재 쌓인 틱 수.
    pub fn len(&self) -> usize {
        self.mailbox.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 드롭 정책으로 버려진 틱 수.
    pub fn dropped_count(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// 구독을 닫습니다. 이미 쌓인 틱은 계속 꺼낼 수 있습니다.
    pub fn close(&self) {
        self.mailbox.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}

/// 허브 통계.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// 활성 구독 수
    pub subscriptions: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub closed: u64,
}

/// 컴파일된 구독 색인.
#[derive(Debug, Default)]
struct HubIndex {
    entries: Vec<(Arc<Mailbox>, SubscriptionFilter)>,
    all: Vec<Arc<Mailbox>>,
    by_market: HashMap<[u8; 2], Vec<Arc<Mailbox>>>,
    by_symbol: HashMap<String, Vec<Arc<Mailbox>>>,
}

impl HubIndex {
    fn build(entries: Vec<(Arc<Mailbox>, SubscriptionFilter)>) -> Self {
        let mut index = HubIndex::default();
        for (mailbox, filter) in &entries {
            match filter {
                SubscriptionFilter::All => index.all.push(Arc::clone(mailbox)),
                SubscriptionFilter::Market(prefix) => {
                    let bytes = prefix.as_bytes();
                    if bytes.len() >= 2 {
                        index
                            .by_market
                            .entry([bytes[0], bytes[1]])
                            .or_default()
                            .push(Arc::clone(mailbox));
                    }
                }
                SubscriptionFilter::Symbols(symbols) => {
                    for symbol in symbols {
                        index
                            .by_symbol
                            .entry(symbol.clone())
                            .or_default()
                            .push(Arc::clone(mailbox));
                    }
                }
            }
        }
        index.entries = entries;
        index
    }

    fn matching<'a>(&'a self, symbol: &str) -> impl Iterator<Item = &'a Arc<Mailbox>> + 'a {
        let bytes = symbol.as_bytes();
        let market = if bytes.len() >= 2 {
            self.by_market.get(&[bytes[0], bytes[1]])
        } else {
            None
        };
        self.all
            .iter()
            .chain(market.into_iter().flatten())
            .chain(self.by_symbol.get(symbol).into_iter().flatten())
    }
}

/// 팬아웃 허브.
pub struct FanoutHub {
    index: RwLock<Arc<HubIndex>>,
    next_id: AtomicU64,
    default_capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl FanoutHub {
    /// 새 허브를 생성합니다.
    pub fn new(default_capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            index: RwLock::new(Arc::new(HubIndex::default())),
            next_id: AtomicU64::new(1),
            default_capacity: default_capacity.max(1),
            metrics,
        }
    }

    /// 구독을 등록합니다. `mailbox_cap`이 0이면 기본 용량을 사용합니다.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        mailbox_cap: usize,
        drop_policy: DropPolicy,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let capacity = if mailbox_cap == 0 {
            self.default_capacity
        } else {
            mailbox_cap
        };
        let mailbox = Arc::new(Mailbox::new(id, capacity, drop_policy));

        let mut guard = self.index.write();
        let mut entries: Vec<_> = guard
            .entries
            .iter()
            .filter(|(mb, _)| !mb.is_closed())
            .cloned()
            .collect();
        info!(subscription_id = id, filter = ?filter, capacity, policy = ?drop_policy, "구독 등록");
        entries.push((Arc::clone(&mailbox), filter));
        *guard = Arc::new(HubIndex::build(entries));

        Subscription { mailbox }
    }

    /// 구독을 해제합니다. 존재하지 않으면 false.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.index.write();
        let Some((mailbox, _)) = guard.entries.iter().find(|(mb, _)| mb.id == id) else {
            return false;
        };
        mailbox.close();
        let entries = guard
            .entries
            .iter()
            .filter(|(mb, _)| mb.id != id && !mb.is_closed())
            .cloned()
            .collect();
        *guard = Arc::new(HubIndex::build(entries));
        debug!(subscription_id = id, "구독 해제");
        true
    }

    /// 닫힌 구독을 색인에서 제거합니다.
    pub fn prune(&self) -> usize {
        let mut guard = self.index.write();
        let before = guard.entries.len();
        let entries: Vec<_> = guard
            .entries
            .iter()
            .filter(|(mb, _)| !mb.is_closed())
            .cloned()
            .collect();
        let removed = before - entries.len();
        if removed > 0 {
            *guard = Arc::new(HubIndex::build(entries));
            debug!(removed, "닫힌 구독 정리");
        }
        removed
    }

    fn current(&self) -> Arc<HubIndex> {
        Arc::clone(&self.index.read())
    }

    /// 틱 하나를 일치하는 구독에 전달합니다. 전달된 구독 수를 반환합니다.
    pub fn publish(&self, tick: &SharedTick) -> usize {
        let index = self.current();
        let mut tally = Tally::default();
        Self::offer_all(&index, tick, &mut tally);
        self.settle(tally)
    }

    /// 배치를 순서대로 전달합니다.
    pub fn publish_batch(&self, ticks: &[SharedTick]) -> usize {
        let index = self.current();
        let mut tally = Tally::default();
        for tick in ticks {
            Self::offer_all(&index, tick, &mut tally);
        }
        self.settle(tally)
    }

    fn offer_all(index: &HubIndex, tick: &SharedTick, tally: &mut Tally) {
        for mailbox in index.matching(&tick.symbol) {
            match mailbox.offer(tick) {
                Offer::Delivered => tally.delivered += 1,
                Offer::DeliveredEvicting => {
                    tally.delivered += 1;
                    tally.dropped += 1;
                }
                Offer::Dropped => tally.dropped += 1,
                Offer::ClosedOnFull => {
                    tally.closed += 1;
                    tally.stale = true;
                }
                Offer::Inactive => tally.stale = true,
            }
        }
    }

    fn settle(&self, tally: Tally) -> usize {
        PipelineMetrics::add(&self.metrics.hub_delivered, tally.delivered as u64);
        PipelineMetrics::add(&self.metrics.hub_dropped, tally.dropped);
        PipelineMetrics::add(&self.metrics.hub_closed, tally.closed);
        if tally.stale {
            self.prune();
        }
        tally.delivered
    }

    /// 활성 구독 수.
    pub fn subscription_count(&self) -> usize {
        self.current()
            .entries
            .iter()
            .filter(|(mb, _)| !mb.is_closed())
            .count()
    }

    /// 허브 통계.
    pub fn stats(&self) -> HubStats {
        HubStats {
            subscriptions: self.subscription_count(),
            delivered: PipelineMetrics::get(&self.metrics.hub_delivered),
            dropped: PipelineMetrics::get(&self.metrics.hub_dropped),
            closed: PipelineMetrics::get(&self.metrics.hub_closed),
        }
    }

    /// 모든 구독을 닫습니다 (종료 시).
    pub fn close_all(&self) {
        let mut guard = self.index.write();
        for (mailbox, _) in &guard.entries {
            mailbox.close();
        }
        *guard = Arc::new(HubIndex::default());
    }
}

#[derive(Default)]
struct Tally {
    delivered: usize,
    dropped: u64,
    closed: u64,
    stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tick_core::Tick;

    fn hub() -> (FanoutHub, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        (FanoutHub::new(16, metrics.clone()), metrics)
    }

    fn tick(symbol: &str, seq: u64) -> SharedTick {
        Arc::new(Tick::new(symbol, "테스트", dec!(1.0)).with_sequence(seq, seq))
    }

    fn drain(sub: &Subscription) -> Vec<u64> {
        std::iter::from_fn(|| sub.try_recv()).map(|t| t.source_seq).collect()
    }

    #[test]
    fn test_filters_route_ticks() {
        let (hub, _) = hub();
        let all = hub.subscribe(SubscriptionFilter::All, 0, DropPolicy::DropOldest);
        let sz = hub.subscribe(SubscriptionFilter::market("sz"), 0, DropPolicy::DropOldest);
        let one = hub.subscribe(
            SubscriptionFilter::symbols(["SH600000"]),
            0,
            DropPolicy::DropOldest,
        );

        hub.publish(&tick("SH600000", 1));
        hub.publish(&tick("SZ000001", 2));
        hub.publish(&tick("BJ830799", 3));

        assert_eq!(drain(&all), vec![1, 2, 3]);
        assert_eq!(drain(&sz), vec![2]);
        assert_eq!(drain(&one), vec![1]);
    }

    #[test]
    fn test_drop_oldest() {
        let (hub, metrics) = hub();
        let sub = hub.subscribe(SubscriptionFilter::All, 3, DropPolicy::DropOldest);
        for seq in 1..=5 {
            hub.publish(&tick("SH600000", seq));
        }
        assert_eq!(drain(&sub), vec![3, 4, 5]);
        assert_eq!(sub.dropped_count(), 2);
        assert_eq!(PipelineMetrics::get(&metrics.hub_dropped), 2);
    }

    #[test]
    fn test_drop_newest() {
        let (hub, _) = hub();
        let sub = hub.subscribe(SubscriptionFilter::All, 3, DropPolicy::DropNewest);
        for seq in 1..=5 {
            hub.publish(&tick("SH600000", seq));
        }
        assert_eq!(drain(&sub), vec![1, 2, 3]);
        assert_eq!(sub.dropped_count(), 2);
    }

    #[test]
    fn test_close_on_full_removes_subscription() {
        let (hub, metrics) = hub();
        let sub = hub.subscribe(SubscriptionFilter::All, 2, DropPolicy::CloseOnFull);
        let other = hub.subscribe(SubscriptionFilter::All, 10, DropPolicy::DropOldest);
        for seq in 1..=4 {
            hub.publish(&tick("SH600000", seq));
        }

        assert!(sub.is_closed());
        assert_eq!(drain(&sub), vec![1, 2]);
        assert_eq!(drain(&other), vec![1, 2, 3, 4]);
        assert_eq!(hub.subscription_count(), 1);
        assert_eq!(PipelineMetrics::get(&metrics.hub_closed), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop_prune() {
        let (hub, _) = hub();
        let a = hub.subscribe(SubscriptionFilter::All, 0, DropPolicy::DropOldest);
        let b = hub.subscribe(SubscriptionFilter::All, 0, DropPolicy::DropOldest);
        assert_eq!(hub.subscription_count(), 2);

        assert!(hub.unsubscribe(a.id()));
        assert!(!hub.unsubscribe(a.id()));
        assert!(a.is_closed());

        drop(b);
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(hub.publish(&tick("SH600000", 1)), 0);
        assert_eq!(hub.stats().subscriptions, 0);
    }

    #[test]
    fn test_publish_batch_keeps_order() {
        let (hub, metrics) = hub();
        let sub = hub.subscribe(SubscriptionFilter::market("SH"), 100, DropPolicy::DropOldest);
        let batch: Vec<SharedTick> = (1..=10)
            .map(|seq| tick(if seq % 2 == 0 { "SH600000" } else { "SZ000001" }, seq))
            .collect();
        assert_eq!(hub.publish_batch(&batch), 5);
        assert_eq!(drain(&sub), vec![2, 4, 6, 8, 10]);
        assert_eq!(PipelineMetrics::get(&metrics.hub_delivered), 5);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish_and_close() {
        let (hub, _) = hub();
        let hub = Arc::new(hub);
        let sub = hub.subscribe(SubscriptionFilter::All, 0, DropPolicy::DropOldest);

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                hub.publish(&tick("SH600000", 7));
                tokio::time::sleep(Duration::from_millis(20)).await;
                hub.close_all();
            })
        };

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(first.unwrap().source_seq, 7);
        let end = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        publisher.await.unwrap();
    }
}
