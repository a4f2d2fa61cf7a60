//! 허브 디스패처.
//!
//! 허브 입력 큐의 배치를 구독자 메일박스로 전달합니다. 입력 큐가 닫히면
//! 남은 배치를 모두 전달한 뒤 끝납니다. 발행이 없어도 드롭된 구독 핸들은
//! `prune_interval`마다 색인에서 빠집니다.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use tick_core::SharedTick;
use tick_state::FanoutHub;

/// 입력 큐가 닫힐 때까지 배치를 발행합니다. 전달한 메일박스 수를 반환합니다.
pub async fn run_dispatcher(
    hub: Arc<FanoutHub>,
    mut rx: mpsc::Receiver<Vec<SharedTick>>,
    prune_interval: Duration,
) -> u64 {
    let mut delivered = 0u64;
    let mut batches = 0u64;
    let mut prune = time::interval_at(Instant::now() + prune_interval, prune_interval);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                delivered += hub.publish_batch(&batch) as u64;
                batches += 1;
            }
            _ = prune.tick() => {
                hub.prune();
            }
        }
    }

    debug!(batches = batches, delivered = delivered, "디스패처 종료");
    delivered
}
