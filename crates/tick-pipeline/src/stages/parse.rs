//! 파서 단계.
//!
//! raw 큐에서 프레임을 꺼내 틱으로 변환하고, 마이크로 배치 단위로
//! 상태 저장소 → 허브 입력 큐 → 싱크에 전달합니다.
//!
//! raw 큐 수신측과 모으는 중인 배치는 공유되어, 패닉 후 재시작한 파서가
//! 남은 프레임과 이미 파싱된 틱을 이어서 처리합니다.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use tick_core::{ParserConfig, PipelineMetrics, SharedTick};
use tick_ingest::{RawFrame, TickParser};
use tick_sink::BatchSink;
use tick_state::StateStore;

/// 공유 raw 큐 수신측.
pub type SharedRawQueue = Arc<Mutex<mpsc::Receiver<RawFrame>>>;

/// 아직 하류로 넘기지 않은 틱.
pub type PendingBatch = Arc<parking_lot::Mutex<Vec<SharedTick>>>;

/// 파서 단계 구성 요소.
#[derive(Clone)]
pub struct ParseStage {
    pub config: ParserConfig,
    pub parser: TickParser,
    pub raw_rx: SharedRawQueue,
    pub pending: PendingBatch,
    pub store: Arc<StateStore>,
    pub hub_tx: mpsc::Sender<Vec<SharedTick>>,
    pub sink: Arc<BatchSink>,
    pub metrics: Arc<PipelineMetrics>,
}

impl ParseStage {
    /// raw 큐가 닫히고 비워질 때까지 실행합니다.
    pub async fn run(self) {
        let mut rx = self.raw_rx.lock().await;
        let batch_size = self.config.micro_batch_size.max(1);
        let interval = self.config.micro_batch_interval();

        debug!("파서 단계 시작");
        self.recover_pending();
        self.emit().await;

        loop {
            let Some(frame) = rx.recv().await else {
                break;
            };
            self.parse_into(&frame);

            // 첫 프레임부터 interval 안에 모인 만큼 한 배치
            let deadline = Instant::now() + interval;
            let mut closed = false;
            while self.pending.lock().len() < batch_size {
                match time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(frame)) => self.parse_into(&frame),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            self.emit().await;
            if closed {
                break;
            }
        }

        self.emit().await;
        debug!("파서 단계 종료 (raw 큐 닫힘)");
    }

    /// 패닉한 이전 실행의 흔적을 정리합니다.
    ///
    /// 모으던 배치는 그대로 이어받고, 넘기던 중 사라진 틱은 in-flight에서 뺍니다.
    fn recover_pending(&self) {
        let carried = self.pending.lock().len() as u64;
        let inflight = PipelineMetrics::get(&self.metrics.parser_inflight);
        if inflight > carried {
            error!(lost = inflight - carried, "이전 파서 실행에서 틱 유실");
            PipelineMetrics::set(&self.metrics.parser_inflight, carried);
        }
        if carried > 0 {
            info!(carried, "이전 배치 이어서 처리");
        }
    }

    fn parse_into(&self, frame: &RawFrame) {
        if let Some(tick) = self.parser.parse_frame(frame) {
            self.pending.lock().push(tick);
        }
    }

    /// 배치를 저장소, 싱크, 허브 순으로 넘깁니다.
    async fn emit(&self) {
        let ticks = std::mem::take(&mut *self.pending.lock());
        if ticks.is_empty() {
            return;
        }
        let count = ticks.len() as u64;

        let accepted = self.store.apply_batch(&ticks);
        self.sink.enqueue_batch(&ticks);
        if !accepted.is_empty() {
            self.forward(accepted).await;
        }

        self.parser.commit(count);
    }

    /// 허브 입력 큐에 넣습니다. 가득 차면 정체로 세고 `hub_enqueue_wait`까지 기다립니다.
    async fn forward(&self, batch: Vec<SharedTick>) {
        let batch = match self.hub_tx.try_send(batch) {
            Ok(()) => return,
            Err(TrySendError::Full(batch)) => {
                PipelineMetrics::incr(&self.metrics.hub_backpressure_stalls);
                debug!(ticks = batch.len(), "허브 입력 큐 정체");
                batch
            }
            Err(TrySendError::Closed(batch)) => batch,
        };

        let wait = self.config.hub_enqueue_wait();
        if let Err(e) = self.hub_tx.send_timeout(batch, wait).await {
            let lost = match e {
                SendTimeoutError::Timeout(b) | SendTimeoutError::Closed(b) => b.len() as u64,
            };
            PipelineMetrics::add(&self.metrics.hub_intake_drops, lost);
            warn!(dropped = lost, "허브 입력 큐 포화, 배치 폐기");
        }
    }
}
