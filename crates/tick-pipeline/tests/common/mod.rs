//! 통합 테스트 공용 도구: 프로세스 내 업스트림 서버와 짧은 타이머 설정.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use tick_core::{AuthToken, PipelineConfig, SinkBackendKind};
use tick_ingest::encode_frame;

pub const TOKEN: &str = "tok-it";

/// `$` 구분 레코드 (11필드).
pub fn record(symbol: &str, price: &str) -> String {
    format!(
        "{}$浦发银行$2024-03-01 09:30:03$10.00$10.90$9.80${}$1200$12600$10.49$300",
        symbol, price
    )
}

/// 업스트림 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// 토큰을 받고 안내문 후 레코드를 흘려보냄
    Stream,
    /// 인증 거부 안내문 후 연결 종료
    Reject,
}

/// 프로세스 내 업스트림 서버.
pub struct MockUpstream {
    pub endpoint: String,
    feed: mpsc::UnboundedSender<String>,
    accepted: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let (feed, feed_rx) = mpsc::unbounded_channel::<String>();
        let feed_rx = Arc::new(Mutex::new(feed_rx));
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, behavior, feed_rx.clone()));
            }
        });

        Self {
            endpoint,
            feed,
            accepted,
        }
    }

    /// 레코드 하나를 프레임으로 보냅니다.
    pub fn send(&self, record: String) {
        self.feed.send(record).unwrap();
    }

    pub fn send_all<I: IntoIterator<Item = String>>(&self, records: I) {
        for record in records {
            self.send(record);
        }
    }

    /// 지금까지 수락한 연결 수.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    behavior: Behavior,
    feed: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) {
    let mut token = vec![0u8; TOKEN.len()];
    if socket.read_exact(&mut token).await.is_err() {
        return;
    }

    if behavior == Behavior::Reject || token != TOKEN.as_bytes() {
        let _ = socket.write_all("认证失败\n".as_bytes()).await;
        return;
    }
    if socket.write_all(b"welcome\n").await.is_err() {
        return;
    }

    // 한 번에 한 연결만 피드를 소비
    let mut feed = feed.lock().await;
    let mut scratch = [0u8; 1024];
    loop {
        tokio::select! {
            record = feed.recv() => {
                let Some(record) = record else { return };
                if socket.write_all(&encode_frame(record.as_bytes())).await.is_err() {
                    return;
                }
            }
            // 하트비트 소비, 연결 종료 감지
            read = socket.read(&mut scratch) => {
                if matches!(read, Ok(0) | Err(_)) {
                    return;
                }
            }
        }
    }
}

/// 짧은 타이머의 파이프라인 설정.
pub fn test_config(endpoint: &str, spill_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();

    let up = &mut config.upstream;
    up.endpoint = endpoint.to_string();
    up.token = AuthToken::new(TOKEN);
    up.heartbeat_interval_ms = 100;
    up.idle_timeout_ms = 2_000;
    up.auth_grace_timeout_ms = 300;
    up.backoff_base_ms = 10;
    up.backoff_max_ms = 40;
    up.max_retries = 3;
    up.enqueue_wait_ms = 20;
    up.connect_timeout_ms = 500;

    config.parser.micro_batch_size = 16;
    config.parser.micro_batch_interval_ms = 5;
    config.parser.hub_enqueue_wait_ms = 50;

    let sink = &mut config.sink;
    sink.backend = SinkBackendKind::Memory;
    sink.batch_size = 8;
    sink.flush_interval_ms = 20;
    sink.write_timeout_ms = 200;
    sink.retry_base_ms = 5;
    sink.retry_max_ms = 20;
    sink.retry_max_attempts = 2;
    sink.reclaim_interval_ms = 50;
    sink.shutdown_grace_ms = 2_000;
    sink.spill_dir = spill_dir.join("spill");

    config.supervisor.stage_grace_ms = 2_000;
    config.supervisor.parser_restart_delay_ms = 10;
    config.telemetry.metrics_listen = None;
    config.telemetry.export_interval_ms = 50;

    config
}

/// 조건이 참이 될 때까지 폴링합니다.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// future가 제한 시간 안에 끝나야 합니다.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
