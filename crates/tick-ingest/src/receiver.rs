//! 재연결 수신기.
//!
//! 업스트림 푸시 서버에 TCP로 연결하고, 토큰 인증 후 길이 접두사 프레임을
//! raw 큐로 전달합니다. 연결 상태는 다음과 같이 전이합니다:
//!
//! ```text
//! Disconnected → Connecting → Authenticated → Streaming
//!                    ↑                            │
//!                    └──────── Backoff ←──────────┘
//! ```
//!
//! `stop()`(취소 토큰) 이후에는 `Stopped`에서 끝납니다.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tick_core::{Backoff, FeedError, MonotonicClock, PipelineMetrics, UpstreamConfig};

use crate::codec::{encode_frame, FrameDecoder, RawFrame};
use crate::notice::{framed_rejection, NoticeOutcome, NoticeScanner};

/// 소켓 읽기 버퍼 크기.
const READ_CHUNK: usize = 64 * 1024;

/// 큐 포화 경고 최소 간격.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// 서버 keep-alive 응답.
const PONG: &[u8] = b"pong";

/// 프로세스 전체 연결 번호.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Backoff,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 수퍼바이저에게 전달되는 수신기 종료 사유.
#[derive(Debug, Clone, Error)]
pub enum ReceiverError {
    /// 연속 인증 거부 (치명적)
    #[error("인증 거부 {attempts}회 연속 ({endpoint}): {notice}")]
    AuthRejected {
        endpoint: String,
        attempts: u32,
        notice: String,
    },

    /// 재연결 시도 소진
    #[error("재연결 시도 소진 ({endpoint}, {attempts}회): {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

impl ReceiverError {
    /// 파이프라인을 멈춰야 하는지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReceiverError::AuthRejected { .. })
    }
}

impl From<ReceiverError> for FeedError {
    fn from(err: ReceiverError) -> Self {
        match &err {
            ReceiverError::AuthRejected { .. } => FeedError::Auth(err.to_string()),
            ReceiverError::Exhausted { .. } => FeedError::Network(err.to_string()),
        }
    }
}

/// 세션 하나의 종료 사유.
enum SessionEnd {
    Cancelled,
    QueueClosed,
    AuthRejected(String),
    Failed {
        error: FeedError,
        streamed: Option<Duration>,
    },
}

/// 세션 사이에 유지되는 수신기 상태.
#[derive(Debug, Default)]
struct SessionHistory {
    /// 연속 인증 거부 횟수. 스트리밍에 도달하면 0
    auth_failures: u32,
    /// 이전 세션 중 하나라도 스트리밍에 도달했는지
    has_streamed: bool,
}

/// 큐 포화 경고를 초당 한 번으로 제한합니다.
#[derive(Default)]
struct DropWarner {
    last_warn: Option<Instant>,
    suppressed: u64,
}

impl DropWarner {
    fn record(&mut self, connection_id: u64) {
        self.suppressed += 1;
        let due = self
            .last_warn
            .map_or(true, |at| at.elapsed() >= DROP_WARN_INTERVAL);
        if due {
            warn!(
                connection_id,
                dropped = self.suppressed,
                "raw 큐 포화: 프레임 폐기"
            );
            self.suppressed = 0;
            self.last_warn = Some(Instant::now());
        }
    }
}

/// 업스트림 수신기.
pub struct Receiver {
    endpoint: String,
    config: UpstreamConfig,
    tx: mpsc::Sender<RawFrame>,
    metrics: Arc<PipelineMetrics>,
    clock: MonotonicClock,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
}

impl Receiver {
    /// 새 수신기를 생성합니다. `run()`을 호출해야 연결을 시작합니다.
    pub fn new(
        endpoint: impl Into<String>,
        config: UpstreamConfig,
        tx: mpsc::Sender<RawFrame>,
        metrics: Arc<PipelineMetrics>,
        clock: MonotonicClock,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            config,
            tx,
            metrics,
            clock,
            cancel,
            state_tx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 연결 상태 구독.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// 수신을 중단합니다. 진행 중인 대기는 1초 안에 끝납니다.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "연결 상태 전이");
        }
    }

    /// 정지되거나 치명적 조건에 도달할 때까지 연결을 유지합니다.
    #[instrument(name = "receiver", skip(self), fields(endpoint = %self.endpoint))]
    pub async fn run(self) -> Result<(), ReceiverError> {
        let mut backoff = Backoff::new(
            self.config.backoff_base(),
            self.config.backoff_max(),
            self.config.backoff_jitter,
        );
        let mut history = SessionHistory::default();
        let mut last_error = String::new();

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Stopped);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            match self.session(&mut history).await {
                SessionEnd::Cancelled | SessionEnd::QueueClosed => {
                    self.set_state(ConnectionState::Stopped);
                    info!("수신기 정지");
                    return Ok(());
                }
                SessionEnd::AuthRejected(notice) => {
                    history.auth_failures += 1;
                    warn!(attempts = history.auth_failures, notice = %notice, "인증 거부");
                    if history.auth_failures >= self.config.auth_fail_max {
                        self.set_state(ConnectionState::Stopped);
                        return Err(ReceiverError::AuthRejected {
                            endpoint: self.endpoint.clone(),
                            attempts: history.auth_failures,
                            notice,
                        });
                    }
                    last_error = notice;
                }
                SessionEnd::Failed { error, streamed } => {
                    if streamed.is_some_and(|d| d >= self.config.backoff_reset_after()) {
                        backoff.reset();
                    }
                    warn!(error = %error, "연결 종료");
                    last_error = error.to_string();
                }
            }

            if backoff.attempt() >= self.config.max_retries {
                self.set_state(ConnectionState::Disconnected);
                return Err(ReceiverError::Exhausted {
                    endpoint: self.endpoint.clone(),
                    attempts: backoff.attempt(),
                    last_error,
                });
            }

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Backoff);
            info!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "재연결 대기"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Stopped);
                    return Ok(());
                }
                _ = time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, FeedError> {
        let endpoint = self.endpoint.as_str();
        let addr = time::timeout(self.config.dns_timeout(), lookup_host(endpoint))
            .await
            .map_err(|_| FeedError::Timeout(format!("DNS 조회 시간 초과: {}", endpoint)))?
            .map_err(|e| FeedError::Network(format!("DNS 조회 실패 {}: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| FeedError::Network(format!("주소를 찾을 수 없음: {}", endpoint)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        socket.set_recv_buffer_size(self.config.recv_buffer_size() as u32)?;

        let stream = time::timeout(self.config.connect_timeout(), socket.connect(addr))
            .await
            .map_err(|_| FeedError::Timeout(format!("연결 시간 초과: {}", addr)))?
            .map_err(|e| FeedError::Network(format!("연결 실패 {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn is_keepalive(&self, frame: &RawFrame) -> bool {
        frame.is_empty()
            || frame.payload == PONG
            || frame.payload == self.config.heartbeat_payload.as_bytes()
    }

    async fn session(&self, history: &mut SessionHistory) -> SessionEnd {
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
            res = self.connect() => match res {
                Ok(stream) => stream,
                Err(error) => return SessionEnd::Failed { error, streamed: None },
            },
        };
        let (mut reader, mut writer) = stream.into_split();

        if let Err(e) = writer
            .write_all(self.config.token.expose().as_bytes())
            .await
        {
            return SessionEnd::Failed {
                error: FeedError::Network(format!("토큰 전송 실패: {}", e)),
                streamed: None,
            };
        }
        self.set_state(ConnectionState::Authenticated);
        debug!(connection_id, "토큰 전송 완료");

        let max_frame_size = self.config.max_frame_size;
        let idle_timeout = self.config.idle_timeout();
        let auth_grace = self.config.auth_grace_timeout();
        let enqueue_wait = self.config.enqueue_wait();
        let heartbeat_period = self.config.heartbeat_interval();
        let heartbeat_frame = encode_frame(self.config.heartbeat_payload.as_bytes());

        let mut decoder = FrameDecoder::new(max_frame_size, connection_id);
        let mut scanner = NoticeScanner::new(self.config.auth_notice_window, max_frame_size);
        let mut framed = false;
        let mut streaming_since: Option<Instant> = None;
        let mut last_activity = Instant::now();
        let mut heartbeat = time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_buf = vec![0u8; READ_CHUNK];
        let mut frames: Vec<RawFrame> = Vec::new();
        let mut drop_warner = DropWarner::default();

        loop {
            let streamed = streaming_since.map(|since| since.elapsed());
            let silence_limit = if streaming_since.is_some() {
                idle_timeout
            } else {
                auth_grace
            };
            let deadline = last_activity + silence_limit;

            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,

                _ = time::sleep_until(deadline) => {
                    let error = if streaming_since.is_some() {
                        FeedError::Timeout(format!("{}ms 동안 프레임 없음", idle_timeout.as_millis()))
                    } else {
                        FeedError::Timeout("인증 후 서버 응답 없음".to_string())
                    };
                    return SessionEnd::Failed { error, streamed };
                }

                _ = heartbeat.tick(), if streaming_since.is_some() => {
                    if let Err(e) = writer.write_all(&heartbeat_frame).await {
                        return SessionEnd::Failed {
                            error: FeedError::Network(format!("하트비트 전송 실패: {}", e)),
                            streamed,
                        };
                    }
                }

                read = reader.read(&mut read_buf) => {
                    let n = match read {
                        Ok(0) => {
                            if !framed {
                                if let Some(notice) = scanner.finish() {
                                    return SessionEnd::AuthRejected(notice);
                                }
                                return SessionEnd::Failed {
                                    error: FeedError::Network("인증 중 서버가 연결을 종료".to_string()),
                                    streamed,
                                };
                            }
                            let error = match decoder.finish() {
                                Err(e) => {
                                    PipelineMetrics::incr(&self.metrics.frame_errors);
                                    FeedError::Frame(e.to_string())
                                }
                                Ok(()) => FeedError::Network("서버가 연결을 종료".to_string()),
                            };
                            return SessionEnd::Failed { error, streamed };
                        }
                        Ok(n) => n,
                        Err(e) => {
                            return SessionEnd::Failed {
                                error: FeedError::Network(format!("읽기 실패: {}", e)),
                                streamed,
                            };
                        }
                    };

                    let data = &read_buf[..n];
                    let decoded = if framed {
                        decoder.feed_into(data, &mut frames)
                    } else {
                        last_activity = Instant::now();
                        match scanner.push(data) {
                            NoticeOutcome::Pending => continue,
                            NoticeOutcome::Rejected(notice) => {
                                return SessionEnd::AuthRejected(notice);
                            }
                            NoticeOutcome::Overflow { consumed } => {
                                PipelineMetrics::incr(&self.metrics.frame_errors);
                                return SessionEnd::Failed {
                                    error: FeedError::Frame(format!(
                                        "첫 프레임 전 안내문 {}바이트 초과",
                                        consumed
                                    )),
                                    streamed,
                                };
                            }
                            NoticeOutcome::Framed(rest) => {
                                framed = true;
                                for notice in scanner.notices() {
                                    info!(connection_id, notice = %notice, "서버 안내문");
                                }
                                decoder.feed_into(&rest, &mut frames)
                            }
                        }
                    };

                    if let Err(e) = decoded {
                        PipelineMetrics::incr(&self.metrics.frame_errors);
                        return SessionEnd::Failed {
                            error: FeedError::Frame(e.to_string()),
                            streamed,
                        };
                    }
                    if frames.is_empty() {
                        continue;
                    }

                    last_activity = Instant::now();
                    if streaming_since.is_none() {
                        // 프레임으로 온 거부 문구는 첫 데이터 프레임 자리에 온다
                        let rejection = frames
                            .iter()
                            .find(|frame| !self.is_keepalive(frame))
                            .and_then(|frame| framed_rejection(&frame.payload));
                        if let Some(notice) = rejection {
                            return SessionEnd::AuthRejected(notice);
                        }

                        streaming_since = Some(last_activity);
                        history.auth_failures = 0;
                        // 재연결은 스트리밍이 복구된 장애당 한 번만 센다
                        if history.has_streamed {
                            self.metrics.record_reconnect(self.clock.now_ns());
                        }
                        history.has_streamed = true;
                        self.set_state(ConnectionState::Streaming);
                        info!(connection_id, "스트리밍 시작");
                    }

                    for frame in frames.drain(..) {
                        if self.is_keepalive(&frame) {
                            continue;
                        }
                        match self.tx.send_timeout(frame, enqueue_wait).await {
                            Ok(()) => PipelineMetrics::incr(&self.metrics.received),
                            Err(SendTimeoutError::Timeout(_)) => {
                                PipelineMetrics::incr(&self.metrics.receiver_drops);
                                drop_warner.record(connection_id);
                            }
                            Err(SendTimeoutError::Closed(_)) => return SessionEnd::QueueClosed,
                        }
                    }
                }
            }
        }
    }
}
