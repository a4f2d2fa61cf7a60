//! HTTP 행 저장소.
//!
//! `{"table": ..., "rows": [...]}` JSON을 POST 합니다. 수신 측은
//! `(symbol, source_seq)` 기준으로 업서트해야 합니다.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::RowStore;
use crate::error::{classify_status, SinkError, SinkResult};
use crate::row::TickRow;

#[derive(Serialize)]
struct UpsertRequest<'a> {
    table: &'a str,
    rows: &'a [TickRow],
}

/// JSON POST 업서트 저장소.
#[derive(Debug, Clone)]
pub struct HttpRowStore {
    client: Client,
    url: String,
    table: String,
}

impl HttpRowStore {
    /// 새 저장소를 생성합니다.
    pub fn new(url: &str, table: &str, timeout: Duration) -> SinkResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Config(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl RowStore for HttpRowStore {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn upsert(&self, rows: &[TickRow]) -> SinkResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&UpsertRequest {
                table: &self.table,
                rows,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        debug!(status = status.as_u16(), "HTTP 업서트 완료");
        Ok(rows.len() as u64)
    }
}
