//! 원격 행 저장소 백엔드.
//!
//! - `PgRowStore` - PostgreSQL 다중 행 업서트 (sqlx)
//! - `HttpRowStore` - JSON POST (reqwest)
//! - `MemoryRowStore` - 프로세스 내 저장소 (드라이런, 테스트)

pub mod http;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;

use tick_core::{SinkBackendKind, SinkConfig};

use crate::error::{SinkError, SinkResult};
use crate::row::TickRow;

pub use http::HttpRowStore;
pub use memory::{FailureMode, MemoryRowStore};
pub use postgres::PgRowStore;

/// `(symbol, source_seq)` 키 멱등 업서트를 수행하는 저장소.
///
/// 같은 행을 여러 번 써도 테이블 상태는 한 번 쓴 것과 같아야 합니다.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// 백엔드 이름 (로그용).
    fn name(&self) -> &str;

    /// 행을 업서트하고 영향받은 행 수를 반환합니다.
    async fn upsert(&self, rows: &[TickRow]) -> SinkResult<u64>;

    /// 저장소 상태를 확인합니다.
    async fn health_check(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// 설정에 맞는 저장소를 생성합니다.
pub async fn connect_store(config: &SinkConfig) -> SinkResult<Arc<dyn RowStore>> {
    match config.backend {
        SinkBackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| SinkError::Config("sink.database_url 누락".to_string()))?;
            let store = PgRowStore::connect(url, &config.table, config.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        SinkBackendKind::Http => {
            let url = config
                .http_url
                .as_deref()
                .ok_or_else(|| SinkError::Config("sink.http_url 누락".to_string()))?;
            Ok(Arc::new(HttpRowStore::new(url, &config.table, config.write_timeout())?))
        }
        SinkBackendKind::Memory => Ok(Arc::new(MemoryRowStore::new())),
    }
}

/// 같은 키가 여러 번 나오면 마지막 행만 남깁니다. 순서는 유지됩니다.
pub(crate) fn dedup_last(rows: &[TickRow]) -> Vec<&TickRow> {
    let mut seen = std::collections::HashSet::with_capacity(rows.len());
    let mut out: Vec<&TickRow> = rows
        .iter()
        .rev()
        .filter(|row| seen.insert(row.key()))
        .collect();
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::fixtures::sample_row;

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let mut second = sample_row("SH600000", 1);
        second.volume = 99;
        let rows = vec![
            sample_row("SH600000", 1),
            sample_row("SZ000001", 1),
            second,
        ];

        let deduped = dedup_last(&rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].symbol, "SZ000001");
        assert_eq!(deduped[1].volume, 99);
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = SinkConfig {
            backend: SinkBackendKind::Memory,
            ..SinkConfig::default()
        };
        let store = connect_store(&config).await.unwrap();
        assert_eq!(store.name(), "memory");
    }
}
