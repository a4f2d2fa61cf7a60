//! 실시간 틱 수집 파이프라인 CLI.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use tick_core::{init_logging, LogConfig, LogFormat, PipelineConfig};
use tick_pipeline::{telemetry, Supervisor};
use tick_sink::{connect_store, MemoryRowStore, RowStore, SegmentLog};

#[derive(Parser)]
#[command(name = "tick-pipeline")]
#[command(about = "A-share realtime tick ingestion pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error). 설정 파일보다 우선
    #[arg(long, global = true, env = "TICKFEED_LOG_LEVEL")]
    log_level: Option<String>,

    /// 로그 형식 (pretty, json, compact)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// 파이프라인 실행 (SIGINT/SIGTERM까지)
    Run {
        /// 설정 파일 경로 (TOML)
        #[arg(short, long, env = "TICKFEED_CONFIG")]
        config: Option<PathBuf>,

        /// 원격 저장소 대신 메모리 저장소에 기록
        #[arg(long)]
        dry_run: bool,
    },

    /// 설정을 검증하고 유효 값을 출력
    CheckConfig {
        #[arg(short, long, env = "TICKFEED_CONFIG")]
        config: Option<PathBuf>,
    },

    /// 스필/데드레터 세그먼트 현황 출력
    SpillStatus {
        #[arg(short, long, env = "TICKFEED_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Commands::Run { config, .. }
            | Commands::CheckConfig { config }
            | Commands::SpillStatus { config } => config.as_deref(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.command.config_path()).context("설정 로드 실패")?;

    // 로깅 초기화 (CLI 값이 설정 파일보다 우선)
    let mut log_config = LogConfig::from_section(&config.logging);
    if let Some(level) = &cli.log_level {
        log_config.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(log_config).map_err(|e| anyhow!("로깅 초기화 실패: {}", e))?;

    match cli.command {
        Commands::Run { dry_run, .. } => run(config, dry_run).await,
        Commands::CheckConfig { .. } => {
            info!("설정 검증 완료");
            println!("{:#?}", config);
            Ok(())
        }
        Commands::SpillStatus { .. } => spill_status(&config),
    }
}

async fn run(config: PipelineConfig, dry_run: bool) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "tick-pipeline 시작");

    if let Some(listen) = &config.telemetry.metrics_listen {
        telemetry::install_exporter(listen)?;
    }

    let row_store: Arc<dyn RowStore> = if dry_run {
        warn!("dry-run: 메모리 저장소에 기록합니다");
        Arc::new(MemoryRowStore::new())
    } else {
        connect_store(&config.sink).await.context("원격 저장소 연결 실패")?
    };

    let mut supervisor = Supervisor::start(config, row_store)
        .await
        .context("파이프라인 시작 실패")?;

    let fatal = tokio::select! {
        _ = shutdown_signal() => None,
        _ = supervisor.wait_fatal() => supervisor.fatal_error(),
    };

    let report = supervisor.shutdown().await;
    let health = supervisor.health();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "shutdown": report, "health": health }))?
    );

    if let Some(reason) = fatal {
        error!(reason = %reason, "치명적 오류로 종료");
        return Err(anyhow!("파이프라인 치명적 오류: {}", reason));
    }
    if !report.clean {
        warn!(stages = ?report.unclean_stages, "비정상 종료 단계 있음");
    }

    info!("tick-pipeline 종료");
    Ok(())
}

fn spill_status(config: &PipelineConfig) -> anyhow::Result<()> {
    let sink = &config.sink;
    let spill = SegmentLog::open(&sink.spill_dir, sink.spill_cap_bytes, sink.spill_segment_max_bytes)
        .context("스필 디렉터리 열기 실패")?;
    let dead_letter = SegmentLog::open(
        sink.dead_letter_dir(),
        sink.dead_letter_cap_bytes,
        sink.spill_segment_max_bytes,
    )
    .context("데드레터 디렉터리 열기 실패")?;

    let status = json!({
        "spill": {
            "dir": spill.dir(),
            "segments": spill.segments(),
            "total_bytes": spill.total_bytes(),
            "total_rows": spill.total_rows(),
        },
        "dead_letter": {
            "dir": dead_letter.dir(),
            "segments": dead_letter.segments(),
            "total_bytes": dead_letter.total_bytes(),
            "total_rows": dead_letter.total_rows(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// SIGINT 또는 SIGTERM을 기다립니다.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C 핸들러 설치 실패");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM 핸들러 설치 실패");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Ctrl+C 수신, 종료 시작"),
        _ = terminate => warn!("SIGTERM 수신, 종료 시작"),
    }
}
