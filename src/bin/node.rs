//! SFRM 노드 - 송신/수신 파이프라인 + HTTP 수신 엔드포인트
//!
//! 사용법:
//!   cargo run --release --bin sfrm-node -- --config sfrm.toml
//!
//! 예시:
//!   # 저사양 프리셋, 포트 지정
//!   cargo run --release --bin sfrm-node -- --preset low-spec --listen 0.0.0.0:9080

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sfrm::{Config, Engine, SfrmContext};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    LowSpec,
    HighPerformance,
}

/// SFRM 노드
#[derive(Debug, Parser)]
#[command(name = "sfrm-node", version, about = "SFRM segmented transfer node")]
struct Args {
    /// TOML 설정 파일
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 설정 파일이 없을 때 사용할 프리셋
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// 수신 주소 (설정 파일 값보다 우선)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

fn load_config(args: &Args) -> sfrm::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => match args.preset {
            Preset::Default => Config::default(),
            Preset::LowSpec => Config::low_spec(),
            Preset::HighPerformance => Config::high_performance(),
        },
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG, 기본 info)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_config(&args)?;
    let listen_addr = config.listen_addr;

    info!("SFRM node starting...");
    info!("Listen address: {}", listen_addr);
    info!("Segment size: {} bytes", config.segment_size);
    info!("Archiver: {:?}", config.archiver);
    info!("Partnerships: {}", config.partnerships.len());

    let ctx = SfrmContext::builder(config).build()?;
    let engine = Engine::start(ctx.clone());

    sfrm::server::serve(ctx, listen_addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("종료 신호 수신");
    })
    .await?;

    engine.stop().await;
    Ok(())
}
