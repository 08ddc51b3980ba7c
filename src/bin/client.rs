//! SFRM 클라이언트 - 송신 요청과 상태 조회
//!
//! 사용법:
//!   cargo run --release --bin sfrm-client -- submit --outgoing ./repo/outgoing --partnership acme data.bin
//!   cargo run --release --bin sfrm-client -- status --node http://127.0.0.1:8080 --box outbox <MESSAGE_ID>
//!
//! submit 은 페이로드를 UPLOADING 이름으로 복사한 뒤 PENDING 으로 rename 한다.
//! 실행 중인 노드가 저장소 lock 을 잡고 있으므로 저장소를 직접 열지 않는다.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use walkdir::WalkDir;

use sfrm::{MessageStatusReport, PayloadKey, PayloadState};

#[derive(Debug, Parser)]
#[command(name = "sfrm-client", version, about = "SFRM submit/status client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 파일 또는 폴더를 송신 대기열에 넣는다
    Submit {
        /// 노드의 outgoing 저장소 경로
        #[arg(long)]
        outgoing: PathBuf,

        /// 파트너십 ID
        #[arg(short, long)]
        partnership: String,

        /// 메시지 ID (없으면 UUID)
        #[arg(short, long)]
        message_id: Option<String>,

        /// 보낼 파일 또는 폴더
        source: PathBuf,
    },

    /// 메시지 상태 조회
    Status {
        /// 노드 주소
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        node: String,

        /// INBOX 또는 OUTBOX
        #[arg(long = "box", default_value = "outbox")]
        message_box: String,

        message_id: String,
    },
}

/// 파일/폴더를 dest 폴더 아래로 복사, 복사한 바이트 수 반환
fn copy_payload(source: &Path, dest: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    fs::create_dir_all(dest)?;
    if source.is_file() {
        let name = source.file_name().ok_or("source has no file name")?;
        return Ok(fs::copy(source, dest.join(name))?);
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

fn submit(
    outgoing: &Path,
    partnership_id: String,
    message_id: Option<String>,
    source: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if !source.exists() {
        return Err(format!("source not found: {}", source.display()).into());
    }
    let message_id = message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let key = PayloadKey::new(partnership_id, message_id)?;

    let uploading = outgoing.join(key.file_name(PayloadState::Uploading, None));
    let pending = outgoing.join(key.file_name(PayloadState::Pending, None));
    if uploading.exists() || pending.exists() {
        return Err(format!("payload already submitted: {key}").into());
    }

    let bytes = copy_payload(source, &uploading)?;
    fs::rename(&uploading, &pending)?;

    info!("Submitted {} ({} bytes)", key, bytes);
    println!("{}", key.message_id);
    Ok(())
}

async fn status(node: &str, message_box: &str, message_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!(
        "{}/sfrm/status/{}/{}",
        node.trim_end_matches('/'),
        message_box,
        message_id
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(format!("status query failed: {}", response.status()).into());
    }
    let report: MessageStatusReport = response.json().await?;

    println!("Message:     {} ({})", report.message_id, report.message_box);
    println!("Status:      {}", report.status);
    println!("Description: {}", report.status_description);
    println!(
        "Segments:    {}/{} processed",
        report.processed_segments, report.total_segments
    );
    if let Some(last_updated) = report.last_updated {
        println!("Updated:     {}", last_updated.to_rfc3339());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match Args::parse().command {
        Command::Submit {
            outgoing,
            partnership,
            message_id,
            source,
        } => submit(&outgoing, partnership, message_id, &source),
        Command::Status {
            node,
            message_box,
            message_id,
        } => status(&node, &message_box, &message_id).await,
    }
}
