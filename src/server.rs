//! HTTP 수신 엔드포인트
//!
//! - `POST /sfrm/inbound`: `x-sfrm-*` 헤더 + 본문으로 된 세그먼트 하나
//! - `GET /sfrm/status/:box/:message_id`: 메시지 상태 (JSON)
//! - `GET /health`

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::context::SfrmContext;
use crate::inbound::InboundHandler;
use crate::record::MessageBox;
use crate::status::query_status;
use crate::wire::{SegmentHeader, WireSegment};
use crate::Result;

pub const INBOUND_PATH: &str = "/sfrm/inbound";

/// 서명/암호화 봉투 여유분 (바이트)
const ENVELOPE_OVERHEAD: u64 = 64 * 1024;

/// 세그먼트 하나의 최대 본문 크기
pub fn body_limit(segment_size: u64) -> usize {
    usize::try_from(segment_size.saturating_add(ENVELOPE_OVERHEAD)).unwrap_or(usize::MAX)
}

/// 수신 라우터
///
/// 본문 제한은 로컬 `segment_size` 기준이다. 파트너가 더 큰 세그먼트를 보내면 413.
pub fn router(ctx: Arc<SfrmContext>) -> Router {
    let limit = body_limit(ctx.config.segment_size);
    Router::new()
        .route(INBOUND_PATH, post(receive_segment))
        .route("/sfrm/status/:box/:message_id", get(message_status))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(InboundHandler::new(ctx))
}

/// shutdown 이 끝날 때까지 수신
pub async fn serve(
    ctx: Arc<SfrmContext>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, path = INBOUND_PATH, "SFRM 수신 대기");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// 헤더 맵에서 세그먼트 복원
pub fn decode_segment(headers: &HeaderMap, body: Bytes) -> Result<WireSegment> {
    let header = SegmentHeader::from_headers(|name| headers.get(name).and_then(|v| v.to_str().ok()))?;
    Ok(WireSegment { header, body })
}

async fn receive_segment(
    State(handler): State<InboundHandler>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let segment = match decode_segment(&headers, body) {
        Ok(segment) => segment,
        Err(e) => {
            warn!(error = %e, "세그먼트 헤더 해석 실패");
            return status_code(e.http_status());
        }
    };
    status_code(handler.accept(segment).await)
}

async fn message_status(
    State(handler): State<InboundHandler>,
    Path((message_box, message_id)): Path<(String, String)>,
) -> Response {
    let message_box: MessageBox = match message_box.parse() {
        Ok(message_box) => message_box,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match query_status(handler.context().records.as_ref(), &message_id, message_box) {
        Ok(report) => Json(report).into_response(),
        Err(e) => (status_code(e.http_status()), e.to_string()).into_response(),
    }
}

async fn health_check() -> &'static str {
    "OK"
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RepositoryConfig};
    use crate::crypto::LocalIdentity;
    use crate::partnership::Partnership;
    use crate::record::SegmentType;
    use crate::transport::{HttpTransport, Transport};
    use std::time::Duration;

    fn payload_of(len: usize) -> WireSegment {
        let mut header = SegmentHeader::new("absent", "acme", 1, SegmentType::Payload);
        header.segment_length = len as u64;
        WireSegment::new(header, vec![0x5au8; len])
    }

    #[tokio::test]
    async fn test_full_size_segment_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::high_performance();
        config.repositories = RepositoryConfig {
            record_store: None,
            ..RepositoryConfig::under(dir.path())
        };
        config.partnerships = vec![Partnership::new("acme", "http://acme.test/sfrm/inbound")];
        let segment_size = config.segment_size;
        assert!(segment_size > 2 * 1024 * 1024);

        let ctx = SfrmContext::builder(config)
            .identity(LocalIdentity::generate())
            .build()
            .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, router(ctx)).await });

        let endpoint = format!("http://{addr}{INBOUND_PATH}");
        let transport = HttpTransport::new(Duration::from_secs(5), Duration::from_secs(30)).unwrap();

        // 핸들러까지 도달했지만 메시지가 없음
        let full = payload_of(segment_size as usize);
        assert_eq!(transport.send(&endpoint, &full).await.unwrap(), 404);

        let oversized = payload_of(body_limit(segment_size) + 1);
        assert_eq!(transport.send(&endpoint, &oversized).await.unwrap(), 413);

        server.abort();
    }

    #[test]
    fn test_decode_segment_from_headers() {
        let mut header = SegmentHeader::new("m1", "acme", 2, SegmentType::Payload);
        header.segment_offset = 1_000_000;
        header.segment_length = 3;
        let wire = WireSegment::new(header, Bytes::from_static(b"abc"));

        let mut headers = HeaderMap::new();
        for (name, value) in wire.header.to_headers() {
            headers.insert(name, value.parse().unwrap());
        }
        let decoded = decode_segment(&headers, wire.body.clone()).unwrap();
        assert_eq!(decoded.header, wire.header);
        decoded.verify_crc().unwrap();

        headers.remove(crate::wire::H_MESSAGE_ID);
        let missing = decode_segment(&headers, wire.body).unwrap_err();
        assert_eq!(missing.http_status(), 400);
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(status_code(409), StatusCode::CONFLICT);
        assert_eq!(status_code(507), StatusCode::INSUFFICIENT_STORAGE);
    }
}
