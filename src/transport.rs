//! 전송 계층 - 세그먼트를 파트너에게 보내고 HTTP 상태 코드를 받는다

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::Config;
use crate::wire::WireSegment;
use crate::Result;

/// 세그먼트 전송 경계
///
/// 200 이외의 응답은 호출자가 재시도 가능한 전송 에러로 처리한다.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, segment: &WireSegment) -> Result<u16>;
}

/// reqwest 기반 HTTP 전송
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.request_timeout_ms),
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, segment: &WireSegment) -> Result<u16> {
        let mut request = self.client.post(endpoint);
        for (name, value) in segment.header.to_headers() {
            request = request.header(name, value);
        }

        let response = request.body(segment.body.clone()).send().await?;
        let status = response.status().as_u16();
        debug!(
            endpoint,
            message_id = %segment.header.message_id,
            segment_no = segment.header.segment_no,
            segment_type = %segment.header.segment_type,
            status,
            "세그먼트 전송"
        );
        Ok(status)
    }
}
