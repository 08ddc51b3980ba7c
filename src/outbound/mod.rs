//! 송신 파이프라인
//!
//! `HANDSHAKING → PACKAGING → PACKAGED → SEGMENTING → PROCESSING → PROCESSED`
//!
//! - [`handshake`]: 메시지 생성, 크기 추정/승인, META 전송, 패키징
//! - [`segmenting`]: 아카이브를 PAYLOAD 세그먼트로 분할
//! - [`sending`]: 세그먼트(및 수신측 영수증) 전송

pub mod handshake;
pub mod segmenting;
pub mod sending;

pub use handshake::{HandshakeTask, OutgoingPayloadsCollector};
pub use segmenting::{PackagedPayloadsCollector, SegmentingTask};
pub use sending::{SegmentsCollector, SendTask};

use tracing::{info, warn};

use crate::context::SfrmContext;
use crate::payload::PayloadKey;
use crate::record::{MessageBox, MessageStatus, SegmentStatus, SegmentType};
use crate::{Error, Result};

/// 모든 PAYLOAD 세그먼트가 PROCESSED 이면 메시지를 PROCESSED 로 변경
///
/// 여러 번 호출해도 종료 상태 기록은 한 번만 일어난다. 이번 호출에서
/// 완료시켰으면 `true`.
pub fn complete_if_done(ctx: &SfrmContext, message_id: &str) -> Result<bool> {
    let Some(mut message) = ctx.records.retrieve_message(message_id, MessageBox::Outbox)? else {
        return Ok(false);
    };
    if message.status != MessageStatus::Processing {
        return Ok(false);
    }

    let processed = ctx.records.count_segments_by_status(
        message_id,
        MessageBox::Outbox,
        SegmentType::Payload,
        SegmentStatus::Processed,
    )?;
    if processed < message.expected_payload_segments() {
        return Ok(false);
    }

    message.set_status(MessageStatus::Processed);
    match ctx.records.update_message(&message) {
        Ok(()) => {}
        // 다른 경로가 먼저 종료시킴
        Err(Error::MessageFinalized { .. }) => return Ok(false),
        Err(e) => return Err(e),
    }

    info!(message_id, segments = processed, "메시지 전송 완료");
    retire_archive(ctx, &message.partnership_id, message_id);
    ctx.clear_message_caches(message_id);
    Ok(true)
}

/// 송신 아카이브 정리 (실패는 로그만)
pub(crate) fn retire_archive(ctx: &SfrmContext, partnership_id: &str, message_id: &str) {
    let result = PayloadKey::new(partnership_id, message_id).and_then(|key| ctx.packaged.purge(&key));
    if let Err(e) = result {
        warn!(message_id, error = %e, "송신 아카이브 정리 실패");
    }
}
