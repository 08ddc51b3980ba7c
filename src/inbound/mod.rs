//! 수신 파이프라인
//!
//! - [`receiver`]: 파트너가 보낸 와이어 세그먼트 처리 (META/PAYLOAD/영수증/ERROR)
//! - [`reassembly`]: 모두 모인 아카이브를 해제하고 영수증 처리가 끝날 때까지 기다린다

pub mod reassembly;
pub mod receiver;

pub use reassembly::{IncomingPayloadsCollector, ReassemblyTask};
pub use receiver::InboundHandler;

use tracing::debug;

use crate::context::SfrmContext;
use crate::record::{MessageBox, SegmentKey, SegmentStatus, SegmentType};
use crate::Result;

/// 영수증 전송 결과를 INBOX PAYLOAD 세그먼트로 전파
///
/// 마지막 세그먼트였거나 메시지가 이미 실패했으면 대기 중인 재조립 태스크를 깨운다.
pub(crate) fn cascade(
    ctx: &SfrmContext,
    message_id: &str,
    segment_no: u32,
    status: SegmentStatus,
) -> Result<()> {
    let key = SegmentKey::new(message_id, MessageBox::Inbox, segment_no, SegmentType::Payload);
    if let Some(mut segment) = ctx.records.find_segment(&key)? {
        if segment.status != status {
            segment.set_status(status);
            ctx.records.persist_segment(&segment)?;
        }
    }

    let Some(message) = ctx.records.retrieve_message(message_id, MessageBox::Inbox)? else {
        return Ok(());
    };
    let processed = ctx.records.count_segments_by_status(
        message_id,
        MessageBox::Inbox,
        SegmentType::Payload,
        SegmentStatus::Processed,
    )?;
    if message.is_failed() || processed >= message.expected_payload_segments() {
        let woke = ctx.completion.notify(message_id);
        debug!(message_id, segment_no, processed, woke, "재조립 대기자 알림");
    }
    Ok(())
}
