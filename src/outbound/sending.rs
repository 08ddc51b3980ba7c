//! 세그먼트 전송 단계
//!
//! OUTBOX 세그먼트를 하나씩 보낸다. PAYLOAD 는 아카이브의 바이트 범위를 읽어 MIC 를
//! 계산하고, 영수증(RECEIPT/RECEIPT_LAST/RECOVERY)은 수신 메시지에 대한 확인이다.
//! 영수증이 200 을 받으면 대응하는 INBOX PAYLOAD 세그먼트로 상태를 전파한다.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::retire_archive;
use crate::context::SfrmContext;
use crate::inbound::cascade;
use crate::partnership::Partnership;
use crate::payload::{PayloadKey, PayloadState};
use crate::record::{Message, MessageBox, Segment, SegmentStatus, SegmentType};
use crate::task::{Collector, RetryPolicy, Task, TaskFailure, TaskOutcome};
use crate::wire::{SegmentHeader, WireSegment};
use crate::{Error, Result};

/// 파트너십 보안 정책을 적용해 와이어 세그먼트 생성
pub(crate) fn seal(
    ctx: &SfrmContext,
    partnership: &Partnership,
    mut header: SegmentHeader,
    content: &[u8],
) -> Result<WireSegment> {
    let sign = partnership.sign_requested;
    let encrypt = partnership.encrypt_requested;
    let body = ctx
        .security(partnership)
        .pack(header.segment_no as u64, content, sign, encrypt)?;
    header.is_signed = sign;
    header.is_encrypted = encrypt;
    Ok(WireSegment::new(header, body))
}

/// 세그먼트가 속한 메시지의 방향
fn owner_box(segment_type: SegmentType) -> MessageBox {
    match segment_type {
        SegmentType::Meta | SegmentType::Payload => MessageBox::Outbox,
        // 영수증과 ERROR 는 수신 메시지에 대한 응답
        SegmentType::Receipt | SegmentType::LastReceipt | SegmentType::Recovery | SegmentType::Error => {
            MessageBox::Inbox
        }
    }
}

/// OUTBOX 세그먼트 컬렉터
pub struct SegmentsCollector {
    first_load: bool,
}

impl SegmentsCollector {
    pub fn new() -> Self {
        Self { first_load: true }
    }

    /// 세그먼트를 PROCESSING 으로 점유하고 태스크 생성
    fn claim(ctx: &SfrmContext, mut segment: Segment) -> Result<SendTask> {
        let message_id = segment.key.message_id.clone();
        let message = ctx
            .records
            .retrieve_message(&message_id, owner_box(segment.key.segment_type))?
            .ok_or_else(|| Error::RecordNotFound(format!("message {message_id}")))?;
        let partnership = ctx
            .partnerships
            .retrieve(&message.partnership_id, &message_id)?;

        segment.set_status(SegmentStatus::Processing);
        ctx.records.persist_segment(&segment)?;
        Ok(SendTask {
            segment,
            partnership,
        })
    }
}

impl Default for SegmentsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for SegmentsCollector {
    type Task = SendTask;

    fn stage(&self) -> &'static str {
        "sending"
    }

    async fn collect(&mut self, ctx: &SfrmContext, limit: usize) -> Vec<SendTask> {
        let mut candidates = Vec::new();

        if std::mem::take(&mut self.first_load) {
            // 중단된 전송 + 영수증을 받지 못한 PAYLOAD 재전송
            let sweeps = [
                (SegmentStatus::Processing, None),
                (SegmentStatus::Delivered, Some(SegmentType::Payload)),
            ];
            for (status, segment_type) in sweeps {
                let remaining = limit.saturating_sub(candidates.len());
                match ctx
                    .records
                    .find_incomplete_segments(MessageBox::Outbox, status, segment_type, remaining)
                {
                    Ok(found) => candidates.extend(found),
                    Err(e) => warn!(status = %status, error = %e, "중단된 세그먼트 조회 실패"),
                }
            }
            if !candidates.is_empty() {
                info!(count = candidates.len(), "중단된 세그먼트 복구");
            }
        }

        let remaining = limit.saturating_sub(candidates.len());
        if remaining > 0 {
            match ctx
                .records
                .find_incomplete_segments(MessageBox::Outbox, SegmentStatus::Pending, None, remaining)
            {
                Ok(found) => candidates.extend(found),
                Err(e) => warn!(error = %e, "대기 세그먼트 조회 실패"),
            }
        }

        let mut tasks = Vec::with_capacity(candidates.len());
        for segment in candidates {
            let key = segment.key.clone();
            match Self::claim(ctx, segment) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(segment = %key, error = %e, "세그먼트 태스크 생성 실패, 건너뜀"),
            }
        }
        tasks
    }
}

/// 세그먼트 전송 태스크
pub struct SendTask {
    segment: Segment,
    partnership: Arc<Partnership>,
}

impl SendTask {
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    fn message_box(&self) -> MessageBox {
        owner_box(self.segment.key.segment_type)
    }

    fn load_message(&self, ctx: &SfrmContext) -> Result<Message> {
        let message_id = &self.segment.key.message_id;
        ctx.records
            .retrieve_message(message_id, self.message_box())?
            .ok_or_else(|| Error::RecordNotFound(format!("message {message_id}")))
    }

    /// 전송할 본문과 헤더
    fn build(&self, ctx: &SfrmContext, message: &Message) -> Result<(SegmentHeader, Vec<u8>)> {
        let key = &self.segment.key;
        let mut header = SegmentHeader::new(
            key.message_id.clone(),
            message.partnership_id.clone(),
            key.segment_no,
            key.segment_type,
        );

        let content = match key.segment_type {
            SegmentType::Payload => {
                let payload_key = PayloadKey::new(message.partnership_id.clone(), key.message_id.clone())?;
                let archive = ctx
                    .packaged
                    .get(&payload_key, PayloadState::Pending)
                    .ok_or_else(|| Error::PayloadNotFound(payload_key.to_string()))?;
                let content = ctx
                    .packaged
                    .read_range(&archive, self.segment.start, self.segment.end)?;
                header.segment_offset = self.segment.start;
                header.segment_length = content.len() as u64;
                header.mic_value = Some(ctx.config.mic_algorithm.digest(&content));
                content
            }
            SegmentType::Meta => {
                header.total_size = Some(message.total_size);
                header.total_segments = Some(message.total_segments);
                Vec::new()
            }
            SegmentType::Error => message.status_description.clone().into_bytes(),
            SegmentType::Receipt | SegmentType::LastReceipt | SegmentType::Recovery => Vec::new(),
        };
        Ok((header, content))
    }

    async fn run(&mut self, ctx: &SfrmContext) -> Result<()> {
        let key = self.segment.key.clone();
        let message = self.load_message(ctx)?;

        if message.is_failed() && key.segment_type != SegmentType::Error {
            debug!(segment = %key, "메시지가 이미 실패함, 전송 생략");
            self.segment.set_status(SegmentStatus::DeliveryFailure);
            return ctx.records.persist_segment(&self.segment);
        }

        let (header, content) = self.build(ctx, &message)?;
        let wire = seal(ctx, &self.partnership, header, &content)?;
        let status = ctx.transport.send(&message.partner_endpoint, &wire).await?;
        if status != 200 {
            return Err(Error::UnexpectedResponse { status });
        }

        // 영수증 처리와 같은 락 아래에서 기록
        let _guard = ctx.locks.lock(&key.message_id).await;
        if key.segment_type.is_receipt() {
            cascade(ctx, &key.message_id, key.segment_no, SegmentStatus::Processed)?;
        }
        let current = ctx.records.find_segment(&key)?;
        if current.is_some_and(|s| s.status.is_terminal()) {
            // 파트너 영수증이 먼저 도착해 이미 PROCESSED
            return Ok(());
        }
        self.segment.set_status(SegmentStatus::Delivered);
        ctx.records.persist_segment(&self.segment)?;
        debug!(segment = %key, bytes = content.len(), "세그먼트 전송 완료");
        Ok(())
    }
}

#[async_trait]
impl Task for SendTask {
    fn key(&self) -> String {
        format!("send/{}", self.segment.key)
    }

    fn describe(&self) -> String {
        format!("send {}", self.segment.key)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.partnership.retry_policy()
    }

    fn retried(&self) -> u32 {
        self.segment.retried
    }

    async fn set_retried(&mut self, ctx: &SfrmContext, retried: u32) -> Result<()> {
        self.segment.retried = retried;
        ctx.records.persist_segment(&self.segment)
    }

    async fn execute(&mut self, ctx: &SfrmContext) -> TaskOutcome {
        self.run(ctx).await.into()
    }

    async fn on_terminal_failure(&mut self, ctx: &SfrmContext, failure: &TaskFailure) -> Result<()> {
        let key = self.segment.key.clone();

        if let Some(mut message) = ctx.records.retrieve_message(&key.message_id, self.message_box())? {
            if !message.status.is_terminal() {
                message.fail(format!("Segment: {} has error: {}", key.segment_no, failure.error));
                ctx.records.update_message(&message)?;
            }
            if key.segment_type == SegmentType::Payload {
                retire_archive(ctx, &message.partnership_id, &key.message_id);
            }
        }

        if key.segment_type.is_receipt() {
            // 대기 중인 재조립 태스크를 깨운다
            if let Err(e) = cascade(ctx, &key.message_id, key.segment_no, SegmentStatus::DeliveryFailure) {
                warn!(segment = %key, error = %e, "영수증 실패 전파 실패");
            }
        }

        self.segment.set_status(SegmentStatus::DeliveryFailure);
        ctx.records.persist_segment(&self.segment)?;
        ctx.clear_message_caches(&key.message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::record::SegmentKey;

    fn segment(ctx: &SfrmContext, message_id: &str, no: u32, segment_type: SegmentType, status: SegmentStatus) {
        let mut segment = Segment::new(SegmentKey::new(message_id, MessageBox::Outbox, no, segment_type), 0, 10);
        segment.set_status(status);
        ctx.records.persist_segment(&segment).unwrap();
    }

    #[tokio::test]
    async fn test_first_collect_recovers_and_skips_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), vec![Partnership::new("acme", "http://partner.test")]);
        let message = Message::new("m1", MessageBox::Outbox, "acme", "http://partner.test");
        ctx.records.create_message(&message).unwrap();

        segment(&ctx, "m1", 1, SegmentType::Payload, SegmentStatus::Processing);
        segment(&ctx, "m1", 2, SegmentType::Payload, SegmentStatus::Delivered);
        segment(&ctx, "m1", 0, SegmentType::Meta, SegmentStatus::Delivered);
        segment(&ctx, "m1", 3, SegmentType::Payload, SegmentStatus::Pending);
        // 메시지 레코드가 없는 세그먼트
        segment(&ctx, "gone", 1, SegmentType::Payload, SegmentStatus::Pending);

        let mut collector = SegmentsCollector::new();
        let tasks = collector.collect(&ctx, 10).await;
        let mut claimed: Vec<(String, u32)> = tasks
            .iter()
            .map(|t| (t.segment().key.message_id.clone(), t.segment().key.segment_no))
            .collect();
        claimed.sort();
        assert_eq!(
            claimed,
            [("m1".to_string(), 1), ("m1".to_string(), 2), ("m1".to_string(), 3)]
        );
        for task in &tasks {
            let stored = ctx.records.find_segment(&task.segment().key).unwrap().unwrap();
            assert_eq!(stored.status, SegmentStatus::Processing);
        }

        let orphan = SegmentKey::new("gone", MessageBox::Outbox, 1, SegmentType::Payload);
        assert_eq!(
            ctx.records.find_segment(&orphan).unwrap().unwrap().status,
            SegmentStatus::Pending
        );
        let meta = SegmentKey::new("m1", MessageBox::Outbox, 0, SegmentType::Meta);
        assert_eq!(
            ctx.records.find_segment(&meta).unwrap().unwrap().status,
            SegmentStatus::Delivered
        );

        // 두 번째 수집은 PENDING 만 본다
        assert!(collector.collect(&ctx, 10).await.is_empty());
    }
}
