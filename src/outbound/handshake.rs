//! 핸드셰이크/패키징 단계
//!
//! 1. 메시지 생성 (HANDSHAKING)
//! 2. 아카이브 크기 추정 → 최대 크기/디스크 공간 확인 (실패 시 재시도 없음)
//! 3. META 세그먼트로 총 크기/세그먼트 수 통지 (200 필수)
//! 4. PACKAGING → 압축 → 실제 크기 기록 (다르면 META 재전송) → PACKAGED

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::sending::seal;
use crate::context::SfrmContext;
use crate::partnership::Partnership;
use crate::payload::{Payload, PayloadState};
use crate::record::{Message, MessageBox, MessageStatus, SegmentType};
use crate::segmentation::SegmentPlan;
use crate::task::{Collector, RetryPolicy, Task, TaskFailure, TaskOutcome};
use crate::wire::SegmentHeader;
use crate::{Error, Result};

/// 송신 대기 폴더 컬렉터
pub struct OutgoingPayloadsCollector {
    first_load: bool,
}

impl OutgoingPayloadsCollector {
    pub fn new() -> Self {
        Self { first_load: true }
    }
}

impl Default for OutgoingPayloadsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for OutgoingPayloadsCollector {
    type Task = HandshakeTask;

    fn stage(&self) -> &'static str {
        "handshake"
    }

    async fn collect(&mut self, ctx: &SfrmContext, limit: usize) -> Vec<HandshakeTask> {
        let mut tasks = Vec::new();

        // 이전 프로세스가 처리하다 남긴 폴더
        if std::mem::take(&mut self.first_load) {
            match ctx.outgoing.list_by_state(PayloadState::Processing, limit) {
                Ok(abandoned) => {
                    if !abandoned.is_empty() {
                        info!(count = abandoned.len(), "중단된 송신 폴더 복구");
                    }
                    tasks.extend(abandoned.into_iter().map(|p| HandshakeTask::new(ctx, p)));
                }
                Err(e) => warn!(error = %e, "중단된 송신 폴더 조회 실패"),
            }
        }

        let remaining = limit.saturating_sub(tasks.len());
        if remaining == 0 {
            return tasks;
        }
        let pending = match ctx.outgoing.list_by_state(PayloadState::Pending, remaining) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "송신 대기 폴더 조회 실패");
                return tasks;
            }
        };
        for payload in pending {
            match ctx.outgoing.transition(&payload, PayloadState::Processing) {
                Ok(owned) => tasks.push(HandshakeTask::new(ctx, owned)),
                Err(e) => warn!(payload = %payload.key, error = %e, "송신 폴더 점유 실패, 건너뜀"),
            }
        }
        tasks
    }
}

/// 핸드셰이크/패키징 태스크
pub struct HandshakeTask {
    /// PROCESSING 상태의 송신 폴더
    payload: Payload,
    partnership: Option<Arc<Partnership>>,
    retried: u32,

    /// 이번 실행에서 메시지 레코드를 만들었는지
    message_created: bool,
}

impl HandshakeTask {
    pub fn new(ctx: &SfrmContext, payload: Payload) -> Self {
        let partnership = ctx
            .partnerships
            .retrieve(&payload.key.partnership_id, &payload.key.message_id)
            .ok();
        Self {
            payload,
            partnership,
            retried: 0,
            message_created: false,
        }
    }

    fn message_id(&self) -> &str {
        &self.payload.key.message_id
    }

    async fn run(&mut self, ctx: &SfrmContext) -> Result<()> {
        let key = self.payload.key.clone();
        let partnership = self
            .partnership
            .clone()
            .ok_or_else(|| Error::PartnershipNotFound(key.partnership_id.clone()))?;

        // 이전 시도가 남긴 HANDSHAKING/PACKAGING 메시지는 롤백
        if let Some(existing) = ctx.records.retrieve_message(&key.message_id, MessageBox::Outbox)? {
            if !existing.status.totals_mutable() {
                return Err(Error::DuplicateMessage {
                    message_id: key.message_id.clone(),
                });
            }
            ctx.records.remove_message(&key.message_id, MessageBox::Outbox)?;
            ctx.packaged.purge(&key)?;
            debug!(message_id = %key.message_id, status = %existing.status, "이전 시도 롤백");
        }

        let mut message = Message::new(
            key.message_id.clone(),
            MessageBox::Outbox,
            key.partnership_id.clone(),
            partnership.partner_endpoint.clone(),
        );
        message.is_signed = partnership.sign_requested;
        message.is_encrypted = partnership.encrypt_requested;
        ctx.records.create_message(&message)?;
        self.message_created = true;

        // 승인
        let estimated = ctx.outgoing.estimate_size(&self.payload)?;
        ctx.admit(estimated, &ctx.packaged)?;
        set_totals(ctx, &mut message, estimated)?;
        announce(ctx, &partnership, &message).await?;

        // 패키징
        message.set_status(MessageStatus::Packaging);
        ctx.records.update_message(&message)?;

        let archive = ctx.packaged.create(&key, PayloadState::Uploading)?;
        let actual = ctx.packaged.pack(&self.payload, &archive).await?;
        if actual != estimated {
            // 세그먼트가 만들어지기 전에 실제 크기로 다시 통지
            info!(
                message_id = %key.message_id,
                estimated,
                actual,
                "추정 크기와 실제 크기가 다름, META 재전송"
            );
            set_totals(ctx, &mut message, actual)?;
            announce(ctx, &partnership, &message).await?;
        }

        ctx.packaged.transition(&archive, PayloadState::Pending)?;
        message.set_status(MessageStatus::Packaged);
        ctx.records.update_message(&message)?;

        if let Err(e) = ctx.outgoing.transition(&self.payload, PayloadState::Processed) {
            warn!(message_id = %key.message_id, error = %e, "송신 폴더를 PROCESSED 로 옮기지 못함");
        }

        info!(
            message_id = %key.message_id,
            partnership_id = %key.partnership_id,
            total_size = message.total_size,
            total_segments = message.total_segments,
            "메시지 패키징 완료"
        );
        Ok(())
    }

    /// 폴더를 PROCESSED 로 고정 (실패는 로그만)
    fn freeze_payload(&self, ctx: &SfrmContext) {
        if let Err(e) = ctx.outgoing.transition(&self.payload, PayloadState::Processed) {
            warn!(payload = %self.payload.key, error = %e, "송신 폴더 고정 실패");
        }
    }
}

fn set_totals(ctx: &SfrmContext, message: &mut Message, total_size: u64) -> Result<()> {
    let plan = SegmentPlan::new(total_size, ctx.config.segment_size)?;
    message.total_size = total_size;
    message.total_segments = plan.total_segments();
    ctx.records.update_message(message)
}

/// META 세그먼트 전송 (200 이외는 전송 에러)
async fn announce(ctx: &SfrmContext, partnership: &Partnership, message: &Message) -> Result<()> {
    let mut header = SegmentHeader::new(
        message.message_id.clone(),
        message.partnership_id.clone(),
        0,
        SegmentType::Meta,
    );
    header.total_size = Some(message.total_size);
    header.total_segments = Some(message.total_segments);

    let wire = seal(ctx, partnership, header, &[])?;
    let status = ctx.transport.send(&message.partner_endpoint, &wire).await?;
    if status != 200 {
        return Err(Error::UnexpectedResponse { status });
    }
    debug!(
        message_id = %message.message_id,
        total_size = message.total_size,
        total_segments = message.total_segments,
        "META 전송"
    );
    Ok(())
}

#[async_trait]
impl Task for HandshakeTask {
    fn key(&self) -> String {
        format!("handshake/{}", self.payload.key)
    }

    fn describe(&self) -> String {
        format!("handshake {}", self.payload.key)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.partnership
            .as_ref()
            .map(|p| p.retry_policy())
            .unwrap_or_else(RetryPolicy::none)
    }

    fn retried(&self) -> u32 {
        self.retried
    }

    async fn set_retried(&mut self, _ctx: &SfrmContext, retried: u32) -> Result<()> {
        self.retried = retried;
        Ok(())
    }

    async fn execute(&mut self, ctx: &SfrmContext) -> TaskOutcome {
        self.run(ctx).await.into()
    }

    async fn on_terminal_failure(&mut self, ctx: &SfrmContext, failure: &TaskFailure) -> Result<()> {
        let message_id = self.message_id().to_string();

        // 메시지를 만들기 전의 실패 (중복 ID, 파트너십 없음): 다른 레코드는 건드리지 않는다
        if !self.message_created {
            self.freeze_payload(ctx);
            ctx.clear_message_caches(&message_id);
            return Ok(());
        }

        match ctx.records.retrieve_message(&message_id, MessageBox::Outbox)? {
            Some(message) if failure.retries_exhausted && message.status.totals_mutable() => {
                ctx.records.remove_message(&message_id, MessageBox::Outbox)?;
                info!(message_id = %message_id, "재시도 초과, 메시지 롤백");
            }
            Some(mut message) if !message.status.is_terminal() => {
                message.fail(failure.error.to_string());
                ctx.records.update_message(&message)?;
            }
            _ => {}
        }

        ctx.packaged.purge(&self.payload.key)?;
        self.freeze_payload(ctx);
        ctx.clear_message_caches(&message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::payload::PayloadKey;

    fn ids(tasks: &[HandshakeTask]) -> Vec<String> {
        let mut ids: Vec<String> = tasks.iter().map(|t| t.payload.key.message_id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_first_collect_recovers_processing_folders() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), vec![Partnership::new("acme", "http://partner.test")]);
        let abandoned = PayloadKey::new("acme", "m1").unwrap();
        let pending = PayloadKey::new("acme", "m2").unwrap();
        ctx.outgoing.create(&abandoned, PayloadState::Processing).unwrap();
        ctx.outgoing.create(&pending, PayloadState::Pending).unwrap();

        let mut collector = OutgoingPayloadsCollector::new();
        let first = collector.collect(&ctx, 10).await;
        assert_eq!(ids(&first), ["m1", "m2"]);
        assert!(ctx.outgoing.get(&pending, PayloadState::Processing).is_some());

        // 복구는 첫 수집에서만
        assert!(collector.collect(&ctx, 10).await.is_empty());

        let later = PayloadKey::new("acme", "m3").unwrap();
        ctx.outgoing.create(&later, PayloadState::Pending).unwrap();
        assert_eq!(ids(&collector.collect(&ctx, 10).await), ["m3"]);
    }
}
