//! 재조립 단계
//!
//! 모두 모인 아카이브(PENDING)를 작업 폴더로 해제하고 크기를 확인한 뒤,
//! 모든 영수증이 전송되어 INBOX PAYLOAD 세그먼트가 PROCESSED 가 될 때까지 기다린다.
//! 대기 중에는 작업 슬롯을 점유하지 않는다 ([`TaskOutcome::Deferred`]).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::SfrmContext;
use crate::partnership::Partnership;
use crate::payload::{Payload, PayloadState};
use crate::record::{Message, MessageBox, MessageStatus, Segment, SegmentKey, SegmentStatus, SegmentType};
use crate::sync::CompletionGuard;
use crate::task::{Collector, RetryPolicy, Task, TaskFailure, TaskOutcome};
use crate::{Error, Result};

/// 조립 완료 아카이브 컬렉터
pub struct IncomingPayloadsCollector {
    first_load: bool,
}

impl IncomingPayloadsCollector {
    pub fn new() -> Self {
        Self { first_load: true }
    }
}

impl Default for IncomingPayloadsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for IncomingPayloadsCollector {
    type Task = ReassemblyTask;

    fn stage(&self) -> &'static str {
        "reassembly"
    }

    async fn collect(&mut self, ctx: &SfrmContext, limit: usize) -> Vec<ReassemblyTask> {
        let store = &ctx.incoming_packaged;
        let mut tasks = Vec::new();

        if std::mem::take(&mut self.first_load) {
            match store.list_by_state(PayloadState::Processing, limit) {
                Ok(abandoned) => {
                    if !abandoned.is_empty() {
                        info!(count = abandoned.len(), "중단된 재조립 복구");
                    }
                    tasks.extend(abandoned.into_iter().map(|a| ReassemblyTask::new(ctx, a)));
                }
                Err(e) => warn!(error = %e, "중단된 재조립 조회 실패"),
            }
        }

        let remaining = limit.saturating_sub(tasks.len());
        if remaining == 0 {
            return tasks;
        }
        match store.list_by_state(PayloadState::Pending, remaining) {
            Ok(pending) => {
                for archive in pending {
                    match store.transition(&archive, PayloadState::Processing) {
                        Ok(owned) => tasks.push(ReassemblyTask::new(ctx, owned)),
                        Err(e) => warn!(payload = %archive.key, error = %e, "아카이브 점유 실패, 건너뜀"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "조립 완료 아카이브 조회 실패"),
        }
        tasks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Extract,
    Await,
}

/// 재조립 태스크
pub struct ReassemblyTask {
    /// PROCESSING 상태의 아카이브
    archive: Payload,
    partnership: Option<Arc<Partnership>>,
    phase: Phase,
    /// 해제된 작업 폴더 (UPLOADING)
    folder: Option<Payload>,
    /// 대기 중인 완료 알림 등록
    waiting: Option<CompletionGuard>,
    retried: u32,
}

impl ReassemblyTask {
    pub fn new(ctx: &SfrmContext, archive: Payload) -> Self {
        let partnership = ctx
            .partnerships
            .retrieve(&archive.key.partnership_id, &archive.key.message_id)
            .ok();
        Self {
            archive,
            partnership,
            phase: Phase::Extract,
            folder: None,
            waiting: None,
            retried: 0,
        }
    }

    fn message_id(&self) -> &str {
        &self.archive.key.message_id
    }

    fn load_message(&self, ctx: &SfrmContext) -> Result<Message> {
        let message_id = self.message_id();
        ctx.records
            .retrieve_message(message_id, MessageBox::Inbox)?
            .ok_or_else(|| Error::RecordNotFound(format!("inbound message {message_id}")))
    }

    /// 아카이브 해제와 크기 확인. 더 할 일이 없으면 `false`
    async fn extract(&mut self, ctx: &SfrmContext) -> Result<bool> {
        let mut message = self.load_message(ctx)?;
        match message.status {
            MessageStatus::DeliveryFailure | MessageStatus::Processed => {
                debug!(message_id = %message.message_id, status = %message.status, "종료된 메시지, 아카이브 정리");
                self.discard(ctx);
                return Ok(false);
            }
            MessageStatus::Unpackaging => {}
            _ => {
                message.set_status(MessageStatus::Unpackaging);
                ctx.records.update_message(&message)?;
            }
        }

        let key = self.archive.key.clone();
        if let Some(stale) = ctx.incoming.get(&key, PayloadState::Uploading) {
            ctx.incoming.remove(&stale)?;
        }
        let folder = ctx.incoming.create(&key, PayloadState::Uploading)?;
        self.folder = Some(folder.clone());

        let content = ctx.incoming_packaged.unpack(&self.archive, &folder.path).await?;
        let extracted = ctx.incoming.size(&folder)?;
        if extracted != content {
            return Err(Error::SizeMismatch {
                message_id: message.message_id.clone(),
                expected: content,
                actual: extracted,
            });
        }

        // 추정이 정확한 형식은 해제된 폴더로 통지 크기를 다시 계산
        let archiver = ctx.incoming_packaged.archiver();
        let actual = if archiver.estimate_is_exact() {
            archiver.estimate_compressed_size(&folder.path)?
        } else {
            message.total_size
        };
        if actual != message.total_size {
            return Err(Error::SizeMismatch {
                message_id: message.message_id.clone(),
                expected: message.total_size,
                actual,
            });
        }

        debug!(message_id = %message.message_id, size = actual, "아카이브 해제 완료");
        Ok(true)
    }

    /// 영수증 전송 완료 확인. 아직이면 Deferred
    fn await_completion(&mut self, ctx: &SfrmContext) -> Result<TaskOutcome> {
        let message_id = self.message_id().to_string();

        // 조건 확인 전에 먼저 등록
        self.waiting = Some(ctx.completion.register(&message_id));

        let mut message = self.load_message(ctx)?;
        if message.is_failed() {
            info!(message_id = %message_id, "메시지가 실패로 종료됨, 재조립 중단");
            self.discard(ctx);
            self.finish(ctx);
            return Ok(TaskOutcome::Success);
        }

        let processed = ctx.records.count_segments_by_status(
            &message_id,
            MessageBox::Inbox,
            SegmentType::Payload,
            SegmentStatus::Processed,
        )?;
        let expected = message.expected_payload_segments();
        if processed < expected {
            debug!(message_id = %message_id, processed, expected, "영수증 대기");
            let wake = self.waiting.as_ref().map(CompletionGuard::notifier);
            return Ok(TaskOutcome::Deferred {
                wake,
                after: ctx.config.completion_poll_interval(),
            });
        }

        if message.status != MessageStatus::Processed {
            message.set_status(MessageStatus::Processed);
            match ctx.records.update_message(&message) {
                Ok(()) => {}
                Err(Error::MessageFinalized { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let processed_archive = ctx.incoming_packaged.transition(&self.archive, PayloadState::Processed)?;
        ctx.incoming_packaged.remove(&processed_archive)?;
        self.archive = processed_archive;

        if let Some(folder) = self.folder.take() {
            if let Some(previous) = ctx.incoming.get(&folder.key, PayloadState::Pending) {
                warn!(payload = %folder.key, "같은 이름의 수신 폴더를 교체");
                ctx.incoming.remove(&previous)?;
            }
            let delivered = ctx.incoming.transition(&folder, PayloadState::Pending)?;
            info!(
                message_id = %message_id,
                segments = processed,
                path = %delivered.path.display(),
                "메시지 수신 완료"
            );
        }

        self.finish(ctx);
        Ok(TaskOutcome::Success)
    }

    /// 아카이브와 작업 폴더 삭제 (실패는 로그만)
    fn discard(&mut self, ctx: &SfrmContext) {
        if let Err(e) = ctx.incoming_packaged.purge(&self.archive.key) {
            warn!(payload = %self.archive.key, error = %e, "수신 아카이브 삭제 실패");
        }
        let folder = self
            .folder
            .take()
            .or_else(|| ctx.incoming.get(&self.archive.key, PayloadState::Uploading));
        if let Some(folder) = folder {
            if let Err(e) = ctx.incoming.remove(&folder) {
                warn!(payload = %folder.key, error = %e, "작업 폴더 삭제 실패");
            }
        }
    }

    fn finish(&mut self, ctx: &SfrmContext) {
        self.waiting = None;
        ctx.clear_message_caches(&self.archive.key.message_id);
    }

    async fn run(&mut self, ctx: &SfrmContext) -> Result<TaskOutcome> {
        if self.phase == Phase::Extract {
            if !self.extract(ctx).await? {
                self.finish(ctx);
                return Ok(TaskOutcome::Success);
            }
            self.phase = Phase::Await;
        }
        self.await_completion(ctx)
    }
}

#[async_trait]
impl Task for ReassemblyTask {
    fn key(&self) -> String {
        format!("reassembly/{}", self.archive.key)
    }

    fn describe(&self) -> String {
        format!("reassembly {}", self.archive.key)
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
        match self.run(ctx).await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::from_error(e),
        }
    }

    async fn on_terminal_failure(&mut self, ctx: &SfrmContext, failure: &TaskFailure) -> Result<()> {
        let message_id = self.message_id().to_string();
        self.waiting = None;

        let message = ctx.records.retrieve_message(&message_id, MessageBox::Inbox)?;
        self.discard(ctx);

        if let Some(mut message) = message {
            if !message.status.is_terminal() {
                message.fail(failure.error.to_string());
                ctx.records.update_message(&message)?;
            }
            // 송신측에 실패 통지
            if message.is_failed() {
                ctx.records.create_segment(&Segment::control(SegmentKey::new(
                    message_id.clone(),
                    MessageBox::Outbox,
                    0,
                    SegmentType::Error,
                )))?;
            }
        }

        ctx.clear_message_caches(&message_id);
        Ok(())
    }
}
