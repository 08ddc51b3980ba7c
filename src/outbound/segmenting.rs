//! 세그먼트 분할 단계
//!
//! PACKAGED 메시지의 아카이브를 `segment_size` 단위 PAYLOAD 세그먼트 레코드로 나눈다.
//! 분할 도중 재시작하면 이미 만든 최대 번호 다음부터 이어서 만든다.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{complete_if_done, retire_archive};
use crate::context::SfrmContext;
use crate::partnership::Partnership;
use crate::record::{Message, MessageBox, MessageStatus};
use crate::segmentation::SegmentationEngine;
use crate::task::{Collector, RetryPolicy, Task, TaskFailure, TaskOutcome};
use crate::{Error, Result};

/// PACKAGED 메시지 컬렉터
pub struct PackagedPayloadsCollector {
    first_load: bool,
}

impl PackagedPayloadsCollector {
    pub fn new() -> Self {
        Self { first_load: true }
    }
}

impl Default for PackagedPayloadsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for PackagedPayloadsCollector {
    type Task = SegmentingTask;

    fn stage(&self) -> &'static str {
        "segmenting"
    }

    async fn collect(&mut self, ctx: &SfrmContext, limit: usize) -> Vec<SegmentingTask> {
        let mut messages = Vec::new();

        // 분할 도중 멈춘 메시지
        if std::mem::take(&mut self.first_load) {
            match ctx
                .records
                .retrieve_messages_by_status(MessageBox::Outbox, MessageStatus::Segmenting, limit)
            {
                Ok(found) => {
                    if !found.is_empty() {
                        info!(count = found.len(), "중단된 분할 복구");
                    }
                    messages.extend(found);
                }
                Err(e) => warn!(error = %e, "중단된 분할 조회 실패"),
            }
        }

        let remaining = limit.saturating_sub(messages.len());
        if remaining > 0 {
            match ctx
                .records
                .retrieve_messages_by_status(MessageBox::Outbox, MessageStatus::Packaged, remaining)
            {
                Ok(found) => messages.extend(found),
                Err(e) => warn!(error = %e, "PACKAGED 메시지 조회 실패"),
            }
        }

        messages
            .into_iter()
            .map(|message| SegmentingTask::new(ctx, message))
            .collect()
    }
}

/// 세그먼트 분할 태스크
pub struct SegmentingTask {
    message: Message,
    partnership: Option<Arc<Partnership>>,
    retried: u32,
}

impl SegmentingTask {
    pub fn new(ctx: &SfrmContext, message: Message) -> Self {
        let partnership = ctx
            .partnerships
            .retrieve(&message.partnership_id, &message.message_id)
            .ok();
        Self {
            message,
            partnership,
            retried: 0,
        }
    }

    fn run(&mut self, ctx: &SfrmContext) -> Result<()> {
        let message_id = self.message.message_id.clone();
        let mut message = ctx
            .records
            .retrieve_message(&message_id, MessageBox::Outbox)?
            .ok_or_else(|| Error::RecordNotFound(format!("message {message_id}")))?;

        if !matches!(message.status, MessageStatus::Packaged | MessageStatus::Segmenting) {
            debug!(message_id = %message_id, status = %message.status, "분할 대상 아님");
            return Ok(());
        }

        if message.status == MessageStatus::Packaged {
            message.set_status(MessageStatus::Segmenting);
            ctx.records.update_message(&message)?;
        }

        let created = SegmentationEngine::segment(ctx.records.as_ref(), &message, ctx.config.segment_size)?;

        if message.expected_payload_segments() == 0 {
            // 길이 0 페이로드는 META 하나로 끝난다
            message.set_status(MessageStatus::Processed);
            ctx.records.update_message(&message)?;
            retire_archive(ctx, &message.partnership_id, &message_id);
            ctx.clear_message_caches(&message_id);
            info!(message_id = %message_id, "빈 페이로드 전송 완료");
            self.message = message;
            return Ok(());
        }

        message.set_status(MessageStatus::Processing);
        ctx.records.update_message(&message)?;
        info!(
            message_id = %message_id,
            created,
            total_segments = message.total_segments,
            "세그먼트 분할 완료"
        );
        self.message = message;

        // 재시작 전에 이미 모든 영수증을 받았을 수 있다
        complete_if_done(ctx, &message_id)?;
        Ok(())
    }
}

#[async_trait]
impl Task for SegmentingTask {
    fn key(&self) -> String {
        format!("segmenting/{}", self.message.message_id)
    }

    fn describe(&self) -> String {
        format!("segmenting {}", self.message.message_id)
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
        self.run(ctx).into()
    }

    async fn on_terminal_failure(&mut self, ctx: &SfrmContext, failure: &TaskFailure) -> Result<()> {
        let message_id = self.message.message_id.clone();
        if let Some(mut message) = ctx.records.retrieve_message(&message_id, MessageBox::Outbox)? {
            if !message.status.is_terminal() {
                message.fail(failure.error.to_string());
                ctx.records.update_message(&message)?;
            }
            retire_archive(ctx, &message.partnership_id, &message_id);
        }
        ctx.clear_message_caches(&message_id);
        Ok(())
    }
}
