//! 수신 핸들러 - 파트너가 보낸 세그먼트 하나를 처리하고 HTTP 상태 코드를 돌려준다
//!
//! | 종류 | 처리 |
//! |------|------|
//! | META | INBOX 메시지 생성, 수신 승인, 조립 아카이브 사전 할당 |
//! | PAYLOAD | MIC/범위 확인 후 오프셋 위치에 기록, 영수증 대기열에 추가 |
//! | RECEIPT / RECEIPT_LAST / RECOVERY | OUTBOX PAYLOAD 세그먼트 PROCESSED, 완료 확인 |
//! | ERROR | 파트너가 보고한 실패를 OUTBOX 메시지에 기록 |
//!
//! 같은 메시지의 세그먼트는 메시지 락 아래에서 하나씩 처리한다.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::SfrmContext;
use crate::crypto::DigestAlgorithm;
use crate::outbound::{complete_if_done, retire_archive};
use crate::partnership::Partnership;
use crate::payload::{PayloadKey, PayloadState};
use crate::record::{Message, MessageBox, MessageStatus, Segment, SegmentKey, SegmentStatus, SegmentType};
use crate::wire::{SegmentHeader, WireSegment, H_TOTAL_SEGMENTS, H_TOTAL_SIZE};
use crate::{Error, Result};

/// 수신 세그먼트 처리기
#[derive(Clone)]
pub struct InboundHandler {
    ctx: Arc<SfrmContext>,
}

impl InboundHandler {
    pub fn new(ctx: Arc<SfrmContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SfrmContext> {
        &self.ctx
    }

    /// 세그먼트 처리 후 응답 코드 반환 (200 만 성공)
    pub async fn accept(&self, segment: WireSegment) -> u16 {
        let header = segment.header.clone();
        match self.handle(segment).await {
            Ok(()) => 200,
            Err(e) => {
                let status = e.http_status();
                warn!(
                    message_id = %header.message_id,
                    partnership_id = %header.partnership_id,
                    segment_no = header.segment_no,
                    segment_type = %header.segment_type,
                    status,
                    error = %e,
                    "세그먼트 거부"
                );
                status
            }
        }
    }

    async fn handle(&self, segment: WireSegment) -> Result<()> {
        let ctx = &self.ctx;
        segment.verify_crc()?;
        let WireSegment { header, body } = segment;

        let partnership = ctx
            .partnerships
            .retrieve(&header.partnership_id, &header.message_id)?;
        let content = ctx
            .security(&partnership)
            .unpack(&body, header.is_signed, header.is_encrypted)?;

        let _guard = ctx.locks.lock(&header.message_id).await;
        match header.segment_type {
            SegmentType::Meta => self.on_meta(&header, &partnership),
            SegmentType::Payload => self.on_payload(&header, &content),
            SegmentType::Receipt | SegmentType::LastReceipt | SegmentType::Recovery => {
                self.on_receipt(&header)
            }
            SegmentType::Error => self.on_error(&header, &content),
        }
    }

    /// 송신측의 총 크기/세그먼트 수 통지
    fn on_meta(&self, header: &SegmentHeader, partnership: &Partnership) -> Result<()> {
        let ctx = &self.ctx;
        let total_size = header.total_size.ok_or(Error::InvalidHeader {
            name: H_TOTAL_SIZE,
            reason: "missing on META".into(),
        })?;
        let total_segments = header.total_segments.ok_or(Error::InvalidHeader {
            name: H_TOTAL_SEGMENTS,
            reason: "missing on META".into(),
        })?;
        if total_size > 0 && total_segments == 0 {
            return Err(Error::InvalidHeader {
                name: H_TOTAL_SEGMENTS,
                reason: format!("0 segments for {total_size} bytes"),
            });
        }

        let key = PayloadKey::new(header.partnership_id.clone(), header.message_id.clone())?;
        let existing = ctx.records.retrieve_message(&header.message_id, MessageBox::Inbox)?;

        let mut message = match existing {
            None => {
                ctx.admit(total_size, &ctx.incoming_packaged)?;
                let mut message = Message::new(
                    header.message_id.clone(),
                    MessageBox::Inbox,
                    header.partnership_id.clone(),
                    partnership.partner_endpoint.clone(),
                );
                message.total_size = total_size;
                message.total_segments = total_segments;
                message.is_signed = header.is_signed;
                message.is_encrypted = header.is_encrypted;
                ctx.records.create_message(&message)?;
                message
            }
            Some(message) if message.is_failed() => {
                debug!(message_id = %header.message_id, "실패한 메시지의 META, 무시");
                return Ok(());
            }
            Some(message) if message.total_size == total_size && message.total_segments == total_segments => {
                // 재전송된 같은 통지
                if message.status != MessageStatus::Handshaking
                    || ctx.incoming_packaged.find(&key).is_some()
                {
                    return Ok(());
                }
                message
            }
            Some(mut message) if message.status == MessageStatus::Handshaking => {
                ctx.admit(total_size, &ctx.incoming_packaged)?;
                info!(
                    message_id = %header.message_id,
                    from = message.total_size,
                    to = total_size,
                    "META 재통지, 총 크기 변경"
                );
                message.total_size = total_size;
                message.total_segments = total_segments;
                ctx.records.update_message(&message)?;
                message
            }
            Some(_) => {
                return Err(Error::DuplicateMessage {
                    message_id: header.message_id.clone(),
                });
            }
        };

        // 조립 아카이브를 새로 준비
        ctx.incoming_packaged.purge(&key)?;
        let archive = ctx.incoming_packaged.create(&key, PayloadState::Uploading)?;
        ctx.incoming_packaged.allocate(&archive, total_size)?;
        if message.expected_payload_segments() == 0 {
            ctx.incoming_packaged.transition(&archive, PayloadState::Pending)?;
        }

        message.proceeded_at = Some(chrono::Utc::now());
        ctx.records.update_message(&message)?;
        info!(
            message_id = %header.message_id,
            partnership_id = %header.partnership_id,
            total_size,
            total_segments,
            "수신 메시지 등록"
        );
        Ok(())
    }

    fn on_payload(&self, header: &SegmentHeader, content: &[u8]) -> Result<()> {
        let ctx = &self.ctx;
        let message_id = &header.message_id;
        let mut message = ctx
            .records
            .retrieve_message(message_id, MessageBox::Inbox)?
            .ok_or_else(|| Error::RecordNotFound(format!("inbound message {message_id}")))?;

        match message.status {
            MessageStatus::DeliveryFailure => {
                debug!(message_id = %message_id, segment_no = header.segment_no, "실패한 메시지의 세그먼트, 버림");
                return Ok(());
            }
            MessageStatus::Processed => return Ok(()),
            _ => {}
        }

        if let Some(mic) = &header.mic_value {
            let algorithm = DigestAlgorithm::from_hex_len(mic.trim().len()).ok_or(Error::InvalidHeader {
                name: crate::wire::H_MIC,
                reason: format!("unknown digest length {}", mic.trim().len()),
            })?;
            if !algorithm.verify(content, mic) {
                return Err(Error::MicMismatch {
                    segment_no: header.segment_no,
                });
            }
        }

        let offset = header.segment_offset;
        let length = content.len() as u64;
        let in_range = header.segment_no >= 1
            && header.segment_no <= message.total_segments
            && length > 0
            && length == header.segment_length
            && offset
                .checked_add(length)
                .is_some_and(|end| end <= message.total_size);
        if !in_range {
            return Err(Error::InvalidSegmentRange {
                segment_no: header.segment_no,
                offset,
                length,
            });
        }

        let segment_key = SegmentKey::new(
            message_id.clone(),
            MessageBox::Inbox,
            header.segment_no,
            SegmentType::Payload,
        );
        if ctx.records.find_segment(&segment_key)?.is_some() {
            debug!(message_id = %message_id, segment_no = header.segment_no, "중복 세그먼트, 영수증만 다시 보냄");
            return self.requeue_receipt(message_id, header.segment_no);
        }

        let key = PayloadKey::new(header.partnership_id.clone(), message_id.clone())?;
        let archive = ctx
            .incoming_packaged
            .get(&key, PayloadState::Uploading)
            .ok_or_else(|| Error::PayloadNotFound(format!("joining archive for {key}")))?;
        ctx.incoming_packaged.write_at(&archive, offset, content)?;

        let mut segment = Segment::new(segment_key, offset, offset + length);
        segment.set_status(SegmentStatus::Delivered);
        ctx.records.create_segment(&segment)?;

        if message.status == MessageStatus::Handshaking {
            message.set_status(MessageStatus::Processing);
            ctx.records.update_message(&message)?;
        }

        let received = [SegmentStatus::Delivered, SegmentStatus::Processed]
            .into_iter()
            .map(|status| {
                ctx.records
                    .count_segments_by_status(message_id, MessageBox::Inbox, SegmentType::Payload, status)
            })
            .sum::<Result<u32>>()?;

        let receipt_type = if received >= message.expected_payload_segments() {
            ctx.incoming_packaged.transition(&archive, PayloadState::Pending)?;
            info!(message_id = %message_id, segments = received, "아카이브 조립 완료");
            SegmentType::LastReceipt
        } else {
            SegmentType::Receipt
        };
        ctx.records.create_segment(&Segment::control(SegmentKey::new(
            message_id.clone(),
            MessageBox::Outbox,
            header.segment_no,
            receipt_type,
        )))?;
        debug!(
            message_id = %message_id,
            segment_no = header.segment_no,
            offset,
            length,
            received,
            "세그먼트 수신"
        );
        Ok(())
    }

    /// 중복 수신 시 영수증 재전송 예약
    fn requeue_receipt(&self, message_id: &str, segment_no: u32) -> Result<()> {
        let ctx = &self.ctx;
        for receipt_type in [SegmentType::LastReceipt, SegmentType::Receipt] {
            let key = SegmentKey::new(message_id, MessageBox::Outbox, segment_no, receipt_type);
            if let Some(mut receipt) = ctx.records.find_segment(&key)? {
                if matches!(receipt.status, SegmentStatus::Delivered | SegmentStatus::Processed) {
                    receipt.set_status(SegmentStatus::Pending);
                    ctx.records.persist_segment(&receipt)?;
                }
                return Ok(());
            }
        }
        ctx.records.create_segment(&Segment::control(SegmentKey::new(
            message_id,
            MessageBox::Outbox,
            segment_no,
            SegmentType::Receipt,
        )))?;
        Ok(())
    }

    /// 송신측: 파트너가 PAYLOAD 세그먼트를 처리했다는 확인
    fn on_receipt(&self, header: &SegmentHeader) -> Result<()> {
        let ctx = &self.ctx;
        let message_id = &header.message_id;
        let message = ctx
            .records
            .retrieve_message(message_id, MessageBox::Outbox)?
            .ok_or_else(|| Error::RecordNotFound(format!("outbound message {message_id}")))?;
        if message.status.is_terminal() {
            debug!(message_id = %message_id, status = %message.status, "종료된 메시지의 영수증, 무시");
            return Ok(());
        }

        let key = SegmentKey::new(
            message_id.clone(),
            MessageBox::Outbox,
            header.segment_no,
            SegmentType::Payload,
        );
        let mut segment = ctx
            .records
            .find_segment(&key)?
            .ok_or_else(|| Error::RecordNotFound(format!("segment {key}")))?;
        if segment.status != SegmentStatus::Processed {
            segment.set_status(SegmentStatus::Processed);
            ctx.records.persist_segment(&segment)?;
        }
        debug!(
            message_id = %message_id,
            segment_no = header.segment_no,
            last = header.is_last_receipt(),
            "영수증 수신"
        );

        complete_if_done(ctx, message_id)?;
        Ok(())
    }

    /// 송신측: 파트너가 재조립 실패를 보고
    fn on_error(&self, header: &SegmentHeader, content: &[u8]) -> Result<()> {
        let ctx = &self.ctx;
        let message_id = &header.message_id;
        let Some(mut message) = ctx.records.retrieve_message(message_id, MessageBox::Outbox)? else {
            return Err(Error::RecordNotFound(format!("outbound message {message_id}")));
        };
        if message.status.is_terminal() {
            return Ok(());
        }

        let reason = String::from_utf8_lossy(content);
        warn!(message_id = %message_id, reason = %reason, "파트너가 실패를 보고");
        message.fail(format!("Partner reported failure: {reason}"));
        ctx.records.update_message(&message)?;
        retire_archive(ctx, &message.partnership_id, message_id);
        ctx.clear_message_caches(message_id);
        Ok(())
    }
}
