//! 메시지와 세그먼트 레코드
//!
//! - Message: 하나의 전송 단위 (파트너십 + 메시지 ID + 방향)
//! - Segment: 메시지 아카이브의 고정 크기 바이트 범위, 또는 제어/영수증 단위

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 메시지 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageBox {
    Inbox,
    Outbox,
}

impl MessageBox {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageBox::Inbox => "INBOX",
            MessageBox::Outbox => "OUTBOX",
        }
    }
}

impl fmt::Display for MessageBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageBox {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INBOX" | "IN" => Ok(MessageBox::Inbox),
            "OUTBOX" | "OUT" => Ok(MessageBox::Outbox),
            other => Err(Error::InvalidHeader {
                name: "message-box",
                reason: format!("unknown message box {other}"),
            }),
        }
    }
}

/// 메시지 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    Handshaking,
    Packaging,
    Packaged,
    Segmenting,
    Processing,
    Unpackaging,
    Processed,
    DeliveryFailure,
}

impl MessageStatus {
    /// 저장/조회용 상태 코드
    pub fn code(&self) -> &'static str {
        match self {
            MessageStatus::Handshaking => "HS",
            MessageStatus::Packaging => "PK",
            MessageStatus::Packaged => "PKD",
            MessageStatus::Segmenting => "ST",
            MessageStatus::Processing => "PR",
            MessageStatus::Unpackaging => "UK",
            MessageStatus::Processed => "PS",
            MessageStatus::DeliveryFailure => "DF",
        }
    }

    /// 기본 상태 설명
    pub fn description(&self) -> &'static str {
        match self {
            MessageStatus::Handshaking => "Connecting to partner.",
            MessageStatus::Packaging => "Message is packaging.",
            MessageStatus::Packaged => "Message is packaged.",
            MessageStatus::Segmenting => "Message is segmenting.",
            MessageStatus::Processing => "Message is processing.",
            MessageStatus::Unpackaging => "Message is un-packaging.",
            MessageStatus::Processed => "Message is processed.",
            MessageStatus::DeliveryFailure => "Message delivery failed.",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Processed | MessageStatus::DeliveryFailure)
    }

    /// 총 크기와 세그먼트 수를 아직 바꿀 수 있는 상태
    pub fn totals_mutable(&self) -> bool {
        matches!(self, MessageStatus::Handshaking | MessageStatus::Packaging)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 세그먼트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SegmentType {
    Meta,
    Payload,
    Receipt,
    LastReceipt,
    Recovery,
    Error,
}

impl SegmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentType::Meta => "META",
            SegmentType::Payload => "PAYLOAD",
            SegmentType::Receipt => "RECEIPT",
            SegmentType::LastReceipt => "RECEIPT_LAST",
            SegmentType::Recovery => "RECOVERY",
            SegmentType::Error => "ERROR",
        }
    }

    /// 수신측이 보내는 확인 세그먼트
    pub fn is_receipt(&self) -> bool {
        matches!(
            self,
            SegmentType::Receipt | SegmentType::LastReceipt | SegmentType::Recovery
        )
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "META" => Ok(SegmentType::Meta),
            "PAYLOAD" => Ok(SegmentType::Payload),
            "RECEIPT" => Ok(SegmentType::Receipt),
            "RECEIPT_LAST" => Ok(SegmentType::LastReceipt),
            "RECOVERY" => Ok(SegmentType::Recovery),
            "ERROR" => Ok(SegmentType::Error),
            other => Err(Error::InvalidHeader {
                name: "segment-type",
                reason: format!("unknown segment type {other}"),
            }),
        }
    }
}

/// 세그먼트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Processing,
    Delivered,
    Processed,
    DeliveryFailure,
}

impl SegmentStatus {
    pub fn code(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "PD",
            SegmentStatus::Processing => "PR",
            SegmentStatus::Delivered => "DL",
            SegmentStatus::Processed => "PS",
            SegmentStatus::DeliveryFailure => "DF",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentStatus::Processed | SegmentStatus::DeliveryFailure)
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 메시지 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub message_box: MessageBox,
    pub partnership_id: String,

    /// 세그먼트를 보낼 파트너 엔드포인트
    pub partner_endpoint: String,

    pub status: MessageStatus,
    pub status_description: String,

    /// 세그먼트 수 (길이 0 페이로드는 제어 단위 1개)
    pub total_segments: u32,

    /// 아카이브 크기 (바이트)
    pub total_size: u64,

    pub is_signed: bool,
    pub is_encrypted: bool,

    pub created_at: DateTime<Utc>,
    pub proceeded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// 새 메시지 (HANDSHAKING)
    pub fn new(
        message_id: impl Into<String>,
        message_box: MessageBox,
        partnership_id: impl Into<String>,
        partner_endpoint: impl Into<String>,
    ) -> Self {
        let status = MessageStatus::Handshaking;
        Self {
            message_id: message_id.into(),
            message_box,
            partnership_id: partnership_id.into(),
            partner_endpoint: partner_endpoint.into(),
            status,
            status_description: status.description().to_string(),
            total_segments: 0,
            total_size: 0,
            is_signed: false,
            is_encrypted: false,
            created_at: Utc::now(),
            proceeded_at: None,
            completed_at: None,
        }
    }

    /// 상태 변경 (기본 설명 사용)
    pub fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.status_description = status.description().to_string();
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// DELIVERY_FAILURE로 변경
    pub fn fail(&mut self, description: impl Into<String>) {
        self.status = MessageStatus::DeliveryFailure;
        self.status_description = description.into();
        self.completed_at = Some(Utc::now());
    }

    /// 완료 조건이 되는 PAYLOAD 세그먼트 수
    pub fn expected_payload_segments(&self) -> u32 {
        if self.total_size == 0 {
            0
        } else {
            self.total_segments
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::DeliveryFailure
    }
}

/// 세그먼트 식별자
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub message_id: String,
    pub message_box: MessageBox,
    pub segment_no: u32,
    pub segment_type: SegmentType,
}

impl SegmentKey {
    pub fn new(
        message_id: impl Into<String>,
        message_box: MessageBox,
        segment_no: u32,
        segment_type: SegmentType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            message_box,
            segment_no,
            segment_type,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.message_box, self.message_id, self.segment_type, self.segment_no
        )
    }
}

/// 세그먼트 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub key: SegmentKey,
    pub status: SegmentStatus,

    /// 바이트 범위 [start, end)
    pub start: u64,
    pub end: u64,

    /// 재시도 횟수 (재시작 후에도 유지)
    pub retried: u32,

    pub created_at: DateTime<Utc>,
    pub proceeded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Segment {
    /// 새 세그먼트 (PENDING)
    pub fn new(key: SegmentKey, start: u64, end: u64) -> Self {
        Self {
            key,
            status: SegmentStatus::Pending,
            start,
            end,
            retried: 0,
            created_at: Utc::now(),
            proceeded_at: None,
            completed_at: None,
        }
    }

    /// 범위가 없는 제어/영수증 세그먼트
    pub fn control(key: SegmentKey) -> Self {
        Self::new(key, 0, 0)
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_status(&mut self, status: SegmentStatus) {
        self.status = status;
        let now = Utc::now();
        match status {
            SegmentStatus::Delivered => self.proceeded_at = Some(now),
            SegmentStatus::Processed | SegmentStatus::DeliveryFailure => {
                self.completed_at = Some(now)
            }
            SegmentStatus::Pending | SegmentStatus::Processing => {}
        }
    }

    /// 마지막 변경 시각
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.proceeded_at)
            .unwrap_or(self.created_at)
    }
}
