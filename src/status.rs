//! 메시지 상태 조회

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{MessageBox, SegmentStatus, SegmentType};
use crate::store::RecordStore;
use crate::Result;

/// 알 수 없는 메시지의 상태 값
pub const UNKNOWN_STATUS: &str = "N/A";

/// 상태 조회 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatusReport {
    pub message_id: String,
    pub message_box: String,
    pub status: String,
    pub status_description: String,
    pub total_segments: u32,
    pub processed_segments: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

impl MessageStatusReport {
    pub fn is_known(&self) -> bool {
        self.status != UNKNOWN_STATUS
    }
}

/// 메시지 상태 조회 (없는 ID 는 `N/A`)
pub fn query_status(
    records: &dyn RecordStore,
    message_id: &str,
    message_box: MessageBox,
) -> Result<MessageStatusReport> {
    let Some(message) = records.retrieve_message(message_id, message_box)? else {
        return Ok(MessageStatusReport {
            message_id: message_id.to_string(),
            message_box: message_box.to_string(),
            status: UNKNOWN_STATUS.to_string(),
            status_description: "Message not found.".to_string(),
            total_segments: 0,
            processed_segments: 0,
            last_updated: None,
        });
    };

    let processed_segments = records.count_segments_by_status(
        message_id,
        message_box,
        SegmentType::Payload,
        SegmentStatus::Processed,
    )?;
    Ok(MessageStatusReport {
        message_id: message.message_id,
        message_box: message_box.to_string(),
        status: message.status.code().to_string(),
        status_description: message.status_description,
        total_segments: message.total_segments,
        processed_segments,
        last_updated: records.last_updated(message_id, message_box)?,
    })
}
