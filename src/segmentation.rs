//! 세그먼트 분할
//!
//! 아카이브 크기 S, 세그먼트 크기 C 일 때 PAYLOAD 세그먼트는 `ceil(S/C)` 개이며
//! 범위는 `[0, S)` 를 빈틈없이 덮는다. 이미 저장된 최대 번호 이후만 생성하므로
//! 크래시 후 다시 실행해도 기존 세그먼트를 다시 만들지 않는다.

use tracing::debug;

use crate::record::{Message, MessageBox, Segment, SegmentKey, SegmentType};
use crate::store::RecordStore;
use crate::{Error, Result};

/// 분할 계획
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub total_size: u64,
    pub segment_size: u64,
    payload_segments: u32,
}

impl SegmentPlan {
    /// 세그먼트 수가 u32 를 넘으면 에러
    pub fn new(total_size: u64, segment_size: u64) -> Result<Self> {
        if segment_size == 0 {
            return Err(Error::Config("segment size must be greater than zero".into()));
        }
        let payload_segments = u32::try_from(total_size.div_ceil(segment_size)).map_err(|_| {
            Error::Config(format!(
                "{total_size} bytes need more than {} segments of {segment_size} bytes",
                u32::MAX
            ))
        })?;
        Ok(Self {
            total_size,
            segment_size,
            payload_segments,
        })
    }

    /// 메시지에 기록되는 세그먼트 수 (길이 0이면 제어 단위 1개)
    pub fn total_segments(&self) -> u32 {
        if self.total_size == 0 {
            1
        } else {
            self.payload_segments()
        }
    }

    /// PAYLOAD 세그먼트 수
    pub fn payload_segments(&self) -> u32 {
        self.payload_segments
    }

    /// segment_no (1부터) 의 바이트 범위 [start, end)
    pub fn range(&self, segment_no: u32) -> Option<(u64, u64)> {
        if segment_no == 0 || segment_no > self.payload_segments() {
            return None;
        }
        let start = (segment_no as u64 - 1) * self.segment_size;
        let end = (start + self.segment_size).min(self.total_size);
        Some((start, end))
    }

    /// 이미 저장된 최대 번호 이후의 범위
    pub fn resume_from(&self, max_existing: u32) -> impl Iterator<Item = (u32, u64, u64)> + '_ {
        (max_existing + 1..=self.payload_segments())
            .filter_map(move |no| self.range(no).map(|(start, end)| (no, start, end)))
    }
}

/// 세그먼트 레코드 생성기
pub struct SegmentationEngine;

impl SegmentationEngine {
    /// 메시지의 PAYLOAD 세그먼트를 PENDING 으로 생성, 새로 만든 개수 반환
    pub fn segment(store: &dyn RecordStore, message: &Message, segment_size: u64) -> Result<u32> {
        let plan = SegmentPlan::new(message.total_size, segment_size)?;
        let max_existing = store
            .find_max_segment_no(&message.message_id, MessageBox::Outbox, SegmentType::Payload)?
            .unwrap_or(0);

        let mut created = 0;
        for (segment_no, start, end) in plan.resume_from(max_existing) {
            let key = SegmentKey::new(
                message.message_id.clone(),
                MessageBox::Outbox,
                segment_no,
                SegmentType::Payload,
            );
            if store.create_segment(&Segment::new(key, start, end))? {
                created += 1;
            }
        }

        debug!(
            message_id = %message.message_id,
            resumed_after = max_existing,
            created,
            total = plan.payload_segments(),
            "세그먼트 생성"
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MessageStatus;
    use crate::store::MemoryRecordStore;

    fn packaged(total_size: u64) -> Message {
        let mut message = Message::new("m1", MessageBox::Outbox, "acme", "http://acme");
        message.total_size = total_size;
        message.set_status(MessageStatus::Segmenting);
        message
    }

    #[test]
    fn test_ranges_tile_payload() {
        for (size, chunk) in [(2_500_000u64, 1_000_000u64), (3_000_000, 1_000_000), (1, 7), (7, 7), (8, 7)] {
            let plan = SegmentPlan::new(size, chunk).unwrap();
            let ranges: Vec<_> = plan.resume_from(0).collect();
            assert_eq!(ranges.len() as u64, size.div_ceil(chunk));

            let mut cursor = 0;
            for (i, (no, start, end)) in ranges.iter().enumerate() {
                assert_eq!(*no as usize, i + 1);
                assert_eq!(*start, cursor);
                assert!(end - start <= chunk);
                cursor = *end;
            }
            assert_eq!(cursor, size);
        }
    }

    #[test]
    fn test_scenario_b_plan() {
        let plan = SegmentPlan::new(2_500_000, 1_000_000).unwrap();
        assert_eq!(plan.total_segments(), 3);
        assert_eq!(plan.range(1), Some((0, 1_000_000)));
        assert_eq!(plan.range(2), Some((1_000_000, 2_000_000)));
        assert_eq!(plan.range(3), Some((2_000_000, 2_500_000)));
        assert_eq!(plan.range(4), None);
    }

    #[test]
    fn test_zero_length_is_control_only() {
        let plan = SegmentPlan::new(0, 1_000_000).unwrap();
        assert_eq!(plan.total_segments(), 1);
        assert_eq!(plan.payload_segments(), 0);
        assert_eq!(plan.resume_from(0).count(), 0);
        assert!(SegmentPlan::new(10, 0).is_err());
    }

    #[test]
    fn test_segment_count_must_fit_u32() {
        let limit = u64::from(u32::MAX);
        assert_eq!(SegmentPlan::new(limit, 1).unwrap().payload_segments(), u32::MAX);
        assert!(matches!(SegmentPlan::new(limit + 1, 1), Err(Error::Config(_))));
    }

    #[test]
    fn test_resume_after_crash() {
        let store = MemoryRecordStore::new();
        let message = packaged(10_000);

        // 처음 4개만 만들어진 상태에서 크래시
        let plan = SegmentPlan::new(10_000, 1_000).unwrap();
        for (no, start, end) in plan.resume_from(0).take(4) {
            let mut segment = Segment::new(
                SegmentKey::new("m1", MessageBox::Outbox, no, SegmentType::Payload),
                start,
                end,
            );
            segment.retried = 9;
            store.create_segment(&segment).unwrap();
        }

        assert_eq!(SegmentationEngine::segment(&store, &message, 1_000).unwrap(), 6);
        assert_eq!(SegmentationEngine::segment(&store, &message, 1_000).unwrap(), 0);

        // 기존 행은 그대로
        let first = store
            .find_segment(&SegmentKey::new("m1", MessageBox::Outbox, 1, SegmentType::Payload))
            .unwrap()
            .unwrap();
        assert_eq!(first.retried, 9);
        let last = store
            .find_segment(&SegmentKey::new("m1", MessageBox::Outbox, 10, SegmentType::Payload))
            .unwrap()
            .unwrap();
        assert_eq!((last.start, last.end, last.retried), (9_000, 10_000, 0));
    }
}
