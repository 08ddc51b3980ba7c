//! 와이어 세그먼트 - HTTP 헤더 + 본문
//!
//! 모든 필드는 `x-sfrm-*` 헤더로 전달되고, 본문은 보안 변환을 거친 세그먼트 내용이다.
//! LAST_RECEIPT 는 RECEIPT 타입 + `x-sfrm-last-receipt: true` 로 전송된다.

use bytes::Bytes;

use crate::record::SegmentType;
use crate::{Error, Result, HEADER_PREFIX, PROTOCOL_VERSION};

pub const H_MESSAGE_ID: &str = "x-sfrm-message-id";
pub const H_PARTNERSHIP_ID: &str = "x-sfrm-partnership-id";
pub const H_SEGMENT_NO: &str = "x-sfrm-segment-no";
pub const H_SEGMENT_TYPE: &str = "x-sfrm-segment-type";
pub const H_SEGMENT_OFFSET: &str = "x-sfrm-segment-offset";
pub const H_SEGMENT_LENGTH: &str = "x-sfrm-segment-length";
pub const H_TOTAL_SIZE: &str = "x-sfrm-total-size";
pub const H_TOTAL_SEGMENTS: &str = "x-sfrm-total-segments";
pub const H_MIC: &str = "x-sfrm-mic";
pub const H_LAST_RECEIPT: &str = "x-sfrm-last-receipt";
pub const H_SIGNED: &str = "x-sfrm-signed";
pub const H_ENCRYPTED: &str = "x-sfrm-encrypted";
pub const H_CONTENT_CRC: &str = "x-sfrm-content-crc";
pub const H_VERSION: &str = "x-sfrm-version";

/// 세그먼트 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub message_id: String,
    pub partnership_id: String,
    pub segment_no: u32,
    pub segment_type: SegmentType,
    pub segment_offset: u64,
    pub segment_length: u64,

    /// META 전용
    pub total_size: Option<u64>,
    /// META 전용
    pub total_segments: Option<u32>,

    /// 보안 변환 전 내용의 다이제스트 (PAYLOAD 전용, hex)
    pub mic_value: Option<String>,

    pub is_signed: bool,
    pub is_encrypted: bool,

    /// 전송 본문 CRC32
    pub content_crc: u32,

    pub protocol_version: u8,
}

impl SegmentHeader {
    pub fn new(
        message_id: impl Into<String>,
        partnership_id: impl Into<String>,
        segment_no: u32,
        segment_type: SegmentType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            partnership_id: partnership_id.into(),
            segment_no,
            segment_type,
            segment_offset: 0,
            segment_length: 0,
            total_size: None,
            total_segments: None,
            mic_value: None,
            is_signed: false,
            is_encrypted: false,
            content_crc: 0,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn is_last_receipt(&self) -> bool {
        self.segment_type == SegmentType::LastReceipt
    }

    /// 헤더 목록으로 변환
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let wire_type = match self.segment_type {
            SegmentType::LastReceipt => SegmentType::Receipt,
            other => other,
        };
        let mut headers = vec![
            (H_VERSION, self.protocol_version.to_string()),
            (H_MESSAGE_ID, self.message_id.clone()),
            (H_PARTNERSHIP_ID, self.partnership_id.clone()),
            (H_SEGMENT_NO, self.segment_no.to_string()),
            (H_SEGMENT_TYPE, wire_type.as_str().to_string()),
            (H_SEGMENT_OFFSET, self.segment_offset.to_string()),
            (H_SEGMENT_LENGTH, self.segment_length.to_string()),
            (H_LAST_RECEIPT, self.is_last_receipt().to_string()),
            (H_SIGNED, self.is_signed.to_string()),
            (H_ENCRYPTED, self.is_encrypted.to_string()),
            (H_CONTENT_CRC, format!("{:08x}", self.content_crc)),
        ];
        if let Some(total_size) = self.total_size {
            headers.push((H_TOTAL_SIZE, total_size.to_string()));
        }
        if let Some(total_segments) = self.total_segments {
            headers.push((H_TOTAL_SEGMENTS, total_segments.to_string()));
        }
        if let Some(mic) = &self.mic_value {
            headers.push((H_MIC, mic.clone()));
        }
        headers
    }

    /// 헤더 조회 함수로부터 복원
    pub fn from_headers<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Result<Self> {
        let required = |name: &'static str| {
            lookup(name).ok_or(Error::InvalidHeader {
                name,
                reason: "missing".into(),
            })
        };
        let parse_flag = |name: &'static str| -> Result<bool> {
            match lookup(name) {
                None => Ok(false),
                Some(v) => v.trim().parse().map_err(|_| Error::InvalidHeader {
                    name,
                    reason: format!("not a boolean: {v}"),
                }),
            }
        };

        let version: u8 = parse_number(H_VERSION, required(H_VERSION)?)?;
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidHeader {
                name: H_VERSION,
                reason: format!("unsupported protocol version {version}"),
            });
        }

        let mut segment_type: SegmentType = required(H_SEGMENT_TYPE)?.parse()?;
        if segment_type == SegmentType::Receipt && parse_flag(H_LAST_RECEIPT)? {
            segment_type = SegmentType::LastReceipt;
        }

        let crc_text = required(H_CONTENT_CRC)?;
        let content_crc = u32::from_str_radix(crc_text.trim(), 16).map_err(|_| Error::InvalidHeader {
            name: H_CONTENT_CRC,
            reason: format!("not a hex crc: {crc_text}"),
        })?;

        Ok(Self {
            message_id: required(H_MESSAGE_ID)?.to_string(),
            partnership_id: required(H_PARTNERSHIP_ID)?.to_string(),
            segment_no: parse_number(H_SEGMENT_NO, required(H_SEGMENT_NO)?)?,
            segment_type,
            segment_offset: parse_number(H_SEGMENT_OFFSET, required(H_SEGMENT_OFFSET)?)?,
            segment_length: parse_number(H_SEGMENT_LENGTH, required(H_SEGMENT_LENGTH)?)?,
            total_size: lookup(H_TOTAL_SIZE)
                .map(|v| parse_number(H_TOTAL_SIZE, v))
                .transpose()?,
            total_segments: lookup(H_TOTAL_SEGMENTS)
                .map(|v| parse_number(H_TOTAL_SEGMENTS, v))
                .transpose()?,
            mic_value: lookup(H_MIC).map(str::to_string),
            is_signed: parse_flag(H_SIGNED)?,
            is_encrypted: parse_flag(H_ENCRYPTED)?,
            content_crc,
            protocol_version: version,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::InvalidHeader {
        name,
        reason: format!("not a number: {value}"),
    })
}

/// 헤더 이름이 이 프로토콜 소속인지
pub fn is_protocol_header(name: &str) -> bool {
    name.len() > HEADER_PREFIX.len() && name[..HEADER_PREFIX.len()].eq_ignore_ascii_case(HEADER_PREFIX)
}

/// 전송 단위
#[derive(Debug, Clone)]
pub struct WireSegment {
    pub header: SegmentHeader,
    pub body: Bytes,
}

impl WireSegment {
    /// 본문 CRC를 채워서 생성
    pub fn new(mut header: SegmentHeader, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        header.content_crc = crc32fast::hash(&body);
        Self { header, body }
    }

    /// 본문 CRC 확인
    pub fn verify_crc(&self) -> Result<()> {
        let got = crc32fast::hash(&self.body);
        if got != self.header.content_crc {
            return Err(Error::CrcMismatch {
                expected: self.header.content_crc,
                got,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(headers: &[(&'static str, String)]) -> HashMap<&'static str, String> {
        headers.iter().cloned().collect()
    }

    #[test]
    fn test_meta_headers() {
        let mut header = SegmentHeader::new("m1", "acme", 0, SegmentType::Meta);
        header.total_size = Some(2_500_000);
        header.total_segments = Some(3);
        let segment = WireSegment::new(header, Bytes::new());

        let map = lookup_in(&segment.header.to_headers());
        let parsed = SegmentHeader::from_headers(|name| map.get(name).map(String::as_str)).unwrap();
        assert_eq!(parsed, segment.header);
    }

    #[test]
    fn test_last_receipt_travels_as_flagged_receipt() {
        let header = SegmentHeader::new("m1", "acme", 3, SegmentType::LastReceipt);
        let headers = header.to_headers();
        let map = lookup_in(&headers);
        assert_eq!(map[H_SEGMENT_TYPE], "RECEIPT");
        assert_eq!(map[H_LAST_RECEIPT], "true");

        let parsed = SegmentHeader::from_headers(|name| map.get(name).map(String::as_str)).unwrap();
        assert_eq!(parsed.segment_type, SegmentType::LastReceipt);
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let header = SegmentHeader::new("m1", "acme", 1, SegmentType::Payload);
        let mut map = lookup_in(&header.to_headers());
        map.remove(H_MESSAGE_ID);
        let err = SegmentHeader::from_headers(|name| map.get(name).map(String::as_str)).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader { name: H_MESSAGE_ID, .. }));

        let mut map = lookup_in(&header.to_headers());
        map.insert(H_SEGMENT_NO, "one".into());
        assert!(SegmentHeader::from_headers(|name| map.get(name).map(String::as_str)).is_err());
    }

    #[test]
    fn test_crc_detects_corruption() {
        let segment = WireSegment::new(SegmentHeader::new("m1", "acme", 1, SegmentType::Payload), b"abc".to_vec());
        assert!(segment.verify_crc().is_ok());

        let corrupted = WireSegment {
            header: segment.header.clone(),
            body: Bytes::from_static(b"abd"),
        };
        assert!(matches!(corrupted.verify_crc(), Err(Error::CrcMismatch { .. })));
        assert!(is_protocol_header("X-SFRM-Message-Id"));
        assert!(!is_protocol_header("content-type"));
    }
}
