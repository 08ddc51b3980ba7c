//! # SFRM (Segmented File Reliable Messaging)
//!
//! HTTP 기반 B2B 분할 파일 전송 엔진
//!
//! ## 핵심 특징
//! - **재개 가능**: 메시지/세그먼트 상태를 레코드 저장소에 영속화, 재시작 후 이어서 처리
//! - **분할 전송**: 아카이브를 고정 크기 세그먼트로 나눠 독립적으로 전송/확인
//! - **영수증 기반 완료**: 수신측이 세그먼트마다 영수증을 보내고, 모두 처리되면 완료
//! - **파트너십 정책**: 파트너별 재시도 횟수/간격, 서명/암호화 요구
//! - **승인 제어**: 최대 크기와 여유 디스크 공간을 전송 전에 확인
//!
//! ## 파이프라인
//! ```text
//! 송신: outgoing 폴더 → [handshake] → packaged 아카이브 → [segmenting] → [sending]
//! 수신: META/PAYLOAD → 조립 아카이브 → [reassembly] → incoming 폴더
//! ```

pub mod archiver;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod partnership;
pub mod payload;
pub mod record;
pub mod runner;
pub mod segmentation;
pub mod server;
pub mod stats;
pub mod status;
pub mod store;
pub mod sync;
pub mod task;
pub mod transport;
pub mod wire;


pub use config::Config;
pub use context::{ContextBuilder, SfrmContext};
pub use crypto::{CryptoError, LocalIdentity, SecurityTransform};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use inbound::InboundHandler;
pub use partnership::{Partnership, PartnershipSource, StaticPartnerships};
pub use payload::{Payload, PayloadKey, PayloadState, PayloadStore};
pub use record::{Message, MessageBox, MessageStatus, Segment, SegmentKey, SegmentStatus, SegmentType};
pub use segmentation::{SegmentPlan, SegmentationEngine};
pub use stats::EngineStats;
pub use status::{query_status, MessageStatusReport};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore};
pub use transport::{HttpTransport, Transport};
pub use wire::{SegmentHeader, WireSegment};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 세그먼트 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: u64 = 1_048_576; // 1MB

/// 기본 최대 페이로드 크기 (바이트)
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 50_465_865_723;

/// 프로토콜 헤더 접두사
pub const HEADER_PREFIX: &str = "x-sfrm-";
