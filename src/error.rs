//! 에러 타입 정의
//!
//! 모든 에러는 [`ErrorKind`] 로 분류되며, 태스크 러너는 이 분류만 보고
//! 재시도 여부를 결정한다.

use thiserror::Error;

use crate::crypto::CryptoError;

/// 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 페이로드 크기 초과, 디스크 부족 (재시도 없음)
    Admission,
    /// 연결 실패, 200 이외의 응답 (재시도)
    Transport,
    /// 레코드 저장소, 파일 시스템 I/O (재시도)
    Persistence,
    /// 크기 불일치, 누락된 레코드 (재시도 없음)
    Validation,
    /// 중복 메시지, 파트너십 없음, 보안 정책 위반 (재시도 없음)
    Protocol,
}

/// SFRM 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("HTTP 에러: {0}")]
    Http(#[from] reqwest::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("페이로드 크기 초과: estimated {estimated} bytes, limit {limit} bytes")]
    PayloadTooLarge { estimated: u64, limit: u64 },

    #[error("디스크 공간 부족: required {required} bytes, available {available} bytes")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("유효하지 않은 응답 코드: {status}")]
    UnexpectedResponse { status: u16 },

    #[error("레코드 저장소 에러: {0}")]
    Persistence(String),

    #[error("아카이브 에러: {0}")]
    Archive(String),

    #[error("크기 불일치: message_id={message_id}, expected {expected} bytes, actual {actual} bytes")]
    SizeMismatch {
        message_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("MIC 불일치: segment_no={segment_no}")]
    MicMismatch { segment_no: u32 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("세그먼트 범위 불일치: segment_no={segment_no}, offset={offset}, length={length}")]
    InvalidSegmentRange {
        segment_no: u32,
        offset: u64,
        length: u64,
    },

    #[error("레코드 없음: {0}")]
    RecordNotFound(String),

    #[error("페이로드 없음: {0}")]
    PayloadNotFound(String),

    #[error("이미 존재하는 페이로드: {0}")]
    PayloadExists(String),

    #[error("유효하지 않은 페이로드 이름: {0}")]
    InvalidPayloadName(String),

    #[error("파트너십 없음: {0}")]
    PartnershipNotFound(String),

    #[error("중복 메시지 ID (다른 내용): {message_id}")]
    DuplicateMessage { message_id: String },

    #[error("종료된 메시지는 변경할 수 없음: {message_id} ({status})")]
    MessageFinalized { message_id: String, status: String },

    #[error("패키징 이후에는 총 크기를 바꿀 수 없음: {message_id}")]
    TotalsFixed { message_id: String },

    #[error("재시도 횟수 초과: {retried}/{max_retries}")]
    RetriesExhausted { retried: u32, max_retries: u32 },

    #[error("지원하지 않는 알고리즘: {0}")]
    UnsupportedAlgorithm(String),

    #[error("유효하지 않은 헤더 {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("파트너 보고 실패: {0}")]
    PartnerReported(String),
}

impl Error {
    /// 에러 분류
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PayloadTooLarge { .. } | Error::InsufficientDiskSpace { .. } => {
                ErrorKind::Admission
            }
            Error::Http(_) | Error::UnexpectedResponse { .. } => ErrorKind::Transport,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Persistence(_)
            | Error::Archive(_) => ErrorKind::Persistence,
            Error::SizeMismatch { .. }
            | Error::MicMismatch { .. }
            | Error::CrcMismatch { .. }
            | Error::InvalidSegmentRange { .. }
            | Error::RecordNotFound(_)
            | Error::PayloadNotFound(_)
            | Error::TotalsFixed { .. }
            | Error::RetriesExhausted { .. } => ErrorKind::Validation,
            Error::Crypto(_)
            | Error::PayloadExists(_)
            | Error::InvalidPayloadName(_)
            | Error::PartnershipNotFound(_)
            | Error::DuplicateMessage { .. }
            | Error::MessageFinalized { .. }
            | Error::UnsupportedAlgorithm(_)
            | Error::InvalidHeader { .. }
            | Error::Config(_)
            | Error::PartnerReported(_) => ErrorKind::Protocol,
        }
    }

    /// 재시도 가능 여부
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Persistence)
    }

    /// 수신측 HTTP 응답 코드
    pub fn http_status(&self) -> u16 {
        match self {
            Error::PayloadTooLarge { .. } => 413,
            Error::InsufficientDiskSpace { .. } => 507,
            Error::PartnershipNotFound(_) => 403,
            Error::Crypto(_) | Error::UnsupportedAlgorithm(_) => 403,
            Error::RecordNotFound(_) | Error::PayloadNotFound(_) => 404,
            Error::DuplicateMessage { .. }
            | Error::MessageFinalized { .. }
            | Error::TotalsFixed { .. }
            | Error::PayloadExists(_) => 409,
            Error::InvalidHeader { .. }
            | Error::InvalidPayloadName(_)
            | Error::CrcMismatch { .. }
            | Error::MicMismatch { .. }
            | Error::InvalidSegmentRange { .. }
            | Error::SizeMismatch { .. } => 400,
            _ => 500,
        }
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Error::Io(e.into())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(e.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
