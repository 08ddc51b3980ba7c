//! 프로토콜 설정

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::DigestAlgorithm;
use crate::partnership::Partnership;
use crate::payload::ArchiverKind;
use crate::{Error, Result, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_SEGMENT_SIZE};

/// 페이로드 저장소 경로
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// 송신 대기 폴더 (사용자가 업로드)
    pub outgoing: PathBuf,

    /// 송신측 아카이브
    pub packaged: PathBuf,

    /// 수신 완료 폴더
    pub incoming: PathBuf,

    /// 수신측 조립 중 아카이브
    pub incoming_packaged: PathBuf,

    /// 레코드 저장소 저널 파일 (없으면 메모리)
    pub record_store: Option<PathBuf>,
}

impl RepositoryConfig {
    /// 하나의 루트 아래에 모든 저장소 배치
    pub fn under(root: &Path) -> Self {
        Self {
            outgoing: root.join("outgoing"),
            packaged: root.join("packaged"),
            incoming: root.join("incoming"),
            incoming_packaged: root.join("incoming-packaged"),
            record_store: Some(root.join("records.bin")),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::under(Path::new("./sfrm-data"))
    }
}

/// 로컬 서명/복호화 키 (hex 32바이트 시드)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub signing_key: Option<String>,
    pub decryption_key: Option<String>,
}

/// SFRM 엔진 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 세그먼트 크기 (바이트)
    pub segment_size: u64,

    /// 허용되는 최대 아카이브 크기 (바이트)
    pub max_payload_size: u64,

    /// 아카이버 종류
    pub archiver: ArchiverKind,

    /// MIC 다이제스트 알고리즘
    pub mic_algorithm: DigestAlgorithm,

    /// 저장소 경로
    pub repositories: RepositoryConfig,

    /// 컬렉터 폴링 주기 (밀리초)
    pub poll_interval_ms: u64,

    /// 한 번의 폴링에서 만드는 최대 태스크 수
    pub max_tasks_per_list: usize,

    /// 핸드셰이크/패키징 워커 수
    pub handshake_workers: usize,

    /// 세그먼트 생성 워커 수
    pub segmenting_workers: usize,

    /// 세그먼트 송신 워커 수
    pub sending_workers: usize,

    /// 재조립 워커 수
    pub reassembly_workers: usize,

    /// 재조립 태스크의 완료 재확인 주기 (밀리초)
    /// 알림을 놓쳐도 이 주기마다 다시 확인한다
    pub completion_poll_interval_ms: u64,

    /// HTTP 연결 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,

    /// HTTP 요청 타임아웃 (밀리초)
    pub request_timeout_ms: u64,

    /// 수신 엔드포인트 바인드 주소
    pub listen_addr: SocketAddr,

    /// 로컬 키
    pub identity: IdentityConfig,

    /// 파트너십 목록
    #[serde(rename = "partnership")]
    pub partnerships: Vec<Partnership>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            archiver: ArchiverKind::Tar,
            mic_algorithm: DigestAlgorithm::Sha256,
            repositories: RepositoryConfig::default(),
            poll_interval_ms: 1000,           // 1초
            max_tasks_per_list: 64,
            handshake_workers: 2,
            segmenting_workers: 2,
            sending_workers: 16,
            reassembly_workers: 4,
            completion_poll_interval_ms: 5000, // 5초
            connect_timeout_ms: 60_000,        // 60초
            request_timeout_ms: 60_000,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            identity: IdentityConfig::default(),
            partnerships: Vec::new(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// TOML 문자열에서 로드
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 로드
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(Error::Config("segment_size must be greater than zero".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be greater than zero".into()));
        }
        if self.completion_poll_interval_ms == 0 {
            return Err(Error::Config(
                "completion_poll_interval_ms must be greater than zero".into(),
            ));
        }
        // 최대 크기 페이로드의 세그먼트 번호가 u32 에 들어가야 한다
        if self.max_payload_size.div_ceil(self.segment_size) > u64::from(u32::MAX) {
            return Err(Error::Config(format!(
                "max_payload_size {} needs more than {} segments of {} bytes",
                self.max_payload_size,
                u32::MAX,
                self.segment_size
            )));
        }
        if self.max_tasks_per_list == 0 {
            return Err(Error::Config("max_tasks_per_list must be greater than zero".into()));
        }
        let workers = [
            ("handshake_workers", self.handshake_workers),
            ("segmenting_workers", self.segmenting_workers),
            ("sending_workers", self.sending_workers),
            ("reassembly_workers", self.reassembly_workers),
        ];
        for (name, count) in workers {
            if count == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for partnership in &self.partnerships {
            partnership.validate()?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_interval_ms)
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            segment_size: 512 * 1024,          // 512KB
            poll_interval_ms: 2000,
            max_tasks_per_list: 16,
            handshake_workers: 1,
            segmenting_workers: 1,
            sending_workers: 4,
            reassembly_workers: 2,
            completion_poll_interval_ms: 10_000,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            segment_size: 8 * 1024 * 1024,     // 8MB
            poll_interval_ms: 250,
            max_tasks_per_list: 256,
            handshake_workers: 4,
            segmenting_workers: 4,
            sending_workers: 64,
            reassembly_workers: 8,
            completion_poll_interval_ms: 2000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let text = r#"
            segment_size = 1000000
            archiver = "zip"
            sending_workers = 8

            [repositories]
            outgoing = "/srv/sfrm/out"

            [[partnership]]
            partnership_id = "acme"
            partner_endpoint = "http://acme.example/sfrm/inbound"
            retry_max = 3
            retry_interval_ms = 1000
        "#;

        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.segment_size, 1_000_000);
        assert_eq!(config.archiver, ArchiverKind::Zip);
        assert_eq!(config.sending_workers, 8);
        assert_eq!(config.repositories.outgoing, PathBuf::from("/srv/sfrm/out"));
        assert_eq!(config.partnerships.len(), 1);
        assert_eq!(config.partnerships[0].retry_max, 3);
        // 지정하지 않은 값은 기본값
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero_segment_size() {
        let config = Config {
            segment_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::low_spec().validate().is_ok());
        assert!(Config::high_performance().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            completion_poll_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_segment_count() {
        // 1바이트 세그먼트로는 기본 최대 크기를 u32 번호로 셀 수 없다
        let config = Config {
            segment_size: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            segment_size: 1,
            max_payload_size: u64::from(u32::MAX),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
