//! 파트너십 (거래 상대별 재시도/보안 정책)

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto::{EncryptAlgorithm, SignAlgorithm};
use crate::task::RetryPolicy;
use crate::{Error, Result};

fn default_retry_max() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    30_000
}

/// 파트너십 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partnership {
    pub partnership_id: String,

    /// 세그먼트를 받을 파트너 URL
    pub partner_endpoint: String,

    /// 최대 재시도 횟수 (0이면 재시도 없음)
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// 재시도 간격 (밀리초)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub sign_requested: bool,
    #[serde(default)]
    pub sign_algorithm: SignAlgorithm,

    #[serde(default)]
    pub encrypt_requested: bool,
    #[serde(default)]
    pub encrypt_algorithm: EncryptAlgorithm,

    /// 파트너 Ed25519 검증키 (hex)
    #[serde(default)]
    pub partner_verify_key: Option<String>,

    /// 파트너 X25519 공개키 (hex)
    #[serde(default)]
    pub partner_encrypt_key: Option<String>,

    /// 파트너 암호화 공개키의 SHA-256 지문 (hex)
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,
}

impl Partnership {
    pub fn new(partnership_id: impl Into<String>, partner_endpoint: impl Into<String>) -> Self {
        Self {
            partnership_id: partnership_id.into(),
            partner_endpoint: partner_endpoint.into(),
            retry_max: default_retry_max(),
            retry_interval_ms: default_retry_interval_ms(),
            sign_requested: false,
            sign_algorithm: SignAlgorithm::default(),
            encrypt_requested: false,
            encrypt_algorithm: EncryptAlgorithm::default(),
            partner_verify_key: None,
            partner_encrypt_key: None,
            certificate_fingerprint: None,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// 이 파트너십에 속한 태스크의 재시도 정책
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry_max > 0,
            max_retries: self.retry_max,
            interval: self.retry_interval(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let id = &self.partnership_id;
        if id.is_empty() || id.contains('$') || id.contains('/') || id.contains('\\') {
            return Err(Error::Config(format!("invalid partnership id: {id:?}")));
        }
        if self.partner_endpoint.is_empty() {
            return Err(Error::Config(format!("partnership {id} has no partner_endpoint")));
        }
        if self.encrypt_requested && self.partner_encrypt_key.is_none() {
            return Err(Error::Config(format!(
                "partnership {id} requests encryption but has no partner_encrypt_key"
            )));
        }
        Ok(())
    }
}

/// 파트너십 조회 경계
pub trait PartnershipSource: Send + Sync {
    fn find(&self, partnership_id: &str) -> Option<Partnership>;
}

/// 설정 파일에서 읽은 고정 목록
#[derive(Debug, Default)]
pub struct StaticPartnerships {
    entries: DashMap<String, Partnership>,
}

impl StaticPartnerships {
    pub fn new(partnerships: impl IntoIterator<Item = Partnership>) -> Self {
        let entries = DashMap::new();
        for partnership in partnerships {
            entries.insert(partnership.partnership_id.clone(), partnership);
        }
        Self { entries }
    }

    pub fn upsert(&self, partnership: Partnership) {
        self.entries.insert(partnership.partnership_id.clone(), partnership);
    }
}

impl PartnershipSource for StaticPartnerships {
    fn find(&self, partnership_id: &str) -> Option<Partnership> {
        self.entries.get(partnership_id).map(|p| p.clone())
    }
}

/// 메시지 단위 파트너십 캐시
///
/// 한 메시지를 처리하는 동안 같은 파트너십 스냅샷을 사용한다.
/// 메시지가 종료되면 [`clear_cache`](Self::clear_cache)로 비운다.
pub struct PartnershipDirectory {
    source: Arc<dyn PartnershipSource>,
    cache: DashMap<(String, String), Arc<Partnership>>,
}

impl PartnershipDirectory {
    pub fn new(source: Arc<dyn PartnershipSource>) -> Self {
        Self {
            source,
            cache: DashMap::new(),
        }
    }

    /// 메시지에 대한 파트너십 조회
    pub fn retrieve(&self, partnership_id: &str, message_id: &str) -> Result<Arc<Partnership>> {
        let key = (partnership_id.to_string(), message_id.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let partnership = self
            .source
            .find(partnership_id)
            .map(Arc::new)
            .ok_or_else(|| Error::PartnershipNotFound(partnership_id.to_string()))?;
        self.cache.insert(key, partnership.clone());
        Ok(partnership)
    }

    /// 메시지 관련 캐시 제거
    pub fn clear_cache(&self, message_id: &str) {
        self.cache.retain(|(_, mid), _| mid != message_id);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_cache_cleared_per_message() {
        let source = Arc::new(StaticPartnerships::new([Partnership::new("acme", "http://acme")]));
        let directory = PartnershipDirectory::new(source.clone());

        let first = directory.retrieve("acme", "m1").unwrap();
        assert_eq!(first.retry_max, 3);

        // 원본이 바뀌어도 캐시된 스냅샷 유지
        let mut changed = Partnership::new("acme", "http://acme");
        changed.retry_max = 7;
        source.upsert(changed);
        assert_eq!(directory.retrieve("acme", "m1").unwrap().retry_max, 3);
        assert_eq!(directory.retrieve("acme", "m2").unwrap().retry_max, 7);

        directory.clear_cache("m1");
        assert_eq!(directory.cached_len(), 1);
        assert_eq!(directory.retrieve("acme", "m1").unwrap().retry_max, 7);
    }

    #[test]
    fn test_unknown_partnership() {
        let directory = PartnershipDirectory::new(Arc::new(StaticPartnerships::default()));
        assert!(matches!(
            directory.retrieve("nobody", "m1"),
            Err(Error::PartnershipNotFound(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(Partnership::new("a$b", "http://x").validate().is_err());
        let mut p = Partnership::new("acme", "http://x");
        p.encrypt_requested = true;
        assert!(p.validate().is_err());
        p.partner_encrypt_key = Some("00".repeat(32));
        assert!(p.validate().is_ok());
        assert_eq!(p.retry_policy().max_retries, 3);
    }
}
