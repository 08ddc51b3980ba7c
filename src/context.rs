//! 엔진 컨텍스트 - 시작 시 한 번 만들어 모든 컬렉터/태스크가 공유한다

use std::sync::Arc;

use tracing::info;

use crate::archiver::Archiver;
use crate::config::Config;
use crate::crypto::{LocalIdentity, SecurityTransform};
use crate::partnership::{Partnership, PartnershipDirectory, PartnershipSource, StaticPartnerships};
use crate::payload::{DiskSpace, Fs2DiskSpace, PayloadKind, PayloadStore};
use crate::stats::EngineStats;
use crate::store::{FileRecordStore, MemoryRecordStore, RecordStore};
use crate::sync::{CompletionSync, MessageLocks};
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};

/// 공유 컨텍스트
pub struct SfrmContext {
    pub config: Config,
    pub records: Arc<dyn RecordStore>,
    pub partnerships: PartnershipDirectory,

    /// 송신 대기 폴더
    pub outgoing: PayloadStore,
    /// 송신 아카이브
    pub packaged: PayloadStore,
    /// 수신 완료 폴더
    pub incoming: PayloadStore,
    /// 수신 조립 아카이브
    pub incoming_packaged: PayloadStore,

    pub transport: Arc<dyn Transport>,
    pub identity: LocalIdentity,
    pub completion: CompletionSync,
    pub locks: MessageLocks,
    pub disk: Arc<dyn DiskSpace>,
    pub stats: EngineStats,
}

impl SfrmContext {
    pub fn builder(config: Config) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// 파트너십 정책에 맞춘 보안 변환
    pub fn security<'a>(&'a self, partnership: &'a Partnership) -> SecurityTransform<'a> {
        SecurityTransform::new(&self.identity, partnership)
    }

    /// 크기 제한과 여유 디스크 공간 확인
    pub fn admit(&self, estimated: u64, store: &PayloadStore) -> Result<()> {
        let limit = self.config.max_payload_size;
        if estimated > limit {
            return Err(Error::PayloadTooLarge { estimated, limit });
        }
        let available = self.disk.available(store.root())?;
        if estimated > available {
            return Err(Error::InsufficientDiskSpace {
                required: estimated,
                available,
            });
        }
        Ok(())
    }

    /// 메시지 단위 캐시 제거
    pub fn clear_message_caches(&self, message_id: &str) {
        self.partnerships.clear_cache(message_id);
        self.locks.forget(message_id);
    }
}

/// 컨텍스트 빌더 (지정하지 않은 구성 요소는 설정에서 만든다)
pub struct ContextBuilder {
    config: Config,
    records: Option<Arc<dyn RecordStore>>,
    partnerships: Option<Arc<dyn PartnershipSource>>,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<LocalIdentity>,
    disk: Option<Arc<dyn DiskSpace>>,
    archiver: Option<Arc<dyn Archiver>>,
}

impl ContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            records: None,
            partnerships: None,
            transport: None,
            identity: None,
            disk: None,
            archiver: None,
        }
    }

    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn partnerships(mut self, source: Arc<dyn PartnershipSource>) -> Self {
        self.partnerships = Some(source);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn disk(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn build(self) -> Result<Arc<SfrmContext>> {
        let config = self.config;
        config.validate()?;

        let repos = &config.repositories;
        let archiver = self.archiver.unwrap_or_else(|| config.archiver.build());

        let records: Arc<dyn RecordStore> = match self.records {
            Some(records) => records,
            None => match &repos.record_store {
                Some(path) => Arc::new(FileRecordStore::open(path)?),
                None => Arc::new(MemoryRecordStore::new()),
            },
        };
        let source = self
            .partnerships
            .unwrap_or_else(|| Arc::new(StaticPartnerships::new(config.partnerships.clone())));
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&config)?),
        };
        let identity = match self.identity {
            Some(identity) => identity,
            None => LocalIdentity::from_config(&config.identity)?,
        };

        let outgoing = PayloadStore::open("outgoing", &repos.outgoing, PayloadKind::Folder, archiver.clone())?;
        let packaged = PayloadStore::open("packaged", &repos.packaged, PayloadKind::Archive, archiver.clone())?;
        let incoming = PayloadStore::open("incoming", &repos.incoming, PayloadKind::Folder, archiver.clone())?;
        let incoming_packaged = PayloadStore::open(
            "incoming-packaged",
            &repos.incoming_packaged,
            PayloadKind::Archive,
            archiver.clone(),
        )?;

        info!(
            archiver = archiver.name(),
            segment_size = config.segment_size,
            max_payload_size = config.max_payload_size,
            verify_key = %identity.verify_key_hex(),
            encrypt_key = %identity.encrypt_key_hex(),
            "SFRM 컨텍스트 생성"
        );

        Ok(Arc::new(SfrmContext {
            records,
            partnerships: PartnershipDirectory::new(source),
            outgoing,
            packaged,
            incoming,
            incoming_packaged,
            transport,
            identity,
            completion: CompletionSync::new(),
            locks: MessageLocks::new(),
            disk: self.disk.unwrap_or_else(|| Arc::new(Fs2DiskSpace)),
            stats: EngineStats::new(),
            config,
        }))
    }
}

/// 임시 폴더 아래 저장소를 둔 메모리 기록 컨텍스트
#[cfg(test)]
pub(crate) fn test_context(root: &std::path::Path, partnerships: Vec<Partnership>) -> Arc<SfrmContext> {
    let config = Config {
        poll_interval_ms: 10,
        repositories: crate::config::RepositoryConfig {
            record_store: None,
            ..crate::config::RepositoryConfig::under(root)
        },
        ..Config::default()
    };
    SfrmContext::builder(config)
        .records(Arc::new(MemoryRecordStore::new()))
        .partnerships(Arc::new(StaticPartnerships::new(partnerships)))
        .identity(LocalIdentity::generate())
        .build()
        .unwrap()
}
