//! 페이로드 저장소 - 파일 시스템 위의 페이로드 생명주기
//!
//! 이름 규칙: `<marker><partnershipId>$<messageId>[.<ext>]`
//!
//! | 상태       | marker |
//! |------------|--------|
//! | UPLOADING  | `~~`   |
//! | PENDING    | (없음) |
//! | PROCESSING | `##`   |
//! | PROCESSED  | `%%`   |
//!
//! 상태 전이는 rename 하나로 끝나며, 대상 이름이 이미 있으면 실패한다.
//! 저장소는 프로세스 수명 동안 lock 파일을 독점하고, 전이는 프로세스 내부
//! 락으로 다시 직렬화된다.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

pub use crate::archiver::{Archiver, ArchiverKind};
use crate::{Error, Result};

const LOCK_FILE: &str = ".sfrm.lock";
const KEY_SEPARATOR: char = '$';

/// 페이로드 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadState {
    Uploading,
    Pending,
    Processing,
    Processed,
}

impl PayloadState {
    pub const ALL: [PayloadState; 4] = [
        PayloadState::Uploading,
        PayloadState::Pending,
        PayloadState::Processing,
        PayloadState::Processed,
    ];

    pub fn marker(&self) -> &'static str {
        match self {
            PayloadState::Uploading => "~~",
            PayloadState::Pending => "",
            PayloadState::Processing => "##",
            PayloadState::Processed => "%%",
        }
    }

    /// 이름 앞부분에서 상태와 나머지 부분 분리
    fn split(name: &str) -> (PayloadState, &str) {
        for state in [
            PayloadState::Uploading,
            PayloadState::Processing,
            PayloadState::Processed,
        ] {
            if let Some(rest) = name.strip_prefix(state.marker()) {
                return (state, rest);
            }
        }
        (PayloadState::Pending, name)
    }
}

impl fmt::Display for PayloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadState::Uploading => "UPLOADING",
            PayloadState::Pending => "PENDING",
            PayloadState::Processing => "PROCESSING",
            PayloadState::Processed => "PROCESSED",
        };
        f.write_str(name)
    }
}

/// 페이로드 식별자 (파트너십 + 메시지)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKey {
    pub partnership_id: String,
    pub message_id: String,
}

impl PayloadKey {
    pub fn new(partnership_id: impl Into<String>, message_id: impl Into<String>) -> Result<Self> {
        let key = Self {
            partnership_id: partnership_id.into(),
            message_id: message_id.into(),
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<()> {
        for part in [&self.partnership_id, &self.message_id] {
            let invalid = part.is_empty()
                || part.contains(KEY_SEPARATOR)
                || part.contains('/')
                || part.contains('\\')
                || part == ".."
                || PayloadState::split(part).0 != PayloadState::Pending;
            if invalid {
                return Err(Error::InvalidPayloadName(format!(
                    "{}{}{}",
                    self.partnership_id, KEY_SEPARATOR, self.message_id
                )));
            }
        }
        Ok(())
    }

    /// 상태 marker가 붙은 파일 이름
    pub fn file_name(&self, state: PayloadState, extension: Option<&str>) -> String {
        let mut name = format!(
            "{}{}{}{}",
            state.marker(),
            self.partnership_id,
            KEY_SEPARATOR,
            self.message_id
        );
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        name
    }

    /// 파일 이름에서 키와 상태 복원
    pub fn parse(file_name: &str, extension: Option<&str>) -> Option<(PayloadKey, PayloadState)> {
        let stem = match extension {
            Some(ext) => file_name.strip_suffix(ext)?.strip_suffix('.')?,
            None => file_name,
        };
        let (state, rest) = PayloadState::split(stem);
        let (partnership_id, message_id) = rest.split_once(KEY_SEPARATOR)?;
        let key = PayloadKey::new(partnership_id, message_id).ok()?;
        Some((key, state))
    }
}

impl fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.partnership_id, KEY_SEPARATOR, self.message_id)
    }
}

/// 저장 형태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// 압축 전 폴더
    Folder,
    /// 아카이브 파일
    Archive,
}

/// 저장소 안의 페이로드 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: PayloadKey,
    pub state: PayloadState,
    pub kind: PayloadKind,
    pub path: PathBuf,
}

/// 여유 디스크 공간 조회
pub trait DiskSpace: Send + Sync {
    fn available(&self, path: &Path) -> Result<u64>;
}

/// fs2 기반 디스크 공간 조회
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2DiskSpace;

impl DiskSpace for Fs2DiskSpace {
    fn available(&self, path: &Path) -> Result<u64> {
        Ok(fs2::available_space(path)?)
    }
}

/// 페이로드 저장소
pub struct PayloadStore {
    name: &'static str,
    root: PathBuf,
    kind: PayloadKind,
    archiver: Arc<dyn Archiver>,
    _lease: File,
    transitions: Mutex<()>,
}

impl fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStore")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("archiver", &self.archiver.name())
            .finish()
    }
}

impl PayloadStore {
    /// 저장소 열기 (폴더 생성 + lock 파일 독점)
    pub fn open(
        name: &'static str,
        root: impl Into<PathBuf>,
        kind: PayloadKind,
        archiver: Arc<dyn Archiver>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let lease = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lease.try_lock_exclusive().map_err(|e| {
            Error::Persistence(format!(
                "repository {} is held by another process: {e}",
                root.display()
            ))
        })?;

        info!(repository = name, root = %root.display(), "페이로드 저장소 열림");
        Ok(Self {
            name,
            root,
            kind,
            archiver,
            _lease: lease,
            transitions: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archiver(&self) -> &Arc<dyn Archiver> {
        &self.archiver
    }

    fn extension(&self) -> Option<&'static str> {
        match self.kind {
            PayloadKind::Folder => None,
            PayloadKind::Archive => Some(self.archiver.extension()),
        }
    }

    fn payload(&self, key: &PayloadKey, state: PayloadState) -> Payload {
        Payload {
            key: key.clone(),
            state,
            kind: self.kind,
            path: self.root.join(key.file_name(state, self.extension())),
        }
    }

    /// 새 페이로드 생성 (이미 있으면 PayloadExists)
    pub fn create(&self, key: &PayloadKey, state: PayloadState) -> Result<Payload> {
        let _guard = self.transitions.lock();
        let payload = self.payload(key, state);
        if payload.path.exists() {
            return Err(Error::PayloadExists(payload.path.display().to_string()));
        }
        match self.kind {
            PayloadKind::Folder => fs::create_dir(&payload.path)?,
            PayloadKind::Archive => {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&payload.path)?;
            }
        }
        debug!(repository = self.name, payload = %key, state = %state, "페이로드 생성");
        Ok(payload)
    }

    /// 주어진 상태의 페이로드 조회
    pub fn get(&self, key: &PayloadKey, state: PayloadState) -> Option<Payload> {
        let payload = self.payload(key, state);
        payload.path.exists().then_some(payload)
    }

    /// 상태와 관계없이 조회
    pub fn find(&self, key: &PayloadKey) -> Option<Payload> {
        PayloadState::ALL.iter().find_map(|state| self.get(key, *state))
    }

    /// 상태별 목록 (이름순, 최대 `limit` 개)
    pub fn list_by_state(&self, state: PayloadState, limit: usize) -> Result<Vec<Payload>> {
        let extension = self.extension();
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let is_dir = entry.file_type()?.is_dir();
            if is_dir != (self.kind == PayloadKind::Folder) {
                continue;
            }
            if let Some((key, parsed)) = PayloadKey::parse(file_name, extension) {
                if parsed == state {
                    found.push(self.payload(&key, state));
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        found.truncate(limit);
        Ok(found)
    }

    /// 상태 전이 (rename, 대상이 있으면 실패)
    pub fn transition(&self, payload: &Payload, state: PayloadState) -> Result<Payload> {
        let _guard = self.transitions.lock();
        let next = self.payload(&payload.key, state);
        if !payload.path.exists() {
            return Err(Error::PayloadNotFound(payload.path.display().to_string()));
        }
        if next.path.exists() {
            return Err(Error::PayloadExists(next.path.display().to_string()));
        }
        fs::rename(&payload.path, &next.path)?;
        debug!(
            repository = self.name,
            payload = %payload.key,
            from = %payload.state,
            to = %state,
            "페이로드 상태 전이"
        );
        Ok(next)
    }

    /// 삭제 (없으면 무시)
    pub fn remove(&self, payload: &Payload) -> Result<()> {
        let _guard = self.transitions.lock();
        let result = match payload.kind {
            PayloadKind::Folder => fs::remove_dir_all(&payload.path),
            PayloadKind::Archive => fs::remove_file(&payload.path),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 모든 상태의 페이로드 삭제
    pub fn purge(&self, key: &PayloadKey) -> Result<()> {
        for state in PayloadState::ALL {
            if let Some(payload) = self.get(key, state) {
                self.remove(&payload)?;
            }
        }
        Ok(())
    }

    /// 폴더 페이로드를 아카이브 페이로드로 압축, 아카이브 크기 반환
    pub async fn pack(&self, folder: &Payload, archive: &Payload) -> Result<u64> {
        let archiver = self.archiver.clone();
        let src = folder.path.clone();
        let dest = archive.path.clone();
        let packed = blocking(move || archiver.compress(&src, &dest, false)).await?;
        if !packed {
            return Err(Error::PayloadNotFound(folder.path.display().to_string()));
        }
        Ok(fs::metadata(&archive.path)?.len())
    }

    /// 아카이브를 폴더로 해제, 아카이브에 기록된 원본 크기 합 반환
    pub async fn unpack(&self, archive: &Payload, dest_dir: &Path) -> Result<u64> {
        let archiver = self.archiver.clone();
        let src = archive.path.clone();
        let dest = dest_dir.to_path_buf();
        let content = blocking(move || {
            if !archiver.extract(&src, &dest)? {
                return Ok(None);
            }
            archiver.content_size(&src).map(Some)
        })
        .await?;
        content.ok_or_else(|| Error::PayloadNotFound(archive.path.display().to_string()))
    }

    /// 압축 전 아카이브 크기 추정
    pub fn estimate_size(&self, payload: &Payload) -> Result<u64> {
        self.archiver.estimate_compressed_size(&payload.path)
    }

    /// 아카이브 파일을 미리 지정 크기로 확장
    pub fn allocate(&self, payload: &Payload, size: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&payload.path)?;
        file.set_len(size)?;
        Ok(())
    }

    /// 오프셋 위치에 쓰기 (순서와 관계없이)
    pub fn write_at(&self, payload: &Payload, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(&payload.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// [start, end) 범위 읽기
    pub fn read_range(&self, payload: &Payload, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut file = File::open(&payload.path)?;
        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// 파일 크기 또는 폴더 안 파일 크기 합
    pub fn size(&self, payload: &Payload) -> Result<u64> {
        match payload.kind {
            PayloadKind::Archive => Ok(fs::metadata(&payload.path)?.len()),
            PayloadKind::Folder => {
                let mut total = 0;
                for entry in WalkDir::new(&payload.path) {
                    let entry = entry?;
                    if entry.file_type().is_file() {
                        total += entry.metadata()?.len();
                    }
                }
                Ok(total)
            }
        }
    }
}

/// 아카이브 작업은 블로킹 스레드에서 실행
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Archive(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::TarArchiver;

    fn folder_store(root: &Path) -> PayloadStore {
        PayloadStore::open("outgoing", root, PayloadKind::Folder, Arc::new(TarArchiver)).unwrap()
    }

    #[test]
    fn test_file_name_round_trip() {
        let key = PayloadKey::new("acme", "msg-1.2").unwrap();
        for state in PayloadState::ALL {
            let name = key.file_name(state, Some("tar"));
            assert_eq!(PayloadKey::parse(&name, Some("tar")), Some((key.clone(), state)));
        }
        assert_eq!(key.file_name(PayloadState::Uploading, None), "~~acme$msg-1.2");
        assert_eq!(PayloadKey::parse("acme-no-separator", None), None);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(PayloadKey::new("ac$me", "m").is_err());
        assert!(PayloadKey::new("acme", "a/b").is_err());
        assert!(PayloadKey::new("##acme", "m").is_err());
        assert!(PayloadKey::new("", "m").is_err());
    }

    #[test]
    fn test_transition_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = folder_store(dir.path());
        let key = PayloadKey::new("acme", "m1").unwrap();

        let pending = store.create(&key, PayloadState::Pending).unwrap();
        store.create(&key, PayloadState::Processing).unwrap();

        // 대상이 이미 있으면 rename 하지 않음
        assert!(matches!(
            store.transition(&pending, PayloadState::Processing),
            Err(Error::PayloadExists(_))
        ));
        assert!(pending.path.exists());

        let processed = store.transition(&pending, PayloadState::Processed).unwrap();
        assert!(!pending.path.exists());
        assert!(processed.path.exists());
        assert!(matches!(
            store.transition(&pending, PayloadState::Processed),
            Err(Error::PayloadNotFound(_))
        ));
    }

    #[test]
    fn test_list_by_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = folder_store(dir.path());
        for id in ["m2", "m1", "m3"] {
            let key = PayloadKey::new("acme", id).unwrap();
            store.create(&key, PayloadState::Pending).unwrap();
        }
        let uploading = PayloadKey::new("acme", "m4").unwrap();
        store.create(&uploading, PayloadState::Uploading).unwrap();
        fs::write(dir.path().join("stray-file"), b"x").unwrap();

        let pending = store.list_by_state(PayloadState::Pending, 10).unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.key.message_id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(store.list_by_state(PayloadState::Pending, 2).unwrap().len(), 2);
        assert_eq!(store.list_by_state(PayloadState::Uploading, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_repository_lease_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _store = folder_store(dir.path());
        let second = PayloadStore::open("outgoing", dir.path(), PayloadKind::Folder, Arc::new(TarArchiver));
        assert!(matches!(second, Err(Error::Persistence(_))));
    }

    #[test]
    fn test_out_of_order_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::open("packaged", dir.path(), PayloadKind::Archive, Arc::new(TarArchiver)).unwrap();
        let key = PayloadKey::new("acme", "m1").unwrap();
        let archive = store.create(&key, PayloadState::Uploading).unwrap();
        store.allocate(&archive, 10).unwrap();

        store.write_at(&archive, 5, b"world").unwrap();
        store.write_at(&archive, 0, b"hello").unwrap();
        assert_eq!(store.size(&archive).unwrap(), 10);
        assert_eq!(store.read_range(&archive, 0, 10).unwrap(), b"helloworld");
        assert_eq!(store.read_range(&archive, 3, 7).unwrap(), b"lowo");
    }

    #[tokio::test]
    async fn test_pack_and_unpack_report_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let zip: Arc<dyn Archiver> = Arc::new(crate::archiver::ZipArchiver);
        let folders = PayloadStore::open("outgoing", dir.path().join("out"), PayloadKind::Folder, zip.clone()).unwrap();
        let archives = PayloadStore::open("packaged", dir.path().join("pkg"), PayloadKind::Archive, zip).unwrap();
        let key = PayloadKey::new("acme", "m1").unwrap();

        let folder = folders.create(&key, PayloadState::Processing).unwrap();
        fs::write(folder.path.join("a.txt"), vec![b'a'; 3000]).unwrap();
        fs::write(folder.path.join("b.txt"), vec![b'b'; 200]).unwrap();

        let archive = archives.create(&key, PayloadState::Uploading).unwrap();
        let packed = archives.pack(&folder, &archive).await.unwrap();
        assert_eq!(packed, archives.size(&archive).unwrap());

        let restored = dir.path().join("restored");
        fs::create_dir(&restored).unwrap();
        assert_eq!(archives.unpack(&archive, &restored).await.unwrap(), 3200);
        assert_eq!(fs::read(restored.join("b.txt")).unwrap(), vec![b'b'; 200]);
    }
}
