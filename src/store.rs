//! 레코드 저장소 - 메시지/세그먼트 상태 머신의 영속 계층
//!
//! 파이프라인은 [`RecordStore`] 에 정의된 연산만 호출한다.
//! 두 가지 구현을 제공:
//! - [`MemoryRecordStore`]: 프로세스 메모리 (테스트, 단발성 노드)
//! - [`FileRecordStore`]: 변경 하나를 저널 끝에 덧붙이고, 저널이 커지면 살아 있는 레코드로 다시 쓴다
//!
//! 변경은 저널 기록이 끝난 뒤에만 메모리 테이블에 적용된다.
//!
//! 저널 프레임:
//! ```text
//! [ length: u32 LE ][ crc32: u32 LE ][ bincode(Change) ]
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::record::{Message, MessageBox, MessageStatus, Segment, SegmentKey, SegmentStatus, SegmentType};
use crate::{Error, Result};

/// 저널 프레임 헤더 크기 (길이 + CRC)
const FRAME_HEADER: usize = 8;

/// 이 개수 이하의 저널 기록은 다시 쓰지 않음
const COMPACT_MIN_ENTRIES: usize = 10_000;

/// 메시지/세그먼트 레코드 저장소 경계
pub trait RecordStore: Send + Sync {
    /// 새 메시지 생성 (이미 있으면 DuplicateMessage)
    fn create_message(&self, message: &Message) -> Result<()>;

    /// 메시지 갱신
    ///
    /// 저장된 레코드가 종료 상태이면 거부하고, PACKAGING 이후에는
    /// 총 크기/세그먼트 수 변경을 거부한다.
    fn update_message(&self, message: &Message) -> Result<()>;

    fn retrieve_message(&self, message_id: &str, message_box: MessageBox) -> Result<Option<Message>>;

    /// 메시지와 그 세그먼트 삭제 (재시도 롤백용)
    fn remove_message(&self, message_id: &str, message_box: MessageBox) -> Result<bool>;

    /// 상태별 메시지 조회 (생성 순)
    fn retrieve_messages_by_status(
        &self,
        message_box: MessageBox,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// 세그먼트 생성 (이미 있으면 false)
    fn create_segment(&self, segment: &Segment) -> Result<bool>;

    /// 세그먼트 저장 (upsert)
    fn persist_segment(&self, segment: &Segment) -> Result<()>;

    fn find_segment(&self, key: &SegmentKey) -> Result<Option<Segment>>;

    /// 주어진 상태의 세그먼트 조회
    fn find_incomplete_segments(
        &self,
        message_box: MessageBox,
        status: SegmentStatus,
        segment_type: Option<SegmentType>,
        limit: usize,
    ) -> Result<Vec<Segment>>;

    fn find_max_segment_no(
        &self,
        message_id: &str,
        message_box: MessageBox,
        segment_type: SegmentType,
    ) -> Result<Option<u32>>;

    fn count_segments_by_status(
        &self,
        message_id: &str,
        message_box: MessageBox,
        segment_type: SegmentType,
        status: SegmentStatus,
    ) -> Result<u32>;

    /// 메시지와 세그먼트 중 가장 최근 변경 시각
    fn last_updated(&self, message_id: &str, message_box: MessageBox) -> Result<Option<DateTime<Utc>>>;
}

type MessageId = (String, MessageBox);

/// 테이블 변경 하나 (저널 기록 단위)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    PutMessage(Message),
    /// 메시지와 그 세그먼트 삭제
    RemoveMessage(String, MessageBox),
    PutSegment(Segment),
}

/// 레코드 테이블
///
/// 변경 연산은 `&self` 에서 검증만 하고 [`Change`] 를 돌려준다.
/// 실제 반영은 [`RecordTables::apply`] 한 곳에서만 한다.
#[derive(Debug, Default)]
pub struct RecordTables {
    messages: BTreeMap<MessageId, Message>,
    segments: BTreeMap<SegmentKey, Segment>,
}

impl RecordTables {
    fn apply(&mut self, change: Change) {
        match change {
            Change::PutMessage(message) => {
                self.messages
                    .insert((message.message_id.clone(), message.message_box), message);
            }
            Change::RemoveMessage(message_id, message_box) => {
                self.messages.remove(&(message_id.clone(), message_box));
                self.segments
                    .retain(|key, _| !(key.message_id == message_id && key.message_box == message_box));
            }
            Change::PutSegment(segment) => {
                self.segments.insert(segment.key.clone(), segment);
            }
        }
    }

    fn live_records(&self) -> usize {
        self.messages.len() + self.segments.len()
    }

    /// 현재 테이블을 다시 만드는 변경 목록
    fn changes(&self) -> impl Iterator<Item = Change> + '_ {
        let messages = self.messages.values().cloned().map(Change::PutMessage);
        let segments = self.segments.values().cloned().map(Change::PutSegment);
        messages.chain(segments)
    }

    fn segments_of<'a>(
        &'a self,
        message_id: &'a str,
        message_box: MessageBox,
    ) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments
            .values()
            .filter(move |s| s.key.message_id == message_id && s.key.message_box == message_box)
    }

    fn create_message(&self, message: &Message) -> Result<Change> {
        let id = (message.message_id.clone(), message.message_box);
        if self.messages.contains_key(&id) {
            return Err(Error::DuplicateMessage {
                message_id: message.message_id.clone(),
            });
        }
        Ok(Change::PutMessage(message.clone()))
    }

    fn update_message(&self, message: &Message) -> Result<Change> {
        let id = (message.message_id.clone(), message.message_box);
        let stored = self
            .messages
            .get(&id)
            .ok_or_else(|| Error::RecordNotFound(format!("{}/{}", message.message_box, message.message_id)))?;

        if stored.status.is_terminal() {
            return Err(Error::MessageFinalized {
                message_id: message.message_id.clone(),
                status: stored.status.code().to_string(),
            });
        }
        let totals_changed = stored.total_size != message.total_size
            || stored.total_segments != message.total_segments;
        if totals_changed && !stored.status.totals_mutable() {
            return Err(Error::TotalsFixed {
                message_id: message.message_id.clone(),
            });
        }

        Ok(Change::PutMessage(message.clone()))
    }

    fn remove_message(&self, message_id: &str, message_box: MessageBox) -> (bool, Option<Change>) {
        let exists = self.messages.contains_key(&(message_id.to_string(), message_box));
        let has_segments = self.segments_of(message_id, message_box).next().is_some();
        let change = (exists || has_segments).then(|| Change::RemoveMessage(message_id.to_string(), message_box));
        (exists, change)
    }

    fn messages_by_status(&self, message_box: MessageBox, status: MessageStatus, limit: usize) -> Vec<Message> {
        let mut found: Vec<Message> = self
            .messages
            .values()
            .filter(|m| m.message_box == message_box && m.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        found.truncate(limit);
        found
    }

    fn create_segment(&self, segment: &Segment) -> Option<Change> {
        (!self.segments.contains_key(&segment.key)).then(|| Change::PutSegment(segment.clone()))
    }

    fn incomplete_segments(
        &self,
        message_box: MessageBox,
        status: SegmentStatus,
        segment_type: Option<SegmentType>,
        limit: usize,
    ) -> Vec<Segment> {
        self.segments
            .values()
            .filter(|s| {
                s.key.message_box == message_box
                    && s.status == status
                    && segment_type.map_or(true, |t| s.key.segment_type == t)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn max_segment_no(&self, message_id: &str, message_box: MessageBox, segment_type: SegmentType) -> Option<u32> {
        self.segments_of(message_id, message_box)
            .filter(|s| s.key.segment_type == segment_type)
            .map(|s| s.key.segment_no)
            .max()
    }

    fn count_by_status(
        &self,
        message_id: &str,
        message_box: MessageBox,
        segment_type: SegmentType,
        status: SegmentStatus,
    ) -> u32 {
        self.segments_of(message_id, message_box)
            .filter(|s| s.key.segment_type == segment_type && s.status == status)
            .count() as u32
    }

    fn last_updated(&self, message_id: &str, message_box: MessageBox) -> Option<DateTime<Utc>> {
        let message = self.messages.get(&(message_id.to_string(), message_box))?;
        let message_time = message
            .completed_at
            .or(message.proceeded_at)
            .unwrap_or(message.created_at);
        let segment_time = self
            .segments_of(message_id, message_box)
            .map(Segment::last_updated)
            .max();
        Some(segment_time.map_or(message_time, |t| t.max(message_time)))
    }
}

/// 변경 기록 방식
pub trait Journal: Send + Sync {
    /// 변경 하나를 기록. 실패하면 메모리 테이블에는 반영되지 않는다
    fn append(&self, change: &Change) -> Result<()>;

    /// 살아 있는 레코드 수에 비해 기록이 너무 많은지
    fn needs_compaction(&self, _live_records: usize) -> bool {
        false
    }

    /// 현재 테이블만으로 기록을 다시 씀
    fn compact(&self, _tables: &RecordTables) -> Result<()> {
        Ok(())
    }
}

/// 기록 없음
#[derive(Debug, Default)]
pub struct NoJournal;

impl Journal for NoJournal {
    fn append(&self, _change: &Change) -> Result<()> {
        Ok(())
    }
}

struct JournalFile {
    file: File,
    /// 마지막으로 완전히 기록된 위치
    len: u64,
    /// 마지막 압축 이후 기록 수
    entries: usize,
}

/// 추가 전용 bincode 저널 파일
pub struct FileJournal {
    path: PathBuf,
    state: Mutex<JournalFile>,
    min_entries: usize,
}

fn encode_frame(change: &Change, out: &mut Vec<u8>) -> Result<()> {
    let body = bincode::serialize(change)?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::Persistence(format!("journal entry too large: {} bytes", body.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// `offset` 의 프레임 하나를 읽고 다음 위치 반환. 잘렸거나 손상되었으면 None
fn decode_frame(bytes: &[u8], offset: usize) -> Option<(Change, usize)> {
    let header = bytes.get(offset..offset.checked_add(FRAME_HEADER)?)?;
    let len = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().ok()?);
    let start = offset + FRAME_HEADER;
    let end = start.checked_add(len)?;
    let body = bytes.get(start..end)?;
    if crc32fast::hash(body) != crc {
        return None;
    }
    let change = bincode::deserialize(body).ok()?;
    Some((change, end))
}

impl FileJournal {
    /// 저널을 열고 재생한 테이블 반환
    ///
    /// 끝의 잘리거나 손상된 프레임은 버리고 파일을 유효한 길이로 자른다.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, RecordTables)> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut tables = RecordTables::default();
        let mut offset = 0;
        let mut entries = 0;
        while let Some((change, next)) = decode_frame(&bytes, offset) {
            tables.apply(change);
            offset = next;
            entries += 1;
        }
        if offset < bytes.len() {
            warn!(
                path = %path.display(),
                valid = offset,
                discarded = bytes.len() - offset,
                "저널 끝의 불완전한 기록 버림"
            );
            file.set_len(offset as u64)?;
            file.sync_data()?;
        }

        let journal = Self {
            path,
            state: Mutex::new(JournalFile {
                file,
                len: offset as u64,
                entries,
            }),
            min_entries: COMPACT_MIN_ENTRIES,
        };
        Ok((journal, tables))
    }
}

impl Journal for FileJournal {
    fn append(&self, change: &Change) -> Result<()> {
        let mut frame = Vec::new();
        encode_frame(change, &mut frame)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        // 이전에 실패한 쓰기의 잔여분은 덮어쓴다
        state.file.set_len(state.len)?;
        state.file.seek(SeekFrom::Start(state.len))?;
        state.file.write_all(&frame)?;
        state.file.sync_data()?;
        state.len += frame.len() as u64;
        state.entries += 1;
        Ok(())
    }

    fn needs_compaction(&self, live_records: usize) -> bool {
        self.state.lock().entries > self.min_entries.max(live_records.saturating_mul(2))
    }

    fn compact(&self, tables: &RecordTables) -> Result<()> {
        let mut buf = Vec::new();
        let mut entries = 0;
        for change in tables.changes() {
            encode_frame(&change, &mut buf)?;
            entries += 1;
        }

        let tmp = self.path.with_extension("compact");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        let mut state = self.state.lock();
        let before = state.entries;
        *state = JournalFile {
            file,
            len: buf.len() as u64,
            entries,
        };
        debug!(path = %self.path.display(), before, after = entries, "저널 압축");
        Ok(())
    }
}

/// 테이블 기반 레코드 저장소
pub struct TableRecordStore<J: Journal> {
    tables: RwLock<RecordTables>,
    journal: J,
}

/// 메모리 레코드 저장소
pub type MemoryRecordStore = TableRecordStore<NoJournal>;

/// 저널 파일 레코드 저장소
pub type FileRecordStore = TableRecordStore<FileJournal>;

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(RecordTables::default()),
            journal: NoJournal,
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRecordStore {
    /// 저널 파일을 열고 기존 레코드를 재생
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (journal, tables) = FileJournal::open(&path)?;
        debug!(
            path = %path.display(),
            messages = tables.messages.len(),
            segments = tables.segments.len(),
            "레코드 저널 로드"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            journal,
        })
    }
}

impl<J: Journal> TableRecordStore<J> {
    fn read<R>(&self, f: impl FnOnce(&RecordTables) -> R) -> R {
        f(&self.tables.read())
    }

    /// 검증 후 저널에 기록하고 적용 (쓰기 락을 잡은 채로)
    fn mutate<R>(&self, plan: impl FnOnce(&RecordTables) -> Result<(R, Option<Change>)>) -> Result<R> {
        let mut tables = self.tables.write();
        let (result, change) = plan(&tables)?;
        if let Some(change) = change {
            self.journal.append(&change)?;
            tables.apply(change);

            if self.journal.needs_compaction(tables.live_records()) {
                if let Err(e) = self.journal.compact(&tables) {
                    // 저널은 그대로 유효하다
                    warn!(error = %e, "저널 압축 실패");
                }
            }
        }
        Ok(result)
    }
}

impl<J: Journal> RecordStore for TableRecordStore<J> {
    fn create_message(&self, message: &Message) -> Result<()> {
        self.mutate(|t| Ok(((), Some(t.create_message(message)?))))
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        self.mutate(|t| Ok(((), Some(t.update_message(message)?))))
    }

    fn retrieve_message(&self, message_id: &str, message_box: MessageBox) -> Result<Option<Message>> {
        Ok(self.read(|t| t.messages.get(&(message_id.to_string(), message_box)).cloned()))
    }

    fn remove_message(&self, message_id: &str, message_box: MessageBox) -> Result<bool> {
        self.mutate(|t| Ok(t.remove_message(message_id, message_box)))
    }

    fn retrieve_messages_by_status(
        &self,
        message_box: MessageBox,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.read(|t| t.messages_by_status(message_box, status, limit)))
    }

    fn create_segment(&self, segment: &Segment) -> Result<bool> {
        self.mutate(|t| {
            let change = t.create_segment(segment);
            Ok((change.is_some(), change))
        })
    }

    fn persist_segment(&self, segment: &Segment) -> Result<()> {
        self.mutate(|_| Ok(((), Some(Change::PutSegment(segment.clone())))))
    }

    fn find_segment(&self, key: &SegmentKey) -> Result<Option<Segment>> {
        Ok(self.read(|t| t.segments.get(key).cloned()))
    }

    fn find_incomplete_segments(
        &self,
        message_box: MessageBox,
        status: SegmentStatus,
        segment_type: Option<SegmentType>,
        limit: usize,
    ) -> Result<Vec<Segment>> {
        Ok(self.read(|t| t.incomplete_segments(message_box, status, segment_type, limit)))
    }

    fn find_max_segment_no(
        &self,
        message_id: &str,
        message_box: MessageBox,
        segment_type: SegmentType,
    ) -> Result<Option<u32>> {
        Ok(self.read(|t| t.max_segment_no(message_id, message_box, segment_type)))
    }

    fn count_segments_by_status(
        &self,
        message_id: &str,
        message_box: MessageBox,
        segment_type: SegmentType,
        status: SegmentStatus,
    ) -> Result<u32> {
        Ok(self.read(|t| t.count_by_status(message_id, message_box, segment_type, status)))
    }

    fn last_updated(&self, message_id: &str, message_box: MessageBox) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read(|t| t.last_updated(message_id, message_box)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn outbound(id: &str) -> Message {
        Message::new(id, MessageBox::Outbox, "acme", "http://acme")
    }

    fn payload_segment(id: &str, no: u32) -> Segment {
        Segment::new(
            SegmentKey::new(id, MessageBox::Outbox, no, SegmentType::Payload),
            (no as u64 - 1) * 10,
            no as u64 * 10,
        )
    }

    #[test]
    fn test_duplicate_message_rejected() {
        let store = MemoryRecordStore::new();
        store.create_message(&outbound("m1")).unwrap();
        assert!(matches!(
            store.create_message(&outbound("m1")),
            Err(Error::DuplicateMessage { .. })
        ));
        // 방향이 다르면 별개의 메시지
        let inbound = Message::new("m1", MessageBox::Inbox, "acme", "http://acme");
        store.create_message(&inbound).unwrap();
    }

    #[test]
    fn test_terminal_message_is_frozen() {
        let store = MemoryRecordStore::new();
        let mut message = outbound("m1");
        store.create_message(&message).unwrap();

        message.set_status(MessageStatus::Processed);
        store.update_message(&message).unwrap();

        message.fail("late failure");
        assert!(matches!(
            store.update_message(&message),
            Err(Error::MessageFinalized { .. })
        ));
        let stored = store.retrieve_message("m1", MessageBox::Outbox).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Processed);
    }

    #[test]
    fn test_totals_fixed_after_packaging() {
        let store = MemoryRecordStore::new();
        let mut message = outbound("m1");
        message.total_size = 100;
        message.total_segments = 1;
        store.create_message(&message).unwrap();

        message.set_status(MessageStatus::Packaging);
        message.total_size = 120;
        store.update_message(&message).unwrap();

        message.set_status(MessageStatus::Packaged);
        store.update_message(&message).unwrap();

        message.total_size = 130;
        assert!(matches!(
            store.update_message(&message),
            Err(Error::TotalsFixed { .. })
        ));
    }

    #[test]
    fn test_segment_queries() {
        let store = MemoryRecordStore::new();
        store.create_message(&outbound("m1")).unwrap();
        for no in 1..=3 {
            assert!(store.create_segment(&payload_segment("m1", no)).unwrap());
        }
        assert!(!store.create_segment(&payload_segment("m1", 2)).unwrap());

        assert_eq!(
            store.find_max_segment_no("m1", MessageBox::Outbox, SegmentType::Payload).unwrap(),
            Some(3)
        );
        assert_eq!(
            store.find_max_segment_no("m1", MessageBox::Outbox, SegmentType::Receipt).unwrap(),
            None
        );

        let mut second = payload_segment("m1", 2);
        second.set_status(SegmentStatus::Processed);
        store.persist_segment(&second).unwrap();

        assert_eq!(
            store
                .count_segments_by_status("m1", MessageBox::Outbox, SegmentType::Payload, SegmentStatus::Processed)
                .unwrap(),
            1
        );
        let pending = store
            .find_incomplete_segments(MessageBox::Outbox, SegmentStatus::Pending, Some(SegmentType::Payload), 10)
            .unwrap();
        assert_eq!(pending.len(), 2);

        assert!(store.remove_message("m1", MessageBox::Outbox).unwrap());
        assert!(store
            .find_segment(&payload_segment("m1", 1).key)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        {
            let store = FileRecordStore::open(&path).unwrap();
            store.create_message(&outbound("m1")).unwrap();
            let mut segment = payload_segment("m1", 1);
            segment.retried = 2;
            store.persist_segment(&segment).unwrap();

            // 롤백된 메시지는 재생 후에도 없어야 함
            store.create_message(&outbound("m2")).unwrap();
            store.create_segment(&payload_segment("m2", 1)).unwrap();
            assert!(store.remove_message("m2", MessageBox::Outbox).unwrap());
        }

        let reopened = FileRecordStore::open(&path).unwrap();
        assert!(reopened.retrieve_message("m1", MessageBox::Outbox).unwrap().is_some());
        let segment = reopened.find_segment(&payload_segment("m1", 1).key).unwrap().unwrap();
        assert_eq!(segment.retried, 2);
        assert!(reopened.retrieve_message("m2", MessageBox::Outbox).unwrap().is_none());
        assert!(reopened.find_segment(&payload_segment("m2", 1).key).unwrap().is_none());
    }

    /// 스위치로 기록 실패를 만드는 저널
    #[derive(Default)]
    struct SwitchJournal {
        failing: AtomicBool,
    }

    impl Journal for SwitchJournal {
        fn append(&self, _change: &Change) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Persistence("disk full".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_tables_unchanged() {
        let store = TableRecordStore {
            tables: RwLock::new(RecordTables::default()),
            journal: SwitchJournal::default(),
        };
        let mut message = outbound("m1");
        store.create_message(&message).unwrap();

        store.journal.failing.store(true, Ordering::SeqCst);
        message.set_status(MessageStatus::Packaging);
        assert!(matches!(store.update_message(&message), Err(Error::Persistence(_))));
        assert!(store.create_segment(&payload_segment("m1", 1)).is_err());
        assert!(store.remove_message("m1", MessageBox::Outbox).is_err());

        let stored = store.retrieve_message("m1", MessageBox::Outbox).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Handshaking);
        assert!(store.find_segment(&payload_segment("m1", 1).key).unwrap().is_none());

        // 같은 변경을 다시 시도하면 성공
        store.journal.failing.store(false, Ordering::SeqCst);
        store.update_message(&message).unwrap();
        assert!(store.create_segment(&payload_segment("m1", 1)).unwrap());
        let stored = store.retrieve_message("m1", MessageBox::Outbox).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Packaging);
    }

    #[test]
    fn test_journal_compacts_repeated_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        {
            let mut store = FileRecordStore::open(&path).unwrap();
            store.journal.min_entries = 8;
            store.create_message(&outbound("m1")).unwrap();
            let mut segment = payload_segment("m1", 1);
            for retried in 0..50 {
                segment.retried = retried;
                store.persist_segment(&segment).unwrap();
                assert!(store.journal.state.lock().entries <= 9);
            }
        }
        assert!(!path.with_extension("compact").exists());

        let reopened = FileRecordStore::open(&path).unwrap();
        assert!(reopened.retrieve_message("m1", MessageBox::Outbox).unwrap().is_some());
        let segment = reopened.find_segment(&payload_segment("m1", 1).key).unwrap().unwrap();
        assert_eq!(segment.retried, 49);
    }

    #[test]
    fn test_torn_journal_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        {
            let store = FileRecordStore::open(&path).unwrap();
            store.create_message(&outbound("m1")).unwrap();
        }
        let valid = fs::metadata(&path).unwrap().len();

        // 쓰다 만 프레임
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        {
            let store = FileRecordStore::open(&path).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), valid);
            assert!(store.retrieve_message("m1", MessageBox::Outbox).unwrap().is_some());
            store.create_message(&outbound("m2")).unwrap();
        }

        let reopened = FileRecordStore::open(&path).unwrap();
        assert!(reopened.retrieve_message("m1", MessageBox::Outbox).unwrap().is_some());
        assert!(reopened.retrieve_message("m2", MessageBox::Outbox).unwrap().is_some());
    }
}
