//! 파이프라인 간 동기화
//!
//! - [`CompletionSync`]: 메시지별 완료 알림. 세그먼트 영수증 처리(송신 파이프라인)가
//!   재조립 태스크(수신 파이프라인)를 깨운다.
//! - [`MessageLocks`]: 메시지 ID 단위 비동기 뮤텍스

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::trace;

struct Slot {
    notify: Arc<Notify>,
    waiters: usize,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// 메시지별 완료 알림 레지스트리
///
/// 대기자는 조건을 확인하기 전에 먼저 [`register`](Self::register) 해야 한다.
/// 등록 후 조건을 다시 확인하면 "등록 전에 알림" 경쟁이 닫힌다.
/// `Notify::notify_one` 은 대기자가 아직 `notified()` 를 호출하지 않았어도
/// permit 을 남기므로 등록과 대기 사이의 알림도 잃지 않는다.
#[derive(Clone, Default)]
pub struct CompletionSync {
    slots: Slots,
}

impl CompletionSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// 메시지 대기 등록
    pub fn register(&self, message_id: &str) -> CompletionGuard {
        let mut slots = self.slots.lock();
        let slot = slots.entry(message_id.to_string()).or_insert_with(|| Slot {
            notify: Arc::new(Notify::new()),
            waiters: 0,
        });
        slot.waiters += 1;
        trace!(message_id, waiters = slot.waiters, "완료 대기 등록");

        CompletionGuard {
            message_id: message_id.to_string(),
            notify: slot.notify.clone(),
            slots: self.slots.clone(),
        }
    }

    /// 대기자가 있으면 깨운다
    pub fn notify(&self, message_id: &str) -> bool {
        let slots = self.slots.lock();
        match slots.get(message_id) {
            Some(slot) => {
                slot.notify.notify_one();
                trace!(message_id, "완료 알림");
                true
            }
            None => false,
        }
    }

    /// 등록된 메시지 수
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 대기 등록 핸들, drop 되면 등록 해제 (마지막 대기자면 항목 삭제)
pub struct CompletionGuard {
    message_id: String,
    notify: Arc<Notify>,
    slots: Slots,
}

impl CompletionGuard {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// 대기에 사용할 Notify
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&self.message_id) {
            slot.waiters = slot.waiters.saturating_sub(1);
            if slot.waiters == 0 {
                slots.remove(&self.message_id);
            }
        }
    }
}

/// 메시지 ID 단위 비동기 뮤텍스 레지스트리
#[derive(Default)]
pub struct MessageLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 메시지 락 획득
    pub async fn lock(&self, message_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(message_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// 아무도 쓰지 않는 락 제거
    pub fn forget(&self, message_id: &str) {
        self.locks
            .remove_if(message_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
