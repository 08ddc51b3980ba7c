//! 단계별 처리 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 한 파이프라인 단계의 카운터
#[derive(Debug)]
pub struct StageStats {
    stage: &'static str,

    /// 컬렉터가 만든 태스크 수
    collected: AtomicU64,

    /// 성공한 태스크 수
    succeeded: AtomicU64,

    /// 재시도 횟수
    retried: AtomicU64,

    /// 보류(Deferred) 횟수
    deferred: AtomicU64,

    /// 종료 실패한 태스크 수
    failed: AtomicU64,
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSnapshot {
    pub collected: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub deferred: u64,
    pub failed: u64,
}

impl StageStats {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            collected: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn record_collected(&self, count: usize) {
        self.collected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            collected: self.collected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "{}: collected {} | ok {} | retried {} | deferred {} | failed {}",
            self.stage, s.collected, s.succeeded, s.retried, s.deferred, s.failed
        )
    }
}

/// 엔진 전체 통계
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub start_time: Instant,
    pub handshake: Arc<StageStats>,
    pub segmenting: Arc<StageStats>,
    pub sending: Arc<StageStats>,
    pub reassembly: Arc<StageStats>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            handshake: Arc::new(StageStats::new("handshake")),
            segmenting: Arc::new(StageStats::new("segmenting")),
            sending: Arc::new(StageStats::new("sending")),
            reassembly: Arc::new(StageStats::new("reassembly")),
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn stages(&self) -> [&Arc<StageStats>; 4] {
        [&self.handshake, &self.segmenting, &self.sending, &self.reassembly]
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let stages: Vec<String> = self.stages().iter().map(|s| s.summary()).collect();
        format!("Elapsed: {:.2}s | {}", self.elapsed().as_secs_f64(), stages.join(" | "))
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
