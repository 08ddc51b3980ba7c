//! 태스크/컬렉터 계약
//!
//! 각 파이프라인 단계는 [`Collector`] 하나와 그 컬렉터가 만드는 [`Task`] 타입 하나로 이루어진다.
//! 태스크는 예외 대신 [`TaskOutcome`] 을 반환하고, 재시도 계산은
//! [`runner::drive`](crate::runner::drive) 한 곳에서만 한다.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::context::SfrmContext;
use crate::Error;

/// 재시도 정책 (파트너십에서 유도)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// 재시도 없음
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            interval: Duration::ZERO,
        }
    }

    /// 현재 횟수로는 더 실행하면 안 되는지
    pub fn is_exhausted(&self, retried: u32) -> bool {
        retried > 0 && retried >= self.max_retries
    }
}

/// 태스크 실행 결과
#[derive(Debug)]
pub enum TaskOutcome {
    /// 완료
    Success,

    /// 조건이 아직 안 됨. 작업 슬롯을 반납하고 알림 또는 `after` 경과 후 다시 실행
    Deferred {
        wake: Option<Arc<Notify>>,
        after: Duration,
    },

    /// 일시적 실패 (재시도 정책 적용)
    Retryable(Error),

    /// 재시도 없는 실패
    Fatal(Error),
}

impl TaskOutcome {
    /// 에러 분류에 따라 Retryable / Fatal 선택
    pub fn from_error(error: Error) -> Self {
        if error.is_retryable() {
            TaskOutcome::Retryable(error)
        } else {
            TaskOutcome::Fatal(error)
        }
    }
}

impl From<crate::Result<()>> for TaskOutcome {
    fn from(result: crate::Result<()>) -> Self {
        match result {
            Ok(()) => TaskOutcome::Success,
            Err(e) => TaskOutcome::from_error(e),
        }
    }
}

/// 종료 실패 정보
#[derive(Debug)]
pub struct TaskFailure {
    pub error: Error,

    /// 재시도 예산을 모두 써서 끝났는지 (재시도 불가 에러면 false)
    pub retries_exhausted: bool,
}

/// 파이프라인 태스크
#[async_trait]
pub trait Task: Send + 'static {
    /// 진행 중 중복을 막기 위한 키
    fn key(&self) -> String;

    /// 로그용 설명
    fn describe(&self) -> String;

    fn retry_policy(&self) -> RetryPolicy;

    fn retried(&self) -> u32;

    /// 재시도 횟수 기록 (재시작 후에도 유지해야 하면 영속화)
    async fn set_retried(&mut self, ctx: &SfrmContext, retried: u32) -> crate::Result<()>;

    async fn execute(&mut self, ctx: &SfrmContext) -> TaskOutcome;

    /// 종료 실패 처리: 메시지/세그먼트 DF 기록, 페이로드 정리, 캐시 제거
    async fn on_terminal_failure(&mut self, ctx: &SfrmContext, failure: &TaskFailure) -> crate::Result<()>;
}

/// 폴링 컬렉터
#[async_trait]
pub trait Collector: Send + 'static {
    type Task: Task;

    fn stage(&self) -> &'static str;

    /// 최대 `limit` 개의 태스크 생성
    ///
    /// 첫 호출에서는 이전 프로세스가 PROCESSING 으로 남긴 항목도 수거한다.
    /// 항목 하나의 실패는 로그만 남기고 건너뛴다.
    async fn collect(&mut self, ctx: &SfrmContext, limit: usize) -> Vec<Self::Task>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_boundary() {
        let policy = RetryPolicy {
            enabled: true,
            max_retries: 3,
            interval: Duration::from_millis(1000),
        };
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
        assert!(!RetryPolicy::none().is_exhausted(0));
    }

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(
            TaskOutcome::from_error(Error::UnexpectedResponse { status: 500 }),
            TaskOutcome::Retryable(_)
        ));
        assert!(matches!(
            TaskOutcome::from_error(Error::PayloadTooLarge { estimated: 2, limit: 1 }),
            TaskOutcome::Fatal(_)
        ));
        assert!(matches!(TaskOutcome::from(Ok(())), TaskOutcome::Success));
    }
}
