//! 태스크 러너 - 폴링 루프 + 세마포어로 제한된 작업 풀
//!
//! 재시도 규칙:
//! - 실행 전 `retried >= max_retries` (그리고 retried > 0) 이면 실행하지 않고 종료 실패
//! - Retryable: 재시도 비활성이면 종료 실패, 아니면 횟수를 올려 기록하고
//!   작업 슬롯을 반납한 채 `interval` 만큼 대기
//! - Deferred: 작업 슬롯을 반납하고 알림 또는 `after` 경과까지 대기
//! - Fatal: 즉시 종료 실패

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::SfrmContext;
use crate::stats::StageStats;
use crate::task::{Collector, Task, TaskFailure, TaskOutcome};
use crate::Error;

/// 한 파이프라인 단계의 러너
pub struct TaskRunner<C: Collector> {
    collector: C,
    ctx: Arc<SfrmContext>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    stats: Arc<StageStats>,
    poll_interval: Duration,
    max_tasks: usize,
}

impl<C: Collector> TaskRunner<C> {
    pub fn new(collector: C, ctx: Arc<SfrmContext>, workers: usize, stats: Arc<StageStats>) -> Self {
        let poll_interval = ctx.config.poll_interval();
        let max_tasks = ctx.config.max_tasks_per_list;
        Self {
            collector,
            ctx,
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(DashSet::new()),
            stats,
            poll_interval,
            max_tasks,
        }
    }

    /// shutdown 신호가 올 때까지 폴링
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let stage = self.collector.stage();
        info!(stage, workers = self.permits.available_permits(), "러너 시작");

        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let poll_now = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    false
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(stage, error = %e, "태스크 패닉");
                        }
                    }
                    false
                }
                _ = ticker.tick() => true,
            };
            if poll_now {
                self.poll(&mut tasks).await;
            }
        }

        // 진행 중 태스크는 영속 상태에서 다시 시작되므로 중단해도 된다
        tasks.shutdown().await;
        info!(stage, "{}", self.stats.summary());
    }

    /// 한 번의 폴링 사이클
    async fn poll(&mut self, tasks: &mut JoinSet<()>) {
        let stage = self.collector.stage();
        let available = self.permits.available_permits();
        if available == 0 {
            debug!(stage, "작업 슬롯 없음, 수집 건너뜀");
            return;
        }

        let batch = self
            .collector
            .collect(&self.ctx, self.max_tasks.min(available))
            .await;
        if batch.is_empty() {
            return;
        }
        self.stats.record_collected(batch.len());
        debug!(stage, count = batch.len(), "태스크 수집");

        for task in batch {
            let key = task.key();
            if !self.in_flight.insert(key.clone()) {
                debug!(stage, key = %key, "이미 진행 중인 항목");
                continue;
            }
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let ctx = self.ctx.clone();
            let permits = self.permits.clone();
            let stats = self.stats.clone();
            let in_flight = self.in_flight.clone();
            tasks.spawn(async move {
                drive(task, &ctx, &permits, permit, &stats).await;
                in_flight.remove(&key);
            });
        }
    }
}

/// 태스크 하나를 끝까지 실행
pub async fn drive<T: Task>(
    mut task: T,
    ctx: &SfrmContext,
    permits: &Arc<Semaphore>,
    permit: OwnedSemaphorePermit,
    stats: &StageStats,
) {
    let stage = stats.stage();
    let policy = task.retry_policy();
    let mut first = Some(permit);
    let mut last_error: Option<Error> = None;

    loop {
        let (wake, after) = {
            let _permit = match first.take() {
                Some(permit) => permit,
                None => match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let retried = task.retried();
            if policy.is_exhausted(retried) {
                let error = last_error.take().unwrap_or(Error::RetriesExhausted {
                    retried,
                    max_retries: policy.max_retries,
                });
                terminate(&mut task, ctx, stats, error, true).await;
                return;
            }

            match task.execute(ctx).await {
                TaskOutcome::Success => {
                    stats.record_success();
                    debug!(stage, task = %task.describe(), "태스크 완료");
                    return;
                }
                TaskOutcome::Deferred { wake, after } => {
                    stats.record_deferred();
                    (wake, after)
                }
                TaskOutcome::Retryable(e) => {
                    if !policy.enabled {
                        terminate(&mut task, ctx, stats, e, true).await;
                        return;
                    }
                    let next = retried + 1;
                    warn!(
                        stage,
                        task = %task.describe(),
                        retried = next,
                        max_retries = policy.max_retries,
                        error = %e,
                        "태스크 실패, 재시도 예정"
                    );
                    if let Err(persist) = task.set_retried(ctx, next).await {
                        warn!(stage, task = %task.describe(), error = %persist, "재시도 횟수 기록 실패");
                    }
                    stats.record_retry();
                    last_error = Some(e);
                    (None, policy.interval)
                }
                TaskOutcome::Fatal(e) => {
                    terminate(&mut task, ctx, stats, e, false).await;
                    return;
                }
            }
        };

        // 작업 슬롯 없이 대기
        match wake {
            Some(notify) => {
                let _ = tokio::time::timeout(after, notify.notified()).await;
            }
            None => tokio::time::sleep(after).await,
        }
    }
}

async fn terminate<T: Task>(
    task: &mut T,
    ctx: &SfrmContext,
    stats: &StageStats,
    error: Error,
    retries_exhausted: bool,
) {
    let stage = stats.stage();
    stats.record_failure();
    warn!(
        stage,
        task = %task.describe(),
        retries_exhausted,
        error = %error,
        "태스크 종료 실패"
    );

    let failure = TaskFailure {
        error,
        retries_exhausted,
    };
    if let Err(e) = task.on_terminal_failure(ctx, &failure).await {
        // 실패 자체를 기록하지 못함
        error!(
            stage,
            fatal = true,
            task = %task.describe(),
            cause = %failure.error,
            error = %e,
            "실패 상태 기록 실패"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::context::test_context;
    use crate::task::RetryPolicy;

    /// 조건이 참이 될 때까지 대기
    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// 실행 방식을 바꿔 끼울 수 있는 태스크
    struct ScriptedTask {
        key: &'static str,
        runs: Arc<AtomicUsize>,
        retried: u32,
        policy: RetryPolicy,
        step: Step,
        failure: Arc<Mutex<Option<bool>>>,
    }

    enum Step {
        /// 게이트 허가를 얻을 때까지 막힘
        Gate(Arc<Semaphore>),
        /// 첫 실행만 알림 대기로 미룸
        DeferOnce(Arc<Notify>),
        /// 항상 일시적 실패
        Fail,
    }

    impl ScriptedTask {
        fn new(key: &'static str, runs: &Arc<AtomicUsize>, step: Step) -> Self {
            Self {
                key,
                runs: runs.clone(),
                retried: 0,
                policy: RetryPolicy::none(),
                step,
                failure: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl Task for ScriptedTask {
        fn key(&self) -> String {
            self.key.to_string()
        }

        fn describe(&self) -> String {
            format!("scripted {}", self.key)
        }

        fn retry_policy(&self) -> RetryPolicy {
            self.policy
        }

        fn retried(&self) -> u32 {
            self.retried
        }

        async fn set_retried(&mut self, _ctx: &SfrmContext, retried: u32) -> crate::Result<()> {
            self.retried = retried;
            Ok(())
        }

        async fn execute(&mut self, _ctx: &SfrmContext) -> TaskOutcome {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.step {
                Step::Gate(gate) => {
                    let _open = gate.acquire().await;
                    TaskOutcome::Success
                }
                Step::DeferOnce(wake) if run == 0 => TaskOutcome::Deferred {
                    wake: Some(wake.clone()),
                    after: Duration::from_secs(60),
                },
                Step::DeferOnce(_) => TaskOutcome::Success,
                Step::Fail => TaskOutcome::Retryable(Error::UnexpectedResponse { status: 500 }),
            }
        }

        async fn on_terminal_failure(&mut self, _ctx: &SfrmContext, failure: &TaskFailure) -> crate::Result<()> {
            *self.failure.lock() = Some(failure.retries_exhausted);
            Ok(())
        }
    }

    /// 매 폴링마다 같은 키의 태스크를 돌려주는 컬렉터
    struct RepeatingCollector {
        runs: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Collector for RepeatingCollector {
        type Task = ScriptedTask;

        fn stage(&self) -> &'static str {
            "repeating"
        }

        async fn collect(&mut self, _ctx: &SfrmContext, _limit: usize) -> Vec<ScriptedTask> {
            vec![ScriptedTask::new("same", &self.runs, Step::Gate(self.gate.clone()))]
        }
    }

    #[tokio::test]
    async fn test_in_flight_key_is_not_started_twice() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Vec::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let stats = Arc::new(StageStats::new("repeating"));

        let collector = RepeatingCollector {
            runs: runs.clone(),
            gate: gate.clone(),
        };
        let runner = TaskRunner::new(collector, ctx, 4, stats.clone());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(rx));

        wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
        wait_until(|| stats.snapshot().collected >= 3).await;
        // 막힌 태스크가 끝나기 전에는 같은 키를 다시 실행하지 않음
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        wait_until(|| runs.load(Ordering::SeqCst) >= 2).await;
        assert!(stats.snapshot().succeeded >= 1);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_deferred_task_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Vec::new());
        let permits = Arc::new(Semaphore::new(1));
        let stats = Arc::new(StageStats::new("deferred"));
        let runs = Arc::new(AtomicUsize::new(0));
        let wake = Arc::new(Notify::new());

        let permit = permits.clone().acquire_owned().await.unwrap();
        assert_eq!(permits.available_permits(), 0);

        let task = ScriptedTask::new("deferred", &runs, Step::DeferOnce(wake.clone()));
        let handle = tokio::spawn({
            let permits = permits.clone();
            let stats = stats.clone();
            async move { drive(task, &ctx, &permits, permit, &stats).await }
        });

        // 대기 중에는 슬롯을 잡고 있지 않음
        wait_until(|| permits.available_permits() == 1).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        wake.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.deferred, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_ends_in_terminal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Vec::new());
        let permits = Arc::new(Semaphore::new(1));
        let stats = StageStats::new("retry");
        let runs = Arc::new(AtomicUsize::new(0));

        let mut task = ScriptedTask::new("retry", &runs, Step::Fail);
        task.policy = RetryPolicy {
            enabled: true,
            max_retries: 2,
            interval: Duration::from_millis(1),
        };
        let failure = task.failure.clone();

        let permit = permits.clone().acquire_owned().await.unwrap();
        drive(task, &ctx, &permits, permit, &stats).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*failure.lock(), Some(true));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retried, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(permits.available_permits(), 1);
    }
}
