//! 엔진 - 네 단계 러너를 띄우고 내린다

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::SfrmContext;
use crate::inbound::IncomingPayloadsCollector;
use crate::outbound::{OutgoingPayloadsCollector, PackagedPayloadsCollector, SegmentsCollector};
use crate::runner::TaskRunner;

/// 실행 중인 파이프라인
pub struct Engine {
    ctx: Arc<SfrmContext>,
    shutdown: watch::Sender<bool>,
    runners: Vec<JoinHandle<()>>,
}

impl Engine {
    /// 모든 단계 러너 시작
    pub fn start(ctx: Arc<SfrmContext>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let config = &ctx.config;
        let stats = &ctx.stats;

        let runners = vec![
            tokio::spawn(
                TaskRunner::new(
                    OutgoingPayloadsCollector::new(),
                    ctx.clone(),
                    config.handshake_workers,
                    stats.handshake.clone(),
                )
                .run(rx.clone()),
            ),
            tokio::spawn(
                TaskRunner::new(
                    PackagedPayloadsCollector::new(),
                    ctx.clone(),
                    config.segmenting_workers,
                    stats.segmenting.clone(),
                )
                .run(rx.clone()),
            ),
            tokio::spawn(
                TaskRunner::new(
                    SegmentsCollector::new(),
                    ctx.clone(),
                    config.sending_workers,
                    stats.sending.clone(),
                )
                .run(rx.clone()),
            ),
            tokio::spawn(
                TaskRunner::new(
                    IncomingPayloadsCollector::new(),
                    ctx.clone(),
                    config.reassembly_workers,
                    stats.reassembly.clone(),
                )
                .run(rx),
            ),
        ];

        info!(
            handshake_workers = config.handshake_workers,
            segmenting_workers = config.segmenting_workers,
            sending_workers = config.sending_workers,
            reassembly_workers = config.reassembly_workers,
            "SFRM 엔진 시작"
        );
        Self {
            ctx,
            shutdown,
            runners,
        }
    }

    pub fn context(&self) -> &Arc<SfrmContext> {
        &self.ctx
    }

    /// 러너 정지 후 통계 출력
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for runner in self.runners {
            if let Err(e) = runner.await {
                warn!(error = %e, "러너 종료 실패");
            }
        }
        info!("SFRM 엔진 정지 | {}", self.ctx.stats.summary());
    }
}
