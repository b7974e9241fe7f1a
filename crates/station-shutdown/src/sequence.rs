use crate::signal::{StopReason, StopSignal};
use crate::stage::{ShutdownStage, StageOutcome};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};

/// 关闭结果
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// 由停止请求触发时的原因
    pub reason: Option<StopReason>,
    pub stages: Vec<(String, StageOutcome)>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn all_completed(&self) -> bool {
        self.stages
            .iter()
            .all(|(_, outcome)| *outcome == StageOutcome::Completed)
    }
}

/// 按优先级执行的关闭阶段序列
pub struct ShutdownSequence {
    stop_rx: broadcast::Receiver<StopReason>,
    stages: Vec<Box<dyn ShutdownStage>>,
    total_timeout: Duration,
}

impl ShutdownSequence {
    pub fn builder() -> ShutdownSequenceBuilder {
        ShutdownSequenceBuilder::new()
    }

    /// 等待停止请求后执行全部阶段
    pub async fn run(mut self) -> ShutdownReport {
        let reason = loop {
            match self.stop_rx.recv().await {
                Ok(reason) => break reason,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                // 所有请求端都已释放，不会再有请求
                Err(broadcast::error::RecvError::Closed) => break StopReason::Requested,
            }
        };
        info!(reason = %reason, stages = self.stages.len(), "Shutting down");

        let mut report = self.execute().await;
        report.reason = Some(reason);
        report
    }

    /// 立即按优先级执行全部阶段
    ///
    /// 单个阶段失败或超时不会阻止后续阶段
    pub async fn execute(&mut self) -> ShutdownReport {
        let start = Instant::now();
        let deadline = start.checked_add(self.total_timeout).unwrap_or(start);

        self.stages.sort_by_key(|s| s.priority());
        let mut outcomes = Vec::with_capacity(self.stages.len());

        for stage in self.stages.iter_mut() {
            let name = stage.name().to_string();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = stage.timeout().min(remaining);
            info!(stage = %name, budget = ?budget, "Running shutdown stage");

            let outcome = match timeout(budget, stage.execute()).await {
                Ok(Ok(())) => {
                    info!(stage = %name, "Shutdown stage complete");
                    StageOutcome::Completed
                }
                Ok(Err(e)) => {
                    error!(stage = %name, error = %e, "Shutdown stage failed");
                    StageOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(stage = %name, budget = ?budget, "Shutdown stage timed out");
                    StageOutcome::TimedOut
                }
            };
            outcomes.push((name, outcome));
        }

        let elapsed = start.elapsed();
        info!(elapsed = ?elapsed, "Shutdown sequence complete");

        ShutdownReport {
            reason: None,
            stages: outcomes,
            elapsed,
        }
    }
}

/// 关闭序列构建器
pub struct ShutdownSequenceBuilder {
    stop: Option<StopSignal>,
    stages: Vec<Box<dyn ShutdownStage>>,
    total_timeout: Duration,
}

impl ShutdownSequenceBuilder {
    pub fn new() -> Self {
        Self {
            stop: None,
            stages: Vec::new(),
            total_timeout: Duration::from_secs(60),
        }
    }

    /// `run` 等待的停止请求来源
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_stage(mut self, stage: impl ShutdownStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// 所有阶段的总时限
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn build(self) -> ShutdownSequence {
        let stop = self.stop.unwrap_or_default();
        // 构建时订阅，`run` 之前发出的请求不会丢失
        ShutdownSequence {
            stop_rx: stop.subscribe(),
            stages: self.stages,
            total_timeout: self.total_timeout,
        }
    }
}

impl Default for ShutdownSequenceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
