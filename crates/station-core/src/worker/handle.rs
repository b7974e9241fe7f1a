use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::WorkerCounters;
use crate::channel::RecordSender;
use crate::model::{Identifier, RecordKind, StatusRecord, WorkerConfig, WorkerState};

/// 停止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 工作任务在超时前自行退出
    Graceful,
    /// 超时后中止任务并强制释放设备
    Forced,
}

/// 运行中的工作任务句柄
///
/// 与驱动类型无关，由监督器按标识持有
pub struct WorkerHandle {
    pub(super) identifier: Identifier,
    pub(super) config: WorkerConfig,
    pub(super) stop_tx: watch::Sender<bool>,
    pub(super) state_tx: Arc<watch::Sender<WorkerState>>,
    pub(super) counters: Arc<WorkerCounters>,
    pub(super) sender: RecordSender,
    pub(super) task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// 当前状态；任务已结束时总是 `Stopped`
    pub fn state(&self) -> WorkerState {
        if self.task.is_finished() {
            return WorkerState::Stopped;
        }
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// 任务是否已经结束（包括致命故障后自行停止）
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 停止工作任务
    ///
    /// 先请求协作停止；超过 `stop_timeout` 后中止任务并发出带 `forced` 标记的最终记录
    pub async fn stop(mut self) -> StopOutcome {
        let _ = self.stop_tx.send(true);
        let stop_timeout = self.config.stop_timeout();

        match timeout(stop_timeout, &mut self.task).await {
            Ok(Ok(())) => {
                info!(identifier = %self.identifier, "Worker stopped");
                StopOutcome::Graceful
            }
            Ok(Err(e)) => {
                // 任务异常退出时没有发出最终记录
                error!(identifier = %self.identifier, error = %e, "Worker task ended abnormally");
                let record = self.final_record().with_error(format!("worker task ended abnormally: {e}"));
                self.finish(record).await;
                StopOutcome::Graceful
            }
            Err(_) => {
                warn!(
                    identifier = %self.identifier,
                    timeout = ?stop_timeout,
                    "Worker did not stop in time, forcing release"
                );
                self.task.abort();
                let _ = (&mut self.task).await;

                let record = self.final_record().with_attribute("forced", true);
                self.finish(record).await;
                StopOutcome::Forced
            }
        }
    }

    fn final_record(&self) -> StatusRecord {
        let mut record = StatusRecord::new(self.identifier.clone(), WorkerState::Stopped, RecordKind::Final)
            .with_sequence(self.counters.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        record.error_count = self.counters.error_count.load(Ordering::Relaxed);
        record
    }

    async fn finish(&self, record: StatusRecord) {
        self.state_tx.send_replace(WorkerState::Stopped);
        self.sender.send(record).await;
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("identifier", &self.identifier)
            .field("state", &self.state())
            .finish()
    }
}
