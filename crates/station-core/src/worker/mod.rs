//! 设备工作任务
//!
//! 状态机：`Created → Initializing → Running ⇄ Degraded → Stopping → Stopped`

mod driver;
mod handle;

pub use driver::{DeviceDriver, UnitOutcome};
pub use handle::{StopOutcome, WorkerHandle};
pub use station_config::CaptureWindow;

use chrono::Local;
use station_logging::LogSampler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::backoff::{deadline_after, Backoff};
use crate::channel::{RecordSender, SendOutcome};
use crate::error::{DeviceError, Result};
use crate::model::{
    Artifact, Disposition, Identifier, RecordKind, StatusRecord, WorkerConfig, WorkerState,
};

/// 工作任务与其句柄共享的计数
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    /// 最后使用的记录序号
    pub(crate) sequence: AtomicU64,
    pub(crate) error_count: AtomicU64,
}

/// 设备工作任务
pub struct Worker<D: DeviceDriver> {
    driver: Arc<D>,
    sender: RecordSender,
    sampler: Arc<LogSampler>,
}

impl<D: DeviceDriver> Worker<D> {
    pub fn new(driver: Arc<D>, sender: RecordSender) -> Self {
        Self {
            driver,
            sender,
            sampler: Arc::new(LogSampler::per_minute(5)),
        }
    }

    /// 共享的失败日志采样器
    pub fn with_sampler(mut self, sampler: Arc<LogSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// 启动工作任务
    ///
    /// 配置无效时返回错误，不会启动任务
    pub fn start(self, config: WorkerConfig) -> Result<WorkerHandle> {
        config.validate()?;
        let window = config.capture_window()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(WorkerState::Created);
        let state_tx = Arc::new(state_tx);
        let counters = Arc::new(WorkerCounters::default());

        let run = WorkerLoop {
            identifier: config.identifier.clone(),
            backoff: Backoff::new(config.backoff_base(), config.backoff_cap()),
            config: config.clone(),
            window,
            driver: self.driver,
            sender: self.sender.clone(),
            sampler: self.sampler,
            stop_rx,
            state_tx: state_tx.clone(),
            counters: counters.clone(),
            consecutive: 0,
        };
        let task = tokio::spawn(run.run());

        Ok(WorkerHandle {
            identifier: config.identifier.clone(),
            config,
            stop_tx,
            state_tx,
            counters,
            sender: self.sender,
            task,
        })
    }
}

struct WorkerLoop<D: DeviceDriver> {
    identifier: Identifier,
    config: WorkerConfig,
    window: Option<CaptureWindow>,
    driver: Arc<D>,
    sender: RecordSender,
    sampler: Arc<LogSampler>,
    stop_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<WorkerState>>,
    counters: Arc<WorkerCounters>,
    backoff: Backoff,
    consecutive: u32,
}

impl<D: DeviceDriver> WorkerLoop<D> {
    async fn run(mut self) {
        info!(
            identifier = %self.identifier,
            kind = %self.config.kind,
            interval = ?self.config.interval(),
            "Worker starting"
        );
        self.transition(WorkerState::Initializing).await;

        let mut handle: Option<D::Handle> = None;
        let mut next_unit = Instant::now();

        loop {
            if self.stop_requested() {
                break;
            }

            if handle.is_none() {
                match self.acquire().await {
                    Ok(device) => {
                        handle = Some(device);
                        self.transition(WorkerState::Running).await;
                        next_unit = Instant::now();
                    }
                    Err(e) => {
                        if self.is_terminal(&e) {
                            self.stop_on_fatal(e).await;
                            return;
                        }
                        self.report_failure(WorkerState::Degraded, &e).await;
                        let delay = self.backoff.next_delay();
                        debug!(identifier = %self.identifier, delay = ?delay, "Retrying acquisition");
                        if self.sleep_or_stop(delay).await {
                            break;
                        }
                    }
                }
                continue;
            }

            if self.sleep_until_or_stop(next_unit).await {
                break;
            }
            let Some(device) = handle.as_mut() else {
                continue;
            };

            if !self.in_window() {
                debug!(identifier = %self.identifier, "Outside capture window, skipping unit");
                next_unit = deadline_after(Instant::now(), self.config.interval());
                continue;
            }

            let unit_timeout = self.config.unit_timeout();
            let result = timeout(unit_timeout, self.driver.perform_unit(device, &self.config))
                .await
                .unwrap_or(Err(DeviceError::Timeout(unit_timeout)));
            next_unit = schedule_next(next_unit, self.config.interval());

            match result {
                Ok(outcome) => {
                    if self.consecutive > 0 {
                        self.sampler.reset(&self.identifier);
                    }
                    self.consecutive = 0;
                    self.backoff.reset();
                    self.emit_observation(outcome).await;
                }
                Err(e) => {
                    self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                    self.consecutive += 1;

                    if self.is_terminal(&e) {
                        if let Some(device) = handle.take() {
                            self.driver.release(device).await;
                        }
                        self.stop_on_fatal(e).await;
                        return;
                    }

                    if self.consecutive >= self.config.error_threshold {
                        if let Some(device) = handle.take() {
                            self.driver.release(device).await;
                        }
                        self.report_failure(WorkerState::Degraded, &e).await;
                        // 每次重新获取设备后重新计数
                        self.consecutive = 0;
                        let delay = self.backoff.next_delay();
                        warn!(
                            identifier = %self.identifier,
                            threshold = self.config.error_threshold,
                            delay = ?delay,
                            "Error threshold reached, device released"
                        );
                        if self.sleep_or_stop(delay).await {
                            break;
                        }
                    } else {
                        self.report_failure(WorkerState::Running, &e).await;
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopping);
        if let Some(device) = handle.take() {
            self.driver.release(device).await;
        }
        self.set_state(WorkerState::Stopped);
        let record = self.record(RecordKind::Final);
        self.emit(record).await;
        info!(identifier = %self.identifier, "Worker loop exited");
    }

    async fn acquire(&mut self) -> std::result::Result<D::Handle, DeviceError> {
        let unit_timeout = self.config.unit_timeout();
        let result = timeout(unit_timeout, self.driver.acquire(&self.config))
            .await
            .unwrap_or(Err(DeviceError::Timeout(unit_timeout)));
        if result.is_err() {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn is_terminal(&self, error: &DeviceError) -> bool {
        error.is_fatal() && !self.config.retry_on_fatal
    }

    async fn stop_on_fatal(&mut self, error: DeviceError) {
        error!(
            identifier = %self.identifier,
            error = %error,
            "Fatal device error, retry disabled, worker stopping"
        );
        self.set_state(WorkerState::Stopped);
        let record = self.record(RecordKind::Final).with_error(error.to_string());
        self.emit(record).await;
    }

    async fn report_failure(&mut self, state: WorkerState, error: &DeviceError) {
        self.set_state(state);

        let decision = self.sampler.sample(&self.identifier);
        if let station_logging::SampleDecision::Emit { suppressed } = decision {
            warn!(
                identifier = %self.identifier,
                state = %state,
                consecutive = self.consecutive,
                suppressed,
                error = %error,
                "Device operation failed"
            );
        }

        let record = self.record(RecordKind::Failure).with_error(error.to_string());
        self.emit(record).await;
    }

    async fn emit_observation(&mut self, outcome: UnitOutcome) {
        let mut record = self.record(RecordKind::Observation);
        record.attributes = outcome.attributes;

        if let Some((path, kind)) = outcome.artifact {
            let mut artifact = Artifact::new(self.identifier.clone(), path, kind)
                .with_destinations(self.config.upload.clone());
            if let Some(remove) = self.config.remove_source {
                artifact = artifact.with_disposition(if remove {
                    Disposition::Delete
                } else {
                    Disposition::Archive
                });
            }
            record.artifact = Some(artifact);
        }

        self.emit(record).await;
    }

    async fn transition(&mut self, state: WorkerState) {
        self.set_state(state);
        let record = self.record(RecordKind::Transition);
        self.emit(record).await;
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(identifier = %self.identifier, from = %previous, to = %state, "Worker state changed");
        }
    }

    fn record(&self, kind: RecordKind) -> StatusRecord {
        let mut record = StatusRecord::new(self.identifier.clone(), *self.state_tx.borrow(), kind)
            .with_sequence(self.counters.sequence.fetch_add(1, Ordering::Relaxed) + 1);
        record.error_count = self.counters.error_count.load(Ordering::Relaxed);
        record.consecutive_errors = self.consecutive;
        record
    }

    async fn emit(&self, record: StatusRecord) {
        if self.sender.send(record).await == SendOutcome::Closed {
            debug!(identifier = %self.identifier, "Record channel closed");
        }
    }

    fn in_window(&self) -> bool {
        self.window
            .map_or(true, |window| window.contains(Local::now().time()))
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// 等待 `delay`，期间收到停止请求返回 true
    async fn sleep_or_stop(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            _ = wait_for_stop(&mut self.stop_rx) => true,
        }
    }

    async fn sleep_until_or_stop(&mut self, deadline: Instant) -> bool {
        let stopped = tokio::select! {
            _ = sleep_until(deadline) => false,
            _ = wait_for_stop(&mut self.stop_rx) => true,
        };
        stopped || self.stop_requested()
    }
}

/// 句柄被丢弃也视为停止
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

/// 按固定节拍排下一次操作；落后时从当前时刻重新计时
fn schedule_next(previous: Instant, interval: std::time::Duration) -> Instant {
    let next = deadline_after(previous, interval);
    let now = Instant::now();
    if next <= now {
        deadline_after(now, interval)
    } else {
        next
    }
}
