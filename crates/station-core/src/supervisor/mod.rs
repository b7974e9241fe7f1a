//! 设备监督器
//!
//! 定期把"已连接的设备"和"已配置的设备"对齐：启动缺失的工作任务，
//! 停止不再需要的任务，配置变化时重新初始化。对齐是幂等的，
//! 探测偶发失败会在下一轮自愈。

mod probe;
mod source;

pub use probe::{DeviceDescriptor, HardwareProbe};
pub use source::{ConfigSource, ConfigWatcher, FileConfigSource};
pub use station_config::ResolvedDevices;

use station_config::{validate_identifier, SupervisorConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::deadline_after;
use crate::channel::RecordSender;
use crate::coordinator::CoordinatorHandle;
use crate::error::{Result, StationError};
use crate::model::{Identifier, RecordKind, StatusRecord, WorkerConfig, WorkerState};
use crate::worker::{DeviceDriver, StopOutcome, Worker, WorkerHandle};

/// 按设备配置创建并启动工作任务
pub trait DriverFactory: Send + Sync {
    fn launch(&self, config: WorkerConfig, sender: RecordSender) -> Result<WorkerHandle>;
}

/// 所有设备共用同一个驱动
impl<D: DeviceDriver> DriverFactory for Arc<D> {
    fn launch(&self, config: WorkerConfig, sender: RecordSender) -> Result<WorkerHandle> {
        Worker::new(self.clone(), sender).start(config)
    }
}

/// 一次对齐的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<Identifier>,
    pub stopped: Vec<Identifier>,
    pub reinitialized: Vec<Identifier>,
    /// 启动失败（下一轮重试）
    pub failed: Vec<(Identifier, String)>,
    /// 本轮新发现的无效配置
    pub rejected: Vec<Identifier>,
    /// 硬件探测失败，本轮没有因缺失而停止任何任务
    pub probe_failed: bool,
}

impl ReconcileReport {
    /// 没有启动、停止或重新初始化任何任务
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.reinitialized.is_empty()
    }
}

enum SupervisorCommand {
    Reconcile(oneshot::Sender<Result<ReconcileReport>>),
    Hotplug,
    Start(Identifier, oneshot::Sender<Result<ReconcileReport>>),
    Stop(Identifier, oneshot::Sender<Result<bool>>),
    Reinitialize(Identifier, WorkerConfig, oneshot::Sender<Result<ReconcileReport>>),
    StopAll(oneshot::Sender<usize>),
}

/// 设备监督器
///
/// 独占所有工作任务句柄；同一标识不会同时存在两个工作任务
pub struct Supervisor {
    config: SupervisorConfig,
    data_dir: PathBuf,
    source: Arc<dyn ConfigSource>,
    probe: Arc<dyn HardwareProbe>,
    factory: Arc<dyn DriverFactory>,
    sender: RecordSender,
    coordinator: CoordinatorHandle,
    commands: mpsc::Receiver<SupervisorCommand>,
    workers: HashMap<Identifier, WorkerHandle>,
    /// 手动停止的设备，对齐时跳过
    held: HashSet<Identifier>,
    /// 手动重新初始化的配置，配置文件变化时清除
    overrides: HashMap<Identifier, WorkerConfig>,
    /// 已报告过的无效配置
    rejected: HashSet<Identifier>,
    /// 已报告过的标识不可用的探测设备
    unusable: HashSet<Identifier>,
    fingerprint: Option<String>,
    last_reconcile: Option<Instant>,
    reconcile_due: Option<Instant>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        data_dir: impl AsRef<Path>,
        source: Arc<dyn ConfigSource>,
        probe: Arc<dyn HardwareProbe>,
        factory: Arc<dyn DriverFactory>,
        sender: RecordSender,
        coordinator: CoordinatorHandle,
    ) -> (Self, SupervisorHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let supervisor = Self {
            config,
            data_dir: data_dir.as_ref().to_path_buf(),
            source,
            probe,
            factory,
            sender,
            coordinator,
            commands: command_rx,
            workers: HashMap::new(),
            held: HashSet::new(),
            overrides: HashMap::new(),
            rejected: HashSet::new(),
            unusable: HashSet::new(),
            fingerprint: None,
            last_reconcile: None,
            reconcile_due: None,
        };
        (supervisor, SupervisorHandle { commands: command_tx })
    }

    /// 当前工作任务及其状态
    pub fn workers(&self) -> BTreeMap<Identifier, WorkerState> {
        self.workers
            .iter()
            .map(|(id, handle)| (id.clone(), handle.state()))
            .collect()
    }

    /// 对齐已连接与已配置的设备
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.last_reconcile = Some(Instant::now());
        self.reconcile_due = None;

        let fingerprint = self.source.fingerprint().await?;
        if self.fingerprint.as_deref() != Some(fingerprint.as_str()) {
            if self.fingerprint.is_some() {
                info!(overrides = self.overrides.len(), "Configuration changed");
            }
            self.overrides.clear();
            self.fingerprint = Some(fingerprint);
        }

        let resolved = self.source.load().await?;
        self.report_rejected(&resolved, &mut report).await;

        let present: Option<HashMap<Identifier, DeviceDescriptor>> = match self.probe.probe().await {
            Ok(devices) => Some(
                devices
                    .into_iter()
                    .map(|d| (d.identifier.clone(), d))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Hardware probe failed, keeping running workers");
                report.probe_failed = true;
                None
            }
        };

        let mut configs = resolved.devices;
        for (identifier, config) in &self.overrides {
            configs.insert(identifier.clone(), config.clone());
        }
        if self.config.auto_configure {
            if let Some(present) = &present {
                for device in present.values() {
                    if device.kind.captures_images() && !configs.contains_key(&device.identifier) {
                        if let Err(e) = validate_identifier(&device.identifier) {
                            if self.unusable.insert(device.identifier.clone()) {
                                warn!(identifier = %device.identifier, error = %e, "Detected device has an unusable identifier");
                                report.rejected.push(device.identifier.clone());
                            }
                            continue;
                        }
                        info!(identifier = %device.identifier, kind = %device.kind, "Auto-configuring detected device");
                        configs.insert(
                            device.identifier.clone(),
                            WorkerConfig::detected_default(&device.identifier, device.kind, &self.data_dir),
                        );
                    }
                }
            }
        }

        let mut desired: BTreeMap<Identifier, WorkerConfig> = BTreeMap::new();
        for (identifier, config) in configs {
            if !config.enabled || self.held.contains(&identifier) {
                continue;
            }
            // 探测失败时只保留正在运行的任务
            let attached = match &present {
                Some(present) => present.contains_key(&identifier),
                None => self.workers.contains_key(&identifier),
            };
            if attached {
                desired.insert(identifier, config);
            }
        }

        let mut to_stop: Vec<Identifier> = self
            .workers
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        to_stop.sort();
        for identifier in to_stop {
            if let Some(handle) = self.workers.remove(&identifier) {
                self.stop_worker(handle).await;
                if let Err(e) = self.coordinator.remove_identifier(&identifier).await {
                    warn!(identifier = %identifier, error = %e, "Failed to unregister identifier");
                }
                report.stopped.push(identifier);
            }
        }

        for (identifier, config) in desired {
            let unchanged = self.workers.get(&identifier).map(|h| h.config() == &config);
            match unchanged {
                Some(true) => continue,
                Some(false) => {
                    if let Some(old) = self.workers.remove(&identifier) {
                        info!(identifier = %identifier, "Configuration changed, reinitializing");
                        self.stop_worker(old).await;
                    }
                    match self.launch(config).await {
                        Ok(()) => report.reinitialized.push(identifier),
                        Err(e) => report.failed.push((identifier, e.to_string())),
                    }
                }
                None => match self.launch(config).await {
                    Ok(()) => report.started.push(identifier),
                    Err(e) => report.failed.push((identifier, e.to_string())),
                },
            }
        }

        if !report.is_noop() || !report.failed.is_empty() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                reinitialized = report.reinitialized.len(),
                failed = report.failed.len(),
                "Reconciled devices"
            );
        }
        Ok(report)
    }

    /// 解除手动停止并重新对齐；已自行结束的任务会被重启
    pub async fn start(&mut self, identifier: &str) -> Result<ReconcileReport> {
        self.held.remove(identifier);
        let finished = self.workers.get(identifier).map_or(false, |h| h.is_finished());
        if finished {
            if let Some(handle) = self.workers.remove(identifier) {
                self.stop_worker(handle).await;
            }
        }
        self.reconcile().await
    }

    /// 停止并保持停止，直到 `start`；返回是否有任务在运行
    pub async fn stop(&mut self, identifier: &str) -> Result<bool> {
        self.held.insert(identifier.to_string());
        match self.workers.remove(identifier) {
            Some(handle) => {
                self.stop_worker(handle).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 用新配置替换，直到配置文件变化
    pub async fn reinitialize(&mut self, identifier: &str, mut config: WorkerConfig) -> Result<ReconcileReport> {
        config.identifier = identifier.to_string();
        config.validate()?;
        self.held.remove(identifier);
        self.overrides.insert(identifier.to_string(), config);
        self.reconcile().await
    }

    /// 并发停止所有工作任务
    pub async fn stop_all(&mut self) -> usize {
        let count = self.workers.len();
        if count == 0 {
            return 0;
        }
        info!(workers = count, "Stopping all workers");

        let mut stops = JoinSet::new();
        for (_, handle) in self.workers.drain() {
            stops.spawn(async move {
                let identifier = handle.identifier().to_string();
                (identifier, handle.stop().await)
            });
        }
        while let Some(result) = stops.join_next().await {
            match result {
                Ok((identifier, StopOutcome::Forced)) => {
                    warn!(identifier = %identifier, "Worker did not stop in time")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Worker stop task panicked"),
            }
        }
        count
    }

    /// 定时对齐并处理命令，直到 `shutdown` 变为 true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.reconcile_interval();
        let mut ticker = interval_at(deadline_after(Instant::now(), interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watcher = match self.source.watch().await {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "Configuration watch unavailable, relying on periodic reconcile");
                None
            }
        };

        info!(interval = ?interval, watching = watcher.is_some(), "Supervisor started");

        loop {
            let reconcile_due = self.reconcile_due;
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                changed = next_change(&mut watcher), if watcher.is_some() => {
                    match changed {
                        Some(()) => self.on_config_changed(),
                        None => {
                            warn!("Configuration watcher closed");
                            watcher = None;
                        }
                    }
                }
                _ = sleep_until(reconcile_due.unwrap_or_else(Instant::now)), if reconcile_due.is_some() => {
                    self.reconcile_logged().await;
                }
                _ = ticker.tick() => {
                    self.reconcile_logged().await;
                }
            }
        }

        self.stop_all().await;
        info!("Supervisor stopped");
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Reconcile(reply) => {
                let _ = reply.send(self.reconcile().await);
            }
            SupervisorCommand::Hotplug => self.on_hotplug().await,
            SupervisorCommand::Start(identifier, reply) => {
                let _ = reply.send(self.start(&identifier).await);
            }
            SupervisorCommand::Stop(identifier, reply) => {
                let _ = reply.send(self.stop(&identifier).await);
            }
            SupervisorCommand::Reinitialize(identifier, config, reply) => {
                let _ = reply.send(self.reinitialize(&identifier, config).await);
            }
            SupervisorCommand::StopAll(reply) => {
                let _ = reply.send(self.stop_all().await);
            }
        }
    }

    /// 热插拔事件：距上次对齐不足去抖窗口时合并到窗口结束
    async fn on_hotplug(&mut self) {
        let debounce = self.config.debounce();
        match self.last_reconcile {
            Some(last) if last.elapsed() < debounce => {
                if self.reconcile_due.is_none() {
                    debug!("Hotplug within debounce window, deferring");
                    self.reconcile_due = Some(deadline_after(last, debounce));
                }
            }
            _ => self.reconcile_logged().await,
        }
    }

    /// 配置文件变化：等去抖窗口结束再对齐，合并编辑器的连续写入
    fn on_config_changed(&mut self) {
        if self.reconcile_due.is_none() {
            debug!("Configuration file changed, scheduling reconcile");
            self.reconcile_due = Some(deadline_after(Instant::now(), self.config.debounce()));
        }
    }

    async fn reconcile_logged(&mut self) {
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Reconcile failed");
        }
    }

    async fn launch(&mut self, config: WorkerConfig) -> Result<()> {
        let identifier = config.identifier.clone();
        self.coordinator.add_identifier(config.clone()).await?;

        match self.factory.launch(config, self.sender.clone()) {
            Ok(handle) => {
                info!(identifier = %identifier, "Worker started");
                self.workers.insert(identifier, handle);
                Ok(())
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to start worker");
                Err(e)
            }
        }
    }

    async fn stop_worker(&self, handle: WorkerHandle) {
        let identifier = handle.identifier().to_string();
        match handle.stop().await {
            StopOutcome::Graceful => info!(identifier = %identifier, "Worker stopped"),
            StopOutcome::Forced => warn!(identifier = %identifier, "Worker force-stopped after timeout"),
        }
    }

    /// 新出现的无效配置报告一次停止记录
    async fn report_rejected(&mut self, resolved: &ResolvedDevices, report: &mut ReconcileReport) {
        self.rejected.retain(|id| resolved.rejected.contains_key(id));

        for (identifier, err) in &resolved.rejected {
            if !self.rejected.insert(identifier.clone()) {
                continue;
            }
            let err = StationError::from(err.clone());
            error!(identifier = %identifier, error = %err, "Rejected device configuration");
            report.rejected.push(identifier.clone());

            // 无法作为记录标识的只记日志
            if validate_identifier(identifier).is_err() {
                continue;
            }
            let record = StatusRecord::new(identifier.as_str(), WorkerState::Stopped, RecordKind::Final)
                .with_error(err.to_string());
            self.sender.send(record).await;
        }
    }
}

/// 监督器句柄
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<SupervisorCommand>,
}

async fn next_change(watcher: &mut Option<ConfigWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}

impl SupervisorHandle {
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.request(SupervisorCommand::Reconcile).await?
    }

    /// 热插拔通知，不等待结果
    pub fn hotplug(&self) {
        if self.commands.try_send(SupervisorCommand::Hotplug).is_err() {
            debug!("Supervisor busy or stopped, dropping hotplug notification");
        }
    }

    pub async fn start(&self, identifier: &str) -> Result<ReconcileReport> {
        let identifier = identifier.to_string();
        self.request(|reply| SupervisorCommand::Start(identifier, reply))
            .await?
    }

    pub async fn stop(&self, identifier: &str) -> Result<bool> {
        let identifier = identifier.to_string();
        self.request(|reply| SupervisorCommand::Stop(identifier, reply))
            .await?
    }

    pub async fn reinitialize(&self, identifier: &str, config: WorkerConfig) -> Result<ReconcileReport> {
        let identifier = identifier.to_string();
        self.request(|reply| SupervisorCommand::Reinitialize(identifier, config, reply))
            .await?
    }

    pub async fn stop_all(&self) -> Result<usize> {
        self.request(SupervisorCommand::StopAll).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| StationError::Closed("supervisor"))?;
        reply_rx.await.map_err(|_| StationError::Closed("supervisor"))
    }
}
