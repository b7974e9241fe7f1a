//! 工作站组装与生命周期
//!
//! 启动顺序：上传器、协调器、监督器（启动时同步对齐一次）。
//! 关闭顺序相反：先停工作任务，再让协调器排空落盘，最后在宽限期内排空上传队列。

use station_config::{DestinationKind, StationConfig};
use station_shutdown::{FnStage, ShutdownReport, ShutdownSequence, StageError, StopReason, StopSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::bounded;
use crate::coordinator::{Coordinator, CoordinatorHandle, StationSnapshot};
use crate::error::{Result, StationError};
use crate::model::WorkerConfig;
use crate::supervisor::{ConfigSource, DriverFactory, HardwareProbe, ReconcileReport, Supervisor, SupervisorHandle};
use crate::uploader::{DestinationStatus, TransportConnector, TransportFactory, UploadTask, Uploader, UploaderHandle};

const WORKER_STAGE_TIMEOUT: Duration = Duration::from_secs(60);
const COORDINATOR_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// 工作站入口
pub struct Station;

impl Station {
    pub fn builder() -> StationBuilder {
        StationBuilder::new()
    }
}

/// 工作站构建器
pub struct StationBuilder {
    config: StationConfig,
    source: Option<Arc<dyn ConfigSource>>,
    probe: Option<Arc<dyn HardwareProbe>>,
    factory: Option<Arc<dyn DriverFactory>>,
    transports: TransportFactory,
}

impl StationBuilder {
    pub fn new() -> Self {
        Self {
            config: StationConfig::default(),
            source: None,
            probe: None,
            factory: None,
            transports: TransportFactory::new(),
        }
    }

    pub fn with_config(mut self, config: StationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_probe(mut self, probe: impl HardwareProbe + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn with_driver_factory(mut self, factory: impl DriverFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// 注册某类目标的传输实现
    pub fn with_transport(mut self, kind: DestinationKind, connector: impl TransportConnector + 'static) -> Self {
        self.transports = self.transports.register(kind, connector);
        self
    }

    /// 启动所有组件
    pub async fn start(self) -> Result<RunningStation> {
        let source = self
            .source
            .ok_or_else(|| StationError::config("no configuration source"))?;
        let probe = self
            .probe
            .ok_or_else(|| StationError::config("no hardware probe"))?;
        let factory = self
            .factory
            .ok_or_else(|| StationError::config("no driver factory"))?;

        let config = self.config;
        let data_dir = config.station.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        let (sender, receiver) = bounded(config.channel.capacity, config.channel.send_timeout());

        let mut uploader = Uploader::new(config.uploader.clone(), data_dir.join("archive"), self.transports);
        for destination in &config.destinations {
            uploader.add_destination(destination.clone());
        }
        let uploader_handle = uploader.handle();

        let (coordinator, coordinator_handle) = Coordinator::new(
            config.station.name.clone(),
            &data_dir,
            config.coordinator.clone(),
            receiver,
            uploader_handle.clone(),
        );
        let (mut supervisor, supervisor_handle) = Supervisor::new(
            config.supervisor.clone(),
            &data_dir,
            source,
            probe,
            factory,
            sender,
            coordinator_handle.clone(),
        );

        let (uploader_stop, uploader_rx) = watch::channel(false);
        let (coordinator_stop, coordinator_rx) = watch::channel(false);
        let (supervisor_stop, supervisor_rx) = watch::channel(false);

        let uploader_task = tokio::spawn(uploader.run(uploader_rx));
        let coordinator_task = tokio::spawn(coordinator.run(coordinator_rx));

        match supervisor.reconcile().await {
            Ok(report) => info!(
                station = %config.station.name,
                workers = report.started.len(),
                rejected = report.rejected.len(),
                "Station started"
            ),
            Err(e) => warn!(error = %e, "Initial reconcile failed, retrying on the next tick"),
        }
        let supervisor_task = tokio::spawn(supervisor.run(supervisor_rx));

        let stop = StopSignal::new();
        Ok(RunningStation {
            handle: StationHandle {
                coordinator: coordinator_handle,
                supervisor: supervisor_handle,
                uploader: uploader_handle,
                stop: stop.clone(),
            },
            stop,
            supervisor: (supervisor_stop, supervisor_task),
            coordinator: (coordinator_stop, coordinator_task),
            uploader: (uploader_stop, uploader_task),
            upload_grace: config.uploader.shutdown_grace(),
        })
    }
}

impl Default for StationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type Component = (watch::Sender<bool>, JoinHandle<()>);

/// 运行中的工作站
pub struct RunningStation {
    handle: StationHandle,
    stop: StopSignal,
    supervisor: Component,
    coordinator: Component,
    uploader: Component,
    upload_grace: Duration,
}

impl RunningStation {
    pub fn handle(&self) -> StationHandle {
        self.handle.clone()
    }

    /// 停止请求的来源，系统信号可转发到这里
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// 运行直到收到停止请求，然后按顺序关闭
    pub async fn wait(self) -> ShutdownReport {
        self.shutdown_sequence().run().await
    }

    /// 立即按顺序关闭：工作任务、协调器、上传器
    pub async fn shutdown(self) -> ShutdownReport {
        self.shutdown_sequence().execute().await
    }

    fn shutdown_sequence(self) -> ShutdownSequence {
        let upload_timeout = self.upload_grace + Duration::from_secs(5);

        ShutdownSequence::builder()
            .with_stop_signal(self.stop)
            .with_stage(stop_stage("workers", 10, WORKER_STAGE_TIMEOUT, self.supervisor))
            .with_stage(stop_stage("coordinator", 20, COORDINATOR_STAGE_TIMEOUT, self.coordinator))
            .with_stage(stop_stage("uploader", 30, upload_timeout, self.uploader))
            .with_total_timeout(WORKER_STAGE_TIMEOUT + COORDINATOR_STAGE_TIMEOUT + upload_timeout)
            .build()
    }
}

fn stop_stage(name: &'static str, priority: u32, timeout: Duration, component: Component) -> FnStage {
    let (stop, task) = component;
    FnStage::new(name, priority, timeout, async move {
        let _ = stop.send(true);
        task.await
            .map_err(|e| StageError::Failed(format!("{name} task failed: {e}")))
    })
}

/// 管理接口，可并发调用
#[derive(Clone)]
pub struct StationHandle {
    coordinator: CoordinatorHandle,
    supervisor: SupervisorHandle,
    uploader: UploaderHandle,
    stop: StopSignal,
}

impl StationHandle {
    /// 当前状态的只读快照
    pub fn snapshot(&self) -> Arc<StationSnapshot> {
        self.coordinator.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StationSnapshot>> {
        self.coordinator.subscribe()
    }

    pub async fn start(&self, identifier: &str) -> Result<ReconcileReport> {
        self.supervisor.start(identifier).await
    }

    pub async fn stop(&self, identifier: &str) -> Result<bool> {
        self.supervisor.stop(identifier).await
    }

    pub async fn reinitialize(&self, identifier: &str, config: WorkerConfig) -> Result<ReconcileReport> {
        self.supervisor.reinitialize(identifier, config).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.supervisor.reconcile().await
    }

    /// 热插拔通知
    pub fn hotplug(&self) {
        self.supervisor.hotplug();
    }

    /// 请求整个工作站停止，由 `RunningStation::wait` 执行关闭
    pub fn request_shutdown(&self) {
        self.stop.request(StopReason::Requested);
    }

    pub async fn flush(&self) -> Result<()> {
        self.coordinator.flush().await
    }

    pub fn trigger_upload(&self, destination: &str) -> Result<()> {
        self.uploader.trigger_upload(destination)
    }

    pub fn upload_status(&self) -> Vec<DestinationStatus> {
        self.uploader.status()
    }

    pub fn abandoned_uploads(&self, destination: &str) -> Result<Vec<UploadTask>> {
        self.uploader.abandoned(destination)
    }

    pub fn requeue_abandoned(&self, destination: &str) -> Result<usize> {
        self.uploader.requeue_abandoned(destination)
    }
}
