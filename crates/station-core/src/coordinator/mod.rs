//! 协调器
//!
//! 唯一拥有工作站状态的任务：消费通道中的记录，合并到状态表，
//! 写入时序日志，把产物交给上传器，并定期保存快照。

mod metadata;
mod snapshot;
mod state;
mod timeseries;

pub use metadata::{DiskSpace, StationMetadata};
pub use snapshot::SnapshotStore;
pub use state::{CoordinatorStatus, DeviceEntry, MalformedRecord, StationSnapshot, COORDINATOR_IDENTIFIER};
pub use timeseries::{TimeSeriesLog, HEADER as LOG_HEADER};

use chrono::Utc;
use station_config::CoordinatorConfig;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::deadline_after;
use crate::channel::{RecordReceiver, RecvError};
use crate::error::{Result, StationError};
use crate::model::{Artifact, ArtifactKind, Identifier, StatusRecord, WorkerConfig};
use crate::uploader::UploaderHandle;
use state::StationState;

enum CoordinatorCommand {
    AddIdentifier(WorkerConfig, oneshot::Sender<()>),
    RemoveIdentifier(Identifier, oneshot::Sender<bool>),
    Flush(oneshot::Sender<Result<()>>),
}

/// 协调器
pub struct Coordinator {
    station: String,
    config: CoordinatorConfig,
    receiver: RecordReceiver,
    commands: mpsc::Receiver<CoordinatorCommand>,
    snapshot_tx: watch::Sender<Arc<StationSnapshot>>,
    state: StationState,
    log: TimeSeriesLog,
    store: SnapshotStore,
    data_dir: PathBuf,
    metadata_path: PathBuf,
    uploader: UploaderHandle,
    /// 写入失败、等待重试的时序行
    pending_rows: VecDeque<StatusRecord>,
    channel_closed: bool,
    /// 有尚未发布的记录
    dirty: bool,
    last_publish: Instant,
    published: u64,
}

impl Coordinator {
    /// 创建协调器
    ///
    /// 时序日志写在 `<data_dir>/logs`，快照写在 `<data_dir>/state/snapshot.json`，
    /// 元数据写在 `<data_dir>/state/metadata.json`
    pub fn new(
        station: impl Into<String>,
        data_dir: impl AsRef<Path>,
        config: CoordinatorConfig,
        receiver: RecordReceiver,
        uploader: UploaderHandle,
    ) -> (Self, CoordinatorHandle) {
        let station = station.into();
        let data_dir = data_dir.as_ref();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StationSnapshot::empty(&station)));

        let coordinator = Self {
            log: TimeSeriesLog::new(data_dir.join("logs"), config.rotate_max_bytes).with_archive(uploader.archive_dir()),
            store: SnapshotStore::new(data_dir.join("state").join("snapshot.json")),
            data_dir: data_dir.to_path_buf(),
            metadata_path: data_dir.join("state").join("metadata.json"),
            station,
            config,
            receiver,
            commands: command_rx,
            snapshot_tx,
            state: StationState::default(),
            uploader,
            pending_rows: VecDeque::new(),
            channel_closed: false,
            dirty: false,
            last_publish: Instant::now(),
            published: 0,
        };
        let handle = CoordinatorHandle {
            commands: command_tx,
            snapshot_rx,
        };
        (coordinator, handle)
    }

    /// 运行直到 `shutdown` 变为 true，退出前排空通道并落盘
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.restore().await;
        self.enqueue_closed_logs();
        self.publish();

        let flush_interval = self.config.flush_interval();
        let poll_timeout = self.config.poll_timeout();
        let mut ticker = interval_at(deadline_after(Instant::now(), flush_interval), flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(station = %self.station, flush_interval = ?flush_interval, "Coordinator started");

        loop {
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
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                received = self.receiver.recv_timeout(poll_timeout), if !self.channel_closed => {
                    match received {
                        Ok(record) => {
                            self.process(record);
                            self.publish_if_due(poll_timeout);
                        }
                        Err(RecvError::Timeout) => self.publish_pending(),
                        Err(RecvError::Closed) => {
                            info!("Record channel closed");
                            self.channel_closed = true;
                        }
                    }
                }
            }
        }

        let drained = self.drain_channel();
        self.on_tick().await;
        info!(
            drained,
            records = self.state.status.records_processed,
            snapshots = self.published,
            "Coordinator stopped"
        );
    }

    fn process(&mut self, record: StatusRecord) {
        let record = match self.state.apply(record) {
            Ok(record) => record,
            Err(e) => {
                self.state.status.malformed_records += 1;
                warn!(error = %e, "Discarding malformed record");
                return;
            }
        };

        if record.lost_records > 0 {
            warn!(
                identifier = %record.identifier,
                lost = record.lost_records,
                "Records lost to channel overflow"
            );
        }

        if let Some(artifact) = &record.artifact {
            self.uploader.enqueue_artifact(artifact);
        }
        self.persist(record);
        self.dirty = true;
    }

    fn persist(&mut self, record: StatusRecord) {
        // 有积压时追加到积压末尾，保持同一标识的行序
        if !self.pending_rows.is_empty() {
            self.buffer(record);
            return;
        }

        match self.log.append(&record) {
            Ok(closed) => {
                self.enqueue_logs(closed);
            }
            Err(e) => {
                error!(identifier = %record.identifier, error = %e, "Failed to write time-series row");
                self.state.set_coordinator_health(Some(e.to_string()));
                self.buffer(record);
            }
        }
    }

    fn buffer(&mut self, record: StatusRecord) {
        if self.pending_rows.len() >= self.config.pending_row_limit.max(1) {
            self.pending_rows.pop_front();
            self.state.status.dropped_rows += 1;
        }
        self.pending_rows.push_back(record);
        self.state.status.pending_rows = self.pending_rows.len();
    }

    fn retry_pending(&mut self) -> Result<()> {
        let mut closed = Vec::new();
        let mut result = Ok(());

        while let Some(record) = self.pending_rows.front() {
            match self.log.append(record) {
                Ok(paths) => {
                    closed.extend(paths);
                    self.pending_rows.pop_front();
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.state.status.pending_rows = self.pending_rows.len();
        self.enqueue_logs(closed);
        result
    }

    async fn on_tick(&mut self) {
        let mut failure: Option<String> = None;

        if let Err(e) = self.retry_pending() {
            failure = Some(e.to_string());
        }

        let mut enqueued = 0;
        match self.log.rotate_stale(Utc::now().date_naive()) {
            Ok(closed) => enqueued += self.enqueue_logs(closed),
            Err(e) => {
                failure.get_or_insert(e.to_string());
            }
        }
        if let Err(e) = self.log.flush() {
            failure.get_or_insert(e.to_string());
        }

        self.state.status.last_flush = Some(Utc::now());
        let snapshot = self.state.snapshot(&self.station, self.receiver.overflow_count());
        if let Err(e) = self.store.save(&snapshot).await {
            failure.get_or_insert(e.to_string());
        }
        match self.write_metadata(&snapshot).await {
            Ok(()) => enqueued += self.enqueue_metadata(),
            Err(e) => warn!(path = ?self.metadata_path, error = %e, "Failed to write station metadata"),
        }

        match &failure {
            Some(e) => warn!(pending_rows = self.pending_rows.len(), error = %e, "Flush incomplete"),
            None if self.state.status.degraded => info!("Coordinator persistence recovered"),
            None => debug!("Flushed"),
        }
        self.state.set_coordinator_health(failure);

        if enqueued > 0 {
            self.uploader.trigger_all();
        }
        self.publish();
    }

    /// 将关闭的时序日志交给上传器
    fn enqueue_logs(&self, paths: Vec<PathBuf>) -> usize {
        let mut enqueued = 0;
        for path in paths {
            if self.config.log_upload.is_empty() {
                debug!(path = ?path, "No log destinations, keeping log locally");
                continue;
            }

            let identifier = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let artifact = Artifact::new(identifier, path, ArtifactKind::StatusLog)
                .with_destinations(self.config.log_upload.clone());
            enqueued += self.uploader.enqueue_artifact(&artifact);
        }
        enqueued
    }

    async fn write_metadata(&self, snapshot: &StationSnapshot) -> Result<()> {
        let dir = self.data_dir.clone();
        let disk = tokio::task::spawn_blocking(move || DiskSpace::of(&dir))
            .await
            .map_err(anyhow::Error::from)?;
        if disk.is_none() {
            debug!(data_dir = ?self.data_dir, "Disk space unavailable");
        }

        StationMetadata::new(snapshot, disk, self.uploader.status(), self.uploader.recent_uploads())
            .save(&self.metadata_path)
            .await
    }

    /// 元数据随日志一起上传
    fn enqueue_metadata(&self) -> usize {
        if self.config.log_upload.is_empty() {
            return 0;
        }
        let artifact = Artifact::new(COORDINATOR_IDENTIFIER, &self.metadata_path, ArtifactKind::Metadata)
            .with_destinations(self.config.log_upload.clone());
        self.uploader.enqueue_artifact(&artifact)
    }

    fn enqueue_closed_logs(&mut self) {
        match self.log.closed_files(Utc::now().date_naive()) {
            Ok(paths) if !paths.is_empty() => {
                info!(count = paths.len(), "Found closed logs from a previous run");
                self.enqueue_logs(paths);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to scan for stale logs"),
        }
    }

    async fn restore(&mut self) {
        match self.store.load().await {
            Ok(Some(snapshot)) => {
                let restored = self.state.restore(snapshot);
                info!(devices = restored, "Restored last known state");
            }
            Ok(None) => {}
            Err(e) => warn!(path = ?self.store.path(), error = %e, "Ignoring unreadable snapshot"),
        }
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::AddIdentifier(config, reply) => {
                debug!(identifier = %config.identifier, "Identifier added");
                self.state.add_identifier(config);
                self.publish();
                let _ = reply.send(());
            }
            CoordinatorCommand::RemoveIdentifier(identifier, reply) => {
                let removed = self.state.remove_identifier(&identifier);
                debug!(identifier = %identifier, removed, "Identifier removed");
                self.publish();
                let _ = reply.send(removed);
            }
            CoordinatorCommand::Flush(reply) => {
                self.drain_channel();
                self.on_tick().await;
                let result = if self.state.status.degraded {
                    Err(StationError::persistence(
                        self.state.status.last_error.clone().unwrap_or_default(),
                    ))
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
        }
    }

    fn drain_channel(&mut self) -> usize {
        let mut drained = 0;
        while let Some(record) = self.receiver.try_recv() {
            self.process(record);
            drained += 1;
        }
        drained
    }

    /// 连续到达的记录最多每 `min_interval` 发布一次快照
    fn publish_if_due(&mut self, min_interval: Duration) {
        if self.dirty && self.last_publish.elapsed() >= min_interval {
            self.publish();
        }
    }

    /// 通道空闲时发布积累的变化
    fn publish_pending(&mut self) {
        if self.dirty {
            self.publish();
        }
    }

    fn publish(&mut self) {
        let snapshot = self.state.snapshot(&self.station, self.receiver.overflow_count());
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        self.dirty = false;
        self.last_publish = Instant::now();
        self.published += 1;
    }
}

/// 协调器句柄
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<CoordinatorCommand>,
    snapshot_rx: watch::Receiver<Arc<StationSnapshot>>,
}

impl CoordinatorHandle {
    /// 登记设备配置（幂等）
    pub async fn add_identifier(&self, config: WorkerConfig) -> Result<()> {
        self.request(|reply| CoordinatorCommand::AddIdentifier(config, reply))
            .await
    }

    /// 标记设备已移除，历史保留；未知标识返回 false
    pub async fn remove_identifier(&self, identifier: &str) -> Result<bool> {
        let identifier = identifier.to_string();
        self.request(|reply| CoordinatorCommand::RemoveIdentifier(identifier, reply))
            .await
    }

    /// 排空通道、写入积压行并保存快照
    pub async fn flush(&self) -> Result<()> {
        self.request(CoordinatorCommand::Flush).await?
    }

    /// 最近发布的快照，不会看到部分更新
    pub fn snapshot(&self) -> Arc<StationSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StationSnapshot>> {
        self.snapshot_rx.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| StationError::Closed("coordinator"))?;
        reply_rx.await.map_err(|_| StationError::Closed("coordinator"))
    }
}
