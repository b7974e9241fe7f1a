//! 上传器
//!
//! 每个目标一个独立任务和一个待上传队列。文件只有在远端确认（字节数、
//! 可选的 sha256）之后才会被删除或归档；同一文件发往多个目标时，
//! 所有目标都确认后才处理源文件。

mod backlog;
mod destination;
mod runner;
pub mod transport;

pub use backlog::{TaskState, UploadTask};
pub use destination::DestinationStatus;
pub use transport::{
    FallbackTransport, LocalCopyTransport, TransferReceipt, Transport, TransportConnector,
    TransportFactory,
};

use station_config::{DestinationConfig, UploaderConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StationError};
use crate::model::Artifact;
use destination::DestinationShared;
use runner::DestinationRunner;

/// 上传器与句柄共享的状态
pub(crate) struct UploaderShared {
    archive_dir: PathBuf,
    destinations: RwLock<BTreeMap<String, Arc<DestinationShared>>>,
    /// 每个源文件尚未确认的目标数
    claims: Mutex<HashMap<PathBuf, usize>>,
}

impl UploaderShared {
    fn destination(&self, name: &str) -> Result<Arc<DestinationShared>> {
        self.destinations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| StationError::UnknownDestination(name.to_string()))
    }

    fn all(&self) -> Vec<Arc<DestinationShared>> {
        self.destinations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// 释放一个目标对源文件的占用，全部释放后返回 true
    pub(crate) fn release_claim(&self, path: &Path) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get_mut(path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                claims.remove(path);
                true
            }
            None => true,
        }
    }
}

/// 上传器
pub struct Uploader {
    config: UploaderConfig,
    factory: TransportFactory,
    shared: Arc<UploaderShared>,
}

impl Uploader {
    pub fn new(config: UploaderConfig, archive_dir: impl AsRef<Path>, factory: TransportFactory) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(UploaderShared {
                archive_dir: archive_dir.as_ref().to_path_buf(),
                destinations: RwLock::new(BTreeMap::new()),
                claims: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 注册上传目标；同名目标只保留第一个
    pub fn add_destination(&mut self, config: DestinationConfig) {
        let mut destinations = self
            .shared
            .destinations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if destinations.contains_key(&config.name) {
            warn!(destination = %config.name, "Destination already registered");
            return;
        }
        debug!(destination = %config.name, kind = ?config.kind, "Destination registered");
        destinations.insert(
            config.name.clone(),
            Arc::new(DestinationShared::new(config, self.config.recent_capacity)),
        );
    }

    pub fn handle(&self) -> UploaderHandle {
        UploaderHandle {
            shared: self.shared.clone(),
        }
    }

    /// 运行所有目标任务，直到 `shutdown` 变为 true 且排空结束
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let destinations = self.shared.all();
        let configs: Vec<DestinationConfig> = destinations.iter().map(|d| d.config.clone()).collect();

        let mut tasks = JoinSet::new();
        for dest in destinations {
            match self.factory.build(&dest.config, &configs) {
                Ok(transport) => {
                    let runner = DestinationRunner::new(
                        dest,
                        self.shared.clone(),
                        transport,
                        self.config.clone(),
                        self.shared.archive_dir.clone(),
                    );
                    tasks.spawn(runner.run(shutdown.clone()));
                }
                Err(e) => {
                    error!(
                        destination = %dest.config.name,
                        error = %e,
                        "No transport for destination, uploads stay queued"
                    );
                    dest.with_stats(|s| {
                        s.available = false;
                        s.last_error = Some(e.to_string());
                    });
                }
            }
        }

        info!(destinations = tasks.len(), "Uploader started");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Upload task panicked");
            }
        }
        info!("Uploader stopped");
    }
}

/// 上传器句柄
#[derive(Clone)]
pub struct UploaderHandle {
    shared: Arc<UploaderShared>,
}

impl UploaderHandle {
    /// 上传后归档文件的目录，按标识分子目录
    pub fn archive_dir(&self) -> &Path {
        &self.shared.archive_dir
    }

    /// 加入目标队列；已在队列中或刚上传过时返回 false
    pub fn enqueue(&self, artifact: Artifact, destination: &str) -> Result<bool> {
        let dest = self.shared.destination(destination)?;
        let mut claims = self.shared.claims.lock().unwrap_or_else(|e| e.into_inner());

        let path = artifact.path.clone();
        let added = dest.with_backlog(|b| b.enqueue(artifact));
        if added {
            *claims.entry(path.clone()).or_insert(0) += 1;
            debug!(destination, file = ?path, "Upload queued");
        }
        Ok(added)
    }

    /// 按产物自带的目标列表入队，返回新增的任务数
    ///
    /// 占用计数在全部入队后才可能归零，先确认的目标不会提前删除文件
    pub fn enqueue_artifact(&self, artifact: &Artifact) -> usize {
        let mut claims = self.shared.claims.lock().unwrap_or_else(|e| e.into_inner());

        let mut added = 0;
        for name in &artifact.destinations {
            let dest = match self.shared.destination(name) {
                Ok(dest) => dest,
                Err(e) => {
                    warn!(identifier = %artifact.identifier, error = %e, "Skipping upload");
                    continue;
                }
            };
            if dest.with_backlog(|b| b.enqueue(artifact.clone())) {
                added += 1;
            }
        }

        if added > 0 {
            *claims.entry(artifact.path.clone()).or_insert(0) += added;
            debug!(file = ?artifact.path, destinations = added, "Upload queued");
        }
        added
    }

    /// 立即处理该目标的队列
    pub fn trigger_upload(&self, destination: &str) -> Result<()> {
        self.shared.destination(destination)?.trigger.notify_one();
        Ok(())
    }

    pub fn trigger_all(&self) {
        for dest in self.shared.all() {
            dest.trigger.notify_one();
        }
    }

    pub fn status(&self) -> Vec<DestinationStatus> {
        self.shared.all().iter().map(|d| d.status()).collect()
    }

    /// 各目标最近成功上传的文件名，去重
    pub fn recent_uploads(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for dest in self.shared.all() {
            dest.with_backlog(|b| {
                for path in b.recent() {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                }
            });
        }
        names
    }

    pub fn destinations(&self) -> Vec<String> {
        self.shared.all().iter().map(|d| d.config.name.clone()).collect()
    }

    pub fn pending(&self, destination: &str) -> Result<Vec<UploadTask>> {
        Ok(self.shared.destination(destination)?.with_backlog(|b| b.pending_tasks()))
    }

    pub fn pending_count(&self, destination: &str) -> Result<usize> {
        Ok(self.shared.destination(destination)?.with_backlog(|b| b.pending_count()))
    }

    /// 已放弃、等待人工处理的任务
    pub fn abandoned(&self, destination: &str) -> Result<Vec<UploadTask>> {
        Ok(self.shared.destination(destination)?.with_backlog(|b| b.abandoned_tasks()))
    }

    /// 将放弃的任务重新入队并触发上传
    pub fn requeue_abandoned(&self, destination: &str) -> Result<usize> {
        let dest = self.shared.destination(destination)?;
        let count = dest.with_backlog(|b| b.requeue_abandoned());
        if count > 0 {
            info!(destination, count, "Requeued abandoned uploads");
            dest.trigger.notify_one();
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactKind;
    use std::time::Duration;
    use tempfile::tempdir;

    fn settings() -> UploaderConfig {
        UploaderConfig {
            tick_secs: 3600,
            ..UploaderConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_unknown_destination() {
        let dir = tempdir().unwrap();
        let uploader = Uploader::new(settings(), dir.path(), TransportFactory::new());
        let artifact = Artifact::new("cam", dir.path().join("a.jpg"), ArtifactKind::Image);

        assert!(matches!(
            uploader.handle().enqueue(artifact, "nas"),
            Err(StationError::UnknownDestination(_))
        ));
    }

    #[test]
    fn test_double_enqueue_creates_one_task() {
        let dir = tempdir().unwrap();
        let mut uploader = Uploader::new(settings(), dir.path(), TransportFactory::new());
        uploader.add_destination(DestinationConfig::local("usb", dir.path().join("usb")));
        let handle = uploader.handle();

        let artifact = Artifact::new("cam", dir.path().join("a.jpg"), ArtifactKind::Image);
        assert!(handle.enqueue(artifact.clone(), "usb").unwrap());
        assert!(!handle.enqueue(artifact, "usb").unwrap());
        assert_eq!(handle.pending_count("usb").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_deleted_only_after_every_destination_confirms() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("cam");
        std::fs::create_dir_all(&source).unwrap();
        let file = source.join("cam_2024_06_01_10_00_00.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let mut uploader = Uploader::new(settings(), dir.path().join("archive"), TransportFactory::new());
        uploader.add_destination(DestinationConfig::local("nas", dir.path().join("nas")));
        uploader.add_destination(DestinationConfig::local("usb", dir.path().join("usb")));
        let handle = uploader.handle();

        let artifact = Artifact::new("cam", &file, ArtifactKind::Image)
            .with_destinations(vec!["nas".to_string(), "usb".to_string()]);
        assert_eq!(handle.enqueue_artifact(&artifact), 2);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(uploader.run(stop_rx));

        handle.trigger_upload("nas").unwrap();
        wait_for(|| dir.path().join("nas/cam/cam_2024_06_01_10_00_00.jpg").exists()).await;
        wait_for(|| handle.pending_count("nas").unwrap() == 0).await;
        assert!(file.exists());

        handle.trigger_upload("usb").unwrap();
        wait_for(|| !file.exists()).await;
        assert!(dir.path().join("usb/cam/cam_2024_06_01_10_00_00.jpg").exists());

        let status = handle.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.files_uploaded == 1 && s.bytes_uploaded == 4));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_uploads() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("dht-2024_06_01.csv");
        std::fs::write(&file, b"timestamp\n").unwrap();

        let mut uploader = Uploader::new(settings(), dir.path().join("archive"), TransportFactory::new());
        uploader.add_destination(DestinationConfig::local("usb", dir.path().join("usb")));
        let handle = uploader.handle();
        handle
            .enqueue(Artifact::new("dht", &file, ArtifactKind::SensorLog), "usb")
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(uploader.run(stop_rx));
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(handle.pending_count("usb").unwrap(), 0);
        assert!(dir.path().join("archive/dht/dht-2024_06_01.csv").exists());
        assert!(dir.path().join("usb/dht/dht-2024_06_01.csv").exists());
    }
}
