use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::destination::DestinationShared;
use super::transport::{sha256_file, TransferReceipt, Transport};
use super::UploaderShared;
use crate::backoff::{deadline_after, Backoff};
use crate::error::{StationError, TransportError};
use crate::model::{Artifact, Disposition};
use crate::uploader::backlog::UploadTask;
use station_config::UploaderConfig;

enum Attempt {
    Confirmed(TransferReceipt),
    Failed(String),
    ConnectionLost(TransportError),
}

/// 单个目标的上传循环
///
/// 独占该目标的传输实例，按入队顺序逐个发送
pub(crate) struct DestinationRunner {
    dest: Arc<DestinationShared>,
    shared: Arc<UploaderShared>,
    transport: Box<dyn Transport>,
    settings: UploaderConfig,
    task_backoff: Backoff,
    connection_backoff: Backoff,
    unavailable_until: Option<Instant>,
    archive_dir: PathBuf,
}

impl DestinationRunner {
    pub(crate) fn new(
        dest: Arc<DestinationShared>,
        shared: Arc<UploaderShared>,
        transport: Box<dyn Transport>,
        settings: UploaderConfig,
        archive_dir: PathBuf,
    ) -> Self {
        Self {
            task_backoff: Backoff::new(settings.backoff_base(), settings.backoff_cap()),
            connection_backoff: Backoff::new(settings.unavailable_base(), settings.unavailable_cap()),
            dest,
            shared,
            transport,
            settings,
            unavailable_until: None,
            archive_dir,
        }
    }

    fn name(&self) -> &str {
        &self.dest.config.name
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(destination = %self.name(), transport = self.transport.kind(), "Upload task started");

        let tick = self.settings.tick();
        let mut next_tick = deadline_after(Instant::now(), tick);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wake = self.next_wake(next_tick);
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = self.dest.trigger.notified() => {
                    debug!(destination = %self.name(), "Upload triggered");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let now = Instant::now();
            if now >= next_tick {
                next_tick = deadline_after(now, tick);
            }
            self.process(false).await;
        }

        self.drain().await;
        self.transport.disconnect().await;
        self.dest.with_stats(|s| s.connected = false);
        info!(destination = %self.name(), "Upload task stopped");
    }

    fn next_wake(&self, next_tick: Instant) -> Instant {
        let mut wake = next_tick;
        if let Some(retry) = self.dest.with_backlog(|b| b.earliest_retry()) {
            wake = wake.min(retry);
        }
        if let Some(until) = self.unavailable_until {
            wake = wake.max(until);
        }
        wake
    }

    /// 处理到期任务；`ignore_backoff` 用于关闭前的尽力排空
    async fn process(&mut self, ignore_backoff: bool) {
        let now = Instant::now();
        if !ignore_backoff {
            if let Some(until) = self.unavailable_until {
                if now < until {
                    return;
                }
            }
        }

        let ids = self.dest.with_backlog(|b| {
            if ignore_backoff {
                b.pending_ids()
            } else {
                b.due(now)
            }
        });
        if ids.is_empty() {
            return;
        }
        if !self.ensure_connected().await {
            return;
        }

        for id in ids {
            if !self.upload(id).await {
                return;
            }
        }
    }

    /// 上传单个任务；目标失联时返回 false
    async fn upload(&mut self, id: u64) -> bool {
        let mut reconnected = false;
        loop {
            let Some(task) = self.dest.with_backlog(|b| b.begin(id)) else {
                return true;
            };

            match self.attempt(&task).await {
                Attempt::Confirmed(receipt) => {
                    self.complete(task, receipt).await;
                    return true;
                }
                Attempt::Failed(reason) => {
                    self.fail(task, reason);
                    return true;
                }
                Attempt::ConnectionLost(err) => {
                    self.dest.with_backlog(|b| b.release(id, err.to_string()));
                    self.transport.disconnect().await;
                    warn!(destination = %self.name(), error = %err, "Connection lost during transfer");

                    if reconnected {
                        self.mark_unavailable(err.to_string());
                        return false;
                    }
                    if !self.ensure_connected().await {
                        return false;
                    }
                    reconnected = true;
                }
            }
        }
    }

    async fn attempt(&mut self, task: &UploadTask) -> Attempt {
        let local = task.artifact.path.as_path();
        let size = match fs::metadata(local).await {
            Ok(metadata) => metadata.len(),
            Err(e) => return Attempt::Failed(format!("cannot read {}: {e}", local.display())),
        };
        let remote = remote_path(&task.artifact);
        let limit = self.settings.transfer_timeout();

        match tokio::time::timeout(limit, self.transport.send(local, &remote)).await {
            Err(_) => {
                self.transport.disconnect().await;
                Attempt::Failed(format!("transfer timed out after {limit:?}"))
            }
            Ok(Err(e)) if e.is_connection_level() => Attempt::ConnectionLost(e),
            Ok(Err(e)) => Attempt::Failed(e.to_string()),
            Ok(Ok(receipt)) => match verify(local, size, &receipt).await {
                Ok(()) => Attempt::Confirmed(receipt),
                Err(reason) => Attempt::Failed(reason),
            },
        }
    }

    async fn complete(&mut self, task: UploadTask, receipt: TransferReceipt) {
        self.dest.with_backlog(|b| b.succeed(task.id));
        self.dest.with_stats(|s| {
            s.files_uploaded += 1;
            s.bytes_uploaded += receipt.bytes;
            s.last_upload = Some(Utc::now());
        });
        info!(
            destination = %self.name(),
            identifier = %task.artifact.identifier,
            file = ?task.artifact.path,
            bytes = receipt.bytes,
            "Upload confirmed"
        );

        // 所有目标都确认后才处理源文件
        if self.shared.release_claim(&task.artifact.path) {
            if let Err(e) = dispose(&task.artifact, &self.archive_dir).await {
                warn!(file = ?task.artifact.path, error = %e, "Failed to dispose uploaded file");
            }
        }
    }

    fn fail(&mut self, task: UploadTask, reason: String) {
        let abandoned = self.dest.with_backlog(|b| {
            b.fail(
                task.id,
                reason.clone(),
                &self.task_backoff,
                self.settings.max_attempts,
                Instant::now(),
            )
        });
        self.dest.with_stats(|s| {
            s.failed_attempts += 1;
            s.last_error = Some(reason.clone());
        });

        match abandoned {
            Some(task) => {
                let err = StationError::TransferAbandoned {
                    artifact: task.artifact.path.clone(),
                    destination: task.destination.clone(),
                    attempts: task.attempts,
                };
                error!(error = %err, last_error = %reason, "Upload abandoned");
            }
            None => {
                warn!(
                    destination = %self.name(),
                    file = ?task.artifact.path,
                    attempt = task.attempts + 1,
                    error = %reason,
                    "Upload attempt failed"
                );
            }
        }
    }

    /// 连接目标，失败时有限次重试；仍失败则按退避标记为不可用
    async fn ensure_connected(&mut self) -> bool {
        if self.transport.is_connected() {
            return true;
        }

        let mut last_error = String::new();
        for attempt in 0..=self.settings.max_reconnects {
            if attempt > 0 {
                sleep(self.settings.reconnect_delay()).await;
            }
            match self.transport.connect().await {
                Ok(()) => {
                    if self.unavailable_until.take().is_some() {
                        info!(destination = %self.name(), "Destination available again");
                    }
                    self.connection_backoff.reset();
                    self.dest.with_stats(|s| {
                        s.connected = true;
                        s.available = true;
                        s.unavailable_until = None;
                    });
                    return true;
                }
                Err(e) => {
                    debug!(destination = %self.name(), attempt, error = %e, "Connect failed");
                    last_error = e.to_string();
                }
            }
        }

        self.mark_unavailable(last_error);
        false
    }

    fn mark_unavailable(&mut self, error: String) {
        let delay = self.connection_backoff.next_delay();
        self.unavailable_until = Some(deadline_after(Instant::now(), delay));

        let until = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        self.dest.with_stats(|s| {
            s.connected = false;
            s.available = false;
            s.unavailable_until = until;
            s.last_error = Some(error.clone());
        });
        warn!(destination = %self.name(), retry_in = ?delay, error = %error, "Destination unavailable");
    }

    async fn drain(&mut self) {
        let pending = self.dest.with_backlog(|b| b.pending_ids().len());
        if pending == 0 {
            return;
        }

        let grace = self.settings.shutdown_grace();
        info!(destination = %self.name(), pending, "Draining upload backlog");
        if tokio::time::timeout(grace, self.process(true)).await.is_err() {
            warn!(destination = %self.name(), "Drain timed out, remaining uploads stay queued");
        }
    }
}

/// 远端路径：`<identifier>/<file name>`
fn remote_path(artifact: &Artifact) -> PathBuf {
    PathBuf::from(&artifact.identifier).join(artifact.path.file_name().unwrap_or_default())
}

async fn verify(local: &Path, size: u64, receipt: &TransferReceipt) -> Result<(), String> {
    if receipt.bytes != size {
        return Err(format!(
            "remote confirmed {} of {} bytes",
            receipt.bytes, size
        ));
    }
    if let Some(remote) = &receipt.sha256 {
        let local_hash = sha256_file(local)
            .await
            .map_err(|e| format!("cannot hash {}: {e}", local.display()))?;
        if !remote.eq_ignore_ascii_case(&local_hash) {
            return Err("checksum mismatch".to_string());
        }
    }
    Ok(())
}

/// 删除、保留或移动到 `<archive>/<identifier>/`
async fn dispose(artifact: &Artifact, archive_dir: &Path) -> std::io::Result<()> {
    match artifact.disposition {
        Disposition::Delete => fs::remove_file(&artifact.path).await,
        Disposition::Keep => Ok(()),
        Disposition::Archive => {
            let file_name = artifact.path.file_name().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact has no file name")
            })?;
            let dir = archive_dir.join(&artifact.identifier);
            fs::create_dir_all(&dir).await?;
            let target = dir.join(file_name);

            // 跨文件系统时 rename 失败，退回复制后删除
            if fs::rename(&artifact.path, &target).await.is_err() {
                fs::copy(&artifact.path, &target).await?;
                fs::remove_file(&artifact.path).await?;
            }
            debug!(file = ?artifact.path, archive = ?target, "Archived uploaded file");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactKind;
    use tempfile::tempdir;

    #[test]
    fn test_remote_path_groups_by_identifier() {
        let artifact = Artifact::new("cam-A", "/data/cam-A/cam-A_2024_06_01_10_00_00.jpg", ArtifactKind::Image);
        assert_eq!(
            remote_path(&artifact),
            PathBuf::from("cam-A/cam-A_2024_06_01_10_00_00.jpg")
        );
    }

    #[tokio::test]
    async fn test_verify_rejects_short_receipt() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("a.jpg");
        std::fs::write(&local, b"0123456789").unwrap();

        let receipt = TransferReceipt {
            remote_path: PathBuf::from("cam/a.jpg"),
            bytes: 4,
            sha256: None,
        };
        assert!(verify(&local, 10, &receipt).await.is_err());

        let receipt = TransferReceipt {
            bytes: 10,
            sha256: Some("00".repeat(32)),
            ..receipt
        };
        assert_eq!(verify(&local, 10, &receipt).await.unwrap_err(), "checksum mismatch");

        let receipt = TransferReceipt {
            sha256: Some(sha256_file(&local).await.unwrap()),
            ..receipt
        };
        assert!(verify(&local, 10, &receipt).await.is_ok());
    }

    #[tokio::test]
    async fn test_archive_moves_file() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("dht-2024_06_01.csv");
        std::fs::write(&local, b"timestamp\n").unwrap();
        let archive = dir.path().join("archive");

        let artifact = Artifact::new("dht", &local, ArtifactKind::SensorLog);
        dispose(&artifact, &archive).await.unwrap();

        assert!(!local.exists());
        assert!(archive.join("dht").join("dht-2024_06_01.csv").exists());
    }
}
