use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use station_config::{ConfigLoader, ResolvedDevices};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Result, StationError};

/// 配置变化通知
///
/// 连续的多个文件事件合并为一次通知
pub struct ConfigWatcher {
    rx: mpsc::Receiver<()>,
    watcher: Option<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// 由外部通道驱动的通知，发送端全部关闭后 `changed` 返回 None
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx, watcher: None }
    }

    /// 等待下一次变化
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await?;
        while self.rx.try_recv().is_ok() {}
        Some(())
    }
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("file_backed", &self.watcher.is_some())
            .finish()
    }
}

/// 设备配置来源
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// 读取全部设备配置；单个条目无效只拒绝该条目
    async fn load(&self) -> Result<ResolvedDevices>;

    /// 配置内容指纹，变化时监督器清除手动覆盖
    async fn fingerprint(&self) -> Result<String>;

    /// 变化通知；不支持时返回 None，只依赖定时对齐
    async fn watch(&self) -> Result<Option<ConfigWatcher>> {
        Ok(None)
    }
}

/// 从 TOML 文件读取设备配置
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<ResolvedDevices> {
        let loader = ConfigLoader::new(&self.path);
        let config = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(anyhow::Error::from)??;
        Ok(ConfigLoader::resolve_devices(&config))
    }

    async fn fingerprint(&self) -> Result<String> {
        let loader = ConfigLoader::new(&self.path);
        let fingerprint = tokio::task::spawn_blocking(move || loader.fingerprint())
            .await
            .map_err(anyhow::Error::from)??;
        Ok(fingerprint)
    }

    /// 监听配置文件所在目录，编辑器以改名方式替换文件时也能收到通知
    async fn watch(&self) -> Result<Option<ConfigWatcher>> {
        let (tx, rx) = mpsc::channel(1);
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant && ours {
                    // 通道已满说明已有未处理的通知
                    let _ = tx.try_send(());
                }
            }
            Err(e) => error!(error = %e, "Config watch error"),
        })
        .map_err(|e| StationError::Config(format!("cannot watch configuration: {e}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| StationError::Config(format!("cannot watch {}: {e}", dir.display())))?;
        debug!(path = %self.path.display(), "Configuration watcher started");

        Ok(Some(ConfigWatcher {
            rx,
            watcher: Some(watcher),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_invalid_entry_is_rejected_individually() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(
            &path,
            r#"
[devices.cam-A]
kind = "usb_camera"
interval_secs = 60

[devices.cam-B]
kind = "usb_camera"
interval_secs = 0
"#,
        )
        .unwrap();

        let source = FileConfigSource::new(&path);
        let resolved = source.load().await.unwrap();
        assert!(resolved.devices.contains_key("cam-A"));
        assert!(resolved.rejected.contains_key("cam-B"));

        let before = source.fingerprint().await.unwrap();
        std::fs::write(&path, "[devices]\n").unwrap();
        assert_ne!(source.fingerprint().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_watch_reports_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(&path, "[devices]\n").unwrap();
        std::fs::write(dir.path().join("other.toml"), "").unwrap();

        let source = FileConfigSource::new(&path);
        let mut watcher = source.watch().await.unwrap().unwrap();

        std::fs::write(&path, "[devices.cam-A]\nkind = \"usb_camera\"\n").unwrap();
        let changed = tokio::time::timeout(std::time::Duration::from_secs(5), watcher.changed()).await;
        assert_eq!(changed.unwrap(), Some(()));
        assert!(source.load().await.unwrap().devices.contains_key("cam-A"));
    }

    #[tokio::test]
    async fn test_watcher_coalesces_pending_notifications() {
        let (tx, rx) = mpsc::channel(4);
        let mut watcher = ConfigWatcher::new(rx);
        for _ in 0..3 {
            tx.send(()).await.unwrap();
        }
        assert_eq!(watcher.changed().await, Some(()));

        drop(tx);
        assert_eq!(watcher.changed().await, None);
    }

    #[tokio::test]
    async fn test_unparseable_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(&path, "[devices\n").unwrap();

        assert!(FileConfigSource::new(&path).load().await.is_err());
    }
}
