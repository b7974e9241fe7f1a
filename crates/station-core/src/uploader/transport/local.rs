use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{sha256_file, TransferReceipt, Transport};
use crate::error::TransportError;

/// 复制到本地目录（挂载的 U 盘、NAS 等）
///
/// 先写 `<name>.tmp` 再重命名，目标目录里不会出现半截文件
#[derive(Debug)]
pub struct LocalCopyTransport {
    root: PathBuf,
    connected: bool,
}

impl LocalCopyTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            connected: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Transport for LocalCopyTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| TransportError::connection(format!("{}: {e}", self.root.display())))?;

        let metadata = fs::metadata(&self.root)
            .await
            .map_err(|e| TransportError::connection(format!("{}: {e}", self.root.display())))?;
        if !metadata.is_dir() {
            return Err(TransportError::connection(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, local: &Path, remote: &Path) -> Result<TransferReceipt, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let target = self.root.join(remote);
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransportError::transfer(format!("invalid remote path {}", remote.display())))?
            .to_string();
        let temp = target.with_file_name(format!("{file_name}.tmp"));

        if let Some(parent) = target.parent() {
            // 目标根目录消失（设备被拔出）属于连接层错误
            if !self.root.exists() {
                self.connected = false;
                return Err(TransportError::connection(format!(
                    "{} disappeared",
                    self.root.display()
                )));
            }
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::transfer(format!("{}: {e}", parent.display())))?;
        }

        let bytes = fs::copy(local, &temp)
            .await
            .map_err(|e| TransportError::transfer(format!("{}: {e}", local.display())))?;
        let sha256 = sha256_file(&temp)
            .await
            .map_err(|e| TransportError::transfer(format!("{}: {e}", temp.display())))?;
        fs::rename(&temp, &target)
            .await
            .map_err(|e| TransportError::transfer(format!("{}: {e}", target.display())))?;

        debug!(local = ?local, remote = ?target, bytes, "Copied file");
        Ok(TransferReceipt {
            remote_path: remote.to_path_buf(),
            bytes,
            sha256: Some(sha256),
        })
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
