use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::state::StationSnapshot;
use crate::error::Result;

/// 快照文件
///
/// 先写临时文件再重命名，读取方不会看到半截内容
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 保存快照
    pub async fn save(&self, snapshot: &StationSnapshot) -> Result<()> {
        write_json(&self.path, snapshot).await?;
        debug!("Snapshot saved to {:?}", self.path);
        Ok(())
    }

    /// 加载快照，文件不存在时返回 None
    pub async fn load(&self) -> Result<Option<StationSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

/// 先写临时文件再重命名
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state").join("snapshot.json"));

        assert!(store.load().await.unwrap().is_none());

        let snapshot = StationSnapshot::empty("greenhouse-3");
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(SnapshotStore::new(&path).load().await.is_err());
    }
}
