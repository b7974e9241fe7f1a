//! 工作站元数据
//!
//! 每个周期写入 `<data_dir>/state/metadata.json`，并交给日志上传目标，
//! 远端据此查看磁盘余量、最近上传和设备状态。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

use super::snapshot::write_json;
use super::state::StationSnapshot;
use crate::error::Result;
use crate::uploader::DestinationStatus;

/// 文件系统空间
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSpace {
    /// `path` 所在文件系统的空间，按最长挂载点匹配；找不到时返回 None
    pub fn of(path: &Path) -> Option<Self> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| Self {
                mount_point: disk.mount_point().to_path_buf(),
                free_bytes: disk.available_space(),
                total_bytes: disk.total_space(),
            })
    }
}

/// 上传给远端的元数据
#[derive(Debug, Clone, Serialize)]
pub struct StationMetadata<'a> {
    pub station: &'a str,
    pub version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub disk: Option<DiskSpace>,
    /// 所有目标中最近一次成功上传的时间
    pub last_upload: Option<DateTime<Utc>>,
    /// 最近上传的文件名
    pub recent_uploads: Vec<String>,
    pub destinations: Vec<DestinationStatus>,
    pub snapshot: &'a StationSnapshot,
}

impl<'a> StationMetadata<'a> {
    pub fn new(
        snapshot: &'a StationSnapshot,
        disk: Option<DiskSpace>,
        destinations: Vec<DestinationStatus>,
        recent_uploads: Vec<String>,
    ) -> Self {
        let last_upload = destinations.iter().filter_map(|d| d.last_upload).max();
        Self {
            station: &snapshot.station,
            version: env!("CARGO_PKG_VERSION"),
            generated_at: Utc::now(),
            disk,
            last_upload,
            recent_uploads,
            destinations,
            snapshot,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self).await
    }
}
