use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::DeviceError;
use crate::model::{ArtifactKind, WorkerConfig};

/// 硬件驱动能力接口
///
/// 每种设备实现一次。句柄由工作任务独占；强制停止时任务被中止，
/// 句柄随之被丢弃而不会调用 `release`，因此句柄的 `Drop` 也应释放设备。
#[async_trait]
pub trait DeviceDriver: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// 获取设备
    async fn acquire(&self, config: &WorkerConfig) -> Result<Self::Handle, DeviceError>;

    /// 执行一次采集/读取
    async fn perform_unit(
        &self,
        handle: &mut Self::Handle,
        config: &WorkerConfig,
    ) -> Result<UnitOutcome, DeviceError>;

    /// 释放设备
    async fn release(&self, handle: Self::Handle);
}

/// 一次成功操作的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOutcome {
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// 本次产生的文件
    pub artifact: Option<(PathBuf, ArtifactKind)>,
}

impl UnitOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        self.artifact = Some((path.into(), kind));
        self
    }
}
