use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use station_config::DeviceKind;

use crate::error::Result;
use crate::model::Identifier;

/// 探测到的设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub identifier: Identifier,
    pub kind: DeviceKind,
    /// 设备地址（路径、端口、URL 等），仅用于日志
    #[serde(default)]
    pub address: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(identifier: impl Into<Identifier>, kind: DeviceKind) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// 硬件探测
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    /// 列出当前连接的设备
    async fn probe(&self) -> Result<Vec<DeviceDescriptor>>;
}
