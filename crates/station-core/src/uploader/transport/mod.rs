mod fallback;
mod local;

pub use fallback::FallbackTransport;
pub use local::LocalCopyTransport;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use station_config::{DestinationConfig, DestinationKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::TransportError;

/// 远端对一次传输的确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub remote_path: PathBuf,
    /// 远端确认收到的字节数
    pub bytes: u64,
    /// 远端计算的 sha256（十六进制），协议不支持时为 None
    pub sha256: Option<String>,
}

/// 传输接口
///
/// 每个目标一个实例，由该目标的上传任务独占
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// 发送文件，`remote` 是相对目标根目录的路径
    async fn send(&mut self, local: &Path, remote: &Path) -> Result<TransferReceipt, TransportError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn kind(&self) -> &'static str;
}

/// 按目标配置创建传输实例
pub trait TransportConnector: Send + Sync {
    fn create(&self, config: &DestinationConfig) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportConnector for F
where
    F: Fn(&DestinationConfig) -> Result<Box<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self, config: &DestinationConfig) -> Result<Box<dyn Transport>, TransportError> {
        self(config)
    }
}

/// 传输工厂
///
/// 内置本地复制；SFTP/FTP 由外部实现通过 `register` 注册
#[derive(Clone)]
pub struct TransportFactory {
    connectors: HashMap<DestinationKind, Arc<dyn TransportConnector>>,
}

impl TransportFactory {
    pub fn new() -> Self {
        let mut connectors: HashMap<DestinationKind, Arc<dyn TransportConnector>> = HashMap::new();
        connectors.insert(
            DestinationKind::Local,
            Arc::new(
                |config: &DestinationConfig| -> Result<Box<dyn Transport>, TransportError> {
                    Ok(Box::new(LocalCopyTransport::new(&config.remote_dir)))
                },
            ),
        );
        Self { connectors }
    }

    pub fn register(mut self, kind: DestinationKind, connector: impl TransportConnector + 'static) -> Self {
        self.connectors.insert(kind, Arc::new(connector));
        self
    }

    /// 创建目标的传输实例，配置了备用目标时包装为 `FallbackTransport`
    pub fn build(
        &self,
        config: &DestinationConfig,
        all: &[DestinationConfig],
    ) -> Result<Box<dyn Transport>, TransportError> {
        let primary = self.create(config)?;

        match &config.fallback {
            Some(name) => {
                let fallback = all
                    .iter()
                    .find(|d| &d.name == name)
                    .ok_or_else(|| TransportError::Unsupported(format!("unknown fallback {name}")))?;
                let secondary = self.create(fallback)?;
                Ok(Box::new(FallbackTransport::new(primary, secondary)))
            }
            None => Ok(primary),
        }
    }

    fn create(&self, config: &DestinationConfig) -> Result<Box<dyn Transport>, TransportError> {
        let connector = self.connectors.get(&config.kind).ok_or_else(|| {
            TransportError::Unsupported(format!(
                "no transport registered for {:?} destination {}",
                config.kind, config.name
            ))
        })?;
        connector.create(config)
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// 计算文件 sha256
pub(crate) async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_kind_is_unsupported() {
        let factory = TransportFactory::new();
        let config = DestinationConfig {
            kind: DestinationKind::Sftp,
            ..DestinationConfig::local("archive", "/srv")
        };
        assert!(matches!(
            factory.build(&config, &[]),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_fallback_is_wrapped() {
        let factory = TransportFactory::new();
        let usb = DestinationConfig::local("usb", "/mnt/usb");
        let primary = DestinationConfig {
            fallback: Some("usb".to_string()),
            ..DestinationConfig::local("nas", "/mnt/nas")
        };

        let transport = factory.build(&primary, &[primary.clone(), usb]).unwrap();
        assert_eq!(transport.kind(), "fallback");
    }
}
