use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 设备驱动错误
#[derive(Error, Debug)]
pub enum DeviceError {
    /// 设备暂时不可用（断开、忙、未响应），可重试
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    /// 设备致命故障
    #[error("Device fatal error: {0}")]
    Fatal(String),

    /// 操作超时
    #[error("Device operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        DeviceError::Unavailable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        DeviceError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Fatal(_))
    }
}

/// 传输错误
#[derive(Error, Debug)]
pub enum TransportError {
    /// 连接层错误，不计入任务尝试次数
    #[error("Connection failed: {0}")]
    Connection(String),

    /// 单个文件传输失败
    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Not connected")]
    NotConnected,

    /// 目标类型没有可用的传输实现
    #[error("Unsupported destination: {0}")]
    Unsupported(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn connection(msg: impl Into<String>) -> Self {
        TransportError::Connection(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        TransportError::Transfer(msg.into())
    }

    pub fn is_connection_level(&self) -> bool {
        matches!(self, TransportError::Connection(_) | TransportError::NotConnected)
    }
}

/// 工作站错误类型
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device fatal error: {0}")]
    DeviceFatal(String),

    /// 持久化失败（下个周期重试）
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Transfer failure: {0}")]
    TransferFailure(String),

    /// 超过最大尝试次数
    #[error("Transfer of {} to {destination} abandoned after {attempts} attempts", artifact.display())]
    TransferAbandoned {
        artifact: PathBuf,
        destination: String,
        attempts: u32,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// 组件已停止
    #[error("{0} is not running")]
    Closed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 工作站结果类型
pub type Result<T> = std::result::Result<T, StationError>;

impl StationError {
    pub fn config(msg: impl Into<String>) -> Self {
        StationError::Config(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        StationError::PersistenceFailure(msg.into())
    }
}

impl From<DeviceError> for StationError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Fatal(msg) => StationError::DeviceFatal(msg),
            other => StationError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<TransportError> for StationError {
    fn from(err: TransportError) -> Self {
        StationError::TransferFailure(err.to_string())
    }
}

impl From<station_config::DeviceConfigError> for StationError {
    fn from(err: station_config::DeviceConfigError) -> Self {
        StationError::Config(err.to_string())
    }
}
