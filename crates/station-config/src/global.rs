use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::destination::DestinationConfig;

/// 工作站全局配置
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub station: StationSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    /// 设备配置，按条目单独解析
    #[serde(default)]
    pub devices: BTreeMap<String, serde_json::Value>,
}

impl StationConfig {
    pub fn destination(&self, name: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

/// 工作站基本信息
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationSection {
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON 格式输出
    #[serde(default)]
    pub json: bool,
    /// 日志文件目录（为空则只输出到 stderr）
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// 设备到协调器的消息通道
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// 快照与日志刷新周期（秒）
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// 通道接收超时（毫秒）
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// 单个时序日志文件大小上限
    #[serde(default = "default_rotate_max_bytes")]
    pub rotate_max_bytes: u64,
    /// 写盘失败时缓存的最大行数
    #[serde(default = "default_pending_row_limit")]
    pub pending_row_limit: usize,
    /// 轮转后的日志上传目标
    #[serde(default)]
    pub log_upload: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploaderConfig {
    #[serde(default = "default_uploader_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_upload_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_upload_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// 单个任务最大尝试次数，超过后标记为放弃
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 连接断开后的重连次数
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 目标不可用时的退避（秒）
    #[serde(default = "default_unavailable_base_secs")]
    pub unavailable_base_secs: u64,
    #[serde(default = "default_unavailable_cap_secs")]
    pub unavailable_cap_secs: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// 最近成功任务的去重窗口
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
    /// 关闭时的排空宽限期（秒）
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// 热插拔事件合并窗口（秒）
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// 为探测到但未配置的相机生成默认配置
    #[serde(default)]
    pub auto_configure: bool,
}

// 默认值函数
fn default_station_name() -> String {
    "capture-station".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    50
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_rotate_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_pending_row_limit() -> usize {
    10_000
}

fn default_uploader_tick_secs() -> u64 {
    10
}

fn default_upload_backoff_base_ms() -> u64 {
    1_000
}

fn default_upload_backoff_cap_ms() -> u64 {
    16_000
}

fn default_max_attempts() -> u32 {
    6
}

fn default_max_reconnects() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_unavailable_base_secs() -> u64 {
    30
}

fn default_unavailable_cap_secs() -> u64 {
    600
}

fn default_transfer_timeout_secs() -> u64 {
    120
}

fn default_recent_capacity() -> usize {
    1024
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_debounce_secs() -> u64 {
    10
}

// Default trait 实现
impl Default for StationSection {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            rotate_max_bytes: default_rotate_max_bytes(),
            pending_row_limit: default_pending_row_limit(),
            log_upload: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_uploader_tick_secs(),
            backoff_base_ms: default_upload_backoff_base_ms(),
            backoff_cap_ms: default_upload_backoff_cap_ms(),
            max_attempts: default_max_attempts(),
            max_reconnects: default_max_reconnects(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            unavailable_base_secs: default_unavailable_base_secs(),
            unavailable_cap_secs: default_unavailable_cap_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            recent_capacity: default_recent_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl UploaderConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn unavailable_base(&self) -> Duration {
        Duration::from_secs(self.unavailable_base_secs)
    }

    pub fn unavailable_cap(&self) -> Duration {
        Duration::from_secs(self.unavailable_cap_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            debounce_secs: default_debounce_secs(),
            auto_configure: false,
        }
    }
}

impl SupervisorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}
