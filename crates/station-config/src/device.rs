use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 单个设备配置错误
///
/// 只影响对应设备的启动，不影响整个工作站
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceConfigError {
    /// 配置无法解析
    #[error("Unparseable device entry: {0}")]
    Unparseable(String),

    /// 字段值非法
    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// 引用了不存在的上传目标
    #[error("Unknown upload destination: {0}")]
    UnknownDestination(String),

    /// 标识保留给工作站自身
    #[error("Reserved identifier: {0}")]
    ReservedIdentifier(String),

    /// 标识不能用作文件名
    #[error("Identifier {0:?} is not usable as a file name")]
    InvalidIdentifier(String),
}

impl DeviceConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DeviceConfigError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// 协调器自身状态使用的标识，设备不可使用
pub const RESERVED_IDENTIFIER: &str = "coordinator";

/// 间隔类配置的上限（一年）
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// 检查设备标识
///
/// 标识会出现在日志文件名、图像目录和远端路径中
pub fn validate_identifier(identifier: &str) -> Result<(), DeviceConfigError> {
    if identifier == RESERVED_IDENTIFIER {
        return Err(DeviceConfigError::ReservedIdentifier(identifier.to_string()));
    }
    let unusable = identifier.trim().is_empty()
        || identifier.trim() != identifier
        || identifier == "."
        || identifier == ".."
        || identifier.chars().any(|c| matches!(c, '/' | '\\') || c.is_control());
    if unusable {
        return Err(DeviceConfigError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// 设备类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// 单反相机（gphoto）
    Dslr,
    /// 网络摄像头
    IpCamera,
    /// 树莓派摄像头模块
    PiCamera,
    /// USB 摄像头
    UsbCamera,
    /// 多路摄像头切换器
    CameraSwitch,
    /// 光照控制器
    Light,
    /// 云台
    PanTilt,
    /// 温湿度传感器
    Sensor,
    /// 生长箱
    Chamber,
}

impl DeviceKind {
    /// 是否产出图像文件
    pub fn captures_images(&self) -> bool {
        matches!(
            self,
            DeviceKind::Dslr
                | DeviceKind::IpCamera
                | DeviceKind::PiCamera
                | DeviceKind::UsbCamera
                | DeviceKind::CameraSwitch
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Dslr => "dslr",
            DeviceKind::IpCamera => "ip_camera",
            DeviceKind::PiCamera => "pi_camera",
            DeviceKind::UsbCamera => "usb_camera",
            DeviceKind::CameraSwitch => "camera_switch",
            DeviceKind::Light => "light",
            DeviceKind::PanTilt => "pan_tilt",
            DeviceKind::Sensor => "sensor",
            DeviceKind::Chamber => "chamber",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备配置
///
/// 每次运行不可变；重新配置时整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 设备标识（取自配置表键名）
    #[serde(default)]
    pub identifier: String,

    pub kind: DeviceKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// 采集间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// 每日采集开始时间（HH:MM）
    #[serde(default)]
    pub start_time: Option<String>,

    /// 每日采集结束时间（HH:MM）
    #[serde(default)]
    pub stop_time: Option<String>,

    /// 连续失败多少次后进入降级状态
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// 设备致命故障后是否继续重试
    #[serde(default = "default_enabled")]
    pub retry_on_fatal: bool,

    /// 单次操作超时（秒）
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    /// 停止等待超时（秒），超时后强制释放
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// 上传目标名称
    #[serde(default)]
    pub upload: Vec<String>,

    /// 上传确认后是否删除源文件（默认：图像删除，其它归档）
    #[serde(default)]
    pub remove_source: Option<bool>,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// 设备类型相关参数
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_error_threshold() -> u32 {
    3
}

fn default_unit_timeout_secs() -> u64 {
    60
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

impl DeviceConfig {
    /// 创建使用默认值的设备配置
    pub fn new(identifier: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            start_time: None,
            stop_time: None,
            error_threshold: default_error_threshold(),
            retry_on_fatal: true,
            unit_timeout_secs: default_unit_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            upload: Vec::new(),
            remove_source: None,
            output_dir: None,
            params: BTreeMap::new(),
        }
    }

    /// 探测到但未配置的设备所使用的默认配置
    pub fn detected_default(identifier: impl Into<String>, kind: DeviceKind, data_dir: &Path) -> Self {
        let identifier = identifier.into();
        let mut config = Self::new(identifier.clone(), kind);
        config.start_time = Some("05:00".to_string());
        config.stop_time = Some("22:00".to_string());
        config.output_dir = Some(data_dir.join("images").join(&identifier));
        config
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn removes_source(&self) -> bool {
        self.remove_source.unwrap_or_else(|| self.kind.captures_images())
    }

    /// 读取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// 解析采集时间窗口
    pub fn capture_window(&self) -> Result<Option<CaptureWindow>, DeviceConfigError> {
        match (&self.start_time, &self.stop_time) {
            (None, None) => Ok(None),
            (Some(start), Some(stop)) => Ok(Some(CaptureWindow {
                start: parse_hhmm("start_time", start)?,
                stop: parse_hhmm("stop_time", stop)?,
            })),
            _ => Err(DeviceConfigError::invalid(
                "start_time",
                "start_time and stop_time must be set together",
            )),
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), DeviceConfigError> {
        validate_identifier(&self.identifier)?;
        if self.interval_secs == 0 || self.interval_secs > MAX_INTERVAL_SECS {
            return Err(DeviceConfigError::invalid(
                "interval_secs",
                format!("must be in 1..={MAX_INTERVAL_SECS}"),
            ));
        }
        if self.error_threshold == 0 {
            return Err(DeviceConfigError::invalid("error_threshold", "must be greater than 0"));
        }
        if self.unit_timeout_secs == 0 || self.unit_timeout_secs > MAX_INTERVAL_SECS {
            return Err(DeviceConfigError::invalid(
                "unit_timeout_secs",
                format!("must be in 1..={MAX_INTERVAL_SECS}"),
            ));
        }
        if self.stop_timeout_secs > MAX_INTERVAL_SECS {
            return Err(DeviceConfigError::invalid(
                "stop_timeout_secs",
                format!("must be at most {MAX_INTERVAL_SECS}"),
            ));
        }
        if self.backoff_cap_ms > MAX_INTERVAL_SECS * 1_000 {
            return Err(DeviceConfigError::invalid(
                "backoff_cap_ms",
                format!("must be at most {}", MAX_INTERVAL_SECS * 1_000),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_cap_ms {
            return Err(DeviceConfigError::invalid(
                "backoff_base_ms",
                format!(
                    "must be in 1..={} (backoff_cap_ms)",
                    self.backoff_cap_ms
                ),
            ));
        }
        self.capture_window()?;
        Ok(())
    }
}

/// 每日采集时间窗口
///
/// `start > stop` 表示跨越午夜
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl CaptureWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.stop {
            time >= self.start && time <= self.stop
        } else {
            time >= self.start || time <= self.stop
        }
    }
}

fn parse_hhmm(field: &'static str, value: &str) -> Result<NaiveTime, DeviceConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| DeviceConfigError::invalid(field, format!("{value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_entry() {
        let config: DeviceConfig = toml::from_str(r#"kind = "usb_camera""#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 300);
        assert_eq!(config.error_threshold, 3);
        assert!(config.removes_source());
    }

    #[test]
    fn test_sensor_archives_by_default() {
        let config = DeviceConfig::new("chamber-dht", DeviceKind::Sensor);
        assert!(!config.removes_source());
    }

    #[test]
    fn test_capture_window_overnight() {
        let mut config = DeviceConfig::new("cam", DeviceKind::PiCamera);
        config.start_time = Some("22:00".to_string());
        config.stop_time = Some("05:30".to_string());

        let window = config.capture_window().unwrap().unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(4, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_half_window_rejected() {
        let mut config = DeviceConfig::new("cam", DeviceKind::PiCamera);
        config.start_time = Some("05:00".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_interval() {
        let mut config = DeviceConfig::new("cam", DeviceKind::Dslr);
        config.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(DeviceConfigError::InvalidField { field: "interval_secs", .. })
        ));
    }

    #[test]
    fn test_validate_interval_upper_bound() {
        let mut config = DeviceConfig::new("cam", DeviceKind::Dslr);
        config.interval_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(DeviceConfigError::InvalidField { field: "interval_secs", .. })
        ));

        config.interval_secs = MAX_INTERVAL_SECS;
        config.backoff_cap_ms = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(DeviceConfigError::InvalidField { field: "backoff_cap_ms", .. })
        ));
    }

    #[test]
    fn test_identifier_rules() {
        for ok in ["cam-A", "USB-0A1B", "chamber.dht", "相机1"] {
            assert_eq!(validate_identifier(ok), Ok(()), "{ok}");
        }
        assert_eq!(
            validate_identifier("coordinator"),
            Err(DeviceConfigError::ReservedIdentifier("coordinator".to_string()))
        );
        for bad in ["", " ", ".", "..", "cam/1", "cam\\1", " cam", "cam\n"] {
            assert!(
                matches!(validate_identifier(bad), Err(DeviceConfigError::InvalidIdentifier(_))),
                "{bad:?}"
            );
        }

        let config = DeviceConfig::new("cam/1", DeviceKind::UsbCamera);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detected_default() {
        let config = DeviceConfig::detected_default("USB-0A1B", DeviceKind::UsbCamera, Path::new("/data"));
        assert_eq!(config.output_dir, Some(PathBuf::from("/data/images/USB-0A1B")));
        assert!(config.capture_window().unwrap().is_some());
        assert!(config.validate().is_ok());
    }
}
