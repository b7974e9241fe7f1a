use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 设备标识
pub type Identifier = String;

/// 设备配置（每次运行不可变）
pub use station_config::DeviceConfig as WorkerConfig;

/// 工作任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Initializing,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Initializing => "initializing",
            WorkerState::Running => "running",
            WorkerState::Degraded => "degraded",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == WorkerState::Stopped
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// 一次成功的采集/读取
    Observation,
    /// 一次失败的操作
    Failure,
    /// 状态迁移
    Transition,
    /// 停止时的最后一条记录
    Final,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Observation => "observation",
            RecordKind::Failure => "failure",
            RecordKind::Transition => "transition",
            RecordKind::Final => "final",
        }
    }
}

/// 产物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    SensorLog,
    StatusLog,
    /// 工作站元数据，每个周期覆盖写入
    Metadata,
}

/// 上传确认后源文件的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Delete,
    /// 移动到本地归档目录
    Archive,
    /// 保留源文件，内容更新后可再次上传
    Keep,
}

/// 落盘的采集产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub identifier: Identifier,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub kind: ArtifactKind,
    pub disposition: Disposition,
    /// 上传目标名称
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl Artifact {
    pub fn new(identifier: impl Into<Identifier>, path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        let disposition = match kind {
            ArtifactKind::Image => Disposition::Delete,
            ArtifactKind::SensorLog | ArtifactKind::StatusLog => Disposition::Archive,
            ArtifactKind::Metadata => Disposition::Keep,
        };
        Self {
            identifier: identifier.into(),
            path: path.into(),
            created_at: Utc::now(),
            kind,
            disposition,
            destinations: Vec::new(),
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn with_destinations(mut self, destinations: Vec<String>) -> Self {
        self.destinations = destinations;
        self
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// 设备状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub identifier: Identifier,
    pub timestamp: DateTime<Utc>,
    /// 同一工作任务内递增
    pub sequence: u64,
    pub state: WorkerState,
    pub kind: RecordKind,
    /// 累计失败次数
    pub error_count: u64,
    pub consecutive_errors: u32,
    /// 此记录之前因通道溢出丢失的记录数
    #[serde(default)]
    pub lost_records: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl StatusRecord {
    pub fn new(identifier: impl Into<Identifier>, state: WorkerState, kind: RecordKind) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: Utc::now(),
            sequence: 0,
            state,
            kind,
            error_count: 0,
            consecutive_errors: 0,
            lost_records: 0,
            error: None,
            artifact: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// 带时间戳的产物文件名：`<identifier>_<YYYY_MM_DD_HH_MM_SS>.<ext>`
pub fn artifact_file_name<Tz>(identifier: &str, at: &DateTime<Tz>, extension: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}.{}",
        identifier,
        at.format("%Y_%m_%d_%H_%M_%S"),
        extension.trim_start_matches('.')
    )
}
