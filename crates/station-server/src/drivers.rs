//! 通用命令驱动与基于配置的硬件探测
//!
//! 设备参数：
//! - `command`：采集/读取命令，经 `sh -c` 执行，`{output}` 替换为输出文件路径，`{device}` 替换为设备路径
//! - `device_path`：设备节点，不存在时视为未连接
//! - `extension`：输出文件扩展名，默认 `jpg`

use async_trait::async_trait;
use chrono::Local;
use station_core::{
    artifact_file_name, ArtifactKind, ConfigSource, DeviceDescriptor, DeviceDriver, DeviceError, HardwareProbe,
    StationError, UnitOutcome, WorkerConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_EXTENSION: &str = "jpg";

/// 运行外部命令的设备驱动
#[derive(Debug, Default)]
pub struct CommandDriver;

/// 已获取的设备
#[derive(Debug)]
pub struct CommandDevice {
    device_path: Option<PathBuf>,
}

#[async_trait]
impl DeviceDriver for CommandDriver {
    type Handle = CommandDevice;

    async fn acquire(&self, config: &WorkerConfig) -> Result<CommandDevice, DeviceError> {
        if config.param_str("command").is_none() {
            return Err(DeviceError::fatal("missing `command` parameter"));
        }

        let device_path = config.param_str("device_path").map(PathBuf::from);
        if let Some(path) = &device_path {
            if !tokio::fs::try_exists(path).await? {
                return Err(DeviceError::unavailable(format!("{} not present", path.display())));
            }
        }
        Ok(CommandDevice { device_path })
    }

    async fn perform_unit(
        &self,
        handle: &mut CommandDevice,
        config: &WorkerConfig,
    ) -> Result<UnitOutcome, DeviceError> {
        let template = config
            .param_str("command")
            .ok_or_else(|| DeviceError::fatal("missing `command` parameter"))?;

        let output = match (&config.output_dir, config.kind.captures_images()) {
            (Some(dir), true) => {
                tokio::fs::create_dir_all(dir).await?;
                let extension = config.param_str("extension").unwrap_or(DEFAULT_EXTENSION);
                Some(dir.join(artifact_file_name(&config.identifier, &Local::now(), extension)))
            }
            (None, true) => return Err(DeviceError::fatal("image device without output_dir")),
            _ => None,
        };

        let command = render(template, output.as_deref(), handle.device_path.as_deref());
        debug!(identifier = %config.identifier, command = %command, "Running device command");

        let result = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .kill_on_drop(true)
            .output()
            .await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(DeviceError::unavailable(format!(
                "command exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        let mut outcome = UnitOutcome::new();
        for (key, value) in parse_attributes(&result.stdout) {
            outcome = outcome.with_attribute(key, value);
        }

        if let Some(path) = output {
            if !tokio::fs::try_exists(&path).await? {
                return Err(DeviceError::unavailable(format!(
                    "command produced no file at {}",
                    path.display()
                )));
            }
            outcome = outcome.with_artifact(path, ArtifactKind::Image);
        }
        Ok(outcome)
    }

    async fn release(&self, _handle: CommandDevice) {}
}

fn render(template: &str, output: Option<&Path>, device: Option<&Path>) -> String {
    let output = output.map(|p| p.display().to_string()).unwrap_or_default();
    let device = device.map(|p| p.display().to_string()).unwrap_or_default();
    template.replace("{output}", &output).replace("{device}", &device)
}

/// 标准输出为 JSON 对象时作为记录属性
fn parse_attributes(stdout: &[u8]) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::from_slice::<serde_json::Value>(stdout) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// 按配置判断设备是否连接：配置了 `device_path` 的设备在路径存在时视为已连接，其余始终视为已连接
pub struct ConfiguredProbe {
    source: Arc<dyn ConfigSource>,
}

impl ConfiguredProbe {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl HardwareProbe for ConfiguredProbe {
    async fn probe(&self) -> Result<Vec<DeviceDescriptor>, StationError> {
        let resolved = self.source.load().await?;

        let mut present = Vec::new();
        for config in resolved.devices.values() {
            let descriptor = DeviceDescriptor::new(config.identifier.clone(), config.kind);
            match config.param_str("device_path") {
                Some(path) => {
                    if tokio::fs::try_exists(path).await? {
                        present.push(descriptor.with_address(path));
                    }
                }
                None => present.push(descriptor),
            }
        }
        Ok(present)
    }
}
