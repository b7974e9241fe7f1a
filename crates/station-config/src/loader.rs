use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::device::{DeviceConfig, DeviceConfigError, MAX_INTERVAL_SECS};
use crate::global::StationConfig;

/// 解析后的设备配置
///
/// 单个设备条目无效时只拒绝该设备
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedDevices {
    pub devices: BTreeMap<String, DeviceConfig>,
    pub rejected: BTreeMap<String, DeviceConfigError>,
}

/// 配置加载器
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// 加载工作站配置
    pub fn load(&self) -> Result<StationConfig> {
        if !self.config_path.exists() {
            // 如果配置文件不存在，返回默认配置
            return Ok(StationConfig::default());
        }

        let content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;
        Self::parse(&content)
    }

    /// 从字符串解析并验证
    pub fn parse(content: &str) -> Result<StationConfig> {
        let config: StationConfig = toml::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// 验证全局配置
    pub fn validate(config: &StationConfig) -> Result<()> {
        if config.channel.capacity == 0 {
            return Err(anyhow!("channel.capacity must be greater than 0"));
        }

        if config.uploader.max_attempts == 0 {
            return Err(anyhow!("uploader.max_attempts must be greater than 0"));
        }

        if config.uploader.backoff_base_ms == 0
            || config.uploader.backoff_base_ms > config.uploader.backoff_cap_ms
        {
            return Err(anyhow!(
                "uploader.backoff_base_ms ({}) must be in 1..=backoff_cap_ms ({})",
                config.uploader.backoff_base_ms,
                config.uploader.backoff_cap_ms
            ));
        }

        if config.uploader.unavailable_base_secs > config.uploader.unavailable_cap_secs {
            return Err(anyhow!(
                "uploader.unavailable_base_secs cannot be greater than unavailable_cap_secs"
            ));
        }

        if config.uploader.tick_secs == 0
            || config.coordinator.flush_interval_secs == 0
            || config.supervisor.reconcile_interval_secs == 0
        {
            return Err(anyhow!("tick, flush and reconcile intervals must be greater than 0"));
        }

        let max_ms = MAX_INTERVAL_SECS * 1_000;
        let bounded = [
            ("channel.send_timeout_ms", config.channel.send_timeout_ms, max_ms),
            ("coordinator.flush_interval_secs", config.coordinator.flush_interval_secs, MAX_INTERVAL_SECS),
            ("coordinator.poll_timeout_ms", config.coordinator.poll_timeout_ms, max_ms),
            ("uploader.tick_secs", config.uploader.tick_secs, MAX_INTERVAL_SECS),
            ("uploader.backoff_cap_ms", config.uploader.backoff_cap_ms, max_ms),
            ("uploader.reconnect_delay_ms", config.uploader.reconnect_delay_ms, max_ms),
            ("uploader.unavailable_cap_secs", config.uploader.unavailable_cap_secs, MAX_INTERVAL_SECS),
            ("uploader.transfer_timeout_secs", config.uploader.transfer_timeout_secs, MAX_INTERVAL_SECS),
            ("uploader.shutdown_grace_secs", config.uploader.shutdown_grace_secs, MAX_INTERVAL_SECS),
            ("supervisor.reconcile_interval_secs", config.supervisor.reconcile_interval_secs, MAX_INTERVAL_SECS),
            ("supervisor.debounce_secs", config.supervisor.debounce_secs, MAX_INTERVAL_SECS),
        ];
        for (field, value, max) in bounded {
            if value > max {
                return Err(anyhow!("{field} ({value}) must be at most {max}"));
            }
        }

        let mut names = HashSet::new();
        for destination in &config.destinations {
            if !names.insert(destination.name.as_str()) {
                return Err(anyhow!("Duplicate destination name: {}", destination.name));
            }
        }

        for destination in &config.destinations {
            if let Some(fallback) = &destination.fallback {
                if fallback == &destination.name {
                    return Err(anyhow!("Destination {} cannot fall back to itself", fallback));
                }
                if !names.contains(fallback.as_str()) {
                    return Err(anyhow!(
                        "Destination {} names unknown fallback {}",
                        destination.name,
                        fallback
                    ));
                }
            }
        }

        for name in &config.coordinator.log_upload {
            if !names.contains(name.as_str()) {
                return Err(anyhow!("coordinator.log_upload names unknown destination {}", name));
            }
        }

        Ok(())
    }

    /// 逐条解析设备配置
    pub fn resolve_devices(config: &StationConfig) -> ResolvedDevices {
        let mut resolved = ResolvedDevices::default();

        for (identifier, raw) in &config.devices {
            match Self::resolve_device(config, identifier, raw) {
                Ok(device) => {
                    resolved.devices.insert(identifier.clone(), device);
                }
                Err(e) => {
                    resolved.rejected.insert(identifier.clone(), e);
                }
            }
        }

        resolved
    }

    fn resolve_device(
        config: &StationConfig,
        identifier: &str,
        raw: &serde_json::Value,
    ) -> std::result::Result<DeviceConfig, DeviceConfigError> {
        let mut device: DeviceConfig = serde_json::from_value(raw.clone())
            .map_err(|e| DeviceConfigError::Unparseable(e.to_string()))?;
        device.identifier = identifier.to_string();
        device.validate()?;

        for destination in &device.upload {
            if config.destination(destination).is_none() {
                return Err(DeviceConfigError::UnknownDestination(destination.clone()));
            }
        }

        Ok(device)
    }

    /// 配置文件内容指纹（sha256），文件不存在时为空字符串
    pub fn fingerprint(&self) -> Result<String> {
        if !self.config_path.exists() {
            return Ok(String::new());
        }
        let bytes = std::fs::read(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
