use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use station_config::{validate_identifier, DeviceConfigError, RESERVED_IDENTIFIER};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{Identifier, RecordKind, StatusRecord, WorkerConfig, WorkerState};

/// 协调器自身状态记录使用的标识
pub const COORDINATOR_IDENTIFIER: &str = RESERVED_IDENTIFIER;

/// 无法合并的记录
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error(transparent)]
    Identifier(#[from] DeviceConfigError),

    #[error("artifact belongs to {artifact}, record to {record}")]
    ArtifactMismatch { record: String, artifact: String },
}

/// 单个设备的最新状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub identifier: Identifier,
    #[serde(default)]
    pub config: Option<WorkerConfig>,
    #[serde(default)]
    pub latest: Option<StatusRecord>,
    #[serde(default)]
    pub records_received: u64,
    /// 通道溢出导致的累计丢失
    #[serde(default)]
    pub lost_records: u64,
    /// 已从监督器移除，历史保留
    #[serde(default)]
    pub removed: bool,
    /// 状态来自启动时恢复的快照，尚未收到新记录
    #[serde(default)]
    pub restored: bool,
}

impl DeviceEntry {
    fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            config: None,
            latest: None,
            records_received: 0,
            lost_records: 0,
            removed: false,
            restored: false,
        }
    }

    pub fn state(&self) -> Option<WorkerState> {
        self.latest.as_ref().map(|r| r.state)
    }
}

/// 协调器运行状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub degraded: bool,
    pub records_processed: u64,
    pub malformed_records: u64,
    /// 等待重写的时序行
    pub pending_rows: usize,
    /// 缓存超限后丢弃的时序行
    pub dropped_rows: u64,
    pub last_error: Option<String>,
    pub last_flush: Option<DateTime<Utc>>,
}

/// 工作站状态的只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationSnapshot {
    pub station: String,
    pub taken_at: DateTime<Utc>,
    pub devices: BTreeMap<Identifier, DeviceEntry>,
    pub coordinator: CoordinatorStatus,
    /// 通道累计溢出次数
    #[serde(default)]
    pub overflow_count: u64,
}

impl StationSnapshot {
    pub fn empty(station: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            taken_at: Utc::now(),
            devices: BTreeMap::new(),
            coordinator: CoordinatorStatus::default(),
            overflow_count: 0,
        }
    }

    pub fn device(&self, identifier: &str) -> Option<&DeviceEntry> {
        self.devices.get(identifier)
    }

    pub fn state_of(&self, identifier: &str) -> Option<WorkerState> {
        self.device(identifier).and_then(DeviceEntry::state)
    }
}

/// 协调器独占的可变状态
#[derive(Debug, Default)]
pub(crate) struct StationState {
    devices: BTreeMap<Identifier, DeviceEntry>,
    pub(crate) status: CoordinatorStatus,
}

impl StationState {
    /// 合并一条记录，返回时间戳校正后的记录
    ///
    /// 时间戳回退时钳制为上一条记录的时间戳，保证同一标识单调不减
    pub(crate) fn apply(&mut self, mut record: StatusRecord) -> Result<StatusRecord, MalformedRecord> {
        validate(&record)?;

        let entry = self
            .devices
            .entry(record.identifier.clone())
            .or_insert_with(|| DeviceEntry::new(record.identifier.clone()));

        if let Some(previous) = &entry.latest {
            if record.timestamp < previous.timestamp {
                record.timestamp = previous.timestamp;
            }
        }

        entry.records_received += 1;
        entry.lost_records += record.lost_records;
        entry.restored = false;
        entry.latest = Some(record.clone());
        self.status.records_processed += 1;

        Ok(record)
    }

    /// 新增或更新设备配置，保留历史
    pub(crate) fn add_identifier(&mut self, config: WorkerConfig) {
        let entry = self
            .devices
            .entry(config.identifier.clone())
            .or_insert_with(|| DeviceEntry::new(config.identifier.clone()));
        entry.config = Some(config);
        entry.removed = false;
    }

    /// 标记为已移除；之后到达的记录仍会被接受
    pub(crate) fn remove_identifier(&mut self, identifier: &str) -> bool {
        match self.devices.get_mut(identifier) {
            Some(entry) => {
                entry.removed = true;
                true
            }
            None => false,
        }
    }

    /// 从快照恢复最后已知状态
    pub(crate) fn restore(&mut self, snapshot: StationSnapshot) -> usize {
        let mut restored = 0;
        for (identifier, mut entry) in snapshot.devices {
            if identifier == COORDINATOR_IDENTIFIER {
                continue;
            }
            entry.restored = true;
            self.devices.entry(identifier).or_insert_with(|| {
                restored += 1;
                entry
            });
        }
        restored
    }

    /// 更新协调器自身的状态记录
    pub(crate) fn set_coordinator_health(&mut self, error: Option<String>) {
        let degraded = error.is_some();
        let changed = self.status.degraded != degraded;
        self.status.degraded = degraded;
        if let Some(e) = &error {
            self.status.last_error = Some(e.clone());
        }

        let entry = self
            .devices
            .entry(COORDINATOR_IDENTIFIER.to_string())
            .or_insert_with(|| DeviceEntry::new(COORDINATOR_IDENTIFIER.to_string()));

        if changed || entry.latest.is_none() {
            let (state, kind) = if degraded {
                (WorkerState::Degraded, RecordKind::Failure)
            } else {
                (WorkerState::Running, RecordKind::Transition)
            };
            let mut record = StatusRecord::new(COORDINATOR_IDENTIFIER, state, kind);
            record.sequence = entry.records_received + 1;
            record.error = error;
            entry.records_received += 1;
            entry.latest = Some(record);
        }
    }

    pub(crate) fn snapshot(&self, station: &str, overflow_count: u64) -> StationSnapshot {
        StationSnapshot {
            station: station.to_string(),
            taken_at: Utc::now(),
            devices: self.devices.clone(),
            coordinator: self.status.clone(),
            overflow_count,
        }
    }
}

fn validate(record: &StatusRecord) -> Result<(), MalformedRecord> {
    validate_identifier(&record.identifier)?;
    if let Some(artifact) = &record.artifact {
        if artifact.identifier != record.identifier {
            return Err(MalformedRecord::ArtifactMismatch {
                record: record.identifier.clone(),
                artifact: artifact.identifier.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Artifact, ArtifactKind};
    use chrono::Duration;
    use station_config::DeviceKind;

    fn record(identifier: &str) -> StatusRecord {
        StatusRecord::new(identifier, WorkerState::Running, RecordKind::Observation)
    }

    #[test]
    fn test_timestamp_never_goes_backwards() {
        let mut state = StationState::default();
        let first = record("cam");
        let t0 = first.timestamp;
        state.apply(first).unwrap();

        let mut late = record("cam");
        late.timestamp = t0 - Duration::seconds(30);
        let applied = state.apply(late).unwrap();

        assert_eq!(applied.timestamp, t0);
        assert_eq!(state.devices.get("cam").unwrap().records_received, 2);
    }

    #[test]
    fn test_malformed_records_rejected() {
        let mut state = StationState::default();
        assert!(matches!(
            state.apply(record("")),
            Err(MalformedRecord::Identifier(DeviceConfigError::InvalidIdentifier(_)))
        ));
        assert!(matches!(
            state.apply(record("../etc")),
            Err(MalformedRecord::Identifier(DeviceConfigError::InvalidIdentifier(_)))
        ));
        assert!(matches!(
            state.apply(record(COORDINATOR_IDENTIFIER)),
            Err(MalformedRecord::Identifier(DeviceConfigError::ReservedIdentifier(_)))
        ));

        let mismatched =
            record("cam-A").with_artifact(Artifact::new("cam-B", "/d/x.jpg", ArtifactKind::Image));
        assert!(matches!(
            state.apply(mismatched),
            Err(MalformedRecord::ArtifactMismatch { .. })
        ));
        assert_eq!(state.status.records_processed, 0);
    }

    #[test]
    fn test_add_and_remove_identifier_are_idempotent() {
        let mut state = StationState::default();
        let mut config = WorkerConfig::new("cam", DeviceKind::UsbCamera);
        state.add_identifier(config.clone());
        state.apply(record("cam")).unwrap();

        config.interval_secs = 60;
        state.add_identifier(config.clone());
        let entry = state.devices.get("cam").unwrap();
        assert_eq!(entry.config.as_ref().unwrap().interval_secs, 60);
        assert_eq!(entry.records_received, 1);

        assert!(state.remove_identifier("cam"));
        assert!(state.remove_identifier("cam"));
        assert!(state.apply(record("cam")).is_ok());
        assert!(state.devices.get("cam").unwrap().removed);
    }

    #[test]
    fn test_coordinator_health_record() {
        let mut state = StationState::default();
        state.set_coordinator_health(Some("disk full".to_string()));

        let snapshot = state.snapshot("station", 0);
        assert!(snapshot.coordinator.degraded);
        assert_eq!(snapshot.state_of(COORDINATOR_IDENTIFIER), Some(WorkerState::Degraded));

        state.set_coordinator_health(None);
        assert_eq!(
            state.snapshot("station", 0).state_of(COORDINATOR_IDENTIFIER),
            Some(WorkerState::Running)
        );
    }

    #[test]
    fn test_restore_marks_entries() {
        let mut source = StationState::default();
        source.apply(record("cam")).unwrap();
        let snapshot = source.snapshot("station", 0);

        let mut state = StationState::default();
        assert_eq!(state.restore(snapshot), 1);
        assert!(state.devices.get("cam").unwrap().restored);

        state.apply(record("cam")).unwrap();
        assert!(!state.devices.get("cam").unwrap().restored);
    }
}
