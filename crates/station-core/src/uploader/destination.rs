use chrono::{DateTime, Utc};
use serde::Serialize;
use station_config::{DestinationConfig, DestinationKind};
use std::sync::Mutex;
use tokio::sync::Notify;

use super::backlog::Backlog;

/// 目标的传输统计
#[derive(Debug, Clone, Default)]
pub(crate) struct DestinationStats {
    pub connected: bool,
    pub available: bool,
    pub unavailable_until: Option<DateTime<Utc>>,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub failed_attempts: u64,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// 上传目标状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationStatus {
    pub name: String,
    pub kind: DestinationKind,
    pub connected: bool,
    pub available: bool,
    pub unavailable_until: Option<DateTime<Utc>>,
    pub pending: usize,
    pub in_flight: usize,
    pub abandoned: usize,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub failed_attempts: u64,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// 目标任务与句柄共享的状态
pub(crate) struct DestinationShared {
    pub config: DestinationConfig,
    pub backlog: Mutex<Backlog>,
    pub stats: Mutex<DestinationStats>,
    pub trigger: Notify,
}

impl DestinationShared {
    pub(crate) fn new(config: DestinationConfig, recent_capacity: usize) -> Self {
        Self {
            backlog: Mutex::new(Backlog::new(config.name.clone(), recent_capacity)),
            stats: Mutex::new(DestinationStats {
                available: true,
                ..DestinationStats::default()
            }),
            trigger: Notify::new(),
            config,
        }
    }

    pub(crate) fn with_backlog<T>(&self, f: impl FnOnce(&mut Backlog) -> T) -> T {
        let mut backlog = self.backlog.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut backlog)
    }

    pub(crate) fn with_stats<T>(&self, f: impl FnOnce(&mut DestinationStats) -> T) -> T {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats)
    }

    pub(crate) fn status(&self) -> DestinationStatus {
        let (pending, in_flight, abandoned) = self.with_backlog(|b| {
            (b.pending_count(), b.in_flight_count(), b.abandoned_tasks().len())
        });
        let stats = self.with_stats(|s| s.clone());

        DestinationStatus {
            name: self.config.name.clone(),
            kind: self.config.kind,
            connected: stats.connected,
            available: stats.available,
            unavailable_until: stats.unavailable_until,
            pending,
            in_flight,
            abandoned,
            files_uploaded: stats.files_uploaded,
            bytes_uploaded: stats.bytes_uploaded,
            failed_attempts: stats.failed_attempts,
            last_upload: stats.last_upload,
            last_error: stats.last_error,
        }
    }
}
