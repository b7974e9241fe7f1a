use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use tokio::time::Instant;

use crate::backoff::{deadline_after, Backoff};
use crate::model::{Artifact, Disposition};

/// 上传任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    /// 超过最大尝试次数，等待人工处理
    Abandoned,
}

/// 上传任务
#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    pub id: u64,
    pub artifact: Artifact,
    pub destination: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) next_attempt: Option<Instant>,
}

impl UploadTask {
    fn is_due(&self, now: Instant) -> bool {
        self.state == TaskState::Pending && self.next_attempt.map_or(true, |at| at <= now)
    }
}

/// 单个目标的待上传队列
///
/// 按入队顺序保存；同一文件在待处理或最近成功期间重复入队是空操作
#[derive(Debug)]
pub(crate) struct Backlog {
    destination: String,
    pending: VecDeque<UploadTask>,
    abandoned: Vec<UploadTask>,
    recent: VecDeque<PathBuf>,
    recent_set: HashSet<PathBuf>,
    recent_capacity: usize,
    next_id: u64,
}

impl Backlog {
    pub(crate) fn new(destination: impl Into<String>, recent_capacity: usize) -> Self {
        Self {
            destination: destination.into(),
            pending: VecDeque::new(),
            abandoned: Vec::new(),
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            recent_capacity: recent_capacity.max(1),
            next_id: 1,
        }
    }

    /// 入队，重复时返回 false
    ///
    /// 保留源文件的产物只与队列中的任务去重
    pub(crate) fn enqueue(&mut self, artifact: Artifact) -> bool {
        let path = &artifact.path;
        let recently_sent = artifact.disposition != Disposition::Keep && self.recent_set.contains(path);
        let duplicate = recently_sent
            || self.pending.iter().any(|t| &t.artifact.path == path)
            || self.abandoned.iter().any(|t| &t.artifact.path == path);
        if duplicate {
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(UploadTask {
            id,
            artifact,
            destination: self.destination.clone(),
            attempts: 0,
            last_error: None,
            state: TaskState::Pending,
            enqueued_at: Utc::now(),
            next_attempt: None,
        });
        true
    }

    /// 退避已结束的任务，按入队顺序
    pub(crate) fn due(&self, now: Instant) -> Vec<u64> {
        self.pending
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| t.id)
            .collect()
    }

    /// 所有待处理任务（忽略退避）
    pub(crate) fn pending_ids(&self) -> Vec<u64> {
        self.pending
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.id)
            .collect()
    }

    /// 最早一个处于退避中的任务的到期时间
    pub(crate) fn earliest_retry(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|t| t.state == TaskState::Pending)
            .filter_map(|t| t.next_attempt)
            .min()
    }

    /// 标记为传输中，任务保留在队列原位置
    pub(crate) fn begin(&mut self, id: u64) -> Option<UploadTask> {
        let task = self.pending.iter_mut().find(|t| t.id == id)?;
        if task.state != TaskState::Pending {
            return None;
        }
        task.state = TaskState::InFlight;
        Some(task.clone())
    }

    pub(crate) fn succeed(&mut self, id: u64) -> Option<UploadTask> {
        let index = self.pending.iter().position(|t| t.id == id)?;
        let mut task = self.pending.remove(index)?;
        task.state = TaskState::Succeeded;
        task.attempts += 1;

        if self.recent.len() >= self.recent_capacity {
            if let Some(evicted) = self.recent.pop_front() {
                self.recent_set.remove(&evicted);
            }
        }
        self.recent.push_back(task.artifact.path.clone());
        self.recent_set.insert(task.artifact.path.clone());
        Some(task)
    }

    /// 记录一次失败；达到上限时移入放弃列表并返回该任务
    pub(crate) fn fail(
        &mut self,
        id: u64,
        error: String,
        backoff: &Backoff,
        max_attempts: u32,
        now: Instant,
    ) -> Option<UploadTask> {
        let index = self.pending.iter().position(|t| t.id == id)?;
        let task = self.pending.get_mut(index)?;
        task.attempts += 1;
        task.last_error = Some(error);

        if task.attempts >= max_attempts {
            let mut task = self.pending.remove(index)?;
            task.state = TaskState::Abandoned;
            task.next_attempt = None;
            self.abandoned.push(task.clone());
            return Some(task);
        }

        task.state = TaskState::Pending;
        task.next_attempt = Some(deadline_after(now, backoff.delay_for(task.attempts)));
        None
    }

    /// 连接层中断：放回队列，不计入尝试次数
    pub(crate) fn release(&mut self, id: u64, error: String) {
        if let Some(task) = self.pending.iter_mut().find(|t| t.id == id) {
            task.state = TaskState::Pending;
            task.last_error = Some(error);
        }
    }

    /// 将放弃的任务重新放回队列，尝试次数清零
    pub(crate) fn requeue_abandoned(&mut self) -> usize {
        let count = self.abandoned.len();
        for mut task in self.abandoned.drain(..) {
            task.state = TaskState::Pending;
            task.attempts = 0;
            task.next_attempt = None;
            self.pending.push_back(task);
        }
        count
    }

    /// 最近成功上传的文件，最新的在后
    pub(crate) fn recent(&self) -> impl Iterator<Item = &PathBuf> {
        self.recent.iter()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|t| t.state == TaskState::InFlight)
            .count()
    }

    pub(crate) fn pending_tasks(&self) -> Vec<UploadTask> {
        self.pending.iter().cloned().collect()
    }

    pub(crate) fn abandoned_tasks(&self) -> Vec<UploadTask> {
        self.abandoned.clone()
    }
}
