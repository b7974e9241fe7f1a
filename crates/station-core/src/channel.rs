//! 工作任务到协调器的有界记录通道
//!
//! 多生产者单消费者，单一有序流。发送方最多等待 `send_timeout`；
//! 仍然满时丢弃同一标识最早排队的记录，丢失数会写入该标识下一条记录的
//! `lost_records`。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::backoff::deadline_after;
use crate::model::{Identifier, StatusRecord};

/// 发送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// 通道满，丢弃了同一标识最早的一条记录
    DroppedOldest,
    /// 通道满且没有同一标识的记录可丢弃，新记录被拒绝
    Rejected,
    /// 接收端已关闭
    Closed,
}

/// 接收错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    /// 所有发送端已关闭且队列为空
    Closed,
}

#[derive(Default)]
struct Queue {
    records: VecDeque<StatusRecord>,
    /// 尚未通过 `lost_records` 报告的丢失数
    unreported: HashMap<Identifier, u64>,
}

struct Shared {
    queue: Mutex<Queue>,
    capacity: usize,
    send_timeout: Duration,
    space: Notify,
    items: Notify,
    overflow: AtomicU64,
    senders: AtomicUsize,
    receiver_alive: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // 临界区内没有会 panic 的操作，中毒时直接取回数据
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// 创建有界通道
pub fn bounded(capacity: usize, send_timeout: Duration) -> (RecordSender, RecordReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue::default()),
        capacity: capacity.max(1),
        send_timeout,
        space: Notify::new(),
        items: Notify::new(),
        overflow: AtomicU64::new(0),
        senders: AtomicUsize::new(1),
        receiver_alive: AtomicBool::new(true),
    });

    (
        RecordSender {
            shared: shared.clone(),
        },
        RecordReceiver { shared },
    )
}

/// 发送端
pub struct RecordSender {
    shared: Arc<Shared>,
}

impl RecordSender {
    /// 发送记录，最多阻塞 `send_timeout`
    pub async fn send(&self, record: StatusRecord) -> SendOutcome {
        let deadline = deadline_after(Instant::now(), self.shared.send_timeout);

        loop {
            let space = self.shared.space.notified();
            {
                let mut queue = self.shared.lock();
                if !self.shared.receiver_alive.load(Ordering::Acquire) {
                    return SendOutcome::Closed;
                }
                if queue.records.len() < self.shared.capacity {
                    push(&mut queue, record);
                    drop(queue);
                    self.shared.items.notify_one();
                    return SendOutcome::Delivered;
                }
            }
            if timeout_at(deadline, space).await.is_err() {
                break;
            }
        }

        let mut queue = self.shared.lock();
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        if queue.records.len() < self.shared.capacity {
            push(&mut queue, record);
            drop(queue);
            self.shared.items.notify_one();
            return SendOutcome::Delivered;
        }

        self.shared.overflow.fetch_add(1, Ordering::Relaxed);
        let identifier = record.identifier.clone();
        let oldest = queue
            .records
            .iter()
            .position(|queued| queued.identifier == identifier);

        match oldest.and_then(|index| queue.records.remove(index)) {
            Some(dropped) => {
                *queue.unreported.entry(identifier.clone()).or_default() += dropped.lost_records + 1;
                push(&mut queue, record);
                drop(queue);
                self.shared.items.notify_one();
                warn!(
                    identifier = %identifier,
                    sequence = dropped.sequence,
                    "Record channel full, dropped oldest queued record"
                );
                SendOutcome::DroppedOldest
            }
            None => {
                *queue.unreported.entry(identifier.clone()).or_default() += record.lost_records + 1;
                warn!(identifier = %identifier, "Record channel full, rejected new record");
                SendOutcome::Rejected
            }
        }
    }

    /// 累计溢出次数
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.receiver_alive.load(Ordering::Acquire)
    }
}

fn push(queue: &mut Queue, mut record: StatusRecord) {
    if let Some(lost) = queue.unreported.remove(&record.identifier) {
        record.lost_records += lost;
    }
    queue.records.push_back(record);
}

impl Clone for RecordSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for RecordSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.items.notify_one();
        }
    }
}

/// 接收端
pub struct RecordReceiver {
    shared: Arc<Shared>,
}

impl RecordReceiver {
    /// 等待下一条记录，最多等待 `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<StatusRecord, RecvError> {
        let deadline = deadline_after(Instant::now(), timeout);
        let shared = self.shared.clone();

        loop {
            let items = shared.items.notified();
            if let Some(record) = self.try_recv() {
                return Ok(record);
            }
            if shared.senders.load(Ordering::Acquire) == 0 {
                return Err(RecvError::Closed);
            }
            if timeout_at(deadline, items).await.is_err() {
                return self.try_recv().ok_or(RecvError::Timeout);
            }
        }
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Option<StatusRecord> {
        let record = self.shared.lock().records.pop_front();
        if record.is_some() {
            self.shared.space.notify_one();
        }
        record
    }

    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecordReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
        self.shared.space.notify_waiters();
    }
}
