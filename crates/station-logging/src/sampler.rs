use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 采样策略
#[derive(Debug, Clone)]
pub enum SamplingStrategy {
    /// 始终记录
    Always,

    /// 从不记录
    Never,

    /// 按键限流：每个窗口内每个键最多 N 条
    PerKey { burst: u32, window: Duration },
}

/// 采样结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    /// 记录日志，附带此前被抑制的条数
    Emit { suppressed: u64 },
    /// 抑制
    Suppress,
}

impl SampleDecision {
    pub fn should_emit(&self) -> bool {
        matches!(self, SampleDecision::Emit { .. })
    }
}

#[derive(Debug)]
struct KeyWindow {
    started: Instant,
    emitted: u32,
    suppressed: u64,
}

/// 日志采样器
///
/// 用于重复出现的设备故障日志；故障本身仍会写入状态记录
#[derive(Debug)]
pub struct LogSampler {
    strategy: SamplingStrategy,
    windows: Mutex<HashMap<String, KeyWindow>>,
}

impl LogSampler {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self {
            strategy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 每个键每分钟最多 `burst` 条
    pub fn per_minute(burst: u32) -> Self {
        Self::new(SamplingStrategy::PerKey {
            burst,
            window: Duration::from_secs(60),
        })
    }

    /// 判断该键的日志是否应该记录
    pub fn sample(&self, key: &str) -> SampleDecision {
        self.sample_at(key, Instant::now())
    }

    fn sample_at(&self, key: &str, now: Instant) -> SampleDecision {
        let (burst, window) = match &self.strategy {
            SamplingStrategy::Always => return SampleDecision::Emit { suppressed: 0 },
            SamplingStrategy::Never => return SampleDecision::Suppress,
            SamplingStrategy::PerKey { burst, window } => (*burst, *window),
        };

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = windows.entry(key.to_string()).or_insert(KeyWindow {
            started: now,
            emitted: 0,
            suppressed: 0,
        });

        // 窗口到期后重置计数
        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.emitted = 0;
        }

        if entry.emitted < burst {
            entry.emitted += 1;
            let suppressed = std::mem::take(&mut entry.suppressed);
            SampleDecision::Emit { suppressed }
        } else {
            entry.suppressed += 1;
            SampleDecision::Suppress
        }
    }

    /// 清除某个键的状态（设备恢复时调用）
    pub fn reset(&self, key: &str) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(key);
        }
    }
}

impl Default for LogSampler {
    fn default() -> Self {
        Self::new(SamplingStrategy::Always)
    }
}
