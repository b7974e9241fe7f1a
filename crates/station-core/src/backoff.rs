use station_config::MAX_INTERVAL_SECS;
use std::time::Duration;
use tokio::time::Instant;

/// `from + delay`；溢出时退到一年后，仍溢出则为 `from`
pub fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(Duration::from_secs(MAX_INTERVAL_SECS)))
        .unwrap_or(from)
}

/// 指数退避：第 n 次失败后等待 `min(base * 2^(n-1), cap)`
///
/// 设备重新获取、上传任务重试和目标重连共用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// 第 `attempt` 次失败后的等待时间，`attempt == 0` 时为零
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        1u32.checked_shl(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// 记录一次失败并返回下次等待时间
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(16));
        let delays: Vec<u64> = (1..=7).map(|n| backoff.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_large_attempt_saturates_at_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(
            deadline_after(now, Duration::MAX),
            now + Duration::from_secs(MAX_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_next_delay_and_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
