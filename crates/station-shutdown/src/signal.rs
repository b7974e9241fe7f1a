//! 停止请求
//!
//! 系统信号和管理接口的停止请求汇入同一个广播，关闭流程只订阅这一处。

use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGTERM（systemd 停止服务）
    Terminate,
    /// SIGINT / Ctrl+C
    Interrupt,
    /// 通过管理接口请求
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Terminate => "terminate",
            StopReason::Interrupt => "interrupt",
            StopReason::Requested => "requested",
        })
    }
}

/// 停止请求的广播端，克隆共享同一通道
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: broadcast::Sender<StopReason>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self { tx }
    }

    /// 请求停止；没有订阅者时返回 false
    pub fn request(&self, reason: StopReason) -> bool {
        info!(reason = %reason, "Stop requested");
        self.tx.send(reason).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StopReason> {
        self.tx.subscribe()
    }

    /// 把第一个 SIGTERM/SIGINT 转成停止请求
    ///
    /// 无法注册信号时立即请求停止，进程不会处于无法停止的状态
    pub fn forward_system_signals(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            match next_system_signal().await {
                Ok(reason) => {
                    signal.request(reason);
                }
                Err(e) => {
                    error!(error = %e, "Cannot listen for system signals");
                    signal.request(StopReason::Requested);
                }
            }
        })
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn next_system_signal() -> std::io::Result<StopReason> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let reason = tokio::select! {
        _ = sigterm.recv() => StopReason::Terminate,
        _ = sigint.recv() => StopReason::Interrupt,
    };
    Ok(reason)
}

#[cfg(not(unix))]
async fn next_system_signal() -> std::io::Result<StopReason> {
    tokio::signal::ctrl_c().await?;
    Ok(StopReason::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reaches_every_subscriber() {
        let signal = StopSignal::new();
        let mut first = signal.subscribe();
        let mut second = signal.clone().subscribe();

        assert!(signal.request(StopReason::Requested));
        assert_eq!(first.recv().await.unwrap(), StopReason::Requested);
        assert_eq!(second.recv().await.unwrap(), StopReason::Requested);
    }

    #[test]
    fn test_request_without_subscribers() {
        assert!(!StopSignal::new().request(StopReason::Terminate));
        assert_eq!(StopReason::Terminate.to_string(), "terminate");
    }
}
