use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage failed: {0}")]
    Failed(String),

    #[error("Stage already executed")]
    AlreadyExecuted,
}

/// 关闭阶段
///
/// 按优先级依次执行（数字越小越先执行），每个阶段有独立超时
#[async_trait]
pub trait ShutdownStage: Send {
    /// 执行阶段
    async fn execute(&mut self) -> Result<(), StageError>;

    /// 阶段名称
    fn name(&self) -> &str;

    fn priority(&self) -> u32 {
        100
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// 阶段执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

type StageFuture = Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>>;

/// 由一个 future 构成的阶段
pub struct FnStage {
    name: String,
    priority: u32,
    timeout: Duration,
    future: Option<StageFuture>,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, priority: u32, timeout: Duration, future: F) -> Self
    where
        F: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            timeout,
            future: Some(Box::pin(future)),
        }
    }
}

#[async_trait]
impl ShutdownStage for FnStage {
    async fn execute(&mut self) -> Result<(), StageError> {
        match self.future.take() {
            Some(future) => future.await,
            None => Err(StageError::AlreadyExecuted),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
