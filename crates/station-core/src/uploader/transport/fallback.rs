use async_trait::async_trait;
use std::path::Path;
use tracing::warn;

use super::{TransferReceipt, Transport};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Primary,
    Secondary,
}

/// 主目标连接失败时改用备用目标
///
/// 每次重新连接都先尝试主目标
pub struct FallbackTransport {
    primary: Box<dyn Transport>,
    secondary: Box<dyn Transport>,
    active: Option<Active>,
}

impl FallbackTransport {
    pub fn new(primary: Box<dyn Transport>, secondary: Box<dyn Transport>) -> Self {
        Self {
            primary,
            secondary,
            active: None,
        }
    }

    /// 当前是否在使用备用目标
    pub fn on_fallback(&self) -> bool {
        self.active == Some(Active::Secondary)
    }

    fn current(&mut self) -> Option<&mut Box<dyn Transport>> {
        match self.active {
            Some(Active::Primary) => Some(&mut self.primary),
            Some(Active::Secondary) => Some(&mut self.secondary),
            None => None,
        }
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        match self.primary.connect().await {
            Ok(()) => {
                self.active = Some(Active::Primary);
                Ok(())
            }
            Err(primary_err) => {
                warn!(
                    primary = self.primary.kind(),
                    error = %primary_err,
                    "Primary destination unreachable, trying fallback"
                );
                match self.secondary.connect().await {
                    Ok(()) => {
                        self.active = Some(Active::Secondary);
                        Ok(())
                    }
                    Err(secondary_err) => {
                        self.active = None;
                        Err(TransportError::connection(format!(
                            "primary: {primary_err}; fallback: {secondary_err}"
                        )))
                    }
                }
            }
        }
    }

    async fn send(&mut self, local: &Path, remote: &Path) -> Result<TransferReceipt, TransportError> {
        match self.current() {
            Some(transport) => transport.send(local, remote).await,
            None => Err(TransportError::NotConnected),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(transport) = self.current() {
            transport.disconnect().await;
        }
        self.active = None;
    }

    fn is_connected(&self) -> bool {
        match self.active {
            Some(Active::Primary) => self.primary.is_connected(),
            Some(Active::Secondary) => self.secondary.is_connected(),
            None => false,
        }
    }

    fn kind(&self) -> &'static str {
        "fallback"
    }
}
