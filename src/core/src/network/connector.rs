use async_trait::async_trait;
use log::{debug, info};
use std::time::Duration;
use tokio::net::TcpStream;

use super::channel::BackendChannel;
use super::request::TermSize;
use crate::authorization::{Asset, SystemUser};
use crate::error_handling::types::NetworkError;

/// Opens the backend side of a session.
#[async_trait]
pub trait AssetConnector: Send + Sync {
    async fn connect(
        &self,
        asset: &Asset,
        system_user: &SystemUser,
        size: TermSize,
    ) -> Result<BackendChannel, NetworkError>;
}

/// Plain TCP connection to `asset.ip:asset.port`.
///
/// The stream is bridged as is; any protocol spoken on it belongs to the two ends.
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl AssetConnector for TcpConnector {
    async fn connect(
        &self,
        asset: &Asset,
        system_user: &SystemUser,
        size: TermSize,
    ) -> Result<BackendChannel, NetworkError> {
        let addr = format!("{}:{}", asset.ip, asset.port);
        debug!(
            "Connecting to {} as {} ({}x{})",
            addr, system_user, size.width, size.height
        );

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetworkError::ConnectFailed(format!("{}: timed out", addr)))?
            .map_err(|e| NetworkError::ConnectFailed(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        info!("Connected to {} as {}", asset, system_user);
        Ok(BackendChannel::new(Box::new(stream)))
    }
}
