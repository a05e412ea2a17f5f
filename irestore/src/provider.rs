//! Device connection seam
//!
//! Discovery and pairing live outside this crate; the engine only needs
//! two things from whoever owns the transport: a fresh RPC channel to
//! the restore daemon, and raw connections to the numbered data ports
//! the daemon hands out for side streams.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::restored::RestoredClient;
use crate::{ReadWrite, RestoreError};

pub trait DeviceProvider: Send + Sync {
    /// Opens a new connection to the restore daemon service port.
    fn connect_restored(
        &self,
    ) -> impl std::future::Future<Output = Result<RestoredClient, RestoreError>> + Send;

    /// Opens a raw connection to a device TCP port, used for the
    /// BootabilityBundle and baseband updater output streams.
    fn connect_port(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<Box<dyn ReadWrite>, RestoreError>> + Send;

    fn label(&self) -> &str;
}

/// Provider for devices reachable over plain TCP (network restore or a
/// usbmuxd-forwarded socket).
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub label: String,
}

/// The service port restored listens on while the device is in restore mode.
pub const RESTORED_PORT: u16 = 62078;

impl DeviceProvider for TcpProvider {
    async fn connect_restored(&self) -> Result<RestoredClient, RestoreError> {
        let socket_addr = SocketAddr::new(self.addr, RESTORED_PORT);
        let stream = TcpStream::connect(socket_addr).await?;
        Ok(RestoredClient::new(Box::new(stream), self.label.clone()))
    }

    async fn connect_port(&self, port: u16) -> Result<Box<dyn ReadWrite>, RestoreError> {
        let socket_addr = SocketAddr::new(self.addr, port);
        let stream = TcpStream::connect(socket_addr).await?;
        Ok(Box::new(stream))
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }
}
