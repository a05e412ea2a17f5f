//! Side channel seam
//!
//! While the main loop answers data requests, the device expects an
//! out-of-band control channel (the reverse proxy, or the legacy FDR
//! listener on older firmware) to service its network requests. The
//! protocol lives outside this crate; the session only starts the
//! channel before the restore and shuts it down afterwards.

use async_trait::async_trait;

use crate::RestoreError;

#[async_trait]
pub trait SideChannel: Send {
    async fn start(&mut self) -> Result<(), RestoreError>;
    async fn stop(&mut self);
}

/// No side channel; acceptable for targets that never open one.
#[async_trait]
impl SideChannel for () {
    async fn start(&mut self) -> Result<(), RestoreError> {
        Ok(())
    }

    async fn stop(&mut self) {}
}
