//! Filesystem transfer seam
//!
//! The system image travels over the device's image-restore service
//! (ASR), which validates chunks it samples from arbitrary offsets and
//! then pulls the whole payload. The wire protocol is a collaborator
//! concern; the engine hands off the payload path and a progress sink.

use std::path::Path;

use async_trait::async_trait;

use crate::RestoreError;

#[async_trait]
pub trait FilesystemTransfer: Send + Sync {
    /// Connects to the image-restore service, lets it validate the
    /// payload, then streams the whole image.
    async fn send_filesystem(
        &self,
        filesystem: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), RestoreError>;
}
