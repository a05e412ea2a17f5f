//! Restore daemon RPC client
//!
//! While a device is in restore mode it runs a single service,
//! `com.apple.mobile.restored`, speaking length-prefixed XML property
//! lists: a big-endian `u32` byte count followed by the document. Unlike
//! lockdownd there is no TLS upgrade; the conversation stays in the
//! clear for the lifetime of the session.

use std::io::BufWriter;
use std::time::Duration;

use log::debug;
use plist::Value;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::util::{dict_get_string, dict_get_uint};
use crate::{pretty_print_dictionary, ReadWrite, RestoreError};

/// The service type restored reports from a QueryType request.
pub const RESTORED_SERVICE_TYPE: &str = "com.apple.mobile.restored";

/// Client for one connection to the restore daemon.
pub struct RestoredClient {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
}

impl RestoredClient {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queries the service type and protocol version.
    ///
    /// # Errors
    /// Returns [`RestoreError::NotRestoreMode`] when the responding
    /// service is not restored.
    pub async fn query_type(&mut self) -> Result<(String, u64), RestoreError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(req).await?;

        let res = self.read_plist().await?;
        let service_type = dict_get_string(&res, "Type")
            .ok_or(RestoreError::UnexpectedResponse)?
            .to_string();
        if service_type != RESTORED_SERVICE_TYPE {
            return Err(RestoreError::NotRestoreMode);
        }
        let version = dict_get_uint(&res, "RestoreProtocolVersion").unwrap_or(0);
        Ok((service_type, version))
    }

    /// Queries a runtime value such as `HardwareInfo` or `SavedDebugInfo`.
    pub async fn query_value(&mut self, key: &str) -> Result<Option<Value>, RestoreError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryValue".into());
        req.insert("QueryKey".into(), key.into());
        self.send_plist(req).await?;

        let mut res = self.read_plist().await?;
        Ok(res.remove(key))
    }

    /// Reads a stored value such as `SerialNumber` or `HardwareModel`.
    pub async fn get_value(&mut self, key: &str) -> Result<Option<Value>, RestoreError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "GetValue".into());
        req.insert("GetKey".into(), key.into());
        self.send_plist(req).await?;

        let mut res = self.read_plist().await?;
        Ok(res.remove("Value").or_else(|| res.remove(key)))
    }

    /// Sends a reply dictionary to the daemon.
    pub async fn send(&mut self, dict: plist::Dictionary) -> Result<(), RestoreError> {
        self.send_plist(dict).await
    }

    /// Receives the next message, returning `None` when nothing arrives
    /// within `timeout`. A timeout is not an error; the main loop just
    /// polls again.
    pub async fn receive(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<plist::Dictionary>, RestoreError> {
        match tokio::time::timeout(timeout, self.read_plist()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Kicks off the restore with the assembled options dictionary.
    pub async fn start_restore(
        &mut self,
        options: plist::Dictionary,
        protocol_version: u64,
    ) -> Result<(), RestoreError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "StartRestore".into());
        req.insert("RestoreOptions".into(), Value::Dictionary(options));
        req.insert("RestoreProtocolVersion".into(), protocol_version.into());
        self.send_plist(req).await
    }

    /// Requests a reboot out of restore mode. The daemon goes away
    /// without replying.
    pub async fn reboot(&mut self) -> Result<(), RestoreError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "Reboot".into());
        self.send_plist(req).await
    }

    async fn send_plist(&mut self, message: plist::Dictionary) -> Result<(), RestoreError> {
        if let Some(socket) = &mut self.socket {
            debug!("Sending plist: {}", pretty_print_dictionary(&message));

            let buf = Vec::new();
            let mut writer = BufWriter::new(buf);
            plist::to_writer_xml(&mut writer, &message)?;
            let message = writer.into_inner().unwrap();
            let len = message.len() as u32;
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(&message).await?;
            socket.flush().await?;
            Ok(())
        } else {
            Err(RestoreError::NoEstablishedConnection)
        }
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, RestoreError> {
        if let Some(socket) = &mut self.socket {
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            let len = u32::from_be_bytes(buf);
            let mut buf = vec![0; len as usize];
            socket.read_exact(&mut buf).await?;
            let res: plist::Dictionary = plist::from_bytes(&buf)?;
            debug!("Received plist: {}", pretty_print_dictionary(&res));
            Ok(res)
        } else {
            Err(RestoreError::NoEstablishedConnection)
        }
    }
}

impl std::fmt::Debug for RestoredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoredClient")
            .field("label", &self.label)
            .finish()
    }
}
