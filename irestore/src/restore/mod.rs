//! The restore session: shared context, the orchestrator, and the
//! message pump that drives a device through a firmware restore.

pub mod baseband;
pub mod bbfw;
pub mod bootability;
pub mod dispatch;
pub mod fwupdater;
pub mod nor;
pub mod options;
pub mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use plist::Value;
use tokio::sync::Notify;

use crate::asr::FilesystemTransfer;
use crate::build_identity::{
    BuildIdentity, BuildManifest, VARIANT_ERASE_INSTALL, VARIANT_MACOS_RECOVERY_OS,
    VARIANT_UPGRADE_INSTALL,
};
use crate::component::Personalizer;
use crate::fdr::SideChannel;
use crate::ipsw::Ipsw;
use crate::provider::DeviceProvider;
use crate::restored::RestoredClient;
use crate::util::{dict_get_bool, dict_get_dict, dict_get_string, dict_get_uint};
use crate::RestoreError;

pub use progress::RestoreStep;

/// How long one receive poll waits before the loop re-checks its flags.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a reboot waits for the mode-change notification.
const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);

pub type ProgressCallback = Box<dyn Fn(RestoreStep, f64) + Send + Sync>;

/// Identity of the device being restored.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub ecid: u64,
    pub udid: String,
    pub serial: String,
    pub hardware_model: String,
    pub image4_supported: bool,
}

/// Behavior switches for the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreFlags {
    /// Erase install instead of an upgrade install.
    pub erase: bool,
    /// Custom firmware without TSS tickets.
    pub custom: bool,
    /// Skip sending NOR data and end the restore instead.
    pub exclude_nor: bool,
    /// Keep going after a handler fails.
    pub ignore_errors: bool,
    pub debug: bool,
}

/// Everything the handlers share for the lifetime of one session.
pub struct RestoreContext {
    pub device: DeviceInfo,
    pub ipsw: Ipsw,
    pub build_manifest: BuildManifest,
    pub build_identity: BuildIdentity,
    /// Path of the filesystem payload handed to the image-restore service.
    pub filesystem: PathBuf,
    pub flags: RestoreFlags,
    pub tss_url: String,

    /// The main AP ticket response.
    pub tss: Option<plist::Dictionary>,
    pub tss_recoveryos_root_ticket: Option<plist::Dictionary>,
    pub tss_localpolicy: Option<plist::Dictionary>,
    /// Explicit root ticket bytes overriding the TSS response.
    pub root_ticket: Option<Vec<u8>>,

    /// Set when the target is a macOS device; holds the install variant.
    pub macos_variant: Option<String>,
    pub preflight_info: Option<plist::Dictionary>,
    pub restore_boot_args: Option<String>,

    pub personalizer: Box<dyn Personalizer>,
    pub progress: Option<ProgressCallback>,
    /// Signaled by the caller's device monitor when the device leaves
    /// restore mode; the reboot path waits on it.
    pub device_event: Arc<Notify>,

    /// Baseband ticket cache, written once on the first baseband round-trip.
    pub(crate) bbtss: Option<plist::Dictionary>,
    pub(crate) protocol_version: u64,
    pub(crate) quit: bool,
    pub(crate) last_operation: i64,
}

impl RestoreContext {
    pub fn new(
        device: DeviceInfo,
        ipsw: Ipsw,
        build_manifest: BuildManifest,
        build_identity: BuildIdentity,
        filesystem: impl Into<PathBuf>,
        personalizer: Box<dyn Personalizer>,
    ) -> Self {
        Self {
            device,
            ipsw,
            build_manifest,
            build_identity,
            filesystem: filesystem.into(),
            flags: RestoreFlags::default(),
            tss_url: crate::tss::TSS_CONTROLLER_ACTION_URL.to_string(),
            tss: None,
            tss_recoveryos_root_ticket: None,
            tss_localpolicy: None,
            root_ticket: None,
            macos_variant: None,
            preflight_info: None,
            restore_boot_args: None,
            personalizer,
            progress: None,
            device_event: Arc::new(Notify::new()),
            bbtss: None,
            protocol_version: 0,
            quit: false,
            last_operation: -1,
        }
    }

    pub(crate) fn report_progress(&self, step: RestoreStep, fraction: f64) {
        if let Some(progress) = &self.progress {
            progress(step, fraction);
        }
    }

    /// The build identity to serve: the recovery OS identity, or the
    /// erase/upgrade identity matching the session flags.
    pub(crate) fn build_identity_for(
        &self,
        is_recovery_os: bool,
    ) -> Result<BuildIdentity, RestoreError> {
        let variant = if is_recovery_os {
            VARIANT_MACOS_RECOVERY_OS
        } else if self.flags.erase {
            VARIANT_ERASE_INSTALL
        } else {
            VARIANT_UPGRADE_INSTALL
        };
        self.build_manifest
            .identity_for_model(&self.device.hardware_model, variant)
            .ok_or(RestoreError::MalformedBuildIdentity("BuildIdentities"))
    }

    pub(crate) fn build_identity_for_request(
        &self,
        msg: &plist::Dictionary,
    ) -> Result<BuildIdentity, RestoreError> {
        let is_recovery_os = dict_get_dict(msg, "Arguments")
            .map(|args| dict_get_bool(args, "IsRecoveryOS"))
            .unwrap_or(false);
        self.build_identity_for(is_recovery_os)
    }
}

/// Drives one device through a restore.
pub struct RestoreSession<P, A, S> {
    pub ctx: RestoreContext,
    provider: P,
    asr: A,
    side_channel: S,
    restored: Option<RestoredClient>,
}

impl<P, A, S> RestoreSession<P, A, S>
where
    P: DeviceProvider,
    A: FilesystemTransfer,
    S: SideChannel,
{
    pub fn new(ctx: RestoreContext, provider: P, asr: A, side_channel: S) -> Self {
        Self {
            ctx,
            provider,
            asr,
            side_channel,
            restored: None,
        }
    }

    /// Connects to the restore daemon, verifying the service type and
    /// that the responding device is the one this session is for.
    /// Retries `attempts` times, one second apart.
    pub async fn open_with_timeout(&mut self, attempts: u32) -> Result<(), RestoreError> {
        let mut last_err = RestoreError::NotRestoreMode;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match self.try_open().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("restore mode connection attempt {attempt} failed: {e}");
                    last_err = e;
                }
            }
        }
        error!("Unable to connect to device in restore mode");
        Err(last_err)
    }

    async fn try_open(&mut self) -> Result<(), RestoreError> {
        let mut restored = self.provider.connect_restored().await?;
        let (service_type, version) = restored.query_type().await?;
        info!("Connected to {service_type}, version {version}");
        self.ctx.protocol_version = version;

        if self.ctx.device.ecid != 0 {
            let hwinfo = restored.query_value("HardwareInfo").await?;
            let this_ecid = hwinfo
                .as_ref()
                .and_then(|v| v.as_dictionary())
                .and_then(|d| dict_get_uint(d, "UniqueChipID"))
                .unwrap_or(0);
            if this_ecid != self.ctx.device.ecid {
                return Err(RestoreError::NotRestoreMode);
            }
        }

        self.restored = Some(restored);
        Ok(())
    }

    async fn log_device_state(&mut self) {
        let restored = match self.restored.as_mut() {
            Some(r) => r,
            None => return,
        };

        if let Ok(Some(Value::Dictionary(hwinfo))) = restored.query_value("HardwareInfo").await {
            info!("Hardware Information:");
            if let Some(board_id) = dict_get_uint(&hwinfo, "BoardID") {
                info!("BoardID: {board_id}");
            }
            if let Some(chip_id) = dict_get_uint(&hwinfo, "ChipID") {
                info!("ChipID: {chip_id}");
            }
            if let Some(ecid) = dict_get_uint(&hwinfo, "UniqueChipID") {
                info!("UniqueChipID: {ecid}");
            }
            if let Some(production) = hwinfo.get("ProductionMode").and_then(|v| v.as_boolean()) {
                info!("ProductionMode: {production}");
            }
        }

        if let Ok(Some(Value::Dictionary(dbginfo))) = restored.query_value("SavedDebugInfo").await {
            if let Some(status) = dict_get_string(&dbginfo, "PreviousExitStatus") {
                info!("Previous restore exit status: {status}");
            }
            if let Some(usb_log) = dict_get_string(&dbginfo, "USBLog") {
                info!("USB log is available:\n{usb_log}");
            }
            if let Some(panic_log) = dict_get_string(&dbginfo, "PanicLog") {
                info!("Panic log is available:\n{panic_log}");
            }
        }
    }

    /// Runs the whole restore: opens the session if needed, starts the
    /// side channel, sends the start options, then answers the daemon
    /// until a terminal status or a fatal error.
    pub async fn run(&mut self) -> Result<(), RestoreError> {
        if self.restored.is_none() {
            self.open_with_timeout(1).await?;
        }
        info!(
            "Device {} has successfully entered restore mode",
            self.ctx.device.udid
        );

        self.log_device_state().await;

        // a main ticket carrying a BBTicket doubles as the baseband ticket
        if let Some(tss) = &self.ctx.tss {
            if tss.get("BBTicket").is_some() {
                self.ctx.bbtss = Some(tss.clone());
            }
        }

        if let Err(e) = self.side_channel.start().await {
            warn!("Could not start the side channel: {e}");
        }

        let opts = options::build_restore_options(&self.ctx);
        let restored = self.restored.as_mut().ok_or(RestoreError::NoEstablishedConnection)?;
        if let Err(e) = restored
            .start_restore(opts, self.ctx.protocol_version)
            .await
        {
            error!("Unable to start the restore process");
            self.side_channel.stop().await;
            return Err(e);
        }
        self.ctx.report_progress(RestoreStep::Prepare, 1.0);

        let result = self.message_pump().await;

        self.side_channel.stop().await;
        self.restored = None;
        result
    }

    /// Reads each message from the daemon and passes it to its handler.
    async fn message_pump(&mut self) -> Result<(), RestoreError> {
        let mut pending_error: Option<RestoreError> = None;

        while !self.ctx.quit {
            if let Some(err) = pending_error.take() {
                if self.ctx.flags.ignore_errors {
                    warn!("Attempting to continue after critical error, restore might fail: {err}");
                } else {
                    error!("Unable to successfully restore device: {err}");
                    self.ctx.quit = true;
                    return Err(err);
                }
            }

            let restored = self
                .restored
                .as_mut()
                .ok_or(RestoreError::NoEstablishedConnection)?;
            let message = match restored.receive(RECEIVE_TIMEOUT).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("No data to read (timeout)");
                    continue;
                }
                Err(e) => {
                    error!("Could not read data. Aborting.");
                    return Err(e);
                }
            };

            let msg_type = match dict_get_string(&message, "MsgType") {
                Some(t) => t.to_string(),
                None => {
                    debug!("Unknown message received:\n{}", crate::pretty_print_dictionary(&message));
                    continue;
                }
            };

            let outcome: Result<(), RestoreError> = match msg_type.as_str() {
                // sent whenever restored needs a file from the host
                "DataRequestMsg" => {
                    dispatch::handle_data_request(
                        self.restored.as_mut().unwrap(),
                        &mut self.ctx,
                        &self.provider,
                        &self.asr,
                        &message,
                    )
                    .await
                }
                // restore logs are available if a previous restore failed
                "PreviousRestoreLogMsg" => progress::handle_previous_restore_log_msg(&message),
                "ProgressMsg" => progress::handle_progress_msg(&mut self.ctx, &message),
                "StatusMsg" => {
                    let outcome = progress::handle_status_msg(&message);
                    if outcome.finished {
                        let mut done = plist::Dictionary::new();
                        done.insert("MsgType".into(), "ReceivedFinalStatusMsg".into());
                        let _ = self.restored.as_mut().unwrap().send(done).await;
                        self.ctx.quit = true;
                    }
                    match outcome.failure {
                        Some(failure) => Err(failure),
                        None => Ok(()),
                    }
                }
                "CheckpointMsg" => progress::handle_checkpoint_msg(&message),
                "BBUpdateStatusMsg" => progress::handle_bb_update_status_msg(&message),
                "BasebandUpdaterOutputData" => {
                    bootability::handle_baseband_updater_output(
                        &self.provider,
                        &self.ctx.device.udid,
                        &message,
                    )
                    .await
                }
                _ => {
                    debug!(
                        "Unknown message type received:\n{}",
                        crate::pretty_print_dictionary(&message)
                    );
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                pending_error = Some(e);
            }
        }

        Ok(())
    }

    /// Reboots the device out of restore mode, waiting for the caller's
    /// device monitor to observe the mode change.
    pub async fn reboot(&mut self) -> Result<(), RestoreError> {
        if self.restored.is_none() {
            self.open_with_timeout(1).await?;
        }

        info!("Rebooting restore mode device...");
        let restored = self
            .restored
            .as_mut()
            .ok_or(RestoreError::NoEstablishedConnection)?;
        restored.reboot().await?;
        self.restored = None;

        let notified = self.ctx.device_event.notified();
        match tokio::time::timeout(REBOOT_TIMEOUT, notified).await {
            Ok(()) => Ok(()),
            Err(_) => Err(RestoreError::StillInRestoreMode),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::asr::FilesystemTransfer;
    use crate::restored::tests::frame;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) struct NullTransfer;

    #[async_trait]
    impl FilesystemTransfer for NullTransfer {
        async fn send_filesystem(
            &self,
            _filesystem: &Path,
            _progress: &(dyn Fn(f64) + Send + Sync),
        ) -> Result<(), RestoreError> {
            Ok(())
        }
    }

    pub(crate) struct SeededProvider {
        client: Mutex<Option<RestoredClient>>,
    }

    impl SeededProvider {
        pub(crate) fn new(client: RestoredClient) -> Self {
            Self {
                client: Mutex::new(Some(client)),
            }
        }
    }

    impl DeviceProvider for SeededProvider {
        async fn connect_restored(&self) -> Result<RestoredClient, RestoreError> {
            self.client
                .lock()
                .unwrap()
                .take()
                .ok_or(RestoreError::NoEstablishedConnection)
        }

        async fn connect_port(&self, _port: u16) -> Result<Box<dyn crate::ReadWrite>, RestoreError> {
            Err(RestoreError::NoEstablishedConnection)
        }

        fn label(&self) -> &str {
            "test"
        }
    }

    /// A context over a throwaway IPSW holding `members`, with an
    /// identity personalizer and a manifest whose erase identity matches
    /// the context's own identity.
    pub(crate) fn test_context(
        members: &[(&str, &[u8])],
    ) -> (RestoreContext, tempfile::TempDir) {
        test_context_with_manifest(members, &[])
    }

    pub(crate) fn test_context_with_manifest(
        members: &[(&str, &[u8])],
        components: &[(&str, plist::Value)],
    ) -> (RestoreContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ipsw_path = dir.path().join("fixture.ipsw");
        crate::ipsw::tests::write_zip(&ipsw_path, members);

        let mut manifest_dict = plist::Dictionary::new();
        for (name, entry) in components {
            manifest_dict.insert((*name).to_string(), entry.clone());
        }
        let mut info = plist::Dictionary::new();
        info.insert("DeviceClass".into(), "d53gap".into());
        info.insert("Variant".into(), VARIANT_ERASE_INSTALL.into());
        let mut identity_dict = plist::Dictionary::new();
        identity_dict.insert("Info".into(), plist::Value::Dictionary(info));
        identity_dict.insert("Manifest".into(), plist::Value::Dictionary(manifest_dict));
        let identity = BuildIdentity::new(identity_dict.clone());

        let mut bm = plist::Dictionary::new();
        bm.insert(
            "BuildIdentities".into(),
            plist::Value::Array(vec![plist::Value::Dictionary(identity_dict)]),
        );

        let device = DeviceInfo {
            ecid: 0x1122334455,
            udid: "0000110-aabbccdd".to_string(),
            serial: "C0FFEE".to_string(),
            hardware_model: "d53gap".to_string(),
            image4_supported: true,
        };

        let personalizer: Box<dyn Personalizer> = Box::new(
            |_component: &str, data: Vec<u8>, _ticket: &plist::Dictionary| -> Result<Vec<u8>, RestoreError> {
                Ok(data)
            },
        );

        let mut ctx = RestoreContext::new(
            device,
            Ipsw::open(&ipsw_path).unwrap(),
            BuildManifest::new(bm),
            identity,
            dir.path().join("fs.dmg"),
            personalizer,
        );
        ctx.flags.erase = true;
        (ctx, dir)
    }

    #[tokio::test]
    async fn test_terminal_status_ends_the_session() {
        let (ctx, _dir) = test_context(&[]);

        let (client_side, mut server_side) = tokio::io::duplex(256 * 1024);
        let client = RestoredClient::new(Box::new(client_side), "irestore");
        let provider = SeededProvider::new(client);

        async fn read_message(stream: &mut tokio::io::DuplexStream) -> plist::Dictionary {
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut body).await.unwrap();
            plist::from_bytes(&body).unwrap()
        }

        let server = tokio::spawn(async move {
            // QueryType handshake
            let req = read_message(&mut server_side).await;
            assert_eq!(
                req.get("Request").and_then(|v| v.as_string()),
                Some("QueryType")
            );
            let mut res = plist::Dictionary::new();
            res.insert(
                "Type".into(),
                crate::restored::RESTORED_SERVICE_TYPE.into(),
            );
            res.insert("RestoreProtocolVersion".into(), 15u64.into());
            server_side.write_all(&frame(&res)).await.unwrap();

            // HardwareInfo and SavedDebugInfo probes get empty answers
            for _ in 0..2 {
                let req = read_message(&mut server_side).await;
                assert_eq!(
                    req.get("Request").and_then(|v| v.as_string()),
                    Some("QueryValue")
                );
                server_side
                    .write_all(&frame(&plist::Dictionary::new()))
                    .await
                    .unwrap();
            }

            // StartRestore with the options dictionary
            let req = read_message(&mut server_side).await;
            assert_eq!(
                req.get("Request").and_then(|v| v.as_string()),
                Some("StartRestore")
            );
            assert!(req.get("RestoreOptions").is_some());

            // terminal status
            let mut status = plist::Dictionary::new();
            status.insert("MsgType".into(), "StatusMsg".into());
            status.insert("Status".into(), 0u64.into());
            server_side.write_all(&frame(&status)).await.unwrap();

            // the host acknowledges with ReceivedFinalStatusMsg
            let req = read_message(&mut server_side).await;
            assert_eq!(
                req.get("MsgType").and_then(|v| v.as_string()),
                Some("ReceivedFinalStatusMsg")
            );
        });

        let mut session = RestoreSession::new(ctx, provider, NullTransfer, ());
        // ecid probing is skipped when the context carries none
        session.ctx.device.ecid = 0;
        session.run().await.unwrap();
        server.await.unwrap();
    }

    #[test]
    fn test_build_identity_for_request_variants() {
        let (ctx, _dir) = test_context(&[]);

        let mut args = plist::Dictionary::new();
        args.insert("IsRecoveryOS".into(), false.into());
        let mut msg = plist::Dictionary::new();
        msg.insert("Arguments".into(), plist::Value::Dictionary(args));

        assert!(ctx.build_identity_for_request(&msg).is_ok());

        // no recovery OS identity in the fixture manifest
        let mut args = plist::Dictionary::new();
        args.insert("IsRecoveryOS".into(), true.into());
        let mut msg = plist::Dictionary::new();
        msg.insert("Arguments".into(), plist::Value::Dictionary(args));
        assert!(ctx.build_identity_for_request(&msg).is_err());
    }
}
