//! Start-restore options and the supported type declarations
//!
//! The option set mirrors what the official restore host sends: a common
//! block for every target, a macOS block for Apple Silicon Macs, and the
//! mobile block for everything else. The supported data/message type
//! tables were captured from the official host and declare which side
//! initiates each item.

use log::debug;
use plist::Value;

use crate::util::dict_copy_item;

use super::RestoreContext;

// Extracted from ac2
pub(crate) fn supported_data_types() -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (name, supported) in [
        ("BasebandBootData", false),
        ("BasebandData", false),
        ("BasebandStackData", false),
        ("BasebandUpdaterOutputData", false),
        ("BootabilityBundle", false),
        ("BuildIdentityDict", false),
        ("BuildIdentityDictV2", false),
        ("DataType", false),
        ("DiagData", false),
        ("EANData", false),
        ("FDRMemoryCommit", false),
        ("FDRTrustData", false),
        ("FUDData", false),
        ("FileData", false),
        ("FileDataDone", false),
        ("FirmwareUpdaterData", false),
        ("GrapeFWData", false),
        ("HPMFWData", false),
        ("HostSystemTime", true),
        ("KernelCache", false),
        ("NORData", false),
        ("NitrogenFWData", true),
        ("OpalFWData", false),
        ("OverlayRootDataCount", false),
        ("OverlayRootDataForKey", true),
        ("PeppyFWData", true),
        ("PersonalizedBootObjectV3", false),
        ("PersonalizedData", true),
        ("ProvisioningData", false),
        ("RamdiskFWData", true),
        ("RecoveryOSASRImage", true),
        ("RecoveryOSAppleLogo", true),
        ("RecoveryOSDeviceTree", true),
        ("RecoveryOSFileAssetImage", true),
        ("RecoveryOSIBEC", true),
        ("RecoveryOSIBootFWFilesImages", true),
        ("RecoveryOSImage", true),
        ("RecoveryOSKernelCache", true),
        ("RecoveryOSLocalPolicy", true),
        ("RecoveryOSOverlayRootDataCount", false),
        ("RecoveryOSRootTicketData", true),
        ("RecoveryOSStaticTrustCache", true),
        ("RecoveryOSVersionData", true),
        ("RootData", false),
        ("RootTicket", false),
        ("S3EOverride", false),
        ("SourceBootObjectV3", false),
        ("SourceBootObjectV4", false),
        ("SsoServiceTicket", false),
        ("StockholmPostflight", false),
        ("SystemImageCanonicalMetadata", false),
        ("SystemImageData", false),
        ("SystemImageRootHash", false),
        ("USBCFWData", false),
        ("USBCOverride", false),
    ] {
        dict.insert(name.to_string(), supported.into());
    }
    dict
}

// Extracted from ac2
pub(crate) fn supported_message_types() -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (name, supported) in [
        ("BBUpdateStatusMsg", false),
        ("CheckpointMsg", true),
        ("DataRequestMsg", false),
        ("FDRSubmit", true),
        ("MsgType", false),
        ("PreviousRestoreLogMsg", false),
        ("ProgressMsg", false),
        ("ProvisioningAck", false),
        ("ProvisioningInfo", false),
        ("ProvisioningStatusMsg", false),
        ("ReceivedFinalStatusMsg", false),
        ("RestoredCrash", true),
        ("StatusMsg", false),
    ] {
        dict.insert(name.to_string(), supported.into());
    }
    dict
}

/// Assembles the options dictionary sent with the StartRestore request.
pub fn build_restore_options(ctx: &RestoreContext) -> plist::Dictionary {
    let identity = &ctx.build_identity;
    let mut opts = plist::Dictionary::new();
    opts.insert("AutoBootDelay".into(), 0u64.into());

    if let Some(preflight) = &ctx.preflight_info {
        let mut bbus = preflight.clone();
        bbus.remove("FusingStatus");
        bbus.remove("PkHash");
        opts.insert("BBUpdaterState".into(), Value::Dictionary(bbus));

        dict_copy_item(&mut opts, "BasebandNonce", preflight, "Nonce");
    }

    opts.insert(
        "SupportedDataTypes".into(),
        Value::Dictionary(supported_data_types()),
    );
    opts.insert(
        "SupportedMessageTypes".into(),
        Value::Dictionary(supported_message_types()),
    );

    if ctx.macos_variant.is_some() {
        opts.insert("AddSystemPartitionPadding".into(), true.into());
        opts.insert("AllowUntetheredRestore".into(), false.into());
        opts.insert("AuthInstallEnableSso".into(), false.into());
        if let Some(macos_variant) = identity.macos_variant() {
            opts.insert(
                "AuthInstallRecoveryOSVariant".into(),
                macos_variant.into(),
            );
        }
        opts.insert(
            "AuthInstallRestoreBehavior".into(),
            if ctx.flags.erase { "Erase" } else { "Update" }.into(),
        );
        opts.insert("AutoBootDelay".into(), 0u64.into());
        opts.insert("BasebandUpdaterOutputPath".into(), true.into());
        opts.insert("DisableUserAuthentication".into(), true.into());
        opts.insert("FitSystemPartitionToContent".into(), true.into());
        opts.insert("FlashNOR".into(), true.into());
        opts.insert("FormatForAPFS".into(), true.into());
        opts.insert("FormatForLwVM".into(), false.into());
        opts.insert("InstallDiags".into(), false.into());
        opts.insert("InstallRecoveryOS".into(), true.into());
        opts.insert("MacOSSwapPerformed".into(), true.into());
        opts.insert("MacOSVariantPresent".into(), true.into());
        opts.insert("MinimumBatteryVoltage".into(), 0u64.into());
        opts.insert("RecoveryOSUnpack".into(), true.into());
        opts.insert("ShouldRestoreSystemImage".into(), true.into());
        opts.insert("SkipPreflightPersonalization".into(), false.into());
        opts.insert("UpdateBaseband".into(), true.into());
        // matches OSVarContentSize in the build identity, origin unknown;
        // verified against multiple macOS builds
        opts.insert("recoveryOSPartitionSize".into(), 58201u64.into());
        if let Some(msp) = identity.minimum_system_partition() {
            opts.insert("SystemPartitionSize".into(), msp.clone());
        }
    } else {
        opts.insert("BootImageType".into(), "UserOrInternal".into());
        opts.insert("DFUFileType".into(), "RELEASE".into());
        opts.insert("DataImage".into(), false.into());
        opts.insert("FirmwareDirectory".into(), ".".into());
        opts.insert("FlashNOR".into(), true.into());
        opts.insert("KernelCacheType".into(), "Release".into());
        opts.insert("NORImageType".into(), "production".into());
        opts.insert("RestoreBundlePath".into(), "/tmp/Per2.tmp".into());
        opts.insert("SystemImageType".into(), "User".into());
        opts.insert("UpdateBaseband".into(), false.into());

        if let Some(capacity) = identity
            .component_entry("SEP")
            .and_then(|sep| sep.get("Info"))
            .and_then(|info| info.as_dictionary())
            .and_then(|info| info.get("RequiredCapacity"))
        {
            if let Some(sval) = capacity.as_string() {
                debug!("TZ0RequiredCapacity: {sval}");
            }
            opts.insert("TZ0RequiredCapacity".into(), capacity.clone());
        }
        // mandatory on iOS 7+ to allow restore from normal mode
        opts.insert("PersonalizedDuringPreflight".into(), true.into());
    }

    opts.insert("RootToInstall".into(), false.into());
    opts.insert(
        "UUID".into(),
        uuid::Uuid::new_v4().to_string().to_uppercase().into(),
    );
    opts.insert("CreateFilesystemPartitions".into(), true.into());
    opts.insert("SystemImage".into(), true.into());
    if let Some(boot_args) = &ctx.restore_boot_args {
        opts.insert("RestoreBootArgs".into(), boot_args.clone().into());
    }

    let padding = match identity.system_partition_padding() {
        Some(spp) => spp.clone(),
        None => {
            let mut spp = plist::Dictionary::new();
            spp.insert("128".into(), 1280u64.into());
            spp.insert("16".into(), 160u64.into());
            spp.insert("32".into(), 320u64.into());
            spp.insert("64".into(), 640u64.into());
            spp.insert("8".into(), 80u64.into());
            Value::Dictionary(spp)
        }
    };
    opts.insert("SystemPartitionPadding".into(), padding);

    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::tests::test_context;

    #[test]
    fn test_supported_types_cover_the_protocol() {
        let data_types = supported_data_types();
        for key in ["SystemImageData", "NORData", "BasebandData", "BootabilityBundle"] {
            assert!(data_types.get(key).is_some(), "missing {key}");
        }
        let message_types = supported_message_types();
        for key in ["DataRequestMsg", "StatusMsg", "ProgressMsg", "CheckpointMsg"] {
            assert!(message_types.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_mobile_options() {
        let (ctx, _dir) = test_context(&[]);
        let opts = build_restore_options(&ctx);

        assert_eq!(
            opts.get("AutoBootDelay").and_then(|v| v.as_unsigned_integer()),
            Some(0)
        );
        assert_eq!(
            opts.get("BootImageType").and_then(|v| v.as_string()),
            Some("UserOrInternal")
        );
        assert_eq!(
            opts.get("RestoreBundlePath").and_then(|v| v.as_string()),
            Some("/tmp/Per2.tmp")
        );
        assert_eq!(
            opts.get("CreateFilesystemPartitions").and_then(|v| v.as_boolean()),
            Some(true)
        );
        assert_eq!(
            opts.get("SystemImage").and_then(|v| v.as_boolean()),
            Some(true)
        );
        assert!(opts.get("UUID").is_some());
        assert!(opts.get("SystemPartitionPadding").is_some());
        assert!(opts.get("AuthInstallRestoreBehavior").is_none());
    }

    #[test]
    fn test_macos_options() {
        let (mut ctx, _dir) = test_context(&[]);
        ctx.macos_variant = Some("macOS Customer".to_string());
        ctx.flags.erase = true;
        let opts = build_restore_options(&ctx);

        assert_eq!(
            opts.get("AuthInstallRestoreBehavior").and_then(|v| v.as_string()),
            Some("Erase")
        );
        assert_eq!(
            opts.get("FormatForAPFS").and_then(|v| v.as_boolean()),
            Some(true)
        );
        assert_eq!(
            opts.get("InstallRecoveryOS").and_then(|v| v.as_boolean()),
            Some(true)
        );
        assert!(opts.get("recoveryOSPartitionSize").is_some());
        assert!(opts.get("BootImageType").is_none());
    }

    #[test]
    fn test_default_partition_padding() {
        let (ctx, _dir) = test_context(&[]);
        let opts = build_restore_options(&ctx);
        let padding = opts
            .get("SystemPartitionPadding")
            .and_then(|v| v.as_dictionary())
            .unwrap();
        assert_eq!(padding.get("8").and_then(|v| v.as_unsigned_integer()), Some(80));
        assert_eq!(
            padding.get("128").and_then(|v| v.as_unsigned_integer()),
            Some(1280)
        );
    }
}
