//! NOR data pipeline
//!
//! Collects every firmware payload flashed alongside LLB, personalizes
//! the lot, and shapes the reply the way the requesting flash stack
//! expects: keyed by component for FlashVersion1, as a bare array
//! otherwise (with iBoot pinned to the front).

use log::{error, info};
use plist::Value;

use crate::component;
use crate::restored::RestoredClient;
use crate::util::dict_get_dict;
use crate::RestoreError;

use super::RestoreContext;

/// Maps firmware directory file names to their manifest component names.
pub(crate) fn component_name_for_file(filename: &str) -> Option<&'static str> {
    const TABLE: &[(&str, &str)] = &[
        ("LLB", "LLB"),
        ("iBoot", "iBoot"),
        ("DeviceTree", "DeviceTree"),
        ("applelogo", "AppleLogo"),
        ("liquiddetect", "Liquid"),
        ("lowpowermode", "LowPowerWallet0"),
        ("recoverymode", "RecoveryMode"),
        ("batterylow0", "BatteryLow0"),
        ("batterylow1", "BatteryLow1"),
        ("glyphcharging", "BatteryCharging"),
        ("glyphplugin", "BatteryPlugin"),
        ("batterycharging0", "BatteryCharging0"),
        ("batterycharging1", "BatteryCharging1"),
        ("batteryfull", "BatteryFull"),
        ("needservice", "NeedService"),
        ("SCAB", "SCAB"),
        ("sep-firmware", "RestoreSEP"),
    ];
    TABLE
        .iter()
        .find(|(prefix, _)| filename.starts_with(prefix))
        .map(|(_, name)| *name)
}

/// Resolves the set of firmware files to flash as `(component, path)`
/// pairs: from the plain-text manifest next to LLB when the archive has
/// one, otherwise from the build identity's payload flags.
pub(crate) fn collect_firmware_files(
    ctx: &RestoreContext,
    llb_path: &str,
) -> Result<Vec<(String, String)>, RestoreError> {
    let firmware_dir = match llb_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => {
            error!("Unable to extract firmware path from LLB filename");
            return Err(RestoreError::MissingComponent("LLB".to_string()));
        }
    };

    let manifest_file = format!("{firmware_dir}/manifest");
    let mut files = Vec::new();
    if ctx.ipsw.file_exists(&manifest_file) {
        info!("Getting firmware manifest from {manifest_file}");
        let manifest_data = ctx.ipsw.extract_to_memory(&manifest_file)?;
        for filename in String::from_utf8_lossy(&manifest_data)
            .split(['\r', '\n'])
            .filter(|l| !l.is_empty())
        {
            if let Some(component) = component_name_for_file(filename) {
                files.push((
                    component.to_string(),
                    format!("{firmware_dir}/{filename}"),
                ));
            }
        }
    } else {
        info!("Getting firmware manifest from build identity");
        files = ctx.build_identity.firmware_payloads();
    }

    if files.is_empty() {
        error!("Unable to get list of firmware files.");
        return Err(RestoreError::MalformedBuildIdentity("firmware files"));
    }
    Ok(files)
}

fn personalize_from_path(ctx: &RestoreContext, component: &str, path: &str) -> Result<Vec<u8>, RestoreError> {
    let data = ctx.ipsw.extract_to_memory(path)?;
    let ticket = ctx.tss.as_ref().ok_or(RestoreError::TssMissingEntry("ticket"))?;
    ctx.personalizer.personalize(component, data, ticket)
}

pub(crate) fn build_nor_reply(
    ctx: &RestoreContext,
    message: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let flash_version_1 = dict_get_dict(message, "Arguments")
        .map(|args| args.get("FlashVersion1").is_some())
        .unwrap_or(false);

    let llb_path = component::component_path("LLB", ctx.tss.as_ref(), &ctx.build_identity)?;
    let firmware_files = collect_firmware_files(ctx, &llb_path)?;

    let mut dict = plist::Dictionary::new();
    let llb_data = personalize_from_path(ctx, "LLB", &llb_path)?;
    dict.insert("LlbImageData".into(), Value::Data(llb_data));

    let mut nor_dict = plist::Dictionary::new();
    let mut nor_array: Vec<Value> = Vec::new();
    for (component, path) in &firmware_files {
        // LLB went out as LlbImageData; RestoreSEP goes out separately
        if component == "LLB" || component == "RestoreSEP" {
            continue;
        }
        let data = personalize_from_path(ctx, component, path)?;
        if flash_version_1 {
            nor_dict.insert(component.clone(), Value::Data(data));
        } else if component.starts_with("iBoot") {
            // iBoot must be the first entry in the array
            nor_array.insert(0, Value::Data(data));
        } else {
            nor_array.push(Value::Data(data));
        }
    }
    if flash_version_1 {
        dict.insert("NorImageData".into(), Value::Dictionary(nor_dict));
    } else {
        dict.insert("NorImageData".into(), Value::Array(nor_array));
    }

    for (component, key) in [("RestoreSEP", "RestoreSEPImageData"), ("SEP", "SEPImageData")] {
        if !ctx.build_identity.has_component(component) {
            continue;
        }
        let path = ctx.build_identity.component_path(component)?;
        let data = personalize_from_path(ctx, component, &path)?;
        dict.insert(key.into(), Value::Data(data));
    }

    Ok(dict)
}

pub(crate) async fn send_nor(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    info!("About to send NORData...");
    let dict = build_nor_reply(ctx, message)?;
    info!("Sending NORData now...");
    restored.send(dict).await?;
    info!("Done sending NORData");
    Ok(())
}
