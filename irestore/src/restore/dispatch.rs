//! DataRequestMsg dispatch
//!
//! restored asks for everything it needs by name; this module maps each
//! request type onto its handler and sends the reply. Handlers build the
//! reply dictionary separately from sending so the shapes stay testable.

use log::{debug, error, info};
use plist::Value;

use crate::asr::FilesystemTransfer;
use crate::component::load_personalized;
use crate::provider::DeviceProvider;
use crate::restored::RestoredClient;
use crate::tss;
use crate::util::{dict_get_bool, dict_get_dict, dict_get_path, dict_get_string};
use crate::RestoreError;

use super::progress::RestoreStep;
use super::{baseband, bootability, fwupdater, nor, RestoreContext};

/// Boot object payloads travel in chunks of this size.
const FILE_DATA_CHUNK_SIZE: usize = 8192;

/// Seed for a freshly personalized local policy: an IM4P with tag `lpol`
/// and an empty payload.
const LPOL_FILE: [u8; 22] = [
    0x30, 0x14, 0x16, 0x04, 0x49, 0x4d, 0x34, 0x50, 0x16, 0x04, 0x6c, 0x70, 0x6f, 0x6c, 0x16,
    0x04, 0x31, 0x2e, 0x30, 0x30, 0x30, 0x00,
];

pub(crate) async fn handle_data_request<P: DeviceProvider, A: FilesystemTransfer>(
    restored: &mut RestoredClient,
    ctx: &mut RestoreContext,
    provider: &P,
    asr: &A,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let data_type = match dict_get_string(message, "DataType") {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    let result = match data_type.as_str() {
        // sent when restored is ready to receive the filesystem
        "SystemImageData" | "RecoveryOSASRImage" => send_filesystem(ctx, asr).await,
        "BuildIdentityDict" => send_build_identity(restored, ctx, message).await,
        "PersonalizedBootObjectV3" => send_boot_object(restored, ctx, message, true).await,
        "SourceBootObjectV4" => send_boot_object(restored, ctx, message, false).await,
        "RecoveryOSLocalPolicy" => send_restore_local_policy(restored, ctx, message).await,
        "RecoveryOSRootTicketData" => send_recovery_os_root_ticket(restored, ctx).await,
        "RootTicket" => send_root_ticket(restored, ctx).await,
        "KernelCache" => send_component(restored, ctx, "KernelCache", None).await,
        "DeviceTree" => send_component(restored, ctx, "DeviceTree", None).await,
        "SystemImageRootHash" => {
            send_component(restored, ctx, "SystemVolume", Some("SystemImageRootHash")).await
        }
        "SystemImageCanonicalMetadata" => {
            send_component(
                restored,
                ctx,
                "Ap,SystemVolumeCanonicalMetadata",
                Some("SystemImageCanonicalMetadata"),
            )
            .await
        }
        "NORData" => {
            if ctx.flags.exclude_nor {
                info!("Not sending NORData... Quitting...");
                ctx.quit = true;
                Ok(())
            } else {
                nor::send_nor(restored, ctx, message).await
            }
        }
        "BasebandData" => baseband::send_baseband_data(restored, ctx, message).await,
        "FDRTrustData" => send_fdr_trust_data(restored).await,
        "FUDData" => {
            send_image_data(
                restored,
                ctx,
                message,
                "FUDImageList",
                Some("IsFUDFirmware"),
                "FUDImageData",
            )
            .await
        }
        "FirmwareUpdaterData" => {
            fwupdater::send_firmware_updater_data(restored, ctx, message).await
        }
        "PersonalizedData" => {
            send_image_data(restored, ctx, message, "ImageList", None, "ImageData").await
        }
        "EANData" => {
            send_image_data(
                restored,
                ctx,
                message,
                "EANImageList",
                Some("IsEarlyAccessFirmware"),
                "EANData",
            )
            .await
        }
        "BootabilityBundle" => {
            bootability::send_bootability_bundle(provider, &ctx.ipsw, message).await
        }
        other => {
            error!("Unknown data request '{other}' received");
            debug!("{}", crate::pretty_print_dictionary(message));
            Ok(())
        }
    };

    if result.is_err() {
        error!("Unable to send {data_type}");
    }
    result
}

async fn send_filesystem<A: FilesystemTransfer>(
    ctx: &RestoreContext,
    asr: &A,
) -> Result<(), RestoreError> {
    info!("About to send filesystem...");
    let progress = |fraction: f64| ctx.report_progress(RestoreStep::UploadFs, fraction);
    asr.send_filesystem(&ctx.filesystem, &progress).await?;
    info!("Done sending filesystem");
    Ok(())
}

pub(crate) fn build_identity_reply(
    ctx: &RestoreContext,
    message: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let identity = ctx.build_identity_for_request(message)?;

    let mut dict = plist::Dictionary::new();
    dict.insert(
        "BuildIdentityDict".into(),
        Value::Dictionary(identity.as_dictionary().clone()),
    );
    match dict_get_path(message, &["Arguments", "Variant"]) {
        Some(variant) => dict.insert("Variant".into(), variant.clone()),
        None => dict.insert("Variant".into(), "Erase".into()),
    };
    Ok(dict)
}

async fn send_build_identity(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    info!("About to send BuildIdentity Dict...");
    let dict = build_identity_reply(ctx, message)?;
    info!("Sending BuildIdentityDict now...");
    restored.send(dict).await?;
    info!("Done sending BuildIdentityDict");
    Ok(())
}

/// The root ticket bytes to send: an explicit override wins, then the
/// image4 ticket, then the legacy AP ticket.
pub(crate) fn root_ticket_bytes(
    ctx: &RestoreContext,
    source: Option<&plist::Dictionary>,
) -> Result<Option<Vec<u8>>, RestoreError> {
    if let Some(root_ticket) = &ctx.root_ticket {
        return Ok(Some(root_ticket.clone()));
    }
    let source = match source {
        Some(s) => s,
        None => {
            if ctx.flags.custom {
                return Ok(None);
            }
            error!("Cannot send RootTicket without TSS");
            return Err(RestoreError::TssMissingEntry("ticket"));
        }
    };
    let data = if ctx.device.image4_supported {
        tss::response_ap_img4_ticket(source)?
    } else {
        tss::response_ap_ticket(source)?
    };
    Ok(Some(data))
}

async fn send_root_ticket(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
) -> Result<(), RestoreError> {
    info!("About to send RootTicket...");
    let mut dict = plist::Dictionary::new();
    match root_ticket_bytes(ctx, ctx.tss.as_ref())? {
        Some(data) if !data.is_empty() => {
            dict.insert("RootTicketData".into(), Value::Data(data));
        }
        _ => info!("NOTE: not sending RootTicketData (no data present)"),
    }

    info!("Sending RootTicket now...");
    restored.send(dict).await?;
    info!("Done sending RootTicket");
    Ok(())
}

async fn send_recovery_os_root_ticket(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
) -> Result<(), RestoreError> {
    info!("About to send RecoveryOSRootTicket...");
    let source = if ctx.device.image4_supported {
        ctx.tss_recoveryos_root_ticket.as_ref()
    } else {
        ctx.tss.as_ref()
    };
    let mut dict = plist::Dictionary::new();
    match root_ticket_bytes(ctx, source)? {
        Some(data) if !data.is_empty() => {
            if ctx.root_ticket.is_some() {
                dict.insert("RecoveryOSRootTicketData".into(), Value::Data(data));
            } else {
                dict.insert("RootTicketData".into(), Value::Data(data));
            }
        }
        _ => info!("NOTE: not sending RootTicketData (no data present)"),
    }

    info!("Sending RecoveryOSRootTicket now...");
    restored.send(dict).await?;
    info!("Done sending RecoveryOS RootTicket");
    Ok(())
}

pub(crate) fn build_component_reply(
    ctx: &RestoreContext,
    component: &str,
    component_name: Option<&str>,
) -> Result<plist::Dictionary, RestoreError> {
    let component_name = component_name.unwrap_or(component);
    let data = load_personalized(
        component,
        ctx.tss.as_ref(),
        &ctx.build_identity,
        &ctx.ipsw,
        ctx.personalizer.as_ref(),
    )?;

    let mut dict = plist::Dictionary::new();
    dict.insert(format!("{component_name}File"), Value::Data(data));
    Ok(dict)
}

async fn send_component(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    component: &str,
    component_name: Option<&str>,
) -> Result<(), RestoreError> {
    let name = component_name.unwrap_or(component);
    info!("About to send {name}...");
    let dict = build_component_reply(ctx, component, component_name)?;
    info!("Sending {name} now...");
    restored.send(dict).await?;
    info!("Done sending {name}");
    Ok(())
}

/// The device-wide manifest for recovery OS installs lives at a fixed
/// archive path derived from the variant and device class.
pub(crate) fn extract_global_manifest(ctx: &RestoreContext) -> Result<Vec<u8>, RestoreError> {
    let identity = &ctx.build_identity;
    let device_class = identity
        .device_class()
        .ok_or(RestoreError::MalformedBuildIdentity("DeviceClass"))?;
    let macos_variant = identity
        .macos_variant()
        .ok_or(RestoreError::MalformedBuildIdentity("MacOSVariant"))?;
    let ticket_path =
        format!("Firmware/Manifests/restore/{macos_variant}/apticket.{device_class}.im4m");
    ctx.ipsw.extract_to_memory(&ticket_path)
}

/// Loads the payload for a boot object request: pseudo-names resolve to
/// archive metadata sent raw; anything else is a component, optionally
/// personalized.
pub(crate) fn load_boot_object(
    ctx: &RestoreContext,
    message: &plist::Dictionary,
    personalized: bool,
) -> Result<(String, Vec<u8>), RestoreError> {
    let image_name = dict_get_path(message, &["Arguments", "ImageName"])
        .and_then(|v| v.as_string())
        .ok_or(RestoreError::MalformedMessage("ImageName"))?
        .to_string();

    let data = match image_name.as_str() {
        "__GlobalManifest__" => extract_global_manifest(ctx)?,
        "__RestoreVersion__" => ctx.ipsw.extract_to_memory("RestoreVersion.plist")?,
        "__SystemVersion__" => ctx.ipsw.extract_to_memory("SystemVersion.plist")?,
        component => {
            let path = match ctx
                .tss
                .as_ref()
                .and_then(|tss| tss::response_path_by_entry(tss, component))
            {
                Some(path) => path,
                None => {
                    debug!(
                        "No path for component {component} in TSS, will fetch from build identity"
                    );
                    let identity = ctx.build_identity_for_request(message)?;
                    identity.component_path(component)?
                }
            };
            let data = ctx.ipsw.extract_to_memory(&path)?;
            if personalized {
                let ticket = ctx.tss.as_ref().ok_or(RestoreError::TssMissingEntry("ticket"))?;
                ctx.personalizer.personalize(component, data, ticket)?
            } else {
                data
            }
        }
    };
    Ok((image_name, data))
}

async fn send_boot_object(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    message: &plist::Dictionary,
    personalized: bool,
) -> Result<(), RestoreError> {
    let (image_name, data) = load_boot_object(ctx, message, personalized)?;
    info!("About to send {image_name}...");

    info!("Sending {image_name} now...");
    for chunk in data.chunks(FILE_DATA_CHUNK_SIZE) {
        let mut dict = plist::Dictionary::new();
        dict.insert("FileData".into(), Value::Data(chunk.to_vec()));
        restored.send(dict).await?;
    }

    let mut done = plist::Dictionary::new();
    done.insert("FileDataDone".into(), true.into());
    restored.send(done).await?;

    info!("Done sending {image_name}");
    Ok(())
}

async fn send_restore_local_policy(
    restored: &mut RestoredClient,
    ctx: &mut RestoreContext,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let component = "Ap,LocalPolicy";

    // update installs have no dedicated recovery OS identity
    let identity = ctx.build_identity_for(ctx.flags.erase)?;
    let request = tss::local_policy_request(
        &identity,
        ctx.device.ecid,
        dict_get_dict(message, "Arguments"),
    );
    let response = request.send(&ctx.tss_url).await?;
    ctx.tss_localpolicy = Some(response);

    let ticket = ctx.tss_localpolicy.as_ref().unwrap();
    let data = ctx
        .personalizer
        .personalize(component, LPOL_FILE.to_vec(), ticket)?;

    let mut dict = plist::Dictionary::new();
    dict.insert("Ap,LocalPolicy".into(), Value::Data(data));
    restored.send(dict).await?;
    Ok(())
}

async fn send_fdr_trust_data(restored: &mut RestoredClient) -> Result<(), RestoreError> {
    info!("About to send FDR Trust data...");
    // an empty dictionary makes the device continue with FDR, matching
    // what the official restore host sends
    let dict = plist::Dictionary::new();
    info!("Sending FDR Trust data now...");
    restored.send(dict).await?;
    info!("Done sending FDR Trust Data");
    Ok(())
}

/// Builds the reply for the image-family requests (FUD, personalized,
/// EAN images): either the list of matching component names, or the
/// personalized payloads themselves.
pub(crate) fn build_image_data_reply(
    ctx: &RestoreContext,
    message: &plist::Dictionary,
    image_list_key: &str,
    image_type_key: Option<&str>,
    image_data_key: &str,
) -> Result<plist::Dictionary, RestoreError> {
    let arguments = dict_get_dict(message, "Arguments");
    let want_image_list = arguments
        .map(|args| dict_get_bool(args, image_list_key))
        .unwrap_or(false);
    let image_name = arguments.and_then(|args| dict_get_string(args, "ImageName"));

    let image_type_key = match image_type_key {
        Some(k) => k,
        None => arguments
            .and_then(|args| dict_get_string(args, "ImageType"))
            .ok_or(RestoreError::MalformedMessage("ImageType"))?,
    };

    let matching: Vec<String> = ctx
        .build_identity
        .components()
        .filter(|(name, _)| ctx.build_identity.component_has_flag(name, image_type_key))
        .map(|(name, _)| name.to_string())
        .collect();

    let mut dict = plist::Dictionary::new();
    if want_image_list {
        let list = matching.iter().map(|name| Value::from(name.as_str())).collect();
        info!("Sending {image_type_key} image list");
        dict.insert(image_list_key.into(), Value::Array(list));
        return Ok(dict);
    }

    let mut data_dict = plist::Dictionary::new();
    for name in &matching {
        if let Some(wanted) = image_name {
            if wanted != name.as_str() {
                continue;
            }
        } else {
            info!("Found {image_type_key} component '{name}'");
        }
        let data = load_personalized(
            name,
            ctx.tss.as_ref(),
            &ctx.build_identity,
            &ctx.ipsw,
            ctx.personalizer.as_ref(),
        )?;
        data_dict.insert(name.clone(), Value::Data(data));
    }

    match image_name {
        Some(name) => {
            if let Some(data) = data_dict.get(name) {
                dict.insert(image_data_key.into(), data.clone());
            }
            dict.insert("ImageName".into(), name.into());
            info!("Sending {image_type_key} for {name}...");
        }
        None => {
            dict.insert(image_data_key.into(), Value::Dictionary(data_dict));
            info!("Sending {image_type_key} now...");
        }
    }
    Ok(dict)
}

async fn send_image_data(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    message: &plist::Dictionary,
    image_list_key: &str,
    image_type_key: Option<&str>,
    image_data_key: &str,
) -> Result<(), RestoreError> {
    let dict = build_image_data_reply(ctx, message, image_list_key, image_type_key, image_data_key)?;
    restored.send(dict).await?;
    Ok(())
}
