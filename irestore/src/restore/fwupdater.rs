//! Firmware updater request handling
//!
//! `FirmwareUpdaterData` requests name a co-processor updater. Every
//! family follows the same shape: assemble TSS parameters from the
//! build identity plus the device-reported info, fetch the family
//! ticket, resolve the payload component, post-process it into the
//! family's `FirmwareData` form. The families share one skeleton and
//! differ only in their tag adder, component naming, and payload shaping.

use std::io::Cursor;

use log::{debug, error, info, warn};
use plist::Value;

use crate::restored::RestoredClient;
use crate::tss::{self, TssRequest};
use crate::util::{dict_copy_item, dict_get_dict, dict_get_string, dict_get_uint, dict_merge};
use crate::RestoreError;

use super::RestoreContext;

pub(crate) async fn send_firmware_updater_data(
    restored: &mut RestoredClient,
    ctx: &RestoreContext,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let arguments = dict_get_dict(message, "Arguments")
        .ok_or(RestoreError::MalformedMessage("Arguments"))?;

    let arg_type = dict_get_string(arguments, "MessageArgType")
        .ok_or(RestoreError::MalformedMessage("MessageArgType"))?;
    if arg_type != "FirmwareResponseData" {
        error!("MessageArgType has unexpected value '{arg_type}'");
        return Err(RestoreError::MalformedMessage("MessageArgType"));
    }

    let updater_name = dict_get_string(arguments, "MessageArgUpdaterName")
        .ok_or(RestoreError::MalformedMessage("MessageArgUpdaterName"))?;
    if let Some(loop_count) = dict_get_uint(arguments, "MessageArgUpdaterLoopCount") {
        debug!("Updater loop count {loop_count}");
    }

    let info = dict_get_dict(arguments, "MessageArgInfo")
        .ok_or(RestoreError::MalformedMessage("MessageArgInfo"))?;

    let fwdict = match updater_name {
        "SE" => se_firmware_data(ctx, info).await?,
        "Savage" => match dict_get_dict(info, "YonkersDeviceInfo") {
            Some(yonkers_info) => yonkers_firmware_data(ctx, yonkers_info).await?,
            None => savage_firmware_data(ctx, info).await?,
        },
        "Rose" => rose_firmware_data(ctx, info).await?,
        "T200" => veridian_firmware_data(ctx, info).await?,
        "AppleTCON" => tcon_firmware_data(ctx, info).await?,
        "AppleTypeCRetimer" => timer_firmware_data(ctx, info).await?,
        other => {
            error!("Got unknown updater name '{other}'.");
            return Err(RestoreError::UnknownUpdater(other.to_string()));
        }
    };

    let mut dict = plist::Dictionary::new();
    dict.insert("FirmwareResponseData".into(), Value::Dictionary(fwdict));

    info!("Sending FirmwareResponse data now...");
    restored.send(dict).await?;
    info!("Done sending FirmwareUpdater data");
    Ok(())
}

/// Manifest-derived parameters merged with the family info dictionary.
fn family_parameters(ctx: &RestoreContext, info: &plist::Dictionary) -> plist::Dictionary {
    let mut parameters = plist::Dictionary::new();
    tss::parameters_from_manifest(&mut parameters, &ctx.build_identity);
    dict_merge(&mut parameters, info);
    parameters
}

/// AP mode flags some families require alongside their own tags.
fn insert_ap_flags(parameters: &mut plist::Dictionary, ctx: &RestoreContext) {
    parameters.insert("ApProductionMode".into(), true.into());
    if ctx.device.image4_supported {
        parameters.insert("ApSecurityMode".into(), true.into());
        parameters.insert("ApSupportsImg4".into(), true.into());
    } else {
        parameters.insert("ApSupportsImg4".into(), false.into());
    }
}

async fn fetch_family_ticket(
    ctx: &RestoreContext,
    request: TssRequest,
    family: &str,
    ticket_key: &str,
) -> Result<plist::Dictionary, RestoreError> {
    info!("Sending {family} TSS request...");
    let response = request.send(&ctx.tss_url).await?;
    if response.get(ticket_key).is_some() {
        info!("Received {family} ticket");
    } else {
        error!("No '{ticket_key}' in TSS response, this might not work");
    }
    Ok(response)
}

/// Picks the SE payload by chip: 0x20211 carries full firmware, the
/// known coprocessor chips take an update payload. Unknown chips fall
/// back to whichever component the build identity ships.
pub(crate) fn se_component_name(
    chip_id: u64,
    identity: &crate::build_identity::BuildIdentity,
) -> Result<&'static str, RestoreError> {
    match chip_id {
        0x20211 => Ok("SE,Firmware"),
        0x73 | 0x64 | 0xC8 | 0xD2 => Ok("SE,UpdatePayload"),
        _ => {
            warn!("Unknown SE,ChipID {chip_id:#x} detected. Restore might fail.");
            if identity.has_component("SE,UpdatePayload") {
                Ok("SE,UpdatePayload")
            } else if identity.has_component("SE,Firmware") {
                Ok("SE,Firmware")
            } else {
                error!("Neither 'SE,Firmware' nor 'SE,UpdatePayload' found in build identity.");
                Err(RestoreError::MissingComponent("SE,Firmware".to_string()))
            }
        }
    }
}

async fn se_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let chip_id = dict_get_uint(info, "SE,ChipID").unwrap_or(0);
    let comp_name = se_component_name(chip_id, &ctx.build_identity)?;
    debug!("Using {comp_name}");

    let comp_path = ctx.build_identity.component_path(comp_name)?;
    let component_data = ctx.ipsw.extract_to_memory(&comp_path)?;

    let parameters = family_parameters(ctx, info);
    let mut request = TssRequest::new();
    tss::add_se_tags(&mut request, &parameters, None);

    let mut response = fetch_family_ticket(ctx, request, "SE", "SE,Ticket").await?;
    response.insert("FirmwareData".into(), Value::Data(component_data));
    Ok(response)
}

/// Savage firmware is framed with a 16-byte header carrying the payload
/// length at offset 4.
pub(crate) fn savage_frame_payload(data: Vec<u8>) -> Vec<u8> {
    let mut framed = vec![0u8; 16];
    framed[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
    framed.extend_from_slice(&data);
    framed
}

async fn savage_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let parameters = family_parameters(ctx, info);
    let mut request = TssRequest::new();
    let comp_name = tss::add_savage_tags(&mut request, &parameters, None)?;
    debug!("Using {comp_name}");

    let mut response = fetch_family_ticket(ctx, request, "Savage", "Savage,Ticket").await?;

    let comp_path = ctx.build_identity.component_path(&comp_name)?;
    let component_data = ctx.ipsw.extract_to_memory(&comp_path)?;
    response.insert(
        "FirmwareData".into(),
        Value::Data(savage_frame_payload(component_data)),
    );
    Ok(response)
}

async fn yonkers_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let parameters = family_parameters(ctx, info);
    let mut request = TssRequest::new();
    let comp_name = tss::add_yonkers_tags(&mut request, &parameters, None)?;
    debug!("Using {comp_name}");

    let mut response = fetch_family_ticket(ctx, request, "Yonkers", "Yonkers,Ticket").await?;

    let comp_path = ctx.build_identity.component_path(&comp_name)?;
    let component_data = ctx.ipsw.extract_to_memory(&comp_path)?;

    let mut firmware_data = plist::Dictionary::new();
    firmware_data.insert("YonkersFirmware".into(), Value::Data(component_data));
    response.insert("FirmwareData".into(), Value::Dictionary(firmware_data));
    Ok(response)
}

/// Parses an RTKit firmware table and, when a restore variant exists,
/// grafts its `rrko` entry into the table before re-serializing.
pub(crate) fn merge_restore_rtkit(
    primary: &[u8],
    restore: Option<&[u8]>,
) -> Result<Vec<u8>, RestoreError> {
    let mut ftab = crate::format::ftab::Ftab::parse(primary)?;
    if ftab.tag() != *b"rkos" {
        warn!(
            "Unexpected firmware table tag {:?}, expected 'rkos'; continuing anyway.",
            ftab.tag()
        );
    }

    if let Some(restore) = restore {
        let rftab = crate::format::ftab::Ftab::parse(restore)?;
        if rftab.tag() != *b"rkos" {
            warn!(
                "Unexpected firmware table tag {:?}, expected 'rkos'; continuing anyway.",
                rftab.tag()
            );
        }
        match rftab.get_entry(*b"rrko") {
            Some(entry) => ftab.add_entry(*b"rrko", entry.to_vec()),
            None => {
                error!("Could not find 'rrko' entry in firmware table. This will probably break things.");
            }
        }
    }

    Ok(ftab.write())
}

async fn rose_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let mut parameters = plist::Dictionary::new();
    tss::parameters_from_manifest(&mut parameters, &ctx.build_identity);
    insert_ap_flags(&mut parameters, ctx);
    dict_merge(&mut parameters, info);

    let mut request = TssRequest::new();
    tss::add_rose_tags(&mut request, &parameters, None);

    let mut response = fetch_family_ticket(ctx, request, "Rose", "Rap,Ticket").await?;

    let comp_path = ctx.build_identity.component_path("Rap,RTKitOS")?;
    let primary = ctx.ipsw.extract_to_memory(&comp_path)?;

    let restore = if ctx.build_identity.has_component("Rap,RestoreRTKitOS") {
        let path = ctx.build_identity.component_path("Rap,RestoreRTKitOS")?;
        Some(ctx.ipsw.extract_to_memory(&path)?)
    } else {
        info!("NOTE: Build identity does not have a 'Rap,RestoreRTKitOS' component.");
        None
    };

    let merged = merge_restore_rtkit(&primary, restore.as_deref())?;
    response.insert("FirmwareData".into(), Value::Data(merged));
    Ok(response)
}

/// The Veridian firmware map is a plist; the device expects it back in
/// binary form with the manifest digest spliced in.
pub(crate) fn veridian_firmware_map(
    data: &[u8],
    digest: Option<&Value>,
) -> Result<Vec<u8>, RestoreError> {
    let map = Value::from_reader(Cursor::new(data))?;
    let mut map = match map {
        Value::Dictionary(d) => d,
        _ => return Err(RestoreError::MalformedMessage("BMU,FirmwareMap")),
    };

    let digest = digest.ok_or(RestoreError::MalformedBuildIdentity("BMU,FirmwareMap digest"))?;
    map.insert("fw_map_digest".into(), digest.clone());

    let mut out = Vec::new();
    Value::Dictionary(map).to_writer_binary(&mut out)?;
    Ok(out)
}

async fn veridian_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let comp_name = "BMU,FirmwareMap";
    let parameters = family_parameters(ctx, info);
    let mut request = TssRequest::new();
    tss::add_veridian_tags(&mut request, &parameters, None);

    let mut response = fetch_family_ticket(ctx, request, "Veridian", "BMU,Ticket").await?;

    let comp_path = ctx.build_identity.component_path(comp_name)?;
    let component_data = ctx.ipsw.extract_to_memory(&comp_path)?;
    let fw_map = veridian_firmware_map(
        &component_data,
        ctx.build_identity.component_digest(comp_name),
    )?;
    response.insert("FirmwareData".into(), Value::Data(fw_map));
    Ok(response)
}

async fn tcon_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let parameters = family_parameters(ctx, info);
    let mut request = TssRequest::new();
    tss::add_tcon_tags(&mut request, &parameters, None);

    let mut response = fetch_family_ticket(ctx, request, "Baobab", "Baobab,Ticket").await?;

    let comp_path = ctx.build_identity.component_path("Baobab,TCON")?;
    let component_data = ctx.ipsw.extract_to_memory(&comp_path)?;
    response.insert("FirmwareData".into(), Value::Data(component_data));
    Ok(response)
}

/// Mines the retimer's hardware identity into the tag-qualified TSS
/// parameter keys. Returns the parameters, the tag number, and the name
/// of the ticket to expect.
pub(crate) fn timer_parameters(
    info: &plist::Dictionary,
) -> Result<(plist::Dictionary, u64, String), RestoreError> {
    let info_array = info
        .get("InfoArray")
        .and_then(|v| v.as_array())
        .ok_or(RestoreError::MalformedMessage("InfoArray"))?;
    let info_dict = info_array
        .first()
        .and_then(|v| v.as_dictionary())
        .ok_or(RestoreError::MalformedMessage("InfoArray"))?;
    let hwid = dict_get_dict(info_dict, "HardwareID")
        .ok_or(RestoreError::MalformedMessage("HardwareID"))?;

    let tag = dict_get_uint(info_dict, "TagNumber").unwrap_or(0);
    let ticket_name = dict_get_string(info_dict, "TicketName")
        .unwrap_or("Timer,Ticket")
        .to_string();

    let mut parameters = plist::Dictionary::new();
    parameters.insert("TagNumber".into(), tag.into());
    parameters.insert("TicketName".into(), ticket_name.clone().into());

    for (field, source) in [
        ("ChipID", "ChipID"),
        ("BoardID", "BoardID"),
        ("ECID", "ECID"),
        ("Nonce", "Nonce"),
        ("SecurityMode", "SecurityMode"),
        ("SecurityDomain", "SecurityDomain"),
        ("ProductionMode", "ProductionStatus"),
    ] {
        dict_copy_item(&mut parameters, &format!("Timer,{field},{tag}"), hwid, source);
    }

    Ok((parameters, tag, ticket_name))
}

async fn timer_firmware_data(
    ctx: &RestoreContext,
    info: &plist::Dictionary,
) -> Result<plist::Dictionary, RestoreError> {
    let (timer_params, tag, ticket_name) = timer_parameters(info)?;

    let mut parameters = plist::Dictionary::new();
    tss::parameters_from_manifest(&mut parameters, &ctx.build_identity);
    insert_ap_flags(&mut parameters, ctx);
    dict_merge(&mut parameters, &timer_params);

    let ap_info = dict_get_dict(info, "APInfo")
        .ok_or(RestoreError::MalformedMessage("APInfo"))?;
    dict_merge(&mut parameters, ap_info);

    let mut request = TssRequest::new();
    tss::add_timer_tags(&mut request, &parameters, None);

    let mut response = fetch_family_ticket(ctx, request, &ticket_name, &ticket_name).await?;

    let comp_name = format!("Timer,RTKitOS,{tag}");
    if !ctx.build_identity.has_component(&comp_name) {
        info!("NOTE: Build identity does not have a '{comp_name}' component.");
        return Err(RestoreError::MissingComponent(comp_name));
    }
    let comp_path = ctx.build_identity.component_path(&comp_name)?;
    let primary = ctx.ipsw.extract_to_memory(&comp_path)?;

    let restore_name = format!("Timer,RestoreRTKitOS,{tag}");
    let restore = if ctx.build_identity.has_component(&restore_name) {
        let path = ctx.build_identity.component_path(&restore_name)?;
        Some(ctx.ipsw.extract_to_memory(&path)?)
    } else {
        info!("NOTE: Build identity does not have a '{restore_name}' component.");
        None
    };

    let merged = merge_restore_rtkit(&primary, restore.as_deref())?;
    response.insert("FirmwareData".into(), Value::Data(merged));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_identity::tests::{identity_with_manifest, manifest_entry};
    use crate::format::ftab::Ftab;

    #[test]
    fn test_se_component_for_chip() {
        let identity = identity_with_manifest(&[]);
        assert_eq!(se_component_name(0x20211, &identity).unwrap(), "SE,Firmware");
        assert_eq!(se_component_name(0x73, &identity).unwrap(), "SE,UpdatePayload");
        assert_eq!(se_component_name(0xD2, &identity).unwrap(), "SE,UpdatePayload");

        // unknown chip falls back to what the identity carries
        let with_fw = identity_with_manifest(&[(
            "SE,Firmware",
            manifest_entry("Firmware/se.fw", &[]),
        )]);
        assert_eq!(se_component_name(0x9999, &with_fw).unwrap(), "SE,Firmware");
        assert!(se_component_name(0x9999, &identity).is_err());
    }

    #[test]
    fn test_savage_payload_framing() {
        let framed = savage_frame_payload(vec![0xAB; 300]);
        assert_eq!(framed.len(), 316);
        assert_eq!(&framed[0..4], &[0, 0, 0, 0]);
        assert_eq!(&framed[4..8], &300u32.to_le_bytes());
        assert_eq!(&framed[8..16], &[0u8; 8]);
        assert_eq!(&framed[16..], &[0xABu8; 300][..]);
    }

    fn rkos_table(entries: &[([u8; 4], &[u8])]) -> Vec<u8> {
        let mut ftab = Ftab::parse(&make_empty_rkos()).unwrap();
        for (tag, data) in entries {
            ftab.add_entry(*tag, data.to_vec());
        }
        ftab.write()
    }

    fn make_empty_rkos() -> Vec<u8> {
        // header-only table with the rkos tag
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        out.extend_from_slice(b"rkos");
        out.extend_from_slice(b"ftab");
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
        out
    }

    #[test]
    fn test_rtkit_merge_copies_rrko() {
        let primary = rkos_table(&[(*b"rkos", &[0x10; 24])]);
        let restore = rkos_table(&[(*b"rrko", &[0x77; 8])]);

        let merged = merge_restore_rtkit(&primary, Some(&restore)).unwrap();
        let parsed = Ftab::parse(&merged).unwrap();
        assert_eq!(parsed.get_entry(*b"rkos"), Some(&[0x10u8; 24][..]));
        assert_eq!(parsed.get_entry(*b"rrko"), Some(&[0x77u8; 8][..]));
    }

    #[test]
    fn test_rtkit_merge_without_restore_table() {
        let primary = rkos_table(&[(*b"rkos", &[0x10; 24])]);
        let merged = merge_restore_rtkit(&primary, None).unwrap();
        let parsed = Ftab::parse(&merged).unwrap();
        assert!(parsed.get_entry(*b"rrko").is_none());
    }

    #[test]
    fn test_veridian_map_gains_digest() {
        let mut map = plist::Dictionary::new();
        map.insert("version".into(), 2u64.into());
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, &map).unwrap();

        let digest = Value::Data(vec![0xD1, 0xD2]);
        let out = veridian_firmware_map(&xml, Some(&digest)).unwrap();

        // comes back as a binary plist with the digest spliced in
        let reparsed = Value::from_reader(Cursor::new(&out[..])).unwrap();
        let reparsed = reparsed.as_dictionary().unwrap();
        assert_eq!(
            reparsed.get("fw_map_digest").and_then(|v| v.as_data()),
            Some(&[0xD1u8, 0xD2][..])
        );
        assert_eq!(
            reparsed.get("version").and_then(|v| v.as_unsigned_integer()),
            Some(2)
        );
        assert_eq!(&out[..6], b"bplist");
    }

    #[test]
    fn test_veridian_map_requires_digest() {
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, &plist::Dictionary::new()).unwrap();
        assert!(veridian_firmware_map(&xml, None).is_err());
    }

    #[test]
    fn test_timer_parameter_mining() {
        let mut hwid = plist::Dictionary::new();
        hwid.insert("ChipID".into(), 0x100u64.into());
        hwid.insert("BoardID".into(), 0x0Au64.into());
        hwid.insert("ECID".into(), 0xDEADu64.into());
        hwid.insert("Nonce".into(), Value::Data(vec![1, 2, 3]));
        hwid.insert("SecurityMode".into(), true.into());
        hwid.insert("SecurityDomain".into(), 1u64.into());
        hwid.insert("ProductionStatus".into(), 1u64.into());

        let mut info_dict = plist::Dictionary::new();
        info_dict.insert("HardwareID".into(), Value::Dictionary(hwid));
        info_dict.insert("TagNumber".into(), 2u64.into());
        info_dict.insert("TicketName".into(), "Timer,Ticket,2".into());

        let mut info = plist::Dictionary::new();
        info.insert(
            "InfoArray".into(),
            Value::Array(vec![Value::Dictionary(info_dict)]),
        );

        let (parameters, tag, ticket_name) = timer_parameters(&info).unwrap();
        assert_eq!(tag, 2);
        assert_eq!(ticket_name, "Timer,Ticket,2");
        assert_eq!(
            parameters.get("Timer,ChipID,2").and_then(|v| v.as_unsigned_integer()),
            Some(0x100)
        );
        assert_eq!(
            parameters.get("Timer,Nonce,2").and_then(|v| v.as_data()),
            Some(&[1u8, 2, 3][..])
        );
        assert_eq!(
            parameters.get("Timer,ProductionMode,2").and_then(|v| v.as_unsigned_integer()),
            Some(1)
        );
        assert_eq!(
            parameters.get("Timer,SecurityMode,2").and_then(|v| v.as_boolean()),
            Some(true)
        );
    }
}
