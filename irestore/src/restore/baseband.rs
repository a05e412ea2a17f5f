//! Baseband data pipeline
//!
//! The device asks for BasebandData two or three times per restore. The
//! first request with a nonce triggers the baseband TSS round-trip; the
//! response is cached and reused for every later visit. Each visit
//! extracts the firmware archive, re-signs it, and sends the whole zip
//! back.

use log::{debug, info};
use plist::Value;

use crate::restored::RestoredClient;
use crate::tss::{self, TssRequest};
use crate::util::{dict_get_data, dict_get_dict, dict_get_uint};
use crate::RestoreError;

use super::{bbfw, RestoreContext};

struct BasebandArgs {
    chip_id: u64,
    cert_id: u64,
    snum: Vec<u8>,
    nonce: Option<Vec<u8>>,
}

fn parse_args(message: &plist::Dictionary) -> BasebandArgs {
    let arguments = dict_get_dict(message, "Arguments");
    let get_uint = |key| arguments.and_then(|a| dict_get_uint(a, key)).unwrap_or(0);
    BasebandArgs {
        chip_id: get_uint("ChipID"),
        cert_id: get_uint("CertID"),
        snum: arguments
            .and_then(|a| dict_get_data(a, "ChipSerialNo"))
            .map(|d| d.to_vec())
            .unwrap_or_default(),
        nonce: arguments
            .and_then(|a| dict_get_data(a, "Nonce"))
            .map(|d| d.to_vec()),
    }
}

/// Builds the baseband TSS request for this device.
fn build_baseband_request(ctx: &RestoreContext, args: &BasebandArgs) -> TssRequest {
    let mut parameters = plist::Dictionary::new();
    parameters.insert("ApECID".into(), ctx.device.ecid.into());
    if let Some(nonce) = &args.nonce {
        parameters.insert("BbNonce".into(), Value::Data(nonce.clone()));
    }
    parameters.insert("BbChipID".into(), args.chip_id.into());
    parameters.insert("BbGoldCertId".into(), args.cert_id.into());
    parameters.insert("BbSNUM".into(), Value::Data(args.snum.clone()));

    tss::parameters_from_manifest(&mut parameters, &ctx.build_identity);

    let mut request = TssRequest::new();
    tss::add_common_tags(&mut request, &parameters, None);
    tss::add_baseband_tags(&mut request, &parameters, None);

    if ctx.build_identity.fdr_support() {
        request.insert("ApProductionMode", true);
        request.insert("ApSecurityMode", true);
    }
    request
}

pub(crate) async fn send_baseband_data(
    restored: &mut RestoredClient,
    ctx: &mut RestoreContext,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    info!("About to send BasebandData...");

    // this handler runs 2 or 3 times per restore
    let args = parse_args(message);

    let mut response = None;
    if args.nonce.is_none() || ctx.bbtss.is_none() {
        let request = build_baseband_request(ctx, &args);
        info!("Sending Baseband TSS request...");
        response = Some(request.send(&ctx.tss_url).await?);
        info!("Received Baseband SHSH blobs");
    }

    let bbfw_path = ctx.build_identity.component_path("BasebandFirmware")?;

    let tmp = tempfile::Builder::new()
        .prefix("bbfw_")
        .suffix(".tmp")
        .tempfile()?;
    ctx.ipsw.extract_to_file(&bbfw_path, tmp.path())?;
    debug!("Extracted baseband firmware to {:?}", tmp.path());

    if args.nonce.is_some() && ctx.bbtss.is_none() {
        // keep the response for later requests
        ctx.bbtss = response.take();
    }

    let bbtss = ctx
        .bbtss
        .as_ref()
        .or(response.as_ref())
        .ok_or(RestoreError::TssMissingEntry("baseband ticket"))?;
    bbfw::sign_bbfw(tmp.path(), bbtss, args.nonce.as_deref())?;

    let buffer = std::fs::read(tmp.path())?;
    // the tempfile is removed when `tmp` drops, error paths included

    let mut dict = plist::Dictionary::new();
    dict.insert("BasebandData".into(), Value::Data(buffer));
    info!("Sending BasebandData now...");
    restored.send(dict).await?;
    info!("Done sending BasebandData");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::tests::test_context;

    fn baseband_message(nonce: Option<&[u8]>) -> plist::Dictionary {
        let mut args = plist::Dictionary::new();
        args.insert("ChipID".into(), 0x35u64.into());
        args.insert("CertID".into(), 0x1234_5678u64.into());
        args.insert("ChipSerialNo".into(), Value::Data(vec![9, 9, 9, 9]));
        if let Some(nonce) = nonce {
            args.insert("Nonce".into(), Value::Data(nonce.to_vec()));
        }
        let mut msg = plist::Dictionary::new();
        msg.insert("Arguments".into(), Value::Dictionary(args));
        msg
    }

    #[test]
    fn test_request_carries_device_and_chip_identity() {
        let (ctx, _dir) = test_context(&[]);
        let args = parse_args(&baseband_message(Some(&[7u8; 20])));
        let request = build_baseband_request(&ctx, &args);
        let dict = request.as_dictionary();

        assert_eq!(
            dict.get("ApECID").and_then(|v| v.as_unsigned_integer()),
            Some(ctx.device.ecid)
        );
        assert_eq!(
            dict.get("BbChipID").and_then(|v| v.as_unsigned_integer()),
            Some(0x35)
        );
        assert_eq!(
            dict.get("BbGoldCertId").and_then(|v| v.as_unsigned_integer()),
            Some(0x1234_5678)
        );
        assert_eq!(
            dict.get("BbNonce").and_then(|v| v.as_data()),
            Some(&[7u8; 20][..])
        );
        assert_eq!(
            dict.get("@BBTicket").and_then(|v| v.as_boolean()),
            Some(true)
        );
        // no FDR support in the fixture identity
        assert!(dict.get("ApProductionMode").is_none());
    }

    #[test]
    fn test_cached_ticket_skips_the_request() {
        // the guard in the handler: with a nonce and a cached bbtss no
        // TSS request is built at all
        let (mut ctx, _dir) = test_context(&[]);
        ctx.bbtss = Some(plist::Dictionary::new());
        let args = parse_args(&baseband_message(Some(&[7u8; 20])));
        assert!(!(args.nonce.is_none() || ctx.bbtss.is_none()));

        // without a nonce the request is rebuilt every time
        let args = parse_args(&baseband_message(None));
        assert!(args.nonce.is_none() || ctx.bbtss.is_none());
    }
}
