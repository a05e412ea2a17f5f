//! Ticket signing service (TSS) client
//!
//! Builds the per-device signing requests the restore needs (AP ticket,
//! baseband, and the co-processor families) and dispatches them over
//! HTTP. Responses come back as a property list wrapped in a
//! `STATUS=…&MESSAGE=…` form body.

use log::{debug, warn};
use plist::Value;

use crate::build_identity::BuildIdentity;
use crate::util::{dict_copy_item, dict_get_dict, dict_get_string, dict_get_uint, dict_merge, plist_to_xml_bytes};
use crate::RestoreError;

const TSS_CLIENT_VERSION_STRING: &str = "libauthinstall-1033.0.2";

/// Default signing server, overridable per request for beta servers.
pub const TSS_CONTROLLER_ACTION_URL: &str = "http://gs.apple.com/TSS/controller?action=2";

#[derive(Debug)]
pub struct TssRequest {
    inner: plist::Dictionary,
}

impl TssRequest {
    pub fn new() -> Self {
        let mut inner = plist::Dictionary::new();
        inner.insert("@HostPlatformInfo".into(), "mac".into());
        inner.insert("@VersionInfo".into(), TSS_CLIENT_VERSION_STRING.into());
        inner.insert(
            "@UUID".into(),
            uuid::Uuid::new_v4().to_string().to_uppercase().into(),
        );
        Self { inner }
    }

    pub fn insert(&mut self, key: impl Into<String>, val: impl Into<Value>) {
        self.inner.insert(key.into(), val.into());
    }

    pub fn as_dictionary(&self) -> &plist::Dictionary {
        &self.inner
    }

    pub fn as_dictionary_mut(&mut self) -> &mut plist::Dictionary {
        &mut self.inner
    }

    /// Posts the request and unwraps the response plist.
    pub async fn send(&self, url: &str) -> Result<plist::Dictionary, RestoreError> {
        debug!(
            "Sending TSS request: {}",
            crate::pretty_print_dictionary(&self.inner)
        );
        let client = reqwest::Client::new();

        let res = client
            .post(url)
            .header("Cache-Control", "no-cache")
            .header("Content-type", "text/xml; charset=\"utf-8\"")
            .header("User-Agent", "InetURL/1.0")
            .header("Expect", "")
            .body(plist_to_xml_bytes(&self.inner))
            .send()
            .await?
            .text()
            .await?;

        let res = res.trim_start_matches("STATUS=0&");
        let res = res.trim_start_matches("MESSAGE=");
        if !res.starts_with("SUCCESS") {
            warn!("TSS responded with non-success value");
            return Err(RestoreError::TssRequestFailed);
        }
        let parts = res.split("REQUEST_STRING=").collect::<Vec<&str>>();
        if parts.len() < 2 {
            warn!("TSS response didn't contain a request string");
            return Err(RestoreError::TssRequestFailed);
        }
        Ok(plist::from_bytes(parts[1].as_bytes())?)
    }
}

impl Default for TssRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies the device-independent signing inputs out of a build identity:
/// the chip identifiers, key hashes, and the component manifest itself.
pub fn parameters_from_manifest(parameters: &mut plist::Dictionary, identity: &BuildIdentity) {
    let src = identity.as_dictionary();
    for key in [
        "UniqueBuildID",
        "Ap,OSLongVersion",
        "ApChipID",
        "ApBoardID",
        "ApSecurityDomain",
        "BbChipID",
        "BbProvisioningManifestKeyHash",
        "BbActivationManifestKeyHash",
        "BbCalibrationManifestKeyHash",
        "BbFactoryActivationManifestKeyHash",
        "BbFDRSecurityKeyHash",
        "BbSkeyId",
        "SE,ChipID",
        "Savage,ChipID",
        "Savage,PatchEpoch",
        "Yonkers,BoardID",
        "Yonkers,ChipID",
        "Yonkers,PatchEpoch",
        "Rap,BoardID",
        "Rap,ChipID",
        "Rap,SecurityDomain",
        "Baobab,BoardID",
        "Baobab,ChipID",
        "Baobab,ManifestEpoch",
        "Baobab,SecurityDomain",
        "eUICC,ChipID",
        "PearlCertificationRootPub",
        "Timer,BoardID,1",
        "Timer,BoardID,2",
        "Timer,ChipID,1",
        "Timer,ChipID,2",
        "Timer,SecurityDomain,1",
        "Timer,SecurityDomain,2",
    ] {
        dict_copy_item(parameters, key, src, key);
    }
    if let Some(manifest) = identity.manifest() {
        parameters.insert(
            "Manifest".into(),
            Value::Dictionary(manifest.clone()),
        );
    }
}

/// Applies a component's restore request rules: every rule whose
/// conditions hold against the request parameters patches the component
/// entry with its actions.
pub fn apply_restore_request_rules(
    input: &mut plist::Dictionary,
    parameters: &plist::Dictionary,
    rules: &[Value],
) {
    for rule in rules {
        let rule = match rule.as_dictionary() {
            Some(r) => r,
            None => {
                warn!("Restore request rule wasn't a dictionary");
                continue;
            }
        };
        let conditions = match rule.get("Conditions").and_then(|c| c.as_dictionary()) {
            Some(c) => c,
            None => {
                warn!("Conditions doesn't exist or wasn't a dictionary");
                continue;
            }
        };

        let mut conditions_fulfilled = true;
        for (key, value) in conditions {
            let actual = match key.as_str() {
                "ApRawProductionMode" => parameters.get("ApProductionMode"),
                "ApCurrentProductionMode" => parameters.get("ApProductionMode"),
                "ApRawSecurityMode" => parameters.get("ApSecurityMode"),
                "ApRequiresImage4" => parameters.get("ApSupportsImg4"),
                "ApDemotionPolicyOverride" => parameters.get("DemotionPolicy"),
                "ApInRomDFU" => parameters.get("ApInRomDFU"),
                _ => {
                    warn!("Unhandled restore request rule condition {key}");
                    None
                }
            };

            if actual != Some(value) {
                conditions_fulfilled = false;
                break;
            }
        }
        if !conditions_fulfilled {
            continue;
        }

        let actions = match rule.get("Actions").and_then(|a| a.as_dictionary()) {
            Some(a) => a,
            None => {
                warn!("Actions doesn't exist or wasn't a dictionary");
                continue;
            }
        };
        for (key, value) in actions {
            // 255 marks an action that should be skipped
            if value.as_unsigned_integer() == Some(255) || value.as_signed_integer() == Some(255) {
                continue;
            }
            input.remove(key);
            input.insert(key.to_owned(), value.to_owned());
        }
    }
}

/// Copies the manifest entries selected by `matcher` into the request,
/// stripped of their `Info` block and with restore request rules applied.
fn add_manifest_entries(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    matcher: impl Fn(&str) -> bool,
) {
    let manifest = match dict_get_dict(parameters, "Manifest") {
        Some(m) => m,
        None => return,
    };
    for (name, entry) in manifest {
        if !matcher(name) {
            continue;
        }
        let entry = match entry.as_dictionary() {
            Some(e) => e,
            None => continue,
        };
        let mut tss_entry = entry.clone();
        tss_entry.remove("Info");

        // a trusted entry with no digest still needs the key present
        if tss_entry.get("Trusted").and_then(|v| v.as_boolean()) == Some(true)
            && tss_entry.get("Digest").is_none()
        {
            tss_entry.insert("Digest".into(), Value::Data(Vec::new()));
        }

        if let Some(rules) = entry
            .get("Info")
            .and_then(|i| i.as_dictionary())
            .and_then(|i| i.get("RestoreRequestRules"))
            .and_then(|r| r.as_array())
        {
            apply_restore_request_rules(&mut tss_entry, parameters, rules);
        }

        request.insert(name.clone(), Value::Dictionary(tss_entry));
    }
}

fn copy_parameters(request: &mut TssRequest, parameters: &plist::Dictionary, keys: &[&str]) {
    for key in keys {
        dict_copy_item(request.as_dictionary_mut(), key, parameters, key);
    }
}

/// Tags shared by every request class.
pub fn add_common_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    copy_parameters(
        request,
        parameters,
        &[
            "ApECID",
            "UniqueBuildID",
            "ApChipID",
            "ApBoardID",
            "ApSecurityDomain",
        ],
    );
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

/// Baseband request tags; the manifest's `BasebandFirmware` entry rides
/// along minus its `Info` block.
pub fn add_baseband_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@BBTicket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "BbChipID",
            "BbProvisioningManifestKeyHash",
            "BbActivationManifestKeyHash",
            "BbCalibrationManifestKeyHash",
            "BbFactoryActivationManifestKeyHash",
            "BbFDRSecurityKeyHash",
            "BbSkeyId",
            "BbNonce",
            "BbGoldCertId",
            "BbSNUM",
        ],
    );
    add_manifest_entries(request, parameters, |name| name == "BasebandFirmware");
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

pub fn add_se_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "SE,ChipID",
            "SE,ID",
            "SE,Nonce",
            "SE,RootKeyIdentifier",
            "SE,OSVersion",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("SE,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

/// Adds the Savage tags and resolves which patch component this device
/// needs: silicon revision selects the family, the production fuse
/// selects the flavor.
pub fn add_savage_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) -> Result<String, RestoreError> {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "Savage,ChipID",
            "Savage,UID",
            "Savage,PatchEpoch",
            "Savage,AllowOfflineBoot",
            "Savage,ReadFWKey",
            "Savage,ProductionMode",
            "Savage,Nonce",
            "Savage,RevisionString",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("Savage,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }

    let revision = dict_get_string(parameters, "Savage,RevisionString")
        .ok_or(RestoreError::MalformedMessage("Savage,RevisionString"))?;
    let family = if revision.starts_with("A0") {
        "B0"
    } else if revision.starts_with("A1") {
        "BA"
    } else {
        "B2"
    };
    let production = parameters
        .get("Savage,ProductionMode")
        .and_then(|v| v.as_boolean())
        .unwrap_or(true);
    let flavor = if production { "Prod" } else { "Dev" };
    Ok(format!("Savage,{family}-{flavor}-Patch"))
}

/// Adds the Yonkers tags and resolves the SysTop patch component from
/// the fuse mask: the lowest set bit is the patch index.
pub fn add_yonkers_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) -> Result<String, RestoreError> {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "Yonkers,BoardID",
            "Yonkers,ChipID",
            "Yonkers,ECID",
            "Yonkers,Nonce",
            "Yonkers,PatchEpoch",
            "Yonkers,ProductionMode",
            "Yonkers,ReadECKey",
            "Yonkers,ReadFWKey",
            "Yonkers,SysTopMask",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("Yonkers,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }

    let mask = dict_get_uint(parameters, "Yonkers,SysTopMask").unwrap_or(1);
    let index = mask.trailing_zeros();
    Ok(format!("Yonkers,SysTopPatch{index}"))
}

pub fn add_rose_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "Rap,BoardID",
            "Rap,ChipID",
            "Rap,ECID",
            "Rap,Nonce",
            "Rap,ProductionMode",
            "Rap,SecurityDomain",
            "Rap,SecurityMode",
            "Rap,FdrRootCaDigest",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("Rap,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

pub fn add_veridian_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@BBTicket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "BMU,BoardID",
            "BMU,ChipID",
            "BMU,UniqueID",
            "BMU,ProductionMode",
            "BMU,Nonce",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("BMU,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

pub fn add_tcon_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(
        request,
        parameters,
        &[
            "Baobab,BoardID",
            "Baobab,ChipID",
            "Baobab,ECID",
            "Baobab,Life",
            "Baobab,ManifestEpoch",
            "Baobab,ProductionMode",
            "Baobab,SecurityDomain",
            "Baobab,UpdateNonce",
        ],
    );
    add_manifest_entries(request, parameters, |name| name.starts_with("Baobab,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

pub fn add_timer_tags(
    request: &mut TssRequest,
    parameters: &plist::Dictionary,
    overrides: Option<&plist::Dictionary>,
) {
    request.insert("@ApImg4Ticket", true);
    copy_parameters(request, parameters, &["TagNumber", "TicketName"]);
    let timer_keys: Vec<String> = parameters
        .iter()
        .filter(|(k, _)| k.starts_with("Timer,"))
        .map(|(k, _)| k.clone())
        .collect();
    for key in timer_keys {
        dict_copy_item(request.as_dictionary_mut(), &key, parameters, &key);
    }
    add_manifest_entries(request, parameters, |name| name.starts_with("Timer,"));
    if let Some(overrides) = overrides {
        dict_merge(request.as_dictionary_mut(), overrides);
    }
}

/// Request for a freshly signed recovery-OS local policy. The argument
/// dictionary from the device carries the measurement hashes.
pub fn local_policy_request(
    identity: &BuildIdentity,
    ecid: u64,
    args: Option<&plist::Dictionary>,
) -> TssRequest {
    let mut parameters = plist::Dictionary::new();
    parameters.insert("ApECID".into(), ecid.into());
    parameters.insert("ApProductionMode".into(), true.into());
    parameters.insert("ApSecurityMode".into(), true.into());
    parameters.insert("ApSupportsImg4".into(), true.into());
    parameters_from_manifest(&mut parameters, identity);

    let mut request = TssRequest::new();
    request.insert("@ApImg4Ticket", true);
    add_common_tags(&mut request, &parameters, None);

    request.insert("Ap,LocalBoot", false);
    if let Some(args) = args {
        for key in [
            "Ap,NextStageIM4MHash",
            "Ap,RecoveryOSPolicyNonceHash",
            "Ap,VolumeUUID",
        ] {
            dict_copy_item(request.as_dictionary_mut(), key, args, key);
        }
    }

    // the policy object itself is measured on the device, not shipped
    let mut lpol = plist::Dictionary::new();
    lpol.insert("Digest".into(), Value::Data(Vec::new()));
    lpol.insert("Trusted".into(), true.into());
    request.insert("Ap,LocalPolicy", Value::Dictionary(lpol));

    request
}

/// The signed root ticket for image4 devices.
pub fn response_ap_img4_ticket(response: &plist::Dictionary) -> Result<Vec<u8>, RestoreError> {
    response
        .get("ApImg4Ticket")
        .and_then(|v| v.as_data())
        .map(|d| d.to_vec())
        .ok_or(RestoreError::TssMissingEntry("ApImg4Ticket"))
}

/// The signed root ticket for pre-image4 devices.
pub fn response_ap_ticket(response: &plist::Dictionary) -> Result<Vec<u8>, RestoreError> {
    response
        .get("APTicket")
        .and_then(|v| v.as_data())
        .map(|d| d.to_vec())
        .ok_or(RestoreError::TssMissingEntry("APTicket"))
}

/// Some responses carry per-component `Path` entries that override the
/// build identity's archive paths.
pub fn response_path_by_entry(response: &plist::Dictionary, component: &str) -> Option<String> {
    dict_get_dict(response, component)
        .and_then(|entry| dict_get_string(entry, "Path"))
        .map(|s| s.to_string())
}
