//! Typed views over the build manifest and build identity dictionaries

use crate::util::{dict_get_bool, dict_get_dict, dict_get_path, dict_get_string};
use crate::RestoreError;

pub const VARIANT_ERASE_INSTALL: &str = "Customer Erase Install (IPSW)";
pub const VARIANT_UPGRADE_INSTALL: &str = "Customer Upgrade Install (IPSW)";
pub const VARIANT_MACOS_RECOVERY_OS: &str = "macOS Customer";

/// The whole BuildManifest.plist of an IPSW.
#[derive(Debug, Clone)]
pub struct BuildManifest {
    dict: plist::Dictionary,
}

impl BuildManifest {
    pub fn new(dict: plist::Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &plist::Dictionary {
        &self.dict
    }

    /// Selects the build identity matching a hardware model and restore
    /// variant. The variant is matched exactly first, then as a
    /// substring, since some manifests qualify the variant string.
    pub fn identity_for_model(&self, hardware_model: &str, variant: &str) -> Option<BuildIdentity> {
        let identities = self.dict.get("BuildIdentities")?.as_array()?;

        let matching = |exact: bool| {
            identities.iter().find_map(|candidate| {
                let dict = candidate.as_dictionary()?;
                let info = dict_get_dict(dict, "Info")?;
                let device_class = dict_get_string(info, "DeviceClass")?;
                if !device_class.eq_ignore_ascii_case(hardware_model) {
                    return None;
                }
                let this_variant = dict_get_string(info, "Variant")?;
                let hit = if exact {
                    this_variant == variant
                } else {
                    this_variant.contains(variant)
                };
                hit.then(|| BuildIdentity::new(dict.clone()))
            })
        };

        matching(true).or_else(|| matching(false))
    }
}

/// One build identity: the `Info` block plus the component manifest.
#[derive(Debug, Clone)]
pub struct BuildIdentity {
    dict: plist::Dictionary,
}

impl BuildIdentity {
    pub fn new(dict: plist::Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &plist::Dictionary {
        &self.dict
    }

    fn info(&self) -> Option<&plist::Dictionary> {
        dict_get_dict(&self.dict, "Info")
    }

    pub fn device_class(&self) -> Option<&str> {
        self.info().and_then(|i| dict_get_string(i, "DeviceClass"))
    }

    pub fn macos_variant(&self) -> Option<&str> {
        self.info().and_then(|i| dict_get_string(i, "MacOSVariant"))
    }

    pub fn minimum_system_partition(&self) -> Option<&plist::Value> {
        self.info().and_then(|i| i.get("MinimumSystemPartition"))
    }

    pub fn system_partition_padding(&self) -> Option<&plist::Value> {
        self.info().and_then(|i| i.get("SystemPartitionPadding"))
    }

    pub fn fdr_support(&self) -> bool {
        self.info().map(|i| dict_get_bool(i, "FDRSupport")).unwrap_or(false)
    }

    pub fn manifest(&self) -> Option<&plist::Dictionary> {
        dict_get_dict(&self.dict, "Manifest")
    }

    pub fn component_entry(&self, component: &str) -> Option<&plist::Dictionary> {
        self.manifest().and_then(|m| dict_get_dict(m, component))
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.component_entry(component).is_some()
    }

    /// The archive path of a component (`Manifest.<name>.Info.Path`).
    pub fn component_path(&self, component: &str) -> Result<String, RestoreError> {
        self.component_entry(component)
            .and_then(|e| dict_get_path(e, &["Info", "Path"]))
            .and_then(|v| v.as_string())
            .map(|s| s.to_string())
            .ok_or_else(|| RestoreError::MissingComponent(component.to_string()))
    }

    pub fn component_digest(&self, component: &str) -> Option<&plist::Value> {
        self.component_entry(component).and_then(|e| e.get("Digest"))
    }

    /// Whether a manifest entry's `Info.<flag>` is true.
    pub fn component_has_flag(&self, component: &str, flag: &str) -> bool {
        self.component_entry(component)
            .and_then(|e| dict_get_dict(e, "Info"))
            .map(|info| dict_get_bool(info, flag))
            .unwrap_or(false)
    }

    /// Iterates manifest components, yielding `(name, entry)` pairs.
    pub fn components(&self) -> impl Iterator<Item = (&str, &plist::Dictionary)> {
        self.manifest()
            .into_iter()
            .flat_map(|m| m.iter())
            .filter_map(|(name, entry)| Some((name.as_str(), entry.as_dictionary()?)))
    }

    /// Firmware payloads flashed through the NOR path: anything marked as
    /// a firmware payload, plus secondary payloads iBoot itself loads.
    pub fn firmware_payloads(&self) -> Vec<(String, String)> {
        self.components()
            .filter_map(|(name, entry)| {
                let info = dict_get_dict(entry, "Info")?;
                let is_fw = dict_get_bool(info, "IsFirmwarePayload");
                let is_secondary = dict_get_bool(info, "IsSecondaryFirmwarePayload");
                let loaded_by_iboot = dict_get_bool(info, "IsLoadedByiBoot");
                if is_fw || (is_secondary && loaded_by_iboot) {
                    let path = dict_get_string(info, "Path")?;
                    Some((name.to_string(), path.to_string()))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A manifest-entry dictionary with a path and optional boolean flags.
    pub(crate) fn manifest_entry(path: &str, flags: &[(&str, bool)]) -> plist::Value {
        let mut info = plist::Dictionary::new();
        info.insert("Path".into(), path.into());
        for (flag, value) in flags {
            info.insert((*flag).to_string(), (*value).into());
        }
        let mut entry = plist::Dictionary::new();
        entry.insert("Info".into(), plist::Value::Dictionary(info));
        plist::Value::Dictionary(entry)
    }

    pub(crate) fn identity_with_manifest(
        components: &[(&str, plist::Value)],
    ) -> BuildIdentity {
        let mut manifest = plist::Dictionary::new();
        for (name, entry) in components {
            manifest.insert((*name).to_string(), entry.clone());
        }
        let mut dict = plist::Dictionary::new();
        dict.insert("Info".into(), plist::Value::Dictionary(plist::Dictionary::new()));
        dict.insert("Manifest".into(), plist::Value::Dictionary(manifest));
        BuildIdentity::new(dict)
    }

    #[test]
    fn test_component_path() {
        let identity = identity_with_manifest(&[(
            "KernelCache",
            manifest_entry("kernelcache.release", &[]),
        )]);
        assert_eq!(
            identity.component_path("KernelCache").unwrap(),
            "kernelcache.release"
        );
        assert!(matches!(
            identity.component_path("DeviceTree"),
            Err(RestoreError::MissingComponent(_))
        ));
    }

    #[test]
    fn test_firmware_payloads() {
        let identity = identity_with_manifest(&[
            ("iBoot", manifest_entry("Firmware/iBoot", &[("IsFirmwarePayload", true)])),
            (
                "Homer",
                manifest_entry(
                    "Firmware/Homer",
                    &[("IsSecondaryFirmwarePayload", true), ("IsLoadedByiBoot", true)],
                ),
            ),
            (
                "Ap,AudioDSP",
                manifest_entry("Firmware/adsp", &[("IsSecondaryFirmwarePayload", true)]),
            ),
            ("OS", manifest_entry("system.dmg", &[])),
        ]);

        let payloads = identity.firmware_payloads();
        let names: Vec<&str> = payloads.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"iBoot"));
        assert!(names.contains(&"Homer"));
        assert!(!names.contains(&"Ap,AudioDSP"));
        assert!(!names.contains(&"OS"));
    }

    #[test]
    fn test_identity_selection_by_variant() {
        let make_identity = |class: &str, variant: &str| {
            let mut info = plist::Dictionary::new();
            info.insert("DeviceClass".into(), class.into());
            info.insert("Variant".into(), variant.into());
            let mut dict = plist::Dictionary::new();
            dict.insert("Info".into(), plist::Value::Dictionary(info));
            plist::Value::Dictionary(dict)
        };
        let mut manifest = plist::Dictionary::new();
        manifest.insert(
            "BuildIdentities".into(),
            plist::Value::Array(vec![
                make_identity("d53gap", VARIANT_UPGRADE_INSTALL),
                make_identity("d53gap", VARIANT_ERASE_INSTALL),
            ]),
        );
        let manifest = BuildManifest::new(manifest);

        let erase = manifest
            .identity_for_model("D53gAP", VARIANT_ERASE_INSTALL)
            .unwrap();
        let variant = erase
            .as_dictionary()
            .get("Info")
            .and_then(|v| v.as_dictionary())
            .and_then(|i| i.get("Variant"))
            .and_then(|v| v.as_string());
        assert_eq!(variant, Some(VARIANT_ERASE_INSTALL));
        assert!(manifest.identity_for_model("n104ap", VARIANT_ERASE_INSTALL).is_none());
    }
}
