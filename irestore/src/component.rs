//! Component loading and personalization
//!
//! A component is one named payload out of the firmware archive. The
//! ticket response may override where it lives; otherwise the build
//! identity's manifest says. Before a component goes to the device it is
//! personalized: wrapped together with the ticket into the container the
//! device verifies. Container construction itself is a collaborator
//! concern behind the [`Personalizer`] trait.

use log::debug;

use crate::build_identity::BuildIdentity;
use crate::ipsw::Ipsw;
use crate::tss;
use crate::RestoreError;

/// Wraps a payload and its ticket into the signed container the device
/// expects (IMG4 for image4 devices, the legacy container otherwise).
pub trait Personalizer: Send + Sync {
    fn personalize(
        &self,
        component: &str,
        data: Vec<u8>,
        ticket: &plist::Dictionary,
    ) -> Result<Vec<u8>, RestoreError>;
}

impl<F> Personalizer for F
where
    F: Fn(&str, Vec<u8>, &plist::Dictionary) -> Result<Vec<u8>, RestoreError> + Send + Sync,
{
    fn personalize(
        &self,
        component: &str,
        data: Vec<u8>,
        ticket: &plist::Dictionary,
    ) -> Result<Vec<u8>, RestoreError> {
        self(component, data, ticket)
    }
}

/// Resolves a component's archive path, preferring the ticket's path
/// entry over the build identity manifest.
pub fn component_path(
    component: &str,
    ticket: Option<&plist::Dictionary>,
    identity: &BuildIdentity,
) -> Result<String, RestoreError> {
    if let Some(ticket) = ticket {
        if let Some(path) = tss::response_path_by_entry(ticket, component) {
            return Ok(path);
        }
        debug!("No path for component {component} in TSS, will fetch from build identity");
    }
    identity.component_path(component)
}

/// Extracts a component's raw bytes from the archive.
pub fn extract_component(ipsw: &Ipsw, path: &str) -> Result<Vec<u8>, RestoreError> {
    debug!("Extracting {path}");
    ipsw.extract_to_memory(path)
}

/// Extracts and personalizes a component in one step.
pub fn load_personalized(
    component: &str,
    ticket: Option<&plist::Dictionary>,
    identity: &BuildIdentity,
    ipsw: &Ipsw,
    personalizer: &dyn Personalizer,
) -> Result<Vec<u8>, RestoreError> {
    let path = component_path(component, ticket, identity)?;
    let data = extract_component(ipsw, &path)?;
    let ticket = ticket.ok_or(RestoreError::TssMissingEntry("ticket"))?;
    personalizer.personalize(component, data, ticket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_identity::tests::{identity_with_manifest, manifest_entry};

    #[test]
    fn test_ticket_path_preferred() {
        let identity = identity_with_manifest(&[(
            "LLB",
            manifest_entry("Firmware/all_flash/LLB.img4", &[]),
        )]);

        let mut entry = plist::Dictionary::new();
        entry.insert("Path".into(), "Overridden/LLB.img4".into());
        let mut ticket = plist::Dictionary::new();
        ticket.insert("LLB".into(), plist::Value::Dictionary(entry));

        assert_eq!(
            component_path("LLB", Some(&ticket), &identity).unwrap(),
            "Overridden/LLB.img4"
        );
        assert_eq!(
            component_path("LLB", None, &identity).unwrap(),
            "Firmware/all_flash/LLB.img4"
        );
    }
}
