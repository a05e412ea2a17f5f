//! Baseband firmware archive re-signing
//!
//! The TSS response carries one signature blob per firmware element.
//! Each blob is spliced into its file inside the baseband zip, everything
//! the updater doesn't need is dropped, and when the device supplied a
//! nonce the BBTicket rides along (inside `ebl.fls` for ICE-style
//! firmware, as `bbticket.der` otherwise). The archive is rebuilt rather
//! than edited in place so member bookkeeping can't go stale.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::format::fls::Fls;
use crate::format::mbn::Mbn;
use crate::util::dict_get_dict;
use crate::RestoreError;

/// Maps a TSS firmware element name to its file inside the archive.
pub(crate) fn bbfw_filename_for_element(element: &str) -> Option<&'static str> {
    const TABLE: &[(&str, &str)] = &[
        // ICE3 firmware files
        ("RamPSI", "psi_ram.fls"),
        ("FlashPSI", "psi_flash.fls"),
        // Trek firmware files
        ("eDBL", "dbl.mbn"),
        ("RestoreDBL", "restoredbl.mbn"),
        // Phoenix/Mav4 firmware files
        ("DBL", "dbl.mbn"),
        ("ENANDPRG", "ENPRG.mbn"),
        // Mav5 firmware files
        ("RestoreSBL1", "restoresbl1.mbn"),
        ("SBL1", "sbl1.mbn"),
        // ICE16 firmware files
        ("RestorePSI", "restorepsi.bin"),
        ("PSI", "psi_ram.bin"),
        // ICE19 firmware files
        ("RestorePSI2", "restorepsi2.bin"),
        ("PSI2", "psi_ram2.bin"),
        // Mav20 firmware file
        ("Misc", "multi_image.mbn"),
    ];
    TABLE
        .iter()
        .find(|(name, _)| *name == element)
        .map(|(_, filename)| *filename)
}

struct BbfwEntry {
    name: String,
    data: Vec<u8>,
    keep: bool,
}

fn extension(name: &str) -> &str {
    name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

/// Re-signs the baseband archive at `path` in place.
pub(crate) fn sign_bbfw(
    path: &Path,
    bbtss: &plist::Dictionary,
    bb_nonce: Option<&[u8]>,
) -> Result<(), RestoreError> {
    let bbticket = bbtss
        .get("BBTicket")
        .and_then(|v| v.as_data())
        .ok_or(RestoreError::TssMissingEntry("BBTicket"))?;
    let bbfw_dict = dict_get_dict(bbtss, "BasebandFirmware")
        .ok_or(RestoreError::TssMissingEntry("BasebandFirmware"))?;

    let mut entries = read_archive(path)?;
    let mut fls_family = false;

    for (key, node) in bbfw_dict {
        let element = match key.strip_suffix("-Blob") {
            Some(e) => e,
            None => continue,
        };
        let blob = match node.as_data() {
            Some(b) => b,
            None => continue,
        };

        let filename = bbfw_filename_for_element(element)
            .ok_or_else(|| RestoreError::UnknownBasebandElement(element.to_string()))?;
        let is_fls = extension(filename) == "fls";
        if is_fls {
            fls_family = true;
        }

        let entry = entries
            .iter_mut()
            .find(|e| e.name == filename)
            .ok_or_else(|| RestoreError::IpswFileNotFound(filename.to_string()))?;

        debug!("Signing {filename}");
        if is_fls {
            let mut fls = Fls::parse(&entry.data)?;
            fls.update_sig_blob(blob)?;
            entry.data = fls.serialize();
        } else {
            let mut mbn = Mbn::parse(&entry.data)?;
            mbn.update_sig_blob(blob)?;
            entry.data = mbn.serialize();
        }

        // ICE firmware without a nonce only ships the RAM PSI
        if fls_family && bb_nonce.is_none() {
            if element == "RamPSI" {
                entry.keep = true;
            }
        } else {
            entry.keep = true;
        }
    }

    // with a nonce the updater wants every loadable image, not just the
    // freshly signed ones
    if bb_nonce.is_some() {
        for entry in entries.iter_mut() {
            if matches!(extension(&entry.name), "fls" | "mbn" | "elf" | "bin") {
                entry.keep = true;
            }
        }
    }
    entries.retain(|e| e.keep);

    if bb_nonce.is_some() {
        if fls_family {
            let entry = entries
                .iter_mut()
                .find(|e| e.name == "ebl.fls")
                .ok_or_else(|| RestoreError::IpswFileNotFound("ebl.fls".to_string()))?;
            let mut fls = Fls::parse(&entry.data)?;
            fls.insert_ticket(bbticket)?;
            entry.data = fls.serialize();
        } else {
            entries.push(BbfwEntry {
                name: "bbticket.der".to_string(),
                data: bbticket.to_vec(),
                keep: true,
            });
        }
    }

    write_archive(path, &entries)?;
    info!("Signed baseband firmware archive");
    Ok(())
}

fn read_archive(path: &Path) -> Result<Vec<BbfwEntry>, RestoreError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        if member.is_dir() {
            continue;
        }
        let mut data = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut data)?;
        entries.push(BbfwEntry {
            name: member.name().to_string(),
            data,
            keep: false,
        });
    }
    Ok(entries)
}

fn write_archive(path: &Path, entries: &[BbfwEntry]) -> Result<(), RestoreError> {
    let file = File::create(path)?;
    let mut writer = ZipWriter::new(file);
    for entry in entries {
        writer.start_file(entry.name.as_str(), SimpleFileOptions::default())?;
        writer.write_all(&entry.data)?;
    }
    // flushes the central directory
    writer.finish()?;
    Ok(())
}
