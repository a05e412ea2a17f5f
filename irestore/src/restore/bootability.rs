//! Secondary data-port streams
//!
//! Two requests move data over a raw side connection instead of the RPC
//! channel: the BootabilityBundle goes out as a CPIO odc stream built
//! from archive members, and the baseband updater's output comes back as
//! one, captured to disk for later inspection.

use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::format::cpio::{self, CpioEntryMeta};
use crate::ipsw::Ipsw;
use crate::provider::DeviceProvider;
use crate::util::dict_get_uint;
use crate::{ReadWrite, RestoreError};

const BUNDLE_PREFIX: &str = "BootabilityBundle/Restore/Bootability/";
const TRUSTCACHE_MEMBER: &str = "BootabilityBundle/Restore/Firmware/Bootability.dmg.trustcache";
const TRUSTCACHE_SUBPATH: &str = "Bootability.trustcache";

const CONNECT_ATTEMPTS: u32 = 10;

/// Keeps a UDID safe for use inside a file name.
pub(crate) fn sanitize_udid(udid: &str) -> String {
    udid.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// The on-device path for a bundle member, or `None` when the member is
/// not part of the bundle.
pub(crate) fn bundle_subpath(name: &str) -> Option<&str> {
    if name == TRUSTCACHE_MEMBER {
        Some(TRUSTCACHE_SUBPATH)
    } else {
        name.strip_prefix(BUNDLE_PREFIX)
    }
}

async fn connect_data_port<P: DeviceProvider>(
    provider: &P,
    port: u16,
) -> Result<Box<dyn ReadWrite>, RestoreError> {
    let mut last_err = RestoreError::NoEstablishedConnection;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            debug!("Retrying connection...");
        }
        match provider.connect_port(port).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

pub(crate) async fn send_bootability_bundle<P: DeviceProvider>(
    provider: &P,
    ipsw: &Ipsw,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let port = dict_get_uint(message, "DataPort")
        .ok_or(RestoreError::MalformedMessage("DataPort"))? as u16;

    debug!("Connecting to BootabilityBundle data port");
    let mut connection = match connect_data_port(provider, port).await {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to connect to BootabilityBundle data port");
            return Err(e);
        }
    };

    for entry in ipsw.list_contents()? {
        let subpath = match bundle_subpath(&entry.name) {
            Some(s) => s,
            None => continue,
        };
        debug!(
            "BootabilityBundle send m={:07o} s={:10} {subpath}",
            entry.mode, entry.size
        );

        let data = if (entry.is_regular() || entry.is_symlink()) && entry.size != 0 {
            Some(ipsw.extract_to_memory(&entry.name)?)
        } else {
            None
        };

        // the device creates these as root
        let meta = CpioEntryMeta {
            mode: entry.mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            mtime: entry.mtime,
            ..Default::default()
        };
        let record = cpio::encode_record(subpath, &meta, data.as_deref());
        connection.write_all(&record).await?;
    }

    connection.write_all(&cpio::encode_trailer()).await?;
    connection.flush().await?;
    info!("Done sending BootabilityBundle");
    Ok(())
}

/// Drains the baseband updater's output stream into
/// `updater_output-<udid>.cpio` next to the current directory.
pub(crate) async fn handle_baseband_updater_output<P: DeviceProvider>(
    provider: &P,
    udid: &str,
    message: &plist::Dictionary,
) -> Result<(), RestoreError> {
    let port = dict_get_uint(message, "DataPort")
        .ok_or(RestoreError::MalformedMessage("DataPort"))? as u16;

    debug!("Connecting to baseband updater data port");
    let mut connection = match connect_data_port(provider, port).await {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to connect to baseband updater data port");
            return Err(e);
        }
    };

    let filename = format!("updater_output-{}.cpio", sanitize_udid(udid));
    let mut file = match tokio::fs::File::create(&filename).await {
        Ok(f) => Some(f),
        Err(_) => {
            error!("Could not open {filename} for writing, will not write baseband updater output data.");
            None
        }
    };

    let mut buf = vec![0u8; 65536];
    loop {
        let n = match connection.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if let Some(file) = &mut file {
            file.write_all(&buf[..n]).await?;
        }
    }
    if let Some(mut file) = file {
        file.flush().await?;
        info!("Wrote baseband updater output data to {filename}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsw::tests::write_zip;
    use std::sync::Mutex;
    use crate::restored::RestoredClient;

    #[test]
    fn test_bundle_subpath_mapping() {
        assert_eq!(
            bundle_subpath("BootabilityBundle/Restore/Bootability/usr/standalone/foo"),
            Some("usr/standalone/foo")
        );
        assert_eq!(
            bundle_subpath("BootabilityBundle/Restore/Firmware/Bootability.dmg.trustcache"),
            Some("Bootability.trustcache")
        );
        assert_eq!(bundle_subpath("Firmware/all_flash/LLB.img4"), None);
        assert_eq!(bundle_subpath("BootabilityBundle/Restore/other"), None);
    }

    #[test]
    fn test_sanitize_udid() {
        assert_eq!(sanitize_udid("00008101-001E30EC"), "00008101-001E30EC");
        assert_eq!(sanitize_udid("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_udid("a/b\\c"), "abc");
    }

    struct PortProvider {
        stream: Mutex<Option<Box<dyn ReadWrite>>>,
    }

    impl DeviceProvider for PortProvider {
        async fn connect_restored(&self) -> Result<RestoredClient, RestoreError> {
            Err(RestoreError::NoEstablishedConnection)
        }

        async fn connect_port(&self, _port: u16) -> Result<Box<dyn ReadWrite>, RestoreError> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or(RestoreError::NoEstablishedConnection)
        }

        fn label(&self) -> &str {
            "test"
        }
    }

    #[tokio::test]
    async fn test_bundle_stream_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.ipsw");
        write_zip(
            &path,
            &[
                (
                    "BootabilityBundle/Restore/Bootability/usr/standalone/bootcaches.plist",
                    b"caches",
                ),
                (
                    "BootabilityBundle/Restore/Firmware/Bootability.dmg.trustcache",
                    b"trust",
                ),
                ("Firmware/unrelated.bin", b"skip me"),
            ],
        );
        let ipsw = Ipsw::open(&path).unwrap();

        let (host_side, mut collector) = tokio::io::duplex(1024 * 1024);
        let provider = PortProvider {
            stream: Mutex::new(Some(Box::new(host_side))),
        };

        let mut message = plist::Dictionary::new();
        message.insert("DataPort".into(), 49152u64.into());

        let reader = tokio::spawn(async move {
            let mut stream = Vec::new();
            collector.read_to_end(&mut stream).await.unwrap();
            stream
        });

        send_bootability_bundle(&provider, &ipsw, &message)
            .await
            .unwrap();
        drop(provider);

        let stream = reader.await.unwrap();

        // walk the odc records
        let mut names = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            assert_eq!(&stream[pos..pos + 6], cpio::CPIO_ODC_MAGIC);
            let read_octal = |start: usize, width: usize| {
                u64::from_str_radix(
                    std::str::from_utf8(&stream[pos + start..pos + start + width]).unwrap(),
                    8,
                )
                .unwrap()
            };
            let namesize = read_octal(59, 6) as usize;
            let filesize = read_octal(65, 11) as usize;
            let name = std::str::from_utf8(&stream[pos + 76..pos + 76 + namesize - 1])
                .unwrap()
                .to_string();
            pos += 76 + namesize + filesize;
            names.push(name);
        }
        assert_eq!(
            names,
            vec![
                "usr/standalone/bootcaches.plist".to_string(),
                "Bootability.trustcache".to_string(),
                cpio::CPIO_TRAILER.to_string(),
            ]
        );
        assert_eq!(pos, stream.len());
    }
}
