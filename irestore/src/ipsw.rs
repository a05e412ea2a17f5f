//! Firmware archive (IPSW) access
//!
//! An IPSW is a plain zip archive. The restore engine only ever reads it:
//! single members into memory, the baseband archive out to a file, and a
//! full listing for the bootability bundle walk. Member reads go through
//! a mutex so the handle can be shared by the session and any secondary
//! streams.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use zip::ZipArchive;

use crate::RestoreError;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFDIR: u32 = 0o040000;

/// Metadata for one archive member, shaped like the stat fields the
/// restore protocol wants.
#[derive(Debug, Clone)]
pub struct IpswEntry {
    pub name: String,
    pub size: u64,
    /// Unix mode including the file type bits; directories without unix
    /// attributes get a plain directory mode.
    pub mode: u32,
    pub mtime: u64,
}

impl IpswEntry {
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

pub struct Ipsw {
    path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
}

impl Ipsw {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RestoreError> {
        let path = path.into();
        let file = File::open(&path)?;
        let archive = ZipArchive::new(file)?;
        Ok(Self {
            path,
            archive: Mutex::new(archive),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_exists(&self, name: &str) -> bool {
        let archive = self.archive.lock().unwrap();
        archive.index_for_name(name).is_some()
    }

    /// Reads a whole member into memory.
    pub fn extract_to_memory(&self, name: &str) -> Result<Vec<u8>, RestoreError> {
        let mut archive = self.archive.lock().unwrap();
        let mut file = archive
            .by_name(name)
            .map_err(|_| RestoreError::IpswFileNotFound(name.to_string()))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Extracts a member to a file on disk, e.g. the baseband firmware
    /// archive before re-signing.
    pub fn extract_to_file(&self, name: &str, outpath: &Path) -> Result<(), RestoreError> {
        let mut archive = self.archive.lock().unwrap();
        let mut file = archive
            .by_name(name)
            .map_err(|_| RestoreError::IpswFileNotFound(name.to_string()))?;
        let mut out = File::create(outpath)?;
        std::io::copy(&mut file, &mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Lists every member with its metadata, in archive order.
    pub fn list_contents(&self) -> Result<Vec<IpswEntry>, RestoreError> {
        let mut archive = self.archive.lock().unwrap();
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            let mut mode = file.unix_mode().unwrap_or(0o644);
            if mode & S_IFMT == 0 {
                // archives without unix attributes only carry permission bits
                mode |= if file.is_dir() { S_IFDIR } else { S_IFREG };
            }
            entries.push(IpswEntry {
                name: file.name().to_string(),
                size: file.size(),
                mode,
                mtime: 0,
            });
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for Ipsw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipsw").field("path", &self.path).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;

    /// Builds a zip on disk from (name, bytes) pairs. Shared by the
    /// pipeline tests that need an IPSW fixture.
    pub(crate) fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ipsw");
        write_zip(
            &path,
            &[
                ("kernelcache.release", b"kern"),
                ("Firmware/LLB.img4", b"llb!"),
            ],
        );

        let ipsw = Ipsw::open(&path).unwrap();
        assert!(ipsw.file_exists("kernelcache.release"));
        assert!(!ipsw.file_exists("missing"));
        assert_eq!(ipsw.extract_to_memory("Firmware/LLB.img4").unwrap(), b"llb!");
        assert!(matches!(
            ipsw.extract_to_memory("missing"),
            Err(RestoreError::IpswFileNotFound(_))
        ));
    }

    #[test]
    fn test_extract_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ipsw");
        write_zip(&path, &[("Firmware/bbfw.zip", b"zipbytes")]);

        let ipsw = Ipsw::open(&path).unwrap();
        let out = dir.path().join("bbfw.zip");
        ipsw.extract_to_file("Firmware/bbfw.zip", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"zipbytes");
    }

    #[test]
    fn test_list_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ipsw");
        write_zip(&path, &[("a", b"1"), ("b/c", b"22")]);

        let ipsw = Ipsw::open(&path).unwrap();
        let entries = ipsw.list_contents().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[1].size, 2);
        assert!(entries.iter().all(|e| e.is_regular()));
    }
}
