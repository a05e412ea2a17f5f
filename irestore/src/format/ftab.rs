//! Tagged firmware tables ('ftab')
//!
//! RTKit firmware ships as a table of four-character-code entries. The
//! 32-byte header carries the table's own tag (`rkos` for RTKit OS
//! images) and the entry count; an array of `{tag, offset, size, pad}`
//! records follows, then the entry payloads. Writing lays the payloads
//! out contiguously in entry order.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use thiserror::Error;

const FTAB_HEADER_SIZE: usize = 32;
const FTAB_ENTRY_SIZE: usize = 16;
const FTAB_MAGIC: &[u8; 4] = b"ftab";

#[derive(Debug, Error)]
pub enum FtabError {
    #[error("buffer too small for header ({0} bytes)")]
    TooSmall(usize),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("entry table overruns the buffer")]
    EntryTableOverrun,
    #[error("entry {tag:?} points outside the buffer")]
    EntryOverrun { tag: [u8; 4] },
}

#[derive(Debug, Clone)]
struct FtabEntry {
    tag: [u8; 4],
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Ftab {
    tag: [u8; 4],
    entries: Vec<FtabEntry>,
}

impl Ftab {
    pub fn parse(data: &[u8]) -> Result<Self, FtabError> {
        if data.len() < FTAB_HEADER_SIZE {
            return Err(FtabError::TooSmall(data.len()));
        }
        let mut r = Cursor::new(data);
        let _always_01 = r.read_u32::<LE>().unwrap();
        let _always_ff = r.read_u32::<LE>().unwrap();
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&data[8..12]);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[12..16]);
        if &magic != FTAB_MAGIC {
            return Err(FtabError::BadMagic(magic));
        }
        r.set_position(16);
        let num_entries = r.read_u32::<LE>().unwrap() as usize;
        // remaining 12 header bytes are reserved

        let table_end = FTAB_HEADER_SIZE + num_entries * FTAB_ENTRY_SIZE;
        if table_end > data.len() {
            return Err(FtabError::EntryTableOverrun);
        }

        let mut entries = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let base = FTAB_HEADER_SIZE + i * FTAB_ENTRY_SIZE;
            let mut entry_tag = [0u8; 4];
            entry_tag.copy_from_slice(&data[base..base + 4]);
            let mut er = Cursor::new(&data[base + 4..base + 12]);
            let offset = er.read_u32::<LE>().unwrap() as usize;
            let size = er.read_u32::<LE>().unwrap() as usize;
            if offset + size > data.len() {
                return Err(FtabError::EntryOverrun { tag: entry_tag });
            }
            entries.push(FtabEntry {
                tag: entry_tag,
                data: data[offset..offset + size].to_vec(),
            });
        }
        Ok(Self { tag, entries })
    }

    /// The table's own four-character tag, e.g. `rkos`.
    pub fn tag(&self) -> [u8; 4] {
        self.tag
    }

    pub fn get_entry(&self, tag: [u8; 4]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.data.as_slice())
    }

    /// Adds an entry, replacing any existing entry with the same tag.
    pub fn add_entry(&mut self, tag: [u8; 4], data: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.tag == tag) {
            entry.data = data;
        } else {
            self.entries.push(FtabEntry { tag, data });
        }
    }

    pub fn write(&self) -> Vec<u8> {
        let payload_base = FTAB_HEADER_SIZE + self.entries.len() * FTAB_ENTRY_SIZE;
        let total: usize = payload_base + self.entries.iter().map(|e| e.data.len()).sum::<usize>();
        let mut out = Vec::with_capacity(total);

        out.write_u32::<LE>(1).unwrap();
        out.write_u32::<LE>(0xFFFF_FFFF).unwrap();
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(FTAB_MAGIC);
        out.write_u32::<LE>(self.entries.len() as u32).unwrap();
        out.extend_from_slice(&[0u8; 12]);

        let mut offset = payload_base;
        for entry in &self.entries {
            out.extend_from_slice(&entry.tag);
            out.write_u32::<LE>(offset as u32).unwrap();
            out.write_u32::<LE>(entry.data.len() as u32).unwrap();
            out.write_u32::<LE>(0).unwrap();
            offset += entry.data.len();
        }
        for entry in &self.entries {
            out.extend_from_slice(&entry.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ftab() -> Ftab {
        let mut ftab = Ftab {
            tag: *b"rkos",
            entries: Vec::new(),
        };
        ftab.add_entry(*b"rkos", vec![0x10u8; 40]);
        ftab.add_entry(*b"sdtb", vec![0x20u8; 12]);
        ftab
    }

    #[test]
    fn test_round_trip_preserves_order_and_bytes() {
        let buf = sample_ftab().write();
        let parsed = Ftab::parse(&buf).unwrap();
        assert_eq!(parsed.tag(), *b"rkos");
        assert_eq!(parsed.get_entry(*b"rkos"), Some(&[0x10u8; 40][..]));
        assert_eq!(parsed.get_entry(*b"sdtb"), Some(&[0x20u8; 12][..]));
        assert_eq!(parsed.write(), buf);
    }

    #[test]
    fn test_add_entry() {
        let mut ftab = sample_ftab();
        ftab.add_entry(*b"rrko", vec![1, 2, 3, 4, 5]);

        let parsed = Ftab::parse(&ftab.write()).unwrap();
        assert_eq!(parsed.get_entry(*b"rrko"), Some(&[1u8, 2, 3, 4, 5][..]));
        // existing entries retain position
        assert_eq!(parsed.entries[0].tag, *b"rkos");
        assert_eq!(parsed.entries[1].tag, *b"sdtb");
        assert_eq!(parsed.entries[2].tag, *b"rrko");
    }

    #[test]
    fn test_add_entry_replaces_same_tag() {
        let mut ftab = sample_ftab();
        ftab.add_entry(*b"sdtb", vec![9, 9]);
        let parsed = Ftab::parse(&ftab.write()).unwrap();
        assert_eq!(parsed.get_entry(*b"sdtb"), Some(&[9u8, 9][..]));
        assert_eq!(parsed.entries.len(), 2);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = sample_ftab().write();
        buf[12] = b'X';
        assert!(matches!(Ftab::parse(&buf), Err(FtabError::BadMagic(_))));
    }

    #[test]
    fn test_entry_overrun() {
        let mut buf = sample_ftab().write();
        // corrupt the first entry's size
        let size_at = FTAB_HEADER_SIZE + 8;
        buf[size_at..size_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Ftab::parse(&buf),
            Err(FtabError::EntryOverrun { .. })
        ));
    }
}
