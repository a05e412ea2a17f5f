//! CPIO odc (portable ASCII) record writer
//!
//! The bootability bundle and updater output travel as an odc stream:
//! every record is a 76-byte ASCII-octal header, the NUL-terminated file
//! name, and the payload. The stream ends with the `TRAILER!!!` record.

pub const CPIO_ODC_MAGIC: &[u8; 6] = b"070707";
pub const CPIO_TRAILER: &str = "TRAILER!!!";

const HEADER_SIZE: usize = 76;

/// Metadata for one record, mirroring the stat fields the header carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpioEntryMeta {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub mtime: u64,
}

fn octal(out: &mut Vec<u8>, width: usize, value: u64) {
    let s = format!("{value:0width$o}");
    // wider values keep only the low-order digits, like a fixed C field
    let bytes = s.as_bytes();
    out.extend_from_slice(&bytes[bytes.len() - width..]);
}

/// Encodes a single odc record. `data` of `None` writes a zero-size
/// record (used for directories and the trailer).
pub fn encode_record(name: &str, meta: &CpioEntryMeta, data: Option<&[u8]>) -> Vec<u8> {
    let namesize = name.len() + 1;
    let filesize = data.map(|d| d.len()).unwrap_or(0);

    let mut out = Vec::with_capacity(HEADER_SIZE + namesize + filesize);
    out.extend_from_slice(CPIO_ODC_MAGIC);
    octal(&mut out, 6, meta.dev);
    octal(&mut out, 6, meta.ino);
    octal(&mut out, 6, meta.mode as u64);
    octal(&mut out, 6, meta.uid as u64);
    octal(&mut out, 6, meta.gid as u64);
    octal(&mut out, 6, meta.nlink);
    octal(&mut out, 6, meta.rdev);
    octal(&mut out, 11, meta.mtime);
    octal(&mut out, 6, namesize as u64);
    octal(&mut out, 11, filesize as u64);
    debug_assert_eq!(out.len(), HEADER_SIZE);

    out.extend_from_slice(name.as_bytes());
    out.push(0);
    if let Some(data) = data {
        out.extend_from_slice(data);
    }
    out
}

/// The stream-terminating record: zero size, single link.
pub fn encode_trailer() -> Vec<u8> {
    let meta = CpioEntryMeta {
        nlink: 1,
        ..Default::default()
    };
    encode_record(CPIO_TRAILER, &meta, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(record: &[u8], start: usize, width: usize) -> &[u8] {
        &record[start..start + width]
    }

    #[test]
    fn test_header_layout() {
        let meta = CpioEntryMeta {
            dev: 0o1,
            ino: 0o7,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            nlink: 1,
            rdev: 0,
            mtime: 0o1234567,
            ..Default::default()
        };
        let record = encode_record("a.txt", &meta, Some(b"hello"));

        assert_eq!(field(&record, 0, 6), b"070707");
        assert_eq!(field(&record, 18, 6), b"100644"); // mode
        assert_eq!(field(&record, 48, 11), b"00001234567"); // mtime
        assert_eq!(field(&record, 59, 6), b"000006"); // namesize incl. NUL
        assert_eq!(field(&record, 65, 11), b"00000000005"); // filesize

        // all header digits are octal
        assert!(record[..HEADER_SIZE]
            .iter()
            .all(|b| (b'0'..=b'7').contains(b)));

        // name is NUL terminated, payload follows
        assert_eq!(&record[HEADER_SIZE..HEADER_SIZE + 6], b"a.txt\0");
        assert_eq!(&record[HEADER_SIZE + 6..], b"hello");
    }

    #[test]
    fn test_trailer() {
        let trailer = encode_trailer();
        assert_eq!(field(&trailer, 36, 6), b"000001"); // nlink
        assert_eq!(field(&trailer, 65, 11), b"00000000000"); // filesize
        assert_eq!(
            &trailer[HEADER_SIZE..],
            b"TRAILER!!!\0"
        );
    }

    #[test]
    fn test_stream_readable_by_simple_parser() {
        // a minimal odc reader: walk records until the trailer
        let mut stream = Vec::new();
        let meta = CpioEntryMeta {
            mode: 0o100644,
            nlink: 1,
            ..Default::default()
        };
        stream.extend(encode_record("one", &meta, Some(&[1, 2, 3])));
        stream.extend(encode_record("two", &meta, Some(&[])));
        stream.extend(encode_trailer());

        let mut names = Vec::new();
        let mut pos = 0;
        loop {
            let header = &stream[pos..pos + HEADER_SIZE];
            assert_eq!(&header[..6], CPIO_ODC_MAGIC);
            let read_octal = |start: usize, width: usize| {
                u64::from_str_radix(
                    std::str::from_utf8(&header[start..start + width]).unwrap(),
                    8,
                )
                .unwrap()
            };
            let namesize = read_octal(59, 6) as usize;
            let filesize = read_octal(65, 11) as usize;
            let name =
                std::str::from_utf8(&stream[pos + HEADER_SIZE..pos + HEADER_SIZE + namesize - 1])
                    .unwrap()
                    .to_string();
            pos += HEADER_SIZE + namesize + filesize;
            if name == CPIO_TRAILER {
                break;
            }
            names.push(name);
        }
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(pos, stream.len());
    }
}
