//! Modem binary (MBN) files
//!
//! An MBN is a single signed baseband binary: a 40-byte little-endian
//! header followed by code, the signature, and the certificate chain.
//! Re-signing replaces the signature region in place; the overall layout
//! and size never change.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use thiserror::Error;

pub const MBN_HEADER_SIZE: usize = 40;

#[derive(Debug, Error)]
pub enum MbnError {
    #[error("buffer too small for header ({0} bytes)")]
    TooSmall(usize),
    #[error("header image size {image} inconsistent with buffer size {actual}")]
    SizeMismatch { image: u32, actual: usize },
    #[error("signature length mismatch: file has {expected}, blob has {got}")]
    SignatureLength { expected: usize, got: usize },
}

/// Fixed header at the start of every MBN image. All fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbnHeader {
    pub image_id: u32,
    pub version: u32,
    pub image_src: u32,
    pub load_addr: u32,
    /// code + signature + certificate chain, header excluded
    pub image_size: u32,
    pub code_size: u32,
    pub signature_ptr: u32,
    pub signature_size: u32,
    pub cert_chain_ptr: u32,
    pub cert_chain_size: u32,
}

impl MbnHeader {
    fn parse(data: &[u8]) -> Result<Self, MbnError> {
        if data.len() < MBN_HEADER_SIZE {
            return Err(MbnError::TooSmall(data.len()));
        }
        let mut r = Cursor::new(data);
        Ok(Self {
            image_id: r.read_u32::<LE>().unwrap(),
            version: r.read_u32::<LE>().unwrap(),
            image_src: r.read_u32::<LE>().unwrap(),
            load_addr: r.read_u32::<LE>().unwrap(),
            image_size: r.read_u32::<LE>().unwrap(),
            code_size: r.read_u32::<LE>().unwrap(),
            signature_ptr: r.read_u32::<LE>().unwrap(),
            signature_size: r.read_u32::<LE>().unwrap(),
            cert_chain_ptr: r.read_u32::<LE>().unwrap(),
            cert_chain_size: r.read_u32::<LE>().unwrap(),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.write_u32::<LE>(self.image_id).unwrap();
        out.write_u32::<LE>(self.version).unwrap();
        out.write_u32::<LE>(self.image_src).unwrap();
        out.write_u32::<LE>(self.load_addr).unwrap();
        out.write_u32::<LE>(self.image_size).unwrap();
        out.write_u32::<LE>(self.code_size).unwrap();
        out.write_u32::<LE>(self.signature_ptr).unwrap();
        out.write_u32::<LE>(self.signature_size).unwrap();
        out.write_u32::<LE>(self.cert_chain_ptr).unwrap();
        out.write_u32::<LE>(self.cert_chain_size).unwrap();
    }
}

#[derive(Debug, Clone)]
pub struct Mbn {
    header: MbnHeader,
    data: Vec<u8>,
    sig_offset: usize,
    sig_len: usize,
}

impl Mbn {
    pub fn parse(data: &[u8]) -> Result<Self, MbnError> {
        let header = MbnHeader::parse(data)?;
        let total = MBN_HEADER_SIZE + header.image_size as usize;
        if data.len() != total {
            return Err(MbnError::SizeMismatch {
                image: header.image_size,
                actual: data.len(),
            });
        }
        let sig_offset = MBN_HEADER_SIZE + header.code_size as usize;
        let sig_len = header.signature_size as usize;
        if sig_offset + sig_len > data.len() {
            return Err(MbnError::SizeMismatch {
                image: header.image_size,
                actual: data.len(),
            });
        }
        Ok(Self {
            header,
            data: data.to_vec(),
            sig_offset,
            sig_len,
        })
    }

    pub fn header(&self) -> &MbnHeader {
        &self.header
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn signature(&self) -> &[u8] {
        &self.data[self.sig_offset..self.sig_offset + self.sig_len]
    }

    /// Splices a signature blob into the signature region. The blob must
    /// match the length the header declares.
    pub fn update_sig_blob(&mut self, blob: &[u8]) -> Result<(), MbnError> {
        if blob.len() != self.sig_len {
            return Err(MbnError::SignatureLength {
                expected: self.sig_len,
                got: blob.len(),
            });
        }
        self.data[self.sig_offset..self.sig_offset + self.sig_len].copy_from_slice(blob);
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        self.header.write(&mut out);
        out.extend_from_slice(&self.data[MBN_HEADER_SIZE..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mbn(code: &[u8], sig: &[u8], certs: &[u8]) -> Vec<u8> {
        let header = MbnHeader {
            image_id: 0x0d,
            version: 3,
            image_src: 0,
            load_addr: 0x4000_0000,
            image_size: (code.len() + sig.len() + certs.len()) as u32,
            code_size: code.len() as u32,
            signature_ptr: (0x4000_0000 + MBN_HEADER_SIZE + code.len()) as u32,
            signature_size: sig.len() as u32,
            cert_chain_ptr: (0x4000_0000 + MBN_HEADER_SIZE + code.len() + sig.len()) as u32,
            cert_chain_size: certs.len() as u32,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        buf.extend_from_slice(code);
        buf.extend_from_slice(sig);
        buf.extend_from_slice(certs);
        buf
    }

    #[test]
    fn test_round_trip() {
        let buf = sample_mbn(&[0xAAu8; 64], &[0x11u8; 16], &[0x22u8; 32]);
        let mbn = Mbn::parse(&buf).unwrap();
        assert_eq!(mbn.serialize(), buf);
    }

    #[test]
    fn test_update_sig_blob() {
        let buf = sample_mbn(&[0xAAu8; 64], &[0x11u8; 16], &[0x22u8; 32]);
        let mut mbn = Mbn::parse(&buf).unwrap();
        let blob = [0x5Au8; 16];
        mbn.update_sig_blob(&blob).unwrap();

        let out = mbn.serialize();
        assert_eq!(out.len(), buf.len());
        let signed = Mbn::parse(&out).unwrap();
        assert_eq!(signed.signature(), &blob);
        // code and certs untouched
        assert_eq!(&out[MBN_HEADER_SIZE..MBN_HEADER_SIZE + 64], &[0xAAu8; 64]);
        assert_eq!(&out[out.len() - 32..], &[0x22u8; 32]);
    }

    #[test]
    fn test_sig_length_mismatch() {
        let buf = sample_mbn(&[0u8; 8], &[0u8; 16], &[]);
        let mut mbn = Mbn::parse(&buf).unwrap();
        assert!(matches!(
            mbn.update_sig_blob(&[0u8; 8]),
            Err(MbnError::SignatureLength { .. })
        ));
    }

    #[test]
    fn test_truncated_buffer() {
        let buf = sample_mbn(&[0u8; 8], &[0u8; 16], &[]);
        assert!(Mbn::parse(&buf[..buf.len() - 1]).is_err());
        assert!(Mbn::parse(&buf[..10]).is_err());
    }
}
