//! Firmware load scripts (FLS)
//!
//! An FLS file bundles everything the baseband bootloader consumes as a
//! sequence of typed elements: a meta header, the ELF segments of the
//! firmware proper, a signature element, and optionally a ticket slot.
//! Each element starts with an 8-byte little-endian header of
//! `{type, total length}`; the payload follows immediately. The file is
//! the plain concatenation of its elements, so serialization is exact.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use thiserror::Error;

const ELEMENT_HEADER_SIZE: usize = 8;

pub const FLS_ELEMENT_META: u32 = 0x0a;
pub const FLS_ELEMENT_TICKET: u32 = 0x0b;
pub const FLS_ELEMENT_SIGNATURE: u32 = 0x0c;
pub const FLS_ELEMENT_ELF_SEGMENT: u32 = 0x10;

#[derive(Debug, Error)]
pub enum FlsError {
    #[error("truncated element header at offset {0}")]
    TruncatedHeader(usize),
    #[error("element at offset {offset} overruns the buffer (length {length})")]
    ElementOverrun { offset: usize, length: u32 },
    #[error("element at offset {0} is shorter than its own header")]
    BadElementLength(usize),
    #[error("script has no signature element")]
    NoSignature,
}

#[derive(Debug, Clone)]
pub struct FlsElement {
    pub element_type: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Fls {
    elements: Vec<FlsElement>,
}

impl Fls {
    pub fn parse(data: &[u8]) -> Result<Self, FlsError> {
        let mut elements = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if data.len() - offset < ELEMENT_HEADER_SIZE {
                return Err(FlsError::TruncatedHeader(offset));
            }
            let mut r = Cursor::new(&data[offset..offset + ELEMENT_HEADER_SIZE]);
            let element_type = r.read_u32::<LE>().unwrap();
            let length = r.read_u32::<LE>().unwrap();
            if (length as usize) < ELEMENT_HEADER_SIZE {
                return Err(FlsError::BadElementLength(offset));
            }
            if offset + length as usize > data.len() {
                return Err(FlsError::ElementOverrun { offset, length });
            }
            elements.push(FlsElement {
                element_type,
                data: data[offset + ELEMENT_HEADER_SIZE..offset + length as usize].to_vec(),
            });
            offset += length as usize;
        }
        Ok(Self { elements })
    }

    pub fn elements(&self) -> &[FlsElement] {
        &self.elements
    }

    /// Payloads of all ELF segment elements, in file order.
    pub fn elf_segments(&self) -> impl Iterator<Item = &[u8]> {
        self.elements
            .iter()
            .filter(|e| e.element_type == FLS_ELEMENT_ELF_SEGMENT)
            .map(|e| e.data.as_slice())
    }

    fn find(&self, element_type: u32) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.element_type == element_type)
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.find(FLS_ELEMENT_SIGNATURE)
            .map(|i| self.elements[i].data.as_slice())
    }

    pub fn ticket(&self) -> Option<&[u8]> {
        self.find(FLS_ELEMENT_TICKET)
            .map(|i| self.elements[i].data.as_slice())
    }

    /// Replaces the signature element payload. The signature element must
    /// already exist; its length may change.
    pub fn update_sig_blob(&mut self, blob: &[u8]) -> Result<(), FlsError> {
        let idx = self.find(FLS_ELEMENT_SIGNATURE).ok_or(FlsError::NoSignature)?;
        self.elements[idx].data = blob.to_vec();
        Ok(())
    }

    /// Sets the ticket slot. An existing slot is replaced; otherwise the
    /// ticket element is inserted right before the signature element so
    /// the loader sees it ahead of the signature check.
    pub fn insert_ticket(&mut self, ticket: &[u8]) -> Result<(), FlsError> {
        if let Some(idx) = self.find(FLS_ELEMENT_TICKET) {
            self.elements[idx].data = ticket.to_vec();
            return Ok(());
        }
        let sig_idx = self.find(FLS_ELEMENT_SIGNATURE).ok_or(FlsError::NoSignature)?;
        self.elements.insert(
            sig_idx,
            FlsElement {
                element_type: FLS_ELEMENT_TICKET,
                data: ticket.to_vec(),
            },
        );
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for element in &self.elements {
            out.write_u32::<LE>(element.element_type).unwrap();
            out.write_u32::<LE>((ELEMENT_HEADER_SIZE + element.data.len()) as u32)
                .unwrap();
            out.extend_from_slice(&element.data);
        }
        out
    }

    pub fn size(&self) -> usize {
        self.elements
            .iter()
            .map(|e| ELEMENT_HEADER_SIZE + e.data.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(element_type: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LE>(element_type).unwrap();
        out.write_u32::<LE>((ELEMENT_HEADER_SIZE + data.len()) as u32)
            .unwrap();
        out.extend_from_slice(data);
        out
    }

    fn sample_fls() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(element(FLS_ELEMENT_META, b"psi"));
        buf.extend(element(FLS_ELEMENT_ELF_SEGMENT, &[0xEEu8; 24]));
        buf.extend(element(FLS_ELEMENT_ELF_SEGMENT, &[0xDDu8; 12]));
        buf.extend(element(FLS_ELEMENT_SIGNATURE, &[0x11u8; 20]));
        buf
    }

    #[test]
    fn test_round_trip() {
        let buf = sample_fls();
        let fls = Fls::parse(&buf).unwrap();
        assert_eq!(fls.elements().len(), 4);
        assert_eq!(fls.elf_segments().count(), 2);
        assert_eq!(fls.serialize(), buf);
        assert_eq!(fls.size(), buf.len());
    }

    #[test]
    fn test_update_sig_blob() {
        let mut fls = Fls::parse(&sample_fls()).unwrap();
        let blob = [0xABu8; 20];
        fls.update_sig_blob(&blob).unwrap();
        let reparsed = Fls::parse(&fls.serialize()).unwrap();
        assert_eq!(reparsed.signature(), Some(&blob[..]));
    }

    #[test]
    fn test_insert_ticket_before_signature() {
        let mut fls = Fls::parse(&sample_fls()).unwrap();
        let ticket = [0xBBu8; 33];
        fls.insert_ticket(&ticket).unwrap();

        let reparsed = Fls::parse(&fls.serialize()).unwrap();
        assert_eq!(reparsed.ticket(), Some(&ticket[..]));
        let ticket_pos = reparsed
            .elements()
            .iter()
            .position(|e| e.element_type == FLS_ELEMENT_TICKET)
            .unwrap();
        let sig_pos = reparsed
            .elements()
            .iter()
            .position(|e| e.element_type == FLS_ELEMENT_SIGNATURE)
            .unwrap();
        assert!(ticket_pos < sig_pos);
    }

    #[test]
    fn test_insert_ticket_replaces_existing() {
        let mut fls = Fls::parse(&sample_fls()).unwrap();
        fls.insert_ticket(&[1, 2, 3]).unwrap();
        fls.insert_ticket(&[4, 5, 6, 7]).unwrap();

        let reparsed = Fls::parse(&fls.serialize()).unwrap();
        assert_eq!(reparsed.ticket(), Some(&[4u8, 5, 6, 7][..]));
        let tickets = reparsed
            .elements()
            .iter()
            .filter(|e| e.element_type == FLS_ELEMENT_TICKET)
            .count();
        assert_eq!(tickets, 1);
    }

    #[test]
    fn test_rejects_overrun() {
        let mut buf = element(FLS_ELEMENT_META, b"meta");
        // claim an element longer than the remaining buffer
        buf.write_u32::<LE>(FLS_ELEMENT_SIGNATURE).unwrap();
        buf.write_u32::<LE>(1000).unwrap();
        assert!(matches!(
            Fls::parse(&buf),
            Err(FlsError::ElementOverrun { .. })
        ));
    }
}
