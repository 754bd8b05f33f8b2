//! Unit slot layout inside a transfer buffer
//!
//! A region is an array of fixed-size slots, one per unit:
//!
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────┐
//! │ len: u32 │ digest: [32] │ payload: [unit_payload]  │
//! └──────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! The host writes `len` and `payload`; the kernel fills `digest` in place.

use crate::error::{Error, Result};
use std::ops::Range;

/// Digest written by the kernel for each unit
pub type Digest = [u8; 32];

const LEN_BYTES: usize = 4;
const DIGEST_BYTES: usize = 32;

/// Bytes of per-slot header preceding the payload
pub const SLOT_HEADER_BYTES: usize = LEN_BYTES + DIGEST_BYTES;

/// Fixed-size slot layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLayout {
    unit_payload: usize,
}

impl UnitLayout {
    /// Create a layout whose slots carry up to `unit_payload` bytes
    #[must_use]
    pub const fn new(unit_payload: usize) -> Self {
        Self { unit_payload }
    }

    /// Maximum payload bytes per unit
    #[inline]
    pub fn unit_payload(&self) -> usize {
        self.unit_payload
    }

    /// Total bytes per slot
    #[inline]
    pub fn slot_size(&self) -> usize {
        SLOT_HEADER_BYTES + self.unit_payload
    }

    /// Number of whole slots that fit in `region_bytes`
    #[inline]
    pub fn max_units(&self, region_bytes: usize) -> usize {
        region_bytes / self.slot_size()
    }

    fn slot(&self, region_len: usize, index: usize) -> Result<Range<usize>> {
        let capacity = self.max_units(region_len);
        if index >= capacity {
            return Err(Error::UnitOutOfRange { index, capacity });
        }
        let start = index * self.slot_size();
        Ok(start..start + self.slot_size())
    }

    /// Write one unit's payload into slot `index`, clearing its digest
    pub fn write_unit(&self, region: &mut [u8], index: usize, payload: &[u8]) -> Result<()> {
        if payload.len() > self.unit_payload {
            return Err(Error::UnitTooLarge {
                len: payload.len(),
                max: self.unit_payload,
            });
        }
        let range = self.slot(region.len(), index)?;
        let slot = &mut region[range];
        slot[..LEN_BYTES].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        slot[LEN_BYTES..SLOT_HEADER_BYTES].fill(0);
        slot[SLOT_HEADER_BYTES..SLOT_HEADER_BYTES + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Payload stored in slot `index`
    pub fn payload<'a>(&self, region: &'a [u8], index: usize) -> Result<&'a [u8]> {
        let slot = &region[self.slot(region.len(), index)?];
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&slot[..LEN_BYTES]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.unit_payload {
            return Err(Error::UnitTooLarge {
                len,
                max: self.unit_payload,
            });
        }
        Ok(&slot[SLOT_HEADER_BYTES..SLOT_HEADER_BYTES + len])
    }

    /// Digest stored in slot `index`
    pub fn digest(&self, region: &[u8], index: usize) -> Result<Digest> {
        let slot = &region[self.slot(region.len(), index)?];
        let mut digest = [0u8; DIGEST_BYTES];
        digest.copy_from_slice(&slot[LEN_BYTES..SLOT_HEADER_BYTES]);
        Ok(digest)
    }

    /// Store `digest` in slot `index`
    pub fn set_digest(&self, region: &mut [u8], index: usize, digest: &Digest) -> Result<()> {
        let range = self.slot(region.len(), index)?;
        region[range][LEN_BYTES..SLOT_HEADER_BYTES].copy_from_slice(digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_geometry() {
        let layout = UnitLayout::new(64);
        assert_eq!(layout.slot_size(), 100);
        assert_eq!(layout.max_units(1000), 10);
        assert_eq!(layout.max_units(999), 9);
        assert_eq!(layout.max_units(50), 0);
    }

    #[test]
    fn test_write_and_read_unit() {
        let layout = UnitLayout::new(16);
        let mut region = vec![0xAAu8; layout.slot_size() * 3];

        layout.write_unit(&mut region, 1, b"hello").unwrap();
        assert_eq!(layout.payload(&region, 1).unwrap(), b"hello");
        assert_eq!(layout.digest(&region, 1).unwrap(), [0u8; 32]);
    }

    #[test]
    fn test_set_digest_in_place() {
        let layout = UnitLayout::new(8);
        let mut region = vec![0u8; layout.slot_size() * 2];
        layout.write_unit(&mut region, 0, b"abc").unwrap();
        layout.set_digest(&mut region, 0, &[7u8; 32]).unwrap();

        assert_eq!(layout.digest(&region, 0).unwrap(), [7u8; 32]);
        assert_eq!(layout.payload(&region, 0).unwrap(), b"abc");
    }

    #[test]
    fn test_payload_too_large() {
        let layout = UnitLayout::new(4);
        let mut region = vec![0u8; layout.slot_size()];
        let err = layout.write_unit(&mut region, 0, b"too long").unwrap_err();
        assert!(matches!(err, Error::UnitTooLarge { len: 8, max: 4 }));
    }

    #[test]
    fn test_index_out_of_range() {
        let layout = UnitLayout::new(4);
        let mut region = vec![0u8; layout.slot_size() * 2];
        assert!(matches!(
            layout.write_unit(&mut region, 2, b"x"),
            Err(Error::UnitOutOfRange {
                index: 2,
                capacity: 2
            })
        ));
    }

    #[test]
    fn test_corrupt_length_rejected() {
        let layout = UnitLayout::new(4);
        let mut region = vec![0u8; layout.slot_size()];
        region[..4].copy_from_slice(&100u32.to_le_bytes());
        assert!(layout.payload(&region, 0).is_err());
    }
}
