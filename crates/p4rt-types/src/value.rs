//! Canonical field values for match keys and action parameters.
//!
//! P4Runtime carries every match value and action parameter as a big-endian
//! byte string whose width is fixed by the P4 program. [`FieldValue`] keeps
//! the integer together with its declared bit width so that masks, prefixes
//! and range checks can be validated when a rule is built rather than when
//! the switch rejects it.

use crate::{Ipv4Address, MacAddress, ParseError};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum supported field width in bits.
pub const MAX_BITWIDTH: u32 = 64;

/// An unsigned value of a fixed bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFieldValue")]
pub struct FieldValue {
    value: u64,
    bitwidth: u32,
}

/// Unchecked serde shape of [`FieldValue`].
#[derive(Deserialize)]
struct RawFieldValue {
    value: u64,
    bitwidth: u32,
}

impl TryFrom<RawFieldValue> for FieldValue {
    type Error = ParseError;

    fn try_from(raw: RawFieldValue) -> Result<Self, Self::Error> {
        Self::new(raw.value, raw.bitwidth)
    }
}

impl FieldValue {
    /// Creates a value, checking that it fits in `bitwidth` bits.
    pub fn new(value: u64, bitwidth: u32) -> Result<Self, ParseError> {
        if bitwidth == 0 || bitwidth > MAX_BITWIDTH {
            return Err(ParseError::InvalidBitwidth(bitwidth));
        }
        if value > Self::max_for(bitwidth) {
            return Err(ParseError::ValueOutOfRange { value, bitwidth });
        }
        Ok(Self { value, bitwidth })
    }

    /// An all-ones mask of the given width.
    pub fn all_ones(bitwidth: u32) -> Result<Self, ParseError> {
        if bitwidth == 0 || bitwidth > MAX_BITWIDTH {
            return Err(ParseError::InvalidBitwidth(bitwidth));
        }
        Ok(Self {
            value: Self::max_for(bitwidth),
            bitwidth,
        })
    }

    /// A mask with the top `prefix_len` bits set.
    pub fn prefix_mask(prefix_len: u32, bitwidth: u32) -> Result<Self, ParseError> {
        if prefix_len > bitwidth {
            return Err(ParseError::ValueOutOfRange {
                value: u64::from(prefix_len),
                bitwidth,
            });
        }
        let ones = Self::all_ones(bitwidth)?;
        let host_bits = bitwidth - prefix_len;
        let value = if host_bits == MAX_BITWIDTH {
            0
        } else {
            (ones.value >> host_bits) << host_bits
        };
        Ok(Self { value, bitwidth })
    }

    pub fn from_ipv4(addr: Ipv4Address) -> Self {
        Self {
            value: u64::from(addr.to_u32()),
            bitwidth: 32,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            value: u64::from(value),
            bitwidth: 16,
        }
    }

    pub fn from_mac(mac: MacAddress) -> Self {
        Self {
            value: mac.to_u64(),
            bitwidth: 48,
        }
    }

    fn max_for(bitwidth: u32) -> u64 {
        if bitwidth >= MAX_BITWIDTH {
            u64::MAX
        } else {
            (1u64 << bitwidth) - 1
        }
    }

    pub const fn value(&self) -> u64 {
        self.value
    }

    pub const fn bitwidth(&self) -> u32 {
        self.bitwidth
    }

    /// Number of bytes on the wire: `ceil(bitwidth / 8)`.
    pub fn byte_len(&self) -> usize {
        self.bitwidth.div_ceil(8) as usize
    }

    /// Encodes the value as a fixed-width big-endian byte string.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, self.value);
        buf[8 - self.byte_len()..].to_vec()
    }

    pub fn count_ones(&self) -> u32 {
        self.value.count_ones()
    }

    pub fn is_all_ones(&self) -> bool {
        self.value == Self::max_for(self.bitwidth)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Returns true if every bit set in `self` is also set in `mask`.
    pub fn is_covered_by(&self, mask: &FieldValue) -> bool {
        self.value & !mask.value == 0
    }

    /// Bitwise AND of the raw values, keeping `self`'s width.
    pub fn masked(&self, mask: &FieldValue) -> FieldValue {
        FieldValue {
            value: self.value & mask.value,
            bitwidth: self.bitwidth,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.to_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<Ipv4Address> for FieldValue {
    fn from(addr: Ipv4Address) -> Self {
        Self::from_ipv4(addr)
    }
}

impl From<MacAddress> for FieldValue {
    fn from(mac: MacAddress) -> Self {
        Self::from_mac(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_range_check() {
        assert!(FieldValue::new(511, 9).is_ok());
        assert_eq!(
            FieldValue::new(512, 9),
            Err(ParseError::ValueOutOfRange {
                value: 512,
                bitwidth: 9
            })
        );
        assert_eq!(FieldValue::new(1, 0), Err(ParseError::InvalidBitwidth(0)));
        assert_eq!(FieldValue::new(1, 65), Err(ParseError::InvalidBitwidth(65)));
        assert!(FieldValue::new(u64::MAX, 64).is_ok());
    }

    #[test]
    fn test_encoding_width() {
        let port = FieldValue::new(2, 9).unwrap();
        assert_eq!(port.to_bytes(), vec![0x00, 0x02]);

        let threshold = FieldValue::new(0x4_0000, 19).unwrap();
        assert_eq!(threshold.to_bytes(), vec![0x04, 0x00, 0x00]);

        let mac = FieldValue::from_mac("08:00:00:00:01:11".parse().unwrap());
        assert_eq!(mac.to_bytes(), vec![0x08, 0x00, 0x00, 0x00, 0x01, 0x11]);
    }

    #[test]
    fn test_unchecked_shape_is_range_checked() {
        let raw = RawFieldValue {
            value: 4000,
            bitwidth: 8,
        };
        assert_eq!(
            FieldValue::try_from(raw),
            Err(ParseError::ValueOutOfRange {
                value: 4000,
                bitwidth: 8
            })
        );
        let raw = RawFieldValue {
            value: 250,
            bitwidth: 8,
        };
        assert_eq!(FieldValue::try_from(raw).unwrap().value(), 250);
    }

    #[test]
    fn test_masks() {
        let mask = FieldValue::prefix_mask(24, 32).unwrap();
        assert_eq!(mask.value(), 0xffff_ff00);
        assert_eq!(mask.count_ones(), 24);
        assert!(FieldValue::prefix_mask(32, 32).unwrap().is_all_ones());
        assert!(FieldValue::prefix_mask(0, 32).unwrap().is_zero());
        assert!(FieldValue::prefix_mask(0, 64).unwrap().is_zero());
        assert!(FieldValue::prefix_mask(33, 32).is_err());
    }

    #[test]
    fn test_covered_by() {
        let value = FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 0));
        let mask = FieldValue::prefix_mask(24, 32).unwrap();
        assert!(value.is_covered_by(&mask));

        let host = FieldValue::from_ipv4(Ipv4Address::new(10, 0, 1, 4));
        assert!(!host.is_covered_by(&mask));
        assert_eq!(host.masked(&mask), value);
    }

    #[test]
    fn test_display() {
        assert_eq!(FieldValue::new(80, 16).unwrap().to_string(), "0x0050");
    }
}
