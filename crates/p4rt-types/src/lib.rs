//! Value types for P4Runtime control planes.
//!
//! This crate provides type-safe representations of the values a controller
//! writes into match fields and action parameters:
//!
//! - [`Ipv4Address`]: IPv4 host addresses
//! - [`Ipv4Prefix`]: IPv4 network prefixes (CIDR notation) with containment checks
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`FieldValue`]: canonical big-endian byte strings sized to a P4 bit width

mod ip;
mod mac;
mod value;

pub use ip::{Ipv4Address, Ipv4Prefix};
pub use mac::MacAddress;
pub use value::{FieldValue, MAX_BITWIDTH};

/// Common error type for parsing and encoding failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IPv4 prefix: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("value {value} does not fit in {bitwidth} bits")]
    ValueOutOfRange { value: u64, bitwidth: u32 },

    #[error("invalid bit width {0} (must be 1-64)")]
    InvalidBitwidth(u32),
}
