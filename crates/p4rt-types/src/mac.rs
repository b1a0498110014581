//! MAC address type with safe parsing and formatting.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address, used as the next-hop rewrite value.
///
/// # Examples
///
/// ```
/// use p4rt_types::MacAddress;
///
/// let mac: MacAddress = "08:00:00:00:01:11".parse().unwrap();
/// assert_eq!(mac.to_string(), "08:00:00:00:01:11");
/// assert_eq!(mac.to_u64(), 0x0800_0000_0111);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns the address as a 48-bit integer.
    pub fn to_u64(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMacAddress(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for slot in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_next_hop_parse() {
        let mac: MacAddress = "08:00:00:00:02:22".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0x08, 0x00, 0x00, 0x00, 0x02, 0x22]);
        assert_eq!(mac.to_u64(), 0x0800_0000_0222);
        assert_eq!(" 08:00:00:00:03:00\n".parse::<MacAddress>().unwrap().to_u64(), 0x0800_0000_0300);
    }

    #[test]
    fn test_display_is_lowercase_padded() {
        let mac = MacAddress::new([0x08, 0x00, 0x0a, 0x0b, 0xfe, 0x01]);
        assert_eq!(mac.to_string(), "08:00:0a:0b:fe:01");
        assert_eq!(String::from(mac).parse::<MacAddress>().unwrap(), mac);
        assert_eq!(MacAddress::ZERO.to_string(), "00:00:00:00:00:00");
    }

    #[test]
    fn test_try_from_string() {
        let mac = MacAddress::try_from("08:00:00:00:01:11".to_string()).unwrap();
        assert_eq!(mac, MacAddress::new([0x08, 0, 0, 0, 0x01, 0x11]));
        assert!(MacAddress::try_from("not-a-mac".to_string()).is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "08:00:00:00:01",
            "08:00:00:00:01:11:22",
            "08:00:00:00:01:zz",
            "080:00:00:00:01:11",
            "08::00:00:01:11",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "{:?} accepted", bad);
        }
    }
}
