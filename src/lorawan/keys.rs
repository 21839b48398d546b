//! Identifier and key newtypes used throughout the server.
//!
//! EUIs and keys travel as hex strings on the bus and in configuration,
//! and as raw little-endian bytes inside LoRaWAN frames. The newtypes keep
//! the two representations from being mixed up at call sites.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NsError;

/// 8-byte extended unique identifier (DevEUI, JoinEUI, gateway MAC).
///
/// Stored in display order (most significant byte first); LoRaWAN frames
/// carry it little-endian, so the codec reverses on the way in and out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Bytes as they appear on-air (little-endian).
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut b = self.0;
        b.reverse();
        b
    }

    pub fn from_le_bytes(mut b: [u8; 8]) -> Self {
        b.reverse();
        Eui64(b)
    }

    /// The byte-reversed EUI, used as a fallback lookup for vendor
    /// firmware that ships EUIs in reverse order in Join Requests.
    pub fn reversed(&self) -> Self {
        let mut b = self.0;
        b.reverse();
        Eui64(b)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Eui64 {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| NsError::MalformedFrame(format!("invalid EUI hex {s:?}: {e}")))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| NsError::MalformedFrame(format!("EUI must be 8 bytes: {s:?}")))?;
        Ok(Eui64(arr))
    }
}

impl TryFrom<String> for Eui64 {
    type Error = NsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Eui64> for String {
    fn from(e: Eui64) -> String {
        e.to_string()
    }
}

/// 4-byte device address, stored in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(pub [u8; 4]);

impl DevAddr {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        let mut b = self.0;
        b.reverse();
        b
    }

    pub fn from_le_bytes(mut b: [u8; 4]) -> Self {
        b.reverse();
        DevAddr(b)
    }

    pub fn from_u32(v: u32) -> Self {
        DevAddr(v.to_be_bytes())
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DevAddr {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| NsError::MalformedFrame(format!("invalid DevAddr hex {s:?}: {e}")))?;
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| NsError::MalformedFrame(format!("DevAddr must be 4 bytes: {s:?}")))?;
        Ok(DevAddr(arr))
    }
}

impl TryFrom<String> for DevAddr {
    type Error = NsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DevAddr> for String {
    fn from(a: DevAddr) -> String {
        a.to_string()
    }
}

/// 128-bit AES key (root or session).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Aes128Key(pub [u8; 16]);

impl Aes128Key {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aes128Key({})", hex::encode(self.0))
    }
}

impl FromStr for Aes128Key {
    type Err = NsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| NsError::MalformedFrame(format!("invalid key hex: {e}")))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| NsError::MalformedFrame("AES key must be 16 bytes".into()))?;
        Ok(Aes128Key(arr))
    }
}

impl TryFrom<String> for Aes128Key {
    type Error = NsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Aes128Key> for String {
    fn from(k: Aes128Key) -> String {
        hex::encode(k.0)
    }
}

/// 4-byte message integrity code (truncated AES-CMAC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mic(pub [u8; 4]);

impl Mic {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Mic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eui_hex_roundtrip() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.0, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(eui.to_string(), "0102030405060708");
        assert_eq!(eui.to_le_bytes(), [8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(Eui64::from_le_bytes([8, 7, 6, 5, 4, 3, 2, 1]), eui);
    }

    #[test]
    fn test_eui_reversed_fallback() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.reversed().to_string(), "0807060504030201");
        assert_eq!(eui.reversed().reversed(), eui);
    }

    #[test]
    fn test_eui_rejects_bad_length() {
        assert!("010203".parse::<Eui64>().is_err());
        assert!("zz02030405060708".parse::<Eui64>().is_err());
    }

    #[test]
    fn test_dev_addr_u32() {
        let addr = DevAddr::from_u32(0x01020304);
        assert_eq!(addr.0, [1, 2, 3, 4]);
        assert_eq!(addr.as_u32(), 0x01020304);
        assert_eq!(addr.to_le_bytes(), [4, 3, 2, 1]);
        assert_eq!(addr.to_string(), "01020304");
    }

    #[test]
    fn test_key_parse() {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(key.0[0], 0x00);
        assert_eq!(key.0[15], 0xff);
        assert!("0011".parse::<Aes128Key>().is_err());
    }
}
