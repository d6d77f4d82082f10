//! Shared Serde helpers
//!
//! Bus addresses and parameter indices are written in hex everywhere in the
//! heating world, so configuration accepts several input formats:
//! - native number `1664`
//! - decimal string `"1664"`
//! - hex string `"0x680"` (environment variables always arrive as strings)
//!
//! Serialization writes them back as `0x`-prefixed hex.

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Int(u64),
    String(String),
}

impl StringOrInt {
    fn into_u16(self) -> Result<u16, String> {
        match self {
            StringOrInt::Int(v) => u16::try_from(v).map_err(|_| format!("{} exceeds 0xFFFF", v)),
            StringOrInt::String(s) => parse_u16_flexible(&s),
        }
    }
}

/// Parse `0x680`, `0X680` or `1664`
pub fn parse_u16_flexible(text: &str) -> Result<u16, String> {
    let t = text.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => t.parse::<u16>(),
    };
    parsed.map_err(|_| format!("invalid 16-bit value '{}'", text))
}

/// Deserialize a u16 from a number or a (hex) string
pub fn deserialize_u16_flexible<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrInt::deserialize(deserializer)?
        .into_u16()
        .map_err(D::Error::custom)
}

/// Deserialize a list of u16 where each element may be a number or a (hex) string
pub fn deserialize_u16_vec_flexible<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<StringOrInt>::deserialize(deserializer)?
        .into_iter()
        .map(|v| v.into_u16().map_err(D::Error::custom))
        .collect()
}

/// Serialize a u16 as `0x`-prefixed hex
pub fn serialize_u16_hex<S>(value: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{:03x}", value))
}

/// Serialize a list of u16 as `0x`-prefixed hex strings
pub fn serialize_u16_vec_hex<S>(values: &[u16], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(values.iter().map(|v| format!("0x{:03x}", v)))
}
