//! Elster value types and their fixed-point/enumerated decodings

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use super::table;

/// Raw value meaning "not available" for numeric parameters
pub const NOT_AVAILABLE: u16 = 0x8000;

/// How a parameter's 16-bit raw value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElsterValueType {
    /// Unsigned integer
    Default,
    /// Signed, one decimal (temperatures)
    DecVal,
    /// Signed, two decimals
    CentVal,
    /// Signed, three decimals
    MilVal,
    /// High byte only
    Byte,
    /// 0x0001 = on
    Bool,
    /// 0x0100 = on
    LittleBool,
    /// Byte-swapped unsigned integer
    LittleEndian,
    /// Operating mode code in the high byte
    OperatingMode,
    /// `hh:mm`, hour in the low byte
    Time,
    /// `dd.mm.`, day in the high byte
    Date,
    /// Quarter-hour switching range
    TimeDomain,
    /// Device id `major-minor`
    DevId,
    /// Error number
    ErrNr,
}

/// Human-facing interpretation of a raw value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Integer(i64),
    Fixed { value: f64, decimals: u8 },
    Flag(bool),
    Text(String),
    NotAvailable,
}

impl DecodedValue {
    /// Numeric view, if the value has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Integer(v) => Some(*v as f64),
            DecodedValue::Fixed { value, .. } => Some(*value),
            DecodedValue::Flag(v) => Some(if *v { 1.0 } else { 0.0 }),
            DecodedValue::Text(_) | DecodedValue::NotAvailable => None,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Integer(v) => write!(f, "{}", v),
            DecodedValue::Fixed { value, decimals } => {
                write!(f, "{:.*}", usize::from(*decimals), value)
            },
            DecodedValue::Flag(true) => f.write_str("on"),
            DecodedValue::Flag(false) => f.write_str("off"),
            DecodedValue::Text(text) => f.write_str(text),
            DecodedValue::NotAvailable => f.write_str("n/a"),
        }
    }
}

/// Decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElsterValue {
    pub index: u16,
    pub raw: [u8; 2],
    pub value_type: ElsterValueType,
    pub decoded: DecodedValue,
}

impl ElsterValue {
    /// Decode a raw value using the parameter table's type for `index`
    pub fn decode(index: u16, raw: [u8; 2]) -> Self {
        let value_type = table::lookup(index)
            .map(|p| p.value_type)
            .unwrap_or(ElsterValueType::Default);
        Self::decode_as(index, raw, value_type)
    }

    /// Decode a raw value with an explicit type
    pub fn decode_as(index: u16, raw: [u8; 2], value_type: ElsterValueType) -> Self {
        Self {
            index,
            raw,
            value_type,
            decoded: decode_raw(value_type, u16::from_be_bytes(raw)),
        }
    }

    pub fn raw_u16(&self) -> u16 {
        u16::from_be_bytes(self.raw)
    }

    /// Parameter name from the table, or a synthesized one
    pub fn name(&self) -> Cow<'static, str> {
        table::parameter_name(self.index)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.decoded.as_f64()
    }

    pub fn is_available(&self) -> bool {
        self.decoded != DecodedValue::NotAvailable
    }
}

impl fmt::Display for ElsterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.decoded.fmt(f)
    }
}

fn fixed(raw: u16, divisor: f64, decimals: u8) -> DecodedValue {
    DecodedValue::Fixed {
        value: f64::from(raw as i16) / divisor,
        decimals,
    }
}

fn operating_mode(code: u8) -> Cow<'static, str> {
    match code {
        0 => "Emergency".into(),
        1 => "Standby".into(),
        3 => "Day".into(),
        4 => "Setback".into(),
        5 => "HotWater".into(),
        11 => "Automatic".into(),
        14 => "Manual".into(),
        other => format!("Mode{}", other).into(),
    }
}

/// Apply the protocol's scaling and sign conventions to a raw value
pub fn decode_raw(value_type: ElsterValueType, raw: u16) -> DecodedValue {
    let [hi, lo] = raw.to_be_bytes();

    match value_type {
        ElsterValueType::Default
        | ElsterValueType::DecVal
        | ElsterValueType::CentVal
        | ElsterValueType::MilVal
            if raw == NOT_AVAILABLE =>
        {
            DecodedValue::NotAvailable
        },
        ElsterValueType::Default | ElsterValueType::ErrNr => DecodedValue::Integer(i64::from(raw)),
        ElsterValueType::DecVal => fixed(raw, 10.0, 1),
        ElsterValueType::CentVal => fixed(raw, 100.0, 2),
        ElsterValueType::MilVal => fixed(raw, 1000.0, 3),
        ElsterValueType::Byte => DecodedValue::Integer(i64::from(hi)),
        ElsterValueType::Bool => match raw {
            0x0000 => DecodedValue::Flag(false),
            0x0001 => DecodedValue::Flag(true),
            other => DecodedValue::Integer(i64::from(other)),
        },
        ElsterValueType::LittleBool => match raw {
            0x0000 => DecodedValue::Flag(false),
            0x0100 => DecodedValue::Flag(true),
            other => DecodedValue::Integer(i64::from(other)),
        },
        ElsterValueType::LittleEndian => DecodedValue::Integer(i64::from(raw.swap_bytes())),
        ElsterValueType::OperatingMode => DecodedValue::Text(operating_mode(hi).into_owned()),
        ElsterValueType::Time => DecodedValue::Text(format!("{:02}:{:02}", lo, hi)),
        ElsterValueType::Date => DecodedValue::Text(format!("{:02}.{:02}.", hi, lo)),
        ElsterValueType::TimeDomain => {
            if raw & 0x8080 != 0 {
                DecodedValue::NotAvailable
            } else {
                DecodedValue::Text(format!(
                    "{:02}:{:02}-{:02}:{:02}",
                    hi / 4,
                    15 * (hi % 4),
                    lo / 4,
                    15 * (lo % 4)
                ))
            }
        },
        ElsterValueType::DevId => DecodedValue::Text(format!("{}-{:02}", hi, lo)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dec_val_scaling() {
        assert_eq!(decode_raw(ElsterValueType::DecVal, 0x0037).to_string(), "5.5");
        assert_eq!(decode_raw(ElsterValueType::DecVal, 0x00D5).to_string(), "21.3");
        assert_eq!(decode_raw(ElsterValueType::DecVal, 0xFF9C).to_string(), "-10.0");
        assert_eq!(decode_raw(ElsterValueType::DecVal, 0xFF9C).as_f64(), Some(-10.0));
        assert_eq!(decode_raw(ElsterValueType::DecVal, 0x0000).to_string(), "0.0");
    }

    #[test]
    fn test_cent_and_mil_scaling() {
        assert_eq!(decode_raw(ElsterValueType::CentVal, 0x00D2).to_string(), "2.10");
        assert_eq!(decode_raw(ElsterValueType::CentVal, 0x00D2).as_f64(), Some(2.1));
        assert_eq!(decode_raw(ElsterValueType::MilVal, 0x04D2).to_string(), "1.234");
        assert_eq!(decode_raw(ElsterValueType::MilVal, 0xFB2E).to_string(), "-1.234");
    }

    #[test]
    fn test_not_available() {
        assert_eq!(
            decode_raw(ElsterValueType::DecVal, NOT_AVAILABLE),
            DecodedValue::NotAvailable
        );
        assert_eq!(
            decode_raw(ElsterValueType::Default, NOT_AVAILABLE),
            DecodedValue::NotAvailable
        );
        assert_eq!(decode_raw(ElsterValueType::DecVal, NOT_AVAILABLE).to_string(), "n/a");
    }

    #[test]
    fn test_enumerated_types() {
        assert_eq!(
            decode_raw(ElsterValueType::OperatingMode, 0x0B00).to_string(),
            "Automatic"
        );
        assert_eq!(decode_raw(ElsterValueType::OperatingMode, 0x0900).to_string(), "Mode9");
        assert_eq!(decode_raw(ElsterValueType::Bool, 0x0001), DecodedValue::Flag(true));
        assert_eq!(decode_raw(ElsterValueType::LittleBool, 0x0100), DecodedValue::Flag(true));
        assert_eq!(decode_raw(ElsterValueType::LittleEndian, 0x0100), DecodedValue::Integer(1));
        assert_eq!(decode_raw(ElsterValueType::Byte, 0x0500), DecodedValue::Integer(5));
    }

    #[test]
    fn test_time_and_date() {
        assert_eq!(decode_raw(ElsterValueType::Time, 0x1E0C).to_string(), "12:30");
        assert_eq!(decode_raw(ElsterValueType::Date, 0x1803).to_string(), "24.03.");
        assert_eq!(decode_raw(ElsterValueType::TimeDomain, 0x1850).to_string(), "06:00-20:00");
        assert_eq!(
            decode_raw(ElsterValueType::TimeDomain, 0x8080),
            DecodedValue::NotAvailable
        );
        assert_eq!(decode_raw(ElsterValueType::DevId, 0x5F03).to_string(), "95-03");
    }

    #[test]
    fn test_value_uses_parameter_table() {
        let value = ElsterValue::decode(0x000C, [0x00, 0x37]);
        assert_eq!(value.value_type, ElsterValueType::DecVal);
        assert_eq!(value.name(), "AUSSENTEMP");
        assert_eq!(value.as_f64(), Some(5.5));

        let unknown = ElsterValue::decode(0x7777, [0x01, 0x02]);
        assert_eq!(unknown.value_type, ElsterValueType::Default);
        assert_eq!(unknown.decoded, DecodedValue::Integer(0x0102));
    }
}
