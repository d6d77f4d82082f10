//! Elster telegram encoding and decoding
//!
//! Telegram layout (CAN 2.0A, identifier = sender address):
//!
//! ```text
//! byte 0   receiver bits 10..7 (high nibble) | telegram type (low nibble)
//! byte 1   receiver bits 6..0
//! short    byte 2 = index,        bytes 3..5 = value (big endian)
//! extended byte 2 = 0xFA, bytes 3..5 = index, bytes 5..7 = value
//! ```

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::value::ElsterValue;
use crate::error::{HeatSrvError, Result};
use crate::protocols::can::CanFrame;

/// Largest bus address (11-bit CAN identifier)
pub const ELSTER_ADDRESS_MAX: u16 = 0x7FF;
/// Largest parameter index; 0xFFFF is reserved
pub const ELSTER_INDEX_MAX: u16 = 0xFFFE;

const EXTENDED_INDEX_MARKER: u8 = 0xFA;
const SHORT_TELEGRAM_LEN: usize = 5;
const EXTENDED_TELEGRAM_LEN: usize = 7;

/// Telegram type carried in the low nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TelegramType {
    Write,
    Read,
    Response,
    Ack,
    WriteAck,
    WriteRespond,
    System,
    SystemRespond,
}

impl TelegramType {
    /// Parse the low nibble of byte 0
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Write),
            1 => Some(Self::Read),
            2 => Some(Self::Response),
            3 => Some(Self::Ack),
            4 => Some(Self::WriteAck),
            5 => Some(Self::WriteRespond),
            6 => Some(Self::System),
            7 => Some(Self::SystemRespond),
            _ => None,
        }
    }

    /// Wire value
    pub fn nibble(self) -> u8 {
        match self {
            Self::Write => 0,
            Self::Read => 1,
            Self::Response => 2,
            Self::Ack => 3,
            Self::WriteAck => 4,
            Self::WriteRespond => 5,
            Self::System => 6,
            Self::SystemRespond => 7,
        }
    }
}

/// One outstanding read: who asks, who is asked, and for which parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ElsterQuery {
    pub sender: u16,
    pub receiver: u16,
    pub index: u16,
}

impl ElsterQuery {
    pub fn new(sender: u16, receiver: u16, index: u16) -> Self {
        Self {
            sender,
            receiver,
            index,
        }
    }

    /// Check the triple against the protocol's code space
    pub fn validate(&self) -> Result<()> {
        if self.sender > ELSTER_ADDRESS_MAX {
            return Err(HeatSrvError::InvalidParameter(format!(
                "sender 0x{:X} exceeds 0x7FF",
                self.sender
            )));
        }
        if self.receiver > ELSTER_ADDRESS_MAX {
            return Err(HeatSrvError::InvalidParameter(format!(
                "receiver 0x{:X} exceeds 0x7FF",
                self.receiver
            )));
        }
        if self.index > ELSTER_INDEX_MAX {
            return Err(HeatSrvError::InvalidParameter(format!(
                "index 0x{:04X} is reserved",
                self.index
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ElsterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:03x} -> 0x{:03x} index 0x{:04x}",
            self.sender, self.receiver, self.index
        )
    }
}

/// Decoded Elster telegram
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElsterTelegram {
    pub sender: u16,
    pub receiver: u16,
    pub kind: TelegramType,
    pub value: ElsterValue,
}

impl ElsterTelegram {
    pub fn index(&self) -> u16 {
        self.value.index
    }

    /// The query this telegram would answer if it is a response
    pub fn answers(&self) -> ElsterQuery {
        ElsterQuery::new(self.receiver, self.sender, self.value.index)
    }
}

/// Reason a frame is not a well-formed Elster telegram
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unrecognized {
    #[error("extended identifier 0x{0:08X}")]
    ExtendedIdentifier(u32),

    #[error("payload too short ({0} bytes)")]
    TooShort(usize),

    #[error("unknown telegram type {0}")]
    UnknownTelegramType(u8),

    #[error("malformed receiver byte 0x{0:02X}")]
    MalformedReceiver(u8),
}

/// Encode a read request
///
/// Always uses the 7-byte extended form with a zero value, like the vendor tools do.
pub fn encode_query(query: &ElsterQuery) -> Result<CanFrame> {
    encode_telegram(
        query.sender,
        query.receiver,
        TelegramType::Read,
        query.index,
        0,
    )
}

/// Encode an arbitrary telegram in extended form
pub fn encode_telegram(
    sender: u16,
    receiver: u16,
    kind: TelegramType,
    index: u16,
    value: u16,
) -> Result<CanFrame> {
    ElsterQuery::new(sender, receiver, index).validate()?;

    let [index_hi, index_lo] = index.to_be_bytes();
    let [value_hi, value_lo] = value.to_be_bytes();
    let payload = [
        (((receiver >> 7) as u8) << 4) | kind.nibble(),
        (receiver & 0x7F) as u8,
        EXTENDED_INDEX_MARKER,
        index_hi,
        index_lo,
        value_hi,
        value_lo,
    ];

    Ok(CanFrame::new_standard(sender, &payload)?)
}

/// Decode a bus frame
///
/// Never fails hard: anything that is not an Elster telegram comes back as
/// `Unrecognized` so the caller can file it as a passive telegram.
pub fn decode_frame(frame: &CanFrame) -> std::result::Result<ElsterTelegram, Unrecognized> {
    if frame.is_extended() {
        return Err(Unrecognized::ExtendedIdentifier(frame.id()));
    }

    let data = frame.data();
    if data.len() < SHORT_TELEGRAM_LEN {
        return Err(Unrecognized::TooShort(data.len()));
    }

    let kind = TelegramType::from_nibble(data[0] & 0x0F)
        .ok_or(Unrecognized::UnknownTelegramType(data[0] & 0x0F))?;
    if data[1] & 0x80 != 0 {
        return Err(Unrecognized::MalformedReceiver(data[1]));
    }
    let receiver = (u16::from(data[0] & 0xF0) << 3) | u16::from(data[1]);

    let (index, raw) = if data[2] == EXTENDED_INDEX_MARKER {
        if data.len() < EXTENDED_TELEGRAM_LEN {
            return Err(Unrecognized::TooShort(data.len()));
        }
        (u16::from_be_bytes([data[3], data[4]]), [data[5], data[6]])
    } else {
        (u16::from(data[2]), [data[3], data[4]])
    };

    Ok(ElsterTelegram {
        sender: frame.id() as u16,
        receiver,
        kind,
        value: ElsterValue::decode(index, raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::elster::value::DecodedValue;

    #[test]
    fn test_encode_read_request() {
        let frame = encode_query(&ElsterQuery::new(0x680, 0x180, 0x000C)).unwrap();
        assert_eq!(frame.id(), 0x680);
        assert_eq!(frame.data(), &[0x31, 0x00, 0xFA, 0x00, 0x0C, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_high_receiver_bits() {
        let frame = encode_query(&ElsterQuery::new(0x680, 0x601, 0x0199)).unwrap();
        assert_eq!(frame.data(), &[0xC1, 0x01, 0xFA, 0x01, 0x99, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let err = encode_query(&ElsterQuery::new(0x800, 0x180, 1)).unwrap_err();
        assert!(matches!(err, HeatSrvError::InvalidParameter(_)));
        let err = encode_query(&ElsterQuery::new(0x680, 0x180, 0xFFFF)).unwrap_err();
        assert!(matches!(err, HeatSrvError::InvalidParameter(_)));
    }

    #[test]
    fn test_decode_extended_response() {
        // outdoor temperature 5.5 °C from the boiler module to the PC address
        let frame =
            CanFrame::new_standard(0x180, &[0xD2, 0x00, 0xFA, 0x00, 0x0C, 0x00, 0x37]).unwrap();
        let telegram = decode_frame(&frame).unwrap();
        assert_eq!(telegram.sender, 0x180);
        assert_eq!(telegram.receiver, 0x680);
        assert_eq!(telegram.kind, TelegramType::Response);
        assert_eq!(telegram.index(), 0x000C);
        assert_eq!(telegram.value.to_string(), "5.5");
        assert_eq!(telegram.answers(), ElsterQuery::new(0x680, 0x180, 0x000C));
    }

    #[test]
    fn test_decode_short_form_negative() {
        // -12.3 °C = 0xFF85
        let frame = CanFrame::new_standard(0x180, &[0xD2, 0x00, 0x0C, 0xFF, 0x85]).unwrap();
        let telegram = decode_frame(&frame).unwrap();
        assert_eq!(telegram.index(), 0x000C);
        assert_eq!(
            telegram.value.decoded,
            DecodedValue::Fixed {
                value: -12.3,
                decimals: 1
            }
        );
    }

    #[test]
    fn test_decode_unrecognized() {
        let short = CanFrame::new_standard(0x180, &[0xD2, 0x00, 0x0C]).unwrap();
        assert_eq!(decode_frame(&short), Err(Unrecognized::TooShort(3)));

        let truncated = CanFrame::new_standard(0x180, &[0xD2, 0x00, 0xFA, 0x00, 0x0C]).unwrap();
        assert_eq!(decode_frame(&truncated), Err(Unrecognized::TooShort(5)));

        let bad_type = CanFrame::new_standard(0x180, &[0xD9, 0x00, 0x0C, 0, 0]).unwrap();
        assert_eq!(
            decode_frame(&bad_type),
            Err(Unrecognized::UnknownTelegramType(9))
        );

        let bad_receiver = CanFrame::new_standard(0x180, &[0xD2, 0x80, 0x0C, 0, 0]).unwrap();
        assert_eq!(
            decode_frame(&bad_receiver),
            Err(Unrecognized::MalformedReceiver(0x80))
        );

        let extended = CanFrame::new_extended(0x18FF_0000, &[0; 7]).unwrap();
        assert!(matches!(
            decode_frame(&extended),
            Err(Unrecognized::ExtendedIdentifier(_))
        ));
    }

    #[test]
    fn test_encoded_telegram_decodes_to_same_fields() {
        let frame =
            encode_telegram(0x180, 0x680, TelegramType::Response, 0x0112, 0x0B00).unwrap();
        let telegram = decode_frame(&frame).unwrap();
        assert_eq!(telegram.sender, 0x180);
        assert_eq!(telegram.receiver, 0x680);
        assert_eq!(telegram.index(), 0x0112);
        assert_eq!(telegram.value.raw_u16(), 0x0B00);
    }
}
