//! CAN Frame Definition
//!
//! Immutable CAN 2.0 frame with an inline payload of at most 8 bytes.

use serde::Serialize;
use std::fmt;

use crate::transport::TransportError;

/// Largest standard (11-bit) identifier
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Largest extended (29-bit) identifier
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;
/// CAN 2.0 payload limit
pub const MAX_DATA_LEN: usize = 8;

/// CAN 2.0 data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl CanFrame {
    /// Create a new standard (11-bit identifier) frame
    pub fn new_standard(id: u16, data: &[u8]) -> Result<Self, TransportError> {
        if u32::from(id) > STANDARD_ID_MAX {
            return Err(TransportError::InvalidFrame(format!(
                "Standard CAN ID 0x{:X} exceeds 0x7FF",
                id
            )));
        }
        Self::build(u32::from(id), false, data)
    }

    /// Create a new extended (29-bit identifier) frame
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, TransportError> {
        if id > EXTENDED_ID_MAX {
            return Err(TransportError::InvalidFrame(format!(
                "Extended CAN ID 0x{:X} exceeds 0x1FFFFFFF",
                id
            )));
        }
        Self::build(id, true, data)
    }

    fn build(id: u32, extended: bool, data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > MAX_DATA_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "CAN 2.0 data must be <= 8 bytes, got {}",
                data.len()
            )));
        }

        let mut payload = [0u8; MAX_DATA_LEN];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: payload,
        })
    }

    /// Raw identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the identifier is 29-bit
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload bytes (only the first `dlc` bytes)
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Data length code
    pub fn dlc(&self) -> u8 {
        self.len
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{:08X} [{}]", self.id, self.len)?;
        } else {
            write!(f, "0x{:03X} [{}]", self.id, self.len)?;
        }
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_frame_creation() {
        let frame = CanFrame::new_standard(0x180, &[0xD2, 0x00, 0x0C]).unwrap();
        assert_eq!(frame.id(), 0x180);
        assert_eq!(frame.data(), &[0xD2, 0x00, 0x0C]);
        assert_eq!(frame.dlc(), 3);
        assert!(!frame.is_extended());
    }

    #[test]
    fn test_can_frame_limits() {
        assert!(CanFrame::new_standard(0x800, &[]).is_err());
        assert!(CanFrame::new_standard(0x123, &[0; 9]).is_err());
        assert!(CanFrame::new_extended(0x2000_0000, &[]).is_err());
        assert!(CanFrame::new_extended(0x1FFF_FFFF, &[0; 8]).is_ok());
    }

    #[test]
    fn test_can_frame_display() {
        let frame = CanFrame::new_standard(0x680, &[0x31, 0x00, 0xFA]).unwrap();
        assert_eq!(frame.to_string(), "0x680 [3] 31 00 FA");
    }
}
