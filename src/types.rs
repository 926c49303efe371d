use serde::{Deserialize, Serialize};
use std::fmt;

/// CAN Frame identifier (11-bit standard or 29-bit extended)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanId {
    Standard(u16), // 11-bit (0x000 - 0x7FF)
    Extended(u32), // 29-bit (0x00000000 - 0x1FFFFFFF)
}

impl CanId {
    pub fn value(&self) -> u32 {
        match self {
            CanId::Standard(id) => *id as u32,
            CanId::Extended(id) => *id,
        }
    }

    /// Check the identifier fits its declared width
    pub fn is_valid(&self) -> bool {
        match self {
            CanId::Standard(id) => *id <= 0x7FF,
            CanId::Extended(id) => *id <= 0x1FFF_FFFF,
        }
    }

    /// Build an id from a raw value, choosing the narrowest format
    pub fn from_raw(value: u32) -> Self {
        if value <= 0x7FF {
            CanId::Standard(value as u16)
        } else {
            CanId::Extended(value & 0x1FFF_FFFF)
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanId::Standard(id) => write!(f, "{:03X}", id),
            CanId::Extended(id) => write!(f, "{:08X}", id),
        }
    }
}

/// Arbitration ids used by the simulated vehicle
pub mod can_ids {
    use super::CanId;

    pub const FLOOD: CanId = CanId::Standard(0x000);
    pub const ENGINE_RPM: CanId = CanId::Standard(0x123);
    pub const ABS_STATUS: CanId = CanId::Standard(0x240);
    pub const TRANSMISSION: CanId = CanId::Standard(0x310);
    pub const INFOTAINMENT: CanId = CanId::Standard(0x4F0);
    pub const BODY_HEARTBEAT: CanId = CanId::Standard(0x500);
}

/// CAN Frame - immutable once published
///
/// `timestamp` is monotonic seconds on the clock of the bus the frame was
/// published to (see `VirtualCanBus::now`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>, // 0-8 bytes
    pub timestamp: f64,
    pub source: String, // sender identifier
}

impl CanFrame {
    pub fn new(id: CanId, data: Vec<u8>, source: String, timestamp: f64) -> Self {
        Self {
            id,
            data,
            timestamp,
            source,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.len() <= 8 && self.id.is_valid()
    }

    /// Copy of this frame carrying a new timestamp
    pub fn restamped(&self, timestamp: f64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Payload as uppercase hex, the `ID#HEX` notation of candump logs
    pub fn data_hex(&self) -> String {
        self.data.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

/// Payload encoding for the simulated signals
pub mod encoding {
    /// RPM scale factor: one raw unit is 0.25 RPM
    pub const RPM_SCALE: f64 = 0.25;

    /// Body control heartbeat payload
    pub const BODY_HEARTBEAT_PAYLOAD: [u8; 4] = [0x0D, 0x0E, 0x0F, 0x10];

    /// Encode engine RPM as 2 bytes big-endian, raw = rpm / 0.25
    pub fn encode_rpm(rpm: u16) -> [u8; 2] {
        let raw = (rpm as f64 / RPM_SCALE).clamp(0.0, u16::MAX as f64) as u16;
        raw.to_be_bytes()
    }

    /// Decode engine RPM from the first 2 bytes
    pub fn decode_rpm(data: &[u8]) -> Option<u16> {
        if data.len() < 2 {
            return None;
        }
        let raw = u16::from_be_bytes([data[0], data[1]]);
        Some((raw as f64 * RPM_SCALE) as u16)
    }

    /// Encode gear as a leading byte followed by padding
    pub fn encode_gear(gear: u8) -> [u8; 4] {
        [gear, 0x00, 0x00, 0x00]
    }

    /// Decode gear from the leading byte
    pub fn decode_gear(data: &[u8]) -> Option<u8> {
        data.first().copied()
    }

    /// Encode the ABS braking flag (1 while braking) followed by padding
    pub fn encode_brake(braking: bool) -> [u8; 2] {
        [u8::from(braking), 0x00]
    }

    /// Decode the ABS braking flag
    pub fn decode_brake(data: &[u8]) -> Option<bool> {
        data.first().map(|&b| b == 1)
    }
}
